//! One-time startup banner (stderr), printed before the launch sequence.

use crate::discovery::XdsResolution;
use crate::paths::MeshPaths;

pub fn print_startup_banner(as_root: bool, paths: &MeshPaths, xds: &XdsResolution) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!();
    eprintln!("──────────────────────────────────────────────────────────────────────────────");
    eprintln!(" 🕸️   meshrun v{version}  —  mesh sidecar launcher and supervisor");
    eprintln!("──────────────────────────────────────────────────────────────────────────────");
    eprintln!(
        "    - Build: {} ({}, {})",
        env!("MESHRUN_BUILD_DATE"),
        env!("MESHRUN_BUILD_TARGET"),
        env!("MESHRUN_BUILD_PROFILE")
    );
    eprintln!(
        "    - Mode: {}",
        if as_root {
            "privileged (transparent interception possible)"
        } else {
            "unprivileged (whitebox proxying)"
        }
    );
    eprintln!("    - Base dir: {}", paths.base().display());
    match xds.effective_addr() {
        Some(addr) => eprintln!("    - Discovery: {} ({})", addr, xds.source),
        None if xds.agent_disabled() => eprintln!("    - Discovery: agent management disabled"),
        None => eprintln!("    - Discovery: unresolved (agent will fail fast)"),
    }
    eprintln!("──────────────────────────────────────────────────────────────────────────────");
    eprintln!();
}
