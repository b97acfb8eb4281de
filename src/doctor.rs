//! Environment diagnostics: what would the launcher see and decide right now.
//! Plain stderr output, no side effects beyond read-only probes.

use std::path::Path;

use crate::agent::{agent_binary, DEFAULT_PROXY_BIN};
use crate::discovery::{resolve_discovery_address, PlatformInfo};
use crate::envset::EnvSet;
use crate::identity::RuntimeIdentity;
use crate::intercept::transparent_preconditions;
use crate::lock::candidate_lock_paths;
use crate::mesh::load_mesh_config;
use crate::paths::{running_as_root, MeshPaths};

fn verdict(v: bool) -> String {
    let s = if v { "yes" } else { "no" };
    if atty::is(atty::Stream::Stderr) {
        format!("\x1b[34;1m{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

fn present(p: &Path) -> String {
    if p.exists() {
        format!("{} (present)", p.display())
    } else {
        format!("{} (missing)", p.display())
    }
}

pub fn run_doctor(verbose: bool) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("meshrun doctor");
    eprintln!();
    eprintln!("  version: v{version}");
    eprintln!(
        "  host:    {} / {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    eprintln!("  rustc:   {}", env!("MESHRUN_BUILD_RUSTC"));

    let as_root = running_as_root();
    eprintln!("  running as root: {}", verdict(as_root));
    eprintln!();

    let env = EnvSet::from_process_env();
    let paths = MeshPaths::detect(as_root);
    eprintln!("  base dir: {}", paths.base().display());

    match agent_binary(&env) {
        Ok(p) => eprintln!("  agent binary: {}", p.display()),
        Err(e) => eprintln!("  agent binary: not found ({e})"),
    }
    eprintln!("  proxy binary: {}", present(Path::new(DEFAULT_PROXY_BIN)));
    match which::which("iptables-restore") {
        Ok(p) => eprintln!("  iptables-restore: {}", p.display()),
        Err(_) => {
            let fallback = Path::new("/usr/sbin/iptables-restore");
            if fallback.exists() {
                eprintln!("  iptables-restore: {}", fallback.display());
            } else {
                eprintln!("  iptables-restore: not found");
            }
        }
    }
    eprintln!("  bootstrap template: {}", present(&paths.bootstrap_template()));
    eprintln!("  mesh-env file: {}", present(&paths.mesh_env_file()));
    eprintln!("  mesh config: {}", present(&paths.mesh_config_file()));
    eprintln!();

    let mesh = load_mesh_config(&env, &paths);
    let platform = PlatformInfo::discover(&env);
    let identity = RuntimeIdentity::resolve(&env, mesh.as_ref(), platform);
    eprintln!("  workload: {}.{}", identity.name, identity.namespace);
    eprintln!("  instance name: {}", identity.instance_name);
    eprintln!("  trust domain: {}", identity.trust_domain);
    eprintln!(
        "  gateway role: {}",
        identity.gateway.as_deref().unwrap_or("(none)")
    );

    let xds = resolve_discovery_address(&env, mesh.as_ref(), &identity.platform);
    match xds.effective_addr() {
        Some(addr) => eprintln!("  discovery: {} ({})", addr, xds.source),
        None if xds.agent_disabled() => eprintln!("  discovery: agent management disabled"),
        None => eprintln!("  discovery: unresolved"),
    }

    match transparent_preconditions(&env, as_root, identity.is_gateway()) {
        Ok(()) => eprintln!("  interception: transparent possible {}", verdict(true)),
        Err(reason) => eprintln!("  interception: whitebox ({reason})"),
    }

    if verbose {
        eprintln!();
        eprintln!("  lock candidates:");
        for p in candidate_lock_paths() {
            eprintln!("    - {}", p.display());
        }
    }

    eprintln!();
    eprintln!("doctor: completed diagnostics.");
}
