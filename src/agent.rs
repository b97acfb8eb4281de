#![allow(clippy::module_name_repetitions)]
//! Agent command assembly: binary lookup, argv and just-in-time env entries.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::envset::EnvSet;
use crate::identity::RuntimeIdentity;
use crate::paths::MeshPaths;
use crate::util::shell_join;

/// Port of the agent's security-token service, fixed by the mesh contract.
pub const STS_PORT: u16 = 15463;
pub const DEFAULT_AGENT_BIN: &str = "/usr/local/bin/pilot-agent";
pub const DEFAULT_PROXY_BIN: &str = "/usr/local/bin/envoy";

/// Locate the agent binary: explicit override, the well-known install path,
/// then PATH. NotFound maps to exit code 127 at the top level.
pub fn agent_binary(env: &EnvSet) -> io::Result<PathBuf> {
    if let Some(bin) = env.get("MESHRUN_AGENT_BIN").filter(|b| !b.is_empty()) {
        let p = PathBuf::from(bin);
        if p.exists() {
            return Ok(p);
        }
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("agent binary {bin} not found"),
        ));
    }
    let default = PathBuf::from(DEFAULT_AGENT_BIN);
    if default.exists() {
        return Ok(default);
    }
    which::which("pilot-agent")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "pilot-agent not found"))
}

/// Argument list after the binary: role, domain, service cluster, optional
/// log levels, STS port.
pub fn agent_args(identity: &RuntimeIdentity, env: &EnvSet) -> Vec<String> {
    let mut args = Vec::new();
    if identity.is_gateway() {
        args.push("router".to_string());
    } else {
        args.push("sidecar".to_string());
    }
    args.push("--domain".to_string());
    args.push(format!("{}.svc.cluster.local", identity.namespace));
    args.push("--serviceCluster".to_string());
    args.push(format!("{}.{}", identity.name, identity.namespace));
    if let Some(lvl) = env.get("AGENT_LOG_LEVEL").filter(|l| !l.is_empty()) {
        args.push(format!("--log_output_level={lvl}"));
    }
    if let Some(lvl) = env.get("ENVOY_LOG_LEVEL").filter(|l| !l.is_empty()) {
        args.push(format!("--proxyLogLevel={lvl}"));
    }
    args.push(format!("--stsPort={STS_PORT}"));
    args
}

/// Last env entries before spawn: proxy availability, bootstrap template and
/// the per-instance gRPC bootstrap path. All set-if-absent, so operators can
/// pin any of them.
pub fn finalize_agent_env(env: &mut EnvSet, paths: &MeshPaths, suffix: &str) {
    let proxy_bin = env
        .get("MESHRUN_PROXY_BIN")
        .filter(|b| !b.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROXY_BIN));
    let template = paths.bootstrap_template();

    if !proxy_bin.exists() || !template.exists() {
        // No data plane available: the agent still fetches certificates and
        // serves the gRPC bootstrap.
        env.set("DISABLE_ENVOY", "true");
    }
    if template.exists() {
        env.set("ISTIO_BOOTSTRAP", &template.display().to_string());
    }
    env.set(
        "GRPC_XDS_BOOTSTRAP",
        &paths.grpc_bootstrap_file(suffix).display().to_string(),
    );
}

/// Build the fully-wired Command plus a shell-style preview of it.
pub fn build_agent_cmd(
    identity: &RuntimeIdentity,
    env: &EnvSet,
    paths: &MeshPaths,
) -> io::Result<(Command, String)> {
    let binary = agent_binary(env)?;
    let args = agent_args(identity, env);

    let mut cmd = Command::new(&binary);
    cmd.args(&args);
    env.apply_to(&mut cmd);
    cmd.current_dir(effective_cwd(paths.base()));

    let mut preview_parts = vec![binary.display().to_string()];
    preview_parts.extend(args);
    Ok((cmd, shell_join(&preview_parts)))
}

fn effective_cwd(base: &Path) -> PathBuf {
    if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        base.to_path_buf()
    }
}
