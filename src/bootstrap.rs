#![allow(clippy::module_name_repetitions)]
//! Credential bootstrap seam and launch-info debugging dump.
//!
//! Everything here happens before the first child spawn and is non-fatal by
//! contract: a mesh instance without credentials starts anyway and the agent
//! reports the real failure with far better detail than we could.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::discovery::TokenAudience;
use crate::envset::EnvSet;
use crate::exec::{ExecRequest, ExecService};
use crate::paths::{MeshPaths, AGENT_GID, AGENT_UID};
use crate::util::shell_escape;

/// Make the runtime/secret tree ready for the agent: directories, ownership,
/// the root-of-trust PEM and the audience token locations.
#[cfg_attr(feature = "otel", tracing::instrument(skip_all, fields(as_root)))]
pub fn prepare_credentials(
    env: &EnvSet,
    paths: &MeshPaths,
    audiences: &[TokenAudience],
    as_root: bool,
    verbose: bool,
) -> Result<()> {
    paths
        .prepare_runtime_dirs(as_root)
        .context("failed to prepare runtime directories")?;

    let root_cert = paths.root_cert_file();
    if let Some(pem) = env.get("CA_ROOT_PEM").filter(|p| !p.is_empty()) {
        std::fs::write(&root_cert, pem)
            .with_context(|| format!("failed to write {}", root_cert.display()))?;
        if as_root {
            std::os::unix::fs::chown(&root_cert, Some(AGENT_UID), Some(AGENT_GID))
                .with_context(|| format!("failed to chown {}", root_cert.display()))?;
        }
        if verbose {
            eprintln!("meshrun: wrote root certificate to {}", root_cert.display());
        }
    } else if verbose && root_cert.exists() {
        eprintln!("meshrun: using existing root certificate {}", root_cert.display());
    }

    for aud in audiences {
        if let Some(parent) = aud.file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if verbose {
            eprintln!(
                "meshrun: token audience {} expected at {}",
                aud.audience,
                aud.file.display()
            );
        }
    }
    Ok(())
}

/// Run the external credential helper named by MESH_CREDENTIAL_HELPER to
/// completion, passing the base directory. The helper is not a managed child.
/// Returns whether a helper actually ran.
pub fn run_credential_helper(env: &EnvSet, paths: &MeshPaths, verbose: bool) -> Result<bool> {
    let helper = match env.get("MESH_CREDENTIAL_HELPER").filter(|h| !h.is_empty()) {
        Some(h) => h.to_string(),
        None => return Ok(false),
    };
    if verbose {
        eprintln!("meshrun: running credential helper {helper}");
    }
    let svc = ExecService::new(Duration::from_secs(60));
    let out = svc.run(
        ExecRequest::new(&helper)
            .arg(paths.base())
            .inherit_env(true)
            .capture_output(true),
    )?;
    if !out.status.success() {
        return Err(anyhow!(
            "credential helper {helper} exited with {:?}: {}",
            out.status.code(),
            out.stderr.trim()
        ));
    }
    Ok(true)
}

/// Write a re-runnable launch script: the full child environment as export
/// lines, then the agent command. Debug aid behind MESHRUN_SAVE_LAUNCH=1.
pub fn save_launch_info(paths: &MeshPaths, env: &EnvSet, preview: &str) -> io::Result<PathBuf> {
    std::fs::create_dir_all(paths.envoy_dir())?;
    let mut script = String::new();
    for (k, v) in env.iter() {
        script.push_str("export ");
        script.push_str(k);
        script.push('=');
        script.push_str(&shell_escape(v));
        script.push('\n');
    }
    script.push('\n');
    script.push_str(preview);
    script.push('\n');

    let file = paths.launch_info_file();
    std::fs::write(&file, script)?;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o700))?;
    Ok(file)
}
