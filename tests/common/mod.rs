#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};

pub fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_meshrun")
}

/// Fresh base directory for one launch. World-traversable so a de-privileged
/// agent child can still reach it when the suite runs as root.
pub fn base_dir() -> tempfile::TempDir {
    let td = tempfile::tempdir().expect("tempdir");
    let mut perm = std::fs::metadata(td.path()).expect("meta").permissions();
    use std::os::unix::fs::PermissionsExt;
    perm.set_mode(0o755);
    std::fs::set_permissions(td.path(), perm).expect("chmod base");
    td
}

/// Command against an isolated environment: pinned base dir, lock skipped,
/// platform lookups disabled and every recognized mesh variable scrubbed so
/// the host environment cannot leak into assertions.
pub fn meshrun_cmd(base: &Path) -> Command {
    let mut cmd = Command::new(bin());
    cmd.env("MESHRUN_BASE_DIR", base)
        .env("MESHRUN_SKIP_LOCK", "1")
        .env("MESHRUN_METADATA_HOST", "")
        // Never let a privileged test run touch the host's packet filter.
        .env("MESHRUN_IPTABLES_RESTORE", "/bin/true")
        .env("NO_COLOR", "1");
    for k in [
        "XDS_ADDR",
        "PROXY_CONFIG",
        "GATEWAY_NAME",
        "K_SERVICE",
        "K_REVISION",
        "WORKLOAD_NAME",
        "WORKLOAD_NAMESPACE",
        "WORKLOAD_SERVICE_ACCOUNT",
        "FORCE_START",
        "MESH_TENANT",
        "MESH_CONFIG",
        "ISTIO_META_INTERCEPTION_MODE",
        "OUTBOUND_PORTS_EXCLUDE",
        "OUTBOUND_IP_RANGES_INCLUDE",
        "MESHRUN_AGENT_BIN",
        "MESHRUN_PROXY_BIN",
        "MESHRUN_SAVE_LAUNCH",
        "MESHRUN_LOCK_FILE",
        "CA_ROOT_PEM",
        "MESH_CREDENTIAL_HELPER",
        "OSS_ISTIO",
        "INSTANCE_ID",
        "TRUST_DOMAIN",
        "CANONICAL_REVISION",
        "PROJECT_ID",
        "PROJECT_NUMBER",
        "CLUSTER_NAME",
        "CLUSTER_LOCATION",
        "CLUSTER_URL",
        "GCE_METADATA_HOST",
        "AGENT_LOG_LEVEL",
        "ENVOY_LOG_LEVEL",
        "GRPC_XDS_BOOTSTRAP",
        "RUST_LOG",
    ] {
        cmd.env_remove(k);
    }
    cmd
}

/// Write an executable stub standing in for the agent binary.
pub fn agent_stub(base: &Path, body: &str) -> std::path::PathBuf {
    let path = base.join("agent-stub.sh");
    let mut f = std::fs::File::create(&path).expect("create agent stub");
    writeln!(f, "#!/bin/sh\n{body}").expect("write agent stub");
    drop(f);
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod stub");
    path
}

pub fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

pub fn assert_success(out: &Output) {
    assert!(
        out.status.success(),
        "meshrun exited non-zero: {:?}\nstdout:\n{}\nstderr:\n{}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
}
