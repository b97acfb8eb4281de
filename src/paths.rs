#![allow(clippy::module_name_repetitions)]
//! Filesystem layout for the launcher.
//!
//! All well-known files live under a single base directory: "/" when running
//! as root, "." otherwise, overridable with MESHRUN_BASE_DIR. Tests point the
//! base at a tempdir and exercise the real read/write paths.

use std::io;
use std::path::{Path, PathBuf};

/// Uid/gid the sidecar agent runs as and that owns its runtime directories.
pub const AGENT_UID: u32 = 1337;
pub const AGENT_GID: u32 = 1337;

#[derive(Debug, Clone)]
pub struct MeshPaths {
    base: PathBuf,
}

impl MeshPaths {
    /// Resolve the base directory: MESHRUN_BASE_DIR wins, then "/" for root,
    /// then the current directory for unprivileged runs.
    pub fn detect(as_root: bool) -> Self {
        if let Ok(dir) = std::env::var("MESHRUN_BASE_DIR") {
            if !dir.is_empty() {
                return Self::at(Path::new(&dir));
            }
        }
        if as_root {
            Self::at(Path::new("/"))
        } else {
            Self::at(Path::new("."))
        }
    }

    pub fn at(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn proxy_dir(&self) -> PathBuf {
        self.base.join("etc/istio/proxy")
    }

    pub fn pod_dir(&self) -> PathBuf {
        self.base.join("etc/istio/pod")
    }

    /// Downward-API style labels file the agent reads for workload metadata.
    pub fn labels_file(&self) -> PathBuf {
        self.pod_dir().join("labels")
    }

    pub fn envoy_dir(&self) -> PathBuf {
        self.base.join("var/lib/istio/envoy")
    }

    pub fn bootstrap_template(&self) -> PathBuf {
        self.envoy_dir().join("envoy_bootstrap_tmpl.json")
    }

    /// Saved launch script (env exports plus the agent command line).
    pub fn launch_info_file(&self) -> PathBuf {
        self.envoy_dir().join("cmd.sh")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.base.join("var/run/secrets")
    }

    pub fn istio_secrets_dir(&self) -> PathBuf {
        self.secrets_dir().join("istio")
    }

    pub fn root_cert_file(&self) -> PathBuf {
        self.istio_secrets_dir().join("root-cert.pem")
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.secrets_dir().join("tokens")
    }

    pub fn token_file(&self) -> PathBuf {
        self.tokens_dir().join("istio-token")
    }

    /// Where the agent writes the certificates it fetches. The env value the
    /// agent expects carries a trailing slash; see identity::apply_env.
    pub fn output_certs_dir(&self) -> PathBuf {
        self.secrets_dir().join("istio.io")
    }

    pub fn mesh_dir(&self) -> PathBuf {
        self.secrets_dir().join("mesh")
    }

    /// Operator-provided dotenv file merged into the child environment.
    pub fn mesh_env_file(&self) -> PathBuf {
        self.mesh_dir().join("mesh-env")
    }

    pub fn mesh_config_file(&self) -> PathBuf {
        self.base.join("etc/istio/config/mesh")
    }

    pub fn spiffe_uds_dir(&self) -> PathBuf {
        self.secrets_dir().join("workload-spiffe-uds")
    }

    pub fn spiffe_credentials_dir(&self) -> PathBuf {
        self.secrets_dir().join("workload-spiffe-credentials")
    }

    /// Platform-managed workload certificate; its presence switches the CA provider.
    pub fn workload_cert_file(&self) -> PathBuf {
        self.spiffe_credentials_dir().join("certificates.pem")
    }

    pub fn grpc_bootstrap_file(&self, suffix: &str) -> PathBuf {
        self.proxy_dir()
            .join(format!("grpc_bootstrap-{suffix}.json"))
    }

    /// Create the runtime directories and, when privileged, hand them to the
    /// agent uid. Secrets get a wide mode so the de-privileged agent can write
    /// fetched material under them.
    pub fn prepare_runtime_dirs(&self, as_root: bool) -> io::Result<()> {
        let dirs = [
            self.proxy_dir(),
            self.pod_dir(),
            self.envoy_dir(),
            self.istio_secrets_dir(),
            self.tokens_dir(),
            self.output_certs_dir(),
            self.mesh_dir(),
            self.spiffe_uds_dir(),
            self.spiffe_credentials_dir(),
        ];
        for d in &dirs {
            std::fs::create_dir_all(d)?;
        }
        if as_root {
            let owned = [
                self.proxy_dir(),
                self.pod_dir(),
                self.envoy_dir(),
                self.istio_secrets_dir(),
                self.tokens_dir(),
                self.output_certs_dir(),
                self.spiffe_uds_dir(),
                self.spiffe_credentials_dir(),
            ];
            for d in &owned {
                std::os::unix::fs::chown(d, Some(AGENT_UID), Some(AGENT_GID))?;
            }
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                self.secrets_dir(),
                std::fs::Permissions::from_mode(0o777),
            )?;
        }
        Ok(())
    }
}

/// True when the launcher itself runs as uid 0.
pub fn running_as_root() -> bool {
    nix::unistd::getuid().is_root()
}
