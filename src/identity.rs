#![allow(clippy::module_name_repetitions)]
//! Runtime identity: who this instance is in the mesh.
//!
//! Derivation is pure given the env snapshot and platform coordinates, so the
//! same inputs always produce the same identity. The instance (pod) name must
//! be unique per concurrent instance yet reproducible enough for debugging.

use std::io;
use std::path::PathBuf;

use crate::discovery::PlatformInfo;
use crate::envset::EnvSet;
use crate::mesh::MeshConfig;
use crate::paths::MeshPaths;
use crate::util::second_of_minute;

#[derive(Debug, Clone)]
pub struct RuntimeIdentity {
    pub name: String,
    pub namespace: String,
    pub revision: String,
    pub trust_domain: String,
    pub gateway: Option<String>,
    pub service_account: String,
    pub instance_name: String,
    pub platform: PlatformInfo,
}

impl RuntimeIdentity {
    /// Resolve the identity from env, mesh config and platform coordinates.
    /// Immutable afterwards.
    pub fn resolve(env: &EnvSet, mesh: Option<&MeshConfig>, platform: PlatformInfo) -> Self {
        let gateway = env
            .get("GATEWAY_NAME")
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let name = first_nonempty(&[
            env.get("K_SERVICE"),
            env.get("WORKLOAD_NAME"),
            gateway.as_deref(),
        ])
        .unwrap_or_default();

        let namespace = first_nonempty(&[
            env.get("WORKLOAD_NAMESPACE"),
            env.get("POD_NAMESPACE"),
        ])
        .unwrap_or_else(|| "default".to_string());

        let service_account = first_nonempty(&[env.get("WORKLOAD_SERVICE_ACCOUNT")])
            .unwrap_or_else(|| "default".to_string());

        let trust_domain = first_nonempty(&[
            env.get("TRUST_DOMAIN"),
            mesh.and_then(|m| m.trust_domain.as_deref()),
        ])
        .unwrap_or_else(|| match platform.project_id.as_deref() {
            Some(p) if !p.is_empty() => format!("{p}.svc.id.goog"),
            _ => "cluster.local".to_string(),
        });

        let hostname = env
            .get("HOSTNAME")
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(system_hostname);

        let instance_name = derive_instance_name(
            &name,
            env.get("K_REVISION"),
            platform.instance_id.as_deref(),
            hostname.as_deref(),
        );

        // The revision label carries the per-instance suffix; only an explicit
        // CANONICAL_REVISION overrides it.
        let revision = first_nonempty(&[
            env.get("CANONICAL_REVISION"),
            Some(instance_name.as_str()),
        ])
        .unwrap_or_else(|| "v1".to_string());

        Self {
            name,
            namespace,
            revision,
            trust_domain,
            gateway,
            service_account,
            instance_name,
            platform,
        }
    }

    pub fn is_gateway(&self) -> bool {
        self.gateway.is_some()
    }

    /// Labels file content the agent reads for workload metadata.
    pub fn labels_content(&self) -> String {
        match self.gateway.as_deref() {
            Some(gw) => format!(
                "version=\"{}\"\nsecurity.istio.io/tlsMode=\"istio\"\nistio=\"{}\"\n",
                self.revision, gw
            ),
            None => format!(
                concat!(
                    "version=\"{}\"\n",
                    "security.istio.io/tlsMode=\"istio\"\n",
                    "app=\"{}\"\n",
                    "service.istio.io/canonical-name=\"{}\"\n",
                    "environment=\"cloud-run-mesh\"\n",
                ),
                self.revision, self.name, self.name
            ),
        }
    }

    /// Persist the labels file. Failure is the caller's to log; never fatal.
    pub fn write_labels_file(&self, paths: &MeshPaths) -> io::Result<PathBuf> {
        std::fs::create_dir_all(paths.pod_dir())?;
        let file = paths.labels_file();
        std::fs::write(&file, self.labels_content())?;
        Ok(file)
    }

    /// Contribute the identity-derived env entries, all set-if-absent.
    pub fn apply_env(&self, env: &mut EnvSet, paths: &MeshPaths) {
        env.set("POD_NAMESPACE", &self.namespace);
        env.set("POD_NAME", &self.instance_name);
        env.set("ISTIO_META_WORKLOAD_NAME", &self.name);
        env.set("CANONICAL_SERVICE", &self.name);
        env.set("CANONICAL_REVISION", &self.revision);
        env.set("SERVICE_ACCOUNT", &self.service_account);
        if let Some(num) = self.platform.project_number.as_deref() {
            if !num.is_empty() {
                env.set("ISTIO_META_MESH_ID", &format!("proj-{num}"));
            }
        }
        // Trailing slash: the agent treats OUTPUT_CERTS as a directory prefix.
        env.set(
            "OUTPUT_CERTS",
            &format!("{}/", paths.output_certs_dir().display()),
        );
        if let Some(ip) = eth1_ipv4() {
            env.set("ISTIO_META_AUTO_REGISTER_GROUP", &self.name);
            env.set("AUTO_REGISTER_GROUP", &self.name);
            env.set("INSTANCE_IP", &ip.to_string());
        }
    }
}

/// Instance (pod) name rules:
/// 1. platform revision plus instance-id prefix (8 chars), or plus the
///    current second when no instance id;
/// 2. else the hostname's first DNS label;
/// 3. else workload name plus the current second.
pub fn derive_instance_name(
    name: &str,
    k_revision: Option<&str>,
    instance_id: Option<&str>,
    hostname: Option<&str>,
) -> String {
    if let Some(rev) = k_revision.filter(|r| !r.is_empty()) {
        if let Some(id) = instance_id.filter(|i| !i.is_empty()) {
            let short: String = id.chars().take(8).collect();
            return format!("{rev}-{short}");
        }
        return format!("{rev}-{}", second_of_minute());
    }
    if let Some(label) = hostname
        .and_then(|h| h.split('.').next())
        .filter(|l| !l.is_empty())
    {
        return label.to_string();
    }
    format!("{name}-{}", second_of_minute())
}

fn first_nonempty(candidates: &[Option<&str>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .find(|v| !v.is_empty())
        .map(|v| (*v).to_string())
}

fn system_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
}

/// First IPv4 address of an up `eth1`, the platform's auto-registration NIC.
fn eth1_ipv4() -> Option<std::net::Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifa in addrs {
        if ifa.interface_name != "eth1" {
            continue;
        }
        if !ifa.flags.contains(nix::net::if_::InterfaceFlags::IFF_UP) {
            continue;
        }
        if let Some(sin) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Some(sin.ip());
        }
    }
    None
}
