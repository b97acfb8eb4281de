#![allow(clippy::module_name_repetitions)]
//! Discovery-address resolution and platform metadata lookup.
//!
//! The discovery (XDS) address is resolved once per instance, in strict
//! precedence order: an operator-injected PROXY_CONFIG document, an inherited
//! XDS_ADDR, platform auto-discovery from the mesh tenant, then the
//! mesh-config default. Platform coordinates come from env first and from the
//! metadata server only for fields still missing.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::color::{color_enabled_stderr, log_warn_stderr};
use crate::envset::EnvSet;
use crate::exec::{ExecRequest, ExecService};
use crate::identity::RuntimeIdentity;
use crate::mesh::{parse_proxy_config, proxy_config_json, MeshConfig};
use crate::paths::MeshPaths;

/// Control planes listening on this port speak the mesh's own CA; any other
/// port means the endpoint terminates TLS with a public/system certificate.
pub const CONTROL_PLANE_PORT: u16 = 15012;

pub const MESH_CA_ADDR: &str = "meshca.googleapis.com:443";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    ProxyConfigEnv,
    Inherited,
    Platform,
    MeshDefault,
    Unset,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscoverySource::ProxyConfigEnv => "proxy-config env",
            DiscoverySource::Inherited => "inherited env",
            DiscoverySource::Platform => "platform discovery",
            DiscoverySource::MeshDefault => "mesh-config default",
            DiscoverySource::Unset => "unset",
        };
        f.write_str(s)
    }
}

/// Resolved discovery endpoint. Computed once; never re-looked-up.
#[derive(Debug, Clone)]
pub struct XdsResolution {
    pub addr: Option<String>,
    pub source: DiscoverySource,
}

impl XdsResolution {
    /// `XDS_ADDR=-` is the operator's way of saying "do not manage an agent".
    pub fn agent_disabled(&self) -> bool {
        self.addr.as_deref() == Some("-")
    }

    /// Address usable for connecting (present, non-empty, not the disable marker).
    pub fn effective_addr(&self) -> Option<&str> {
        match self.addr.as_deref() {
            Some("") | Some("-") | None => None,
            Some(a) => Some(a),
        }
    }
}

/// Platform coordinates for the instance. Env wins over metadata-server
/// lookups; lookups run once and only for missing fields.
#[derive(Debug, Default, Clone)]
pub struct PlatformInfo {
    pub project_id: Option<String>,
    pub project_number: Option<String>,
    pub cluster_name: Option<String>,
    pub cluster_location: Option<String>,
    pub cluster_url: Option<String>,
    pub instance_id: Option<String>,
    pub mesh_tenant: Option<String>,
}

impl PlatformInfo {
    pub fn discover(env: &EnvSet) -> Self {
        let mut info = Self {
            project_id: env.get("PROJECT_ID").map(str::to_string),
            project_number: env.get("PROJECT_NUMBER").map(str::to_string),
            cluster_name: env.get("CLUSTER_NAME").map(str::to_string),
            cluster_location: env.get("CLUSTER_LOCATION").map(str::to_string),
            cluster_url: env.get("CLUSTER_URL").map(str::to_string),
            instance_id: env.get("INSTANCE_ID").map(str::to_string),
            mesh_tenant: env.get("MESH_TENANT").map(str::to_string),
        };
        if let Some(host) = metadata_host(env) {
            info.fill_from_metadata(&host);
        }
        if info.cluster_url.is_none() {
            if let (Some(p), Some(l), Some(c)) = (
                info.project_id.as_deref(),
                info.cluster_location.as_deref(),
                info.cluster_name.as_deref(),
            ) {
                info.cluster_url = Some(format!(
                    "https://container.googleapis.com/v1/projects/{p}/locations/{l}/clusters/{c}"
                ));
            }
        }
        info
    }

    fn fill_from_metadata(&mut self, host: &str) {
        if self.project_id.is_none() {
            self.project_id = metadata_value(host, "project/project-id");
        }
        if self.project_number.is_none() {
            self.project_number = metadata_value(host, "project/numeric-project-id");
        }
        if self.cluster_name.is_none() {
            self.cluster_name = metadata_value(host, "instance/attributes/cluster-name");
        }
        if self.cluster_location.is_none() {
            self.cluster_location = metadata_value(host, "instance/attributes/cluster-location");
        }
        if self.instance_id.is_none() {
            self.instance_id = metadata_value(host, "instance/id");
        }
    }

    /// Tenant of a managed control plane; "-" and "" mean none.
    pub fn effective_tenant(&self) -> Option<&str> {
        match self.mesh_tenant.as_deref() {
            Some("") | Some("-") | None => None,
            Some(t) => Some(t),
        }
    }
}

/// Pick the metadata server host, if any: explicit test seam, then the GCE
/// convention env, then the well-known name when the DMI vendor says we are
/// actually on the platform. None disables lookups entirely.
fn metadata_host(env: &EnvSet) -> Option<String> {
    if let Some(h) = env.get("MESHRUN_METADATA_HOST") {
        if h.is_empty() {
            return None;
        }
        return Some(h.to_string());
    }
    if let Some(h) = env.get("GCE_METADATA_HOST") {
        if !h.is_empty() {
            return Some(h.to_string());
        }
    }
    if on_gce() {
        return Some("metadata.google.internal".to_string());
    }
    None
}

fn on_gce() -> bool {
    std::fs::read_to_string("/sys/class/dmi/id/product_name")
        .map(|s| s.contains("Google"))
        .unwrap_or(false)
}

/// Single metadata lookup via curl; short timeout, None on any failure.
fn metadata_value(host: &str, path: &str) -> Option<String> {
    let url = format!("http://{host}/computeMetadata/v1/{path}");
    let svc = ExecService::new(Duration::from_secs(5));
    let out = svc
        .run(
            ExecRequest::new("curl")
                .args(["-s", "-f", "-m", "2", "-H", "Metadata-Flavor: Google"])
                .arg(&url)
                .inherit_env(true)
                .capture_output(true),
        )
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let v = out.stdout.trim().to_string();
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

/// Resolve the discovery address in precedence order. Missing everywhere is
/// non-fatal; the agent will fail fast and visibly on its own.
pub fn resolve_discovery_address(
    env: &EnvSet,
    mesh: Option<&MeshConfig>,
    platform: &PlatformInfo,
) -> XdsResolution {
    let use_err = color_enabled_stderr();

    if let Some(doc) = env.get("PROXY_CONFIG") {
        match parse_proxy_config(doc) {
            Ok(pc) => {
                return XdsResolution {
                    addr: pc.discovery_address,
                    source: DiscoverySource::ProxyConfigEnv,
                };
            }
            Err(e) => {
                log_warn_stderr(
                    use_err,
                    &format!("meshrun: ignoring malformed PROXY_CONFIG: {e}"),
                );
            }
        }
    }

    if let Some(addr) = env.get("XDS_ADDR") {
        if !addr.is_empty() {
            return XdsResolution {
                addr: Some(addr.to_string()),
                source: DiscoverySource::Inherited,
            };
        }
    }

    if let Some(tenant) = platform.effective_tenant() {
        return XdsResolution {
            addr: Some(format!("{tenant}:443")),
            source: DiscoverySource::Platform,
        };
    }

    if let Some(addr) = mesh
        .and_then(|m| m.default_config.as_ref())
        .and_then(|dc| dc.discovery_address.as_deref())
    {
        if !addr.is_empty() {
            return XdsResolution {
                addr: Some(addr.to_string()),
                source: DiscoverySource::MeshDefault,
            };
        }
    }

    XdsResolution {
        addr: None,
        source: DiscoverySource::Unset,
    }
}

/// Token audience plus the file the agent reads it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAudience {
    pub audience: String,
    pub file: PathBuf,
}

/// Derive the control-plane env entries from the resolved address. Returns
/// the audiences the credential bootstrap must be able to serve.
pub fn apply_control_plane_env(
    env: &mut EnvSet,
    paths: &MeshPaths,
    identity: &RuntimeIdentity,
    xds: &XdsResolution,
    mesh: Option<&MeshConfig>,
) -> Vec<TokenAudience> {
    let addr = xds.effective_addr();
    let control_plane_port = addr
        .map(|a| a.ends_with(&format!(":{CONTROL_PLANE_PORT}")))
        .unwrap_or(false);

    let audience = if control_plane_port {
        env.set("ISTIOD_SAN", "istiod.istio-system.svc");
        if env.contains("OSS_ISTIO") {
            "istio-ca".to_string()
        } else {
            identity.trust_domain.clone()
        }
    } else {
        // Endpoint is fronted by a public certificate; trust the system store.
        env.set("XDS_ROOT_CA", "SYSTEM");
        env.set("PILOT_CERT_PROVIDER", "system");
        env.set("CA_ROOT_CA", "SYSTEM");
        identity.trust_domain.clone()
    };

    if let Some(addr) = addr {
        env.set("XDS_ADDR", addr);
    }
    env.set("TRUST_DOMAIN", &identity.trust_domain);
    env.set("JWT_POLICY", "third-party-jwt");
    env.set("PROXY_CONFIG_XDS_AGENT", "true");
    env.set("ISTIO_META_APP_CONTAINERS", "cloudrun");

    let platform = &identity.platform;
    if let Some(url) = platform.cluster_url.as_deref() {
        env.set("GKE_CLUSTER_URL", url);
    }
    if platform.project_id.is_some() {
        env.set(
            "GCP_METADATA",
            &format!(
                "{}|{}|{}|{}",
                platform.project_id.as_deref().unwrap_or(""),
                platform.project_number.as_deref().unwrap_or(""),
                platform.cluster_name.as_deref().unwrap_or(""),
                platform.cluster_location.as_deref().unwrap_or("")
            ),
        );
    }

    if paths.workload_cert_file().exists() {
        env.set("CA_PROVIDER", "GoogleGkeWorkloadCertificate");
    }

    // Managed control plane extras; skipped when the operator injected a full
    // PROXY_CONFIG and thereby took ownership of the agent wiring.
    if let Some(tenant) = platform.effective_tenant() {
        if !env.contains("PROXY_CONFIG") {
            env.set("CA_ADDR", MESH_CA_ADDR);
            env.set("XDS_AUTH_PROVIDER", "gcp");
            env.set("ISTIO_META_CLOUDRUN_ADDR", tenant);
            if let (Some(p), Some(l), Some(c)) = (
                platform.project_id.as_deref(),
                platform.cluster_location.as_deref(),
                platform.cluster_name.as_deref(),
            ) {
                env.set("ISTIO_META_CLUSTER_ID", &format!("cn-{p}-{l}-{c}"));
            }
        }
    }

    if xds.source != DiscoverySource::ProxyConfigEnv {
        if let Some(addr) = addr {
            env.set("PROXY_CONFIG", &proxy_config_json(addr));
        }
    }

    if let Some(dc) = mesh.and_then(|m| m.default_config.as_ref()) {
        for (k, v) in &dc.proxy_metadata {
            env.set(k, v);
        }
    }

    vec![TokenAudience {
        audience,
        file: paths.token_file(),
    }]
}
