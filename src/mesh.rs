#![allow(clippy::module_name_repetitions)]
//! Mesh configuration documents and the mesh-env file.
//!
//! Two operator-facing inputs feed the resolver: a mesh-config YAML document
//! (`MESH_CONFIG` env or `<base>/etc/istio/config/mesh`) and a dotenv-style
//! mesh-env file projected into the instance by the platform. Both are
//! optional and both merge into the EnvSet with first-writer-wins.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::color::{color_enabled_stderr, log_warn_stderr};
use crate::envset::EnvSet;
use crate::paths::MeshPaths;

/// Subset of the proxy configuration document the launcher cares about.
/// Accepts YAML or JSON (JSON is a YAML subset for serde_yaml).
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub discovery_address: Option<String>,
    pub mesh_id: Option<String>,
    pub proxy_metadata: BTreeMap<String, String>,
}

/// Subset of the mesh-wide configuration document.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshConfig {
    pub trust_domain: Option<String>,
    pub default_config: Option<ProxyConfig>,
}

pub fn parse_proxy_config(text: &str) -> Result<ProxyConfig, serde_yaml::Error> {
    serde_yaml::from_str(text)
}

pub fn parse_mesh_config(text: &str) -> Result<MeshConfig, serde_yaml::Error> {
    serde_yaml::from_str(text)
}

/// Render the minimal PROXY_CONFIG document handed to the agent when the
/// launcher derived the discovery address itself.
pub fn proxy_config_json(discovery_address: &str) -> String {
    serde_json::json!({ "discoveryAddress": discovery_address }).to_string()
}

/// Load the mesh-config document: inline env first, then the well-known file.
/// A malformed document is logged and ignored (resolution stays non-fatal).
pub fn load_mesh_config(env: &EnvSet, paths: &MeshPaths) -> Option<MeshConfig> {
    let use_err = color_enabled_stderr();
    let text = match env.get("MESH_CONFIG") {
        Some(inline) if !inline.is_empty() => inline.to_string(),
        _ => match std::fs::read_to_string(paths.mesh_config_file()) {
            Ok(t) => t,
            Err(_) => return None,
        },
    };
    match parse_mesh_config(&text) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            log_warn_stderr(
                use_err,
                &format!("meshrun: ignoring malformed mesh config: {e}"),
            );
            None
        }
    }
}

/// Merge the mesh-env dotenv file into the EnvSet. Returns how many keys the
/// file actually contributed (pre-set keys are left alone).
pub fn load_mesh_env(env: &mut EnvSet, paths: &MeshPaths, verbose: bool) -> usize {
    let use_err = color_enabled_stderr();
    let path = paths.mesh_env_file();
    let iter = match dotenvy::from_path_iter(&path) {
        Ok(it) => it,
        Err(_) => return 0,
    };
    let mut applied = 0usize;
    for item in iter {
        match item {
            Ok((k, v)) => {
                if env.set(&k, &v) {
                    applied += 1;
                }
            }
            Err(e) => {
                log_warn_stderr(
                    use_err,
                    &format!("meshrun: skipping malformed mesh-env entry: {e}"),
                );
            }
        }
    }
    if verbose && applied > 0 {
        eprintln!(
            "meshrun: merged {} entr{} from {}",
            applied,
            if applied == 1 { "y" } else { "ies" },
            path.display()
        );
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_config_yaml_and_json() {
        let yaml = "discoveryAddress: istiod.example:15012\nmeshId: proj-123\n";
        let pc = parse_proxy_config(yaml).unwrap();
        assert_eq!(pc.discovery_address.as_deref(), Some("istiod.example:15012"));
        assert_eq!(pc.mesh_id.as_deref(), Some("proj-123"));

        let json = r#"{"discoveryAddress": "istiod.example:443"}"#;
        let pc = parse_proxy_config(json).unwrap();
        assert_eq!(pc.discovery_address.as_deref(), Some("istiod.example:443"));
    }

    #[test]
    fn test_parse_mesh_config_with_defaults() {
        let yaml = concat!(
            "trustDomain: example.svc.id.goog\n",
            "defaultConfig:\n",
            "  discoveryAddress: istiod.mesh.internal:15012\n",
            "  proxyMetadata:\n",
            "    DNS_AGENT: \"\"\n",
        );
        let mc = parse_mesh_config(yaml).unwrap();
        assert_eq!(mc.trust_domain.as_deref(), Some("example.svc.id.goog"));
        let dc = mc.default_config.unwrap();
        assert_eq!(
            dc.discovery_address.as_deref(),
            Some("istiod.mesh.internal:15012")
        );
        assert!(dc.proxy_metadata.contains_key("DNS_AGENT"));
    }

    #[test]
    fn test_parse_mesh_config_empty_document() {
        let mc = parse_mesh_config("{}").unwrap();
        assert!(mc.trust_domain.is_none());
        assert!(mc.default_config.is_none());
    }

    #[test]
    fn test_proxy_config_json_shape() {
        let s = proxy_config_json("istiod.example:15012");
        assert_eq!(s, r#"{"discoveryAddress":"istiod.example:15012"}"#);
    }
}
