#![allow(clippy::module_name_repetitions)]
//! Traffic interception: transparent redirect rules or whitebox fallback.
//!
//! The decision is made exactly once, before any child process exists, and is
//! one-way: any precondition or application failure selects Whitebox for the
//! lifetime of the instance. Rules are kept structured and rendered to
//! iptables-restore text only at the apply boundary.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::color::{color_enabled_stderr, log_info_stderr, log_warn_stderr};
use crate::envset::EnvSet;
use crate::exec::{ExecRequest, ExecService};
use crate::paths::{AGENT_GID, AGENT_UID};
use crate::util::parse_csv_ports;

/// Tunnel ports that must never be captured, inbound or outbound.
pub const RESERVED_TUNNEL_PORTS: [u16; 2] = [15008, 15009];
pub const OUTBOUND_CAPTURE_PORT: u16 = 15001;
pub const INBOUND_CAPTURE_PORT: u16 = 15006;
pub const DNS_CAPTURE_PORT: u16 = 15053;
/// Port an app is told to use for explicit proxying when interception is off.
pub const WHITEBOX_HTTP_PROXY_PORT: u16 = 15007;

const METADATA_SERVER_IP: &str = "169.254.169.254/32";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptionState {
    Transparent,
    Whitebox,
}

/// Complete redirect rule set for one instance. Rendered once, applied once.
#[derive(Debug, Clone)]
pub struct RedirectRules {
    pub outbound_port: u16,
    pub inbound_port: u16,
    pub dns_port: u16,
    pub proxy_uid: u32,
    pub proxy_gid: u32,
    pub include_ranges: Vec<String>,
    pub inbound_exclude_ports: Vec<u16>,
    pub outbound_exclude_ports: Vec<u16>,
}

impl Default for RedirectRules {
    fn default() -> Self {
        Self {
            outbound_port: OUTBOUND_CAPTURE_PORT,
            inbound_port: INBOUND_CAPTURE_PORT,
            dns_port: DNS_CAPTURE_PORT,
            proxy_uid: AGENT_UID,
            proxy_gid: AGENT_GID,
            include_ranges: vec!["10.0.0.0/8".to_string()],
            inbound_exclude_ports: vec![15000, 15008, 15009, 15020, 15021, 15022, 15090],
            outbound_exclude_ports: RESERVED_TUNNEL_PORTS.to_vec(),
        }
    }
}

impl RedirectRules {
    /// Build from env knobs. The reserved tunnel ports are always present in
    /// the outbound exclusions regardless of what the operator lists.
    pub fn from_env(env: &EnvSet) -> Self {
        let mut rules = Self::default();
        if let Some(ranges) = env.get("OUTBOUND_IP_RANGES_INCLUDE") {
            let list: Vec<String> = ranges
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !list.is_empty() {
                rules.include_ranges = list;
            }
        }
        if let Some(csv) = env.get("OUTBOUND_PORTS_EXCLUDE") {
            let mut ports = parse_csv_ports(csv);
            for r in RESERVED_TUNNEL_PORTS {
                if !ports.contains(&r) {
                    ports.push(r);
                }
            }
            rules.outbound_exclude_ports = ports;
        }
        rules
    }

    /// Render the nat table document consumed by iptables-restore.
    pub fn render(&self) -> String {
        let mut doc = String::with_capacity(2048);
        doc.push_str("*nat\n");
        doc.push_str(":PREROUTING ACCEPT [0:0]\n");
        doc.push_str(":INPUT ACCEPT [0:0]\n");
        doc.push_str(":OUTPUT ACCEPT [0:0]\n");
        doc.push_str(":POSTROUTING ACCEPT [0:0]\n");
        doc.push_str(":ISTIO_INBOUND - [0:0]\n");
        doc.push_str(":ISTIO_IN_REDIRECT - [0:0]\n");
        doc.push_str(":ISTIO_OUTPUT - [0:0]\n");
        doc.push_str(":ISTIO_REDIRECT - [0:0]\n");

        // Primary interface traffic already went through the mesh on the way in.
        doc.push_str("-A PREROUTING -i eth0 -j RETURN\n");
        doc.push_str("-A PREROUTING -p tcp -j ISTIO_INBOUND\n");
        doc.push_str("-A OUTPUT -o eth0 -p tcp -j RETURN\n");
        doc.push_str("-A OUTPUT -p tcp -j ISTIO_OUTPUT\n");
        doc.push_str(&format!(
            "-A OUTPUT -p udp -m udp --dport 53 -m owner --uid-owner {} -j RETURN\n",
            self.proxy_uid
        ));
        doc.push_str(&format!(
            "-A OUTPUT -p udp -m udp --dport 53 -m owner --gid-owner {} -j RETURN\n",
            self.proxy_gid
        ));
        doc.push_str(&format!(
            "-A OUTPUT -d {METADATA_SERVER_IP} -p udp -m udp --dport 53 -j REDIRECT --to-ports {}\n",
            self.dns_port
        ));
        doc.push_str("-A OUTPUT -o eth0 -j RETURN\n");

        for port in &self.inbound_exclude_ports {
            doc.push_str(&format!(
                "-A ISTIO_INBOUND -p tcp -m tcp --dport {port} -j RETURN\n"
            ));
        }
        doc.push_str("-A ISTIO_INBOUND -p tcp -j ISTIO_IN_REDIRECT\n");
        doc.push_str(&format!(
            "-A ISTIO_IN_REDIRECT -p tcp -j REDIRECT --to-ports {}\n",
            self.inbound_port
        ));

        for port in &self.outbound_exclude_ports {
            doc.push_str(&format!(
                "-A ISTIO_OUTPUT -p tcp -m tcp --dport {port} -j RETURN\n"
            ));
        }
        doc.push_str("-A ISTIO_OUTPUT -s 127.0.0.6/32 -o lo -j RETURN\n");
        doc.push_str(&format!(
            "-A ISTIO_OUTPUT ! -d 127.0.0.1/32 -o lo -p tcp -m tcp ! --dport 53 -m owner --uid-owner {} -j ISTIO_IN_REDIRECT\n",
            self.proxy_uid
        ));
        doc.push_str(&format!(
            "-A ISTIO_OUTPUT -o lo -p tcp -m tcp ! --dport 53 -m owner ! --uid-owner {} -j RETURN\n",
            self.proxy_uid
        ));
        doc.push_str(&format!(
            "-A ISTIO_OUTPUT -m owner --uid-owner {} -j RETURN\n",
            self.proxy_uid
        ));
        doc.push_str(&format!(
            "-A ISTIO_OUTPUT ! -d 127.0.0.1/32 -o lo -m owner --gid-owner {} -j ISTIO_IN_REDIRECT\n",
            self.proxy_gid
        ));
        doc.push_str(&format!(
            "-A ISTIO_OUTPUT -o lo -p tcp -m tcp ! --dport 53 -m owner ! --gid-owner {} -j RETURN\n",
            self.proxy_gid
        ));
        doc.push_str(&format!(
            "-A ISTIO_OUTPUT -m owner --gid-owner {} -j RETURN\n",
            self.proxy_gid
        ));
        doc.push_str(&format!(
            "-A ISTIO_OUTPUT -d {METADATA_SERVER_IP} -p tcp -m tcp --dport 53 -j REDIRECT --to-ports {}\n",
            self.dns_port
        ));
        doc.push_str("-A ISTIO_OUTPUT -d 127.0.0.1/32 -j RETURN\n");
        for range in &self.include_ranges {
            doc.push_str(&format!("-A ISTIO_OUTPUT -d {range} -j ISTIO_REDIRECT\n"));
        }
        doc.push_str("-A ISTIO_OUTPUT -j RETURN\n");
        doc.push_str(&format!(
            "-A ISTIO_REDIRECT -p tcp -j REDIRECT --to-ports {}\n",
            self.outbound_port
        ));
        doc.push_str("COMMIT\n");
        doc
    }
}

/// Check whether Transparent may even be attempted. Err carries the reason.
pub fn transparent_preconditions(
    env: &EnvSet,
    as_root: bool,
    gateway: bool,
) -> std::result::Result<(), &'static str> {
    if env.get("ISTIO_META_INTERCEPTION_MODE") == Some("NONE") {
        return Err("interception mode override is NONE");
    }
    if gateway {
        return Err("gateway role proxies explicitly");
    }
    if !as_root {
        return Err("not running as root");
    }
    Ok(())
}

/// Decide and (when possible) establish interception. Exactly one call per
/// instance, before any child spawn. Whitebox always records the markers the
/// app uses to proxy explicitly.
#[cfg_attr(
    feature = "otel",
    tracing::instrument(skip_all, fields(as_root, gateway, dry_run))
)]
pub fn establish(
    env: &mut EnvSet,
    rules: &RedirectRules,
    as_root: bool,
    gateway: bool,
    dry_run: bool,
    verbose: bool,
) -> InterceptionState {
    let use_err = color_enabled_stderr();

    if let Err(reason) = transparent_preconditions(env, as_root, gateway) {
        log_info_stderr(
            use_err,
            &format!("meshrun: whitebox mode: {reason}"),
        );
        set_whitebox_markers(env);
        return InterceptionState::Whitebox;
    }

    if dry_run {
        if verbose {
            eprintln!("meshrun: dry-run: skipping redirect rule application");
        }
        env.set("ISTIO_META_DNS_CAPTURE", "true");
        return InterceptionState::Transparent;
    }

    match apply_redirect_rules(rules) {
        Ok(()) => {
            log_info_stderr(use_err, "meshrun: transparent interception enabled");
            env.set("ISTIO_META_DNS_CAPTURE", "true");
            InterceptionState::Transparent
        }
        Err(e) => {
            log_warn_stderr(
                use_err,
                &format!("meshrun: redirect rules failed, falling back to whitebox: {e:#}"),
            );
            set_whitebox_markers(env);
            InterceptionState::Whitebox
        }
    }
}

fn set_whitebox_markers(env: &mut EnvSet) {
    env.set("ISTIO_META_INTERCEPTION_MODE", "NONE");
    env.set("HTTP_PROXY_PORT", &WHITEBOX_HTTP_PROXY_PORT.to_string());
}

/// Stage the rendered document in a temp file and apply it atomically with a
/// single iptables-restore run.
fn apply_redirect_rules(rules: &RedirectRules) -> Result<()> {
    let restore = iptables_restore_path()?;
    let mut staged = tempfile::NamedTempFile::new().context("failed to stage rules file")?;
    staged
        .write_all(rules.render().as_bytes())
        .context("failed to write rules file")?;
    staged.flush().context("failed to flush rules file")?;

    let svc = ExecService::new(Duration::from_secs(30));
    let out = svc.run(
        ExecRequest::new(&restore)
            .arg(staged.path())
            .inherit_env(true)
            .capture_output(true),
    )?;
    if !out.status.success() {
        return Err(anyhow!(
            "{} exited with {:?}: {}",
            restore.display(),
            out.status.code(),
            out.stderr.trim()
        ));
    }
    Ok(())
}

fn iptables_restore_path() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("MESHRUN_IPTABLES_RESTORE") {
        if !p.is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    if let Ok(p) = which::which("iptables-restore") {
        return Ok(p);
    }
    let fallback = PathBuf::from("/usr/sbin/iptables-restore");
    if fallback.exists() {
        return Ok(fallback);
    }
    Err(anyhow!("iptables-restore not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_reserved_ports_everywhere() {
        let doc = RedirectRules::default().render();
        for port in RESERVED_TUNNEL_PORTS {
            assert!(
                doc.contains(&format!("-A ISTIO_INBOUND -p tcp -m tcp --dport {port} -j RETURN")),
                "inbound exclusion for {port} missing"
            );
            assert!(
                doc.contains(&format!("-A ISTIO_OUTPUT -p tcp -m tcp --dport {port} -j RETURN")),
                "outbound exclusion for {port} missing"
            );
        }
    }

    #[test]
    fn test_render_redirect_targets_and_commit() {
        let doc = RedirectRules::default().render();
        assert!(doc.starts_with("*nat\n"));
        assert!(doc.contains("-A ISTIO_IN_REDIRECT -p tcp -j REDIRECT --to-ports 15006\n"));
        assert!(doc.contains("-A ISTIO_REDIRECT -p tcp -j REDIRECT --to-ports 15001\n"));
        assert!(doc.contains("--dport 53 -j REDIRECT --to-ports 15053\n"));
        assert!(doc.contains("-A ISTIO_OUTPUT -d 10.0.0.0/8 -j ISTIO_REDIRECT\n"));
        assert!(doc.ends_with("COMMIT\n"));
    }

    #[test]
    fn test_from_env_appends_reserved_to_operator_list() {
        let mut env = EnvSet::new();
        env.set("OUTBOUND_PORTS_EXCLUDE", "8080,9090");
        let rules = RedirectRules::from_env(&env);
        assert!(rules.outbound_exclude_ports.contains(&8080));
        assert!(rules.outbound_exclude_ports.contains(&9090));
        for r in RESERVED_TUNNEL_PORTS {
            assert!(
                rules.outbound_exclude_ports.contains(&r),
                "reserved port {r} must always be excluded"
            );
        }
    }

    #[test]
    fn test_from_env_does_not_duplicate_reserved() {
        let mut env = EnvSet::new();
        env.set("OUTBOUND_PORTS_EXCLUDE", "15008,15009");
        let rules = RedirectRules::from_env(&env);
        assert_eq!(rules.outbound_exclude_ports, vec![15008, 15009]);
    }

    #[test]
    fn test_preconditions_reasons() {
        let env = EnvSet::new();
        assert!(transparent_preconditions(&env, true, false).is_ok());
        assert_eq!(
            transparent_preconditions(&env, false, false),
            Err("not running as root")
        );
        assert_eq!(
            transparent_preconditions(&env, true, true),
            Err("gateway role proxies explicitly")
        );
        let mut env = EnvSet::new();
        env.set("ISTIO_META_INTERCEPTION_MODE", "NONE");
        assert_eq!(
            transparent_preconditions(&env, true, false),
            Err("interception mode override is NONE")
        );
    }

    #[test]
    fn test_establish_whitebox_records_markers() {
        let mut env = EnvSet::new();
        let rules = RedirectRules::default();
        let state = establish(&mut env, &rules, false, false, false, false);
        assert_eq!(state, InterceptionState::Whitebox);
        assert_eq!(env.get("ISTIO_META_INTERCEPTION_MODE"), Some("NONE"));
        assert_eq!(env.get("HTTP_PROXY_PORT"), Some("15007"));
        assert_eq!(env.get("ISTIO_META_DNS_CAPTURE"), None);
    }

    #[test]
    fn test_establish_dry_run_skips_apply() {
        let mut env = EnvSet::new();
        let rules = RedirectRules::default();
        let state = establish(&mut env, &rules, true, false, true, false);
        assert_eq!(state, InterceptionState::Transparent);
        assert_eq!(env.get("ISTIO_META_DNS_CAPTURE"), Some("true"));
    }
}
