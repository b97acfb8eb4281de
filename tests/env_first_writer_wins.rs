mod common;

// Inherited XDS_ADDR must be left untouched and short-circuit auto-discovery,
// even when a mesh tenant would otherwise resolve a different address.
#[test]
fn test_inherited_xds_addr_wins_over_platform_discovery() {
    let base = common::base_dir();
    let stub = common::agent_stub(base.path(), "exit 0");
    let out = common::meshrun_cmd(base.path())
        .env("MESHRUN_AGENT_BIN", &stub)
        .env("XDS_ADDR", "foo:1234")
        .env("MESH_TENANT", "tenant.mesh.example")
        .env("WORKLOAD_NAME", "shop")
        .arg("--dry-run")
        .output()
        .expect("run meshrun --dry-run");

    common::assert_success(&out);
    let err = common::stderr_of(&out);
    assert!(
        err.contains("foo:1234 (inherited env)"),
        "discovery should come from the inherited env:\n{err}"
    );
    assert!(
        !err.contains("meshrun: env +XDS_ADDR="),
        "inherited XDS_ADDR must not be re-derived:\n{err}"
    );
    assert!(
        err.contains(r#"meshrun: env +PROXY_CONFIG={"discoveryAddress":"foo:1234"}"#),
        "derived PROXY_CONFIG should carry the inherited address:\n{err}"
    );
}

// Port 1234 is not the control-plane port, so the system trust store applies.
#[test]
fn test_non_control_plane_port_forces_system_ca_flags() {
    let base = common::base_dir();
    let stub = common::agent_stub(base.path(), "exit 0");
    let out = common::meshrun_cmd(base.path())
        .env("MESHRUN_AGENT_BIN", &stub)
        .env("XDS_ADDR", "foo:1234")
        .env("WORKLOAD_NAME", "shop")
        .args(["--dry-run", "--quiet"])
        .output()
        .expect("run meshrun --dry-run");

    common::assert_success(&out);
    let err = common::stderr_of(&out);
    for line in [
        "meshrun: env +XDS_ROOT_CA=SYSTEM",
        "meshrun: env +PILOT_CERT_PROVIDER=system",
        "meshrun: env +CA_ROOT_CA=SYSTEM",
    ] {
        assert!(err.contains(line), "missing {line} in:\n{err}");
    }
    assert!(
        !err.contains("meshrun: env +ISTIOD_SAN="),
        "system-CA mode must not pin the control-plane SAN:\n{err}"
    );
}
