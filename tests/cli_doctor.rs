mod common;

#[test]
fn test_doctor_reports_and_exits_clean() {
    let base = common::base_dir();
    let out = common::meshrun_cmd(base.path())
        .arg("doctor")
        .output()
        .expect("run meshrun doctor");

    common::assert_success(&out);
    let err = common::stderr_of(&out);
    assert!(err.contains("meshrun doctor"), "header missing:\n{err}");
    assert!(err.contains("rustc:"), "toolchain line missing:\n{err}");
    assert!(err.contains("running as root:"), "uid line missing:\n{err}");
    assert!(err.contains("agent binary:"), "agent probe missing:\n{err}");
    assert!(
        err.contains("doctor: completed diagnostics."),
        "footer missing:\n{err}"
    );
}

#[test]
fn test_doctor_sees_inherited_discovery_address() {
    let base = common::base_dir();
    let out = common::meshrun_cmd(base.path())
        .env("XDS_ADDR", "istiod.example:15012")
        .env("WORKLOAD_NAME", "shop")
        .arg("doctor")
        .output()
        .expect("run meshrun doctor");

    common::assert_success(&out);
    let err = common::stderr_of(&out);
    assert!(
        err.contains("discovery: istiod.example:15012 (inherited env)"),
        "doctor should show the resolved discovery address:\n{err}"
    );
    assert!(
        err.contains("workload: shop.default"),
        "doctor should show the workload identity:\n{err}"
    );
}
