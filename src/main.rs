use std::process::ExitCode;

use clap::Parser;

use meshrun::agent::{build_agent_cmd, finalize_agent_env};
use meshrun::banner::print_startup_banner;
use meshrun::bootstrap::{prepare_credentials, run_credential_helper, save_launch_info};
use meshrun::cli::{Cli, Cmd};
use meshrun::color::{color_enabled_stderr, log_error_stderr, log_info_stderr, log_warn_stderr};
use meshrun::discovery::{apply_control_plane_env, resolve_discovery_address, PlatformInfo};
use meshrun::doctor::run_doctor;
use meshrun::envset::EnvSet;
use meshrun::errors::{exit_code_for_io_error, exit_code_for_lock_error};
use meshrun::identity::RuntimeIdentity;
use meshrun::intercept::{establish, RedirectRules};
use meshrun::lock::{acquire_lock, should_acquire_lock};
use meshrun::mesh::{load_mesh_config, load_mesh_env};
use meshrun::paths::{running_as_root, MeshPaths};
use meshrun::supervisor::Supervisor;
use meshrun::telemetry::init_tracing;
use meshrun::util::create_instance_suffix;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(mode) = cli.color {
        meshrun::color::set_color_mode(mode);
    }
    init_tracing();

    if let Some(Cmd::Doctor) = &cli.command {
        run_doctor(cli.verbose);
        return ExitCode::from(0);
    }

    let lock = if should_acquire_lock() {
        match acquire_lock() {
            Ok(l) => Some(l),
            Err(e) => {
                log_error_stderr(color_enabled_stderr(), &format!("meshrun: {e}"));
                return ExitCode::from(exit_code_for_lock_error(&e));
            }
        }
    } else {
        None
    };

    let code = run_launch(&cli);
    drop(lock);
    ExitCode::from(code)
}

/// The launch sequence: resolve -> bootstrap -> intercept -> supervise.
fn run_launch(cli: &Cli) -> u8 {
    let use_err = color_enabled_stderr();
    let as_root = running_as_root();
    let paths = MeshPaths::detect(as_root);

    let mut env = EnvSet::from_process_env();
    load_mesh_env(&mut env, &paths, cli.verbose);
    let mesh = load_mesh_config(&env, &paths);
    let platform = PlatformInfo::discover(&env);
    let identity = RuntimeIdentity::resolve(&env, mesh.as_ref(), platform);

    match identity.write_labels_file(&paths) {
        Ok(f) => {
            if cli.verbose {
                eprintln!("meshrun: wrote workload labels to {}", f.display());
            }
        }
        Err(e) => {
            log_warn_stderr(use_err, &format!("meshrun: could not write labels file: {e}"));
        }
    }
    identity.apply_env(&mut env, &paths);

    let xds = resolve_discovery_address(&env, mesh.as_ref(), &identity.platform);
    if !cli.quiet {
        print_startup_banner(as_root, &paths, &xds);
    }
    if cli.verbose {
        eprintln!(
            "meshrun: workload {}.{} instance {}",
            identity.name, identity.namespace, identity.instance_name
        );
    }
    if xds.addr.is_none() {
        log_warn_stderr(
            use_err,
            "meshrun: no discovery address resolved; the agent will fail fast",
        );
    }

    // XDS_ADDR=- means "no agent": supervise the app alone, or nothing.
    if xds.agent_disabled() {
        log_info_stderr(use_err, "meshrun: agent management disabled (XDS_ADDR=-)");
        if cli.dry_run || cli.app.is_empty() {
            return 0;
        }
        let mut sup = Supervisor::new(env.flag("FORCE_START"), cli.verbose);
        return match sup.spawn_app(&cli.app, &env) {
            Ok(_) => sup.supervise(),
            Err(e) => {
                log_error_stderr(use_err, &format!("meshrun: failed to start app: {e}"));
                exit_code_for_io_error(&e)
            }
        };
    }

    let audiences = apply_control_plane_env(&mut env, &paths, &identity, &xds, mesh.as_ref());

    if let Err(e) = prepare_credentials(&env, &paths, &audiences, as_root, cli.verbose) {
        log_warn_stderr(
            use_err,
            &format!("meshrun: credential bootstrap degraded: {e:#}"),
        );
    }
    match run_credential_helper(&env, &paths, cli.verbose) {
        Ok(ran) => {
            if ran && cli.verbose {
                eprintln!("meshrun: credential helper completed");
            }
        }
        Err(e) => {
            log_warn_stderr(use_err, &format!("meshrun: credential helper failed: {e:#}"));
        }
    }

    let rules = RedirectRules::from_env(&env);
    let _interception = establish(
        &mut env,
        &rules,
        as_root,
        identity.is_gateway(),
        cli.dry_run,
        cli.verbose,
    );

    if !as_root {
        env.set("ISTIO_META_UNPRIVILEGED_POD", "true");
    }
    let suffix = create_instance_suffix();
    finalize_agent_env(&mut env, &paths, &suffix);

    let (agent_cmd, preview) = match build_agent_cmd(&identity, &env, &paths) {
        Ok(v) => v,
        Err(e) => {
            log_error_stderr(use_err, &format!("meshrun: {e}"));
            return exit_code_for_io_error(&e);
        }
    };

    if env.flag("MESHRUN_SAVE_LAUNCH") {
        match save_launch_info(&paths, &env, &preview) {
            Ok(f) => {
                if cli.verbose {
                    eprintln!("meshrun: saved launch info to {}", f.display());
                }
            }
            Err(e) => {
                log_warn_stderr(use_err, &format!("meshrun: could not save launch info: {e}"));
            }
        }
    }

    if cli.verbose || cli.dry_run {
        eprintln!("meshrun: agent: {preview}");
        for (k, v) in env.derived() {
            eprintln!("meshrun: env +{k}={v}");
        }
    }
    if cli.dry_run {
        eprintln!("meshrun: dry-run requested; not spawning.");
        return 0;
    }

    let mut sup = Supervisor::new(env.flag("FORCE_START"), cli.verbose);
    if let Err(e) = sup.spawn_agent(agent_cmd, as_root) {
        log_error_stderr(use_err, &format!("meshrun: failed to start agent: {e}"));
        return exit_code_for_io_error(&e);
    }
    if !cli.app.is_empty() {
        if let Err(e) = sup.spawn_app(&cli.app, &env) {
            log_error_stderr(use_err, &format!("meshrun: failed to start app: {e}"));
            return sup.shutdown(exit_code_for_io_error(&e));
        }
    }
    sup.supervise()
}
