#![allow(clippy::module_name_repetitions)]
//! Process supervision: the agent and the application as one lifecycle unit.
//!
//! The supervisor exclusively owns the set of managed children. Each spawned
//! child gets a watcher thread that blocks in wait() and reports the exit over
//! a channel; the control task alone decides what an exit means and drives the
//! shutdown protocol. No restart is ever attempted.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::color::{color_enabled_stderr, log_error_stderr, log_info_stderr, log_warn_stderr};
use crate::envset::EnvSet;
use crate::paths::{AGENT_GID, AGENT_UID};

/// Bounded wait between the graceful signal and the forced kill.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Agent exit code that signals a connection/authentication failure rather
/// than a generic crash. Worth calling out distinctly in diagnostics.
pub const AGENT_AUTH_FAILURE_CODE: i32 = 255;

const SIGNAL_POLL: Duration = Duration::from_millis(200);

static GOT_SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_sig: i32) {
    GOT_SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let act = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGTERM, &act);
        let _ = signal::sigaction(Signal::SIGINT, &act);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    App,
    OtherChild,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Agent => "agent",
            Role::App => "app",
            Role::OtherChild => "child",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// One tracked OS process. The Child handle lives with the watcher thread;
/// the supervisor keeps the pid for signaling and the liveness bit.
#[derive(Debug)]
struct ManagedProcess {
    role: Role,
    pid: i32,
    alive: bool,
}

struct ExitEvent {
    role: Role,
    pid: i32,
    status: io::Result<ExitStatus>,
}

pub struct Supervisor {
    state: LifecycleState,
    force_start: bool,
    verbose: bool,
    children: Vec<ManagedProcess>,
    tx: Sender<ExitEvent>,
    rx: Receiver<ExitEvent>,
}

impl Supervisor {
    pub fn new(force_start: bool, verbose: bool) -> Self {
        install_signal_handlers();
        let (tx, rx) = mpsc::channel();
        Self {
            state: LifecycleState::NotStarted,
            force_start,
            verbose,
            children: Vec::new(),
            tx,
            rx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn alive_count(&self) -> usize {
        self.children.iter().filter(|c| c.alive).count()
    }

    /// Spawn the agent. When privileged, drop it to the agent uid/gid and
    /// prefer a pseudo-terminal so the child keeps a controlling terminal;
    /// the master side is relayed to our stdout on an independent thread so
    /// a slow log sink never stalls the agent.
    pub fn spawn_agent(&mut self, mut cmd: Command, as_root: bool) -> io::Result<u32> {
        self.state = LifecycleState::Starting;
        let use_err = color_enabled_stderr();

        let mut relay: Option<File> = None;
        if as_root {
            cmd.uid(AGENT_UID);
            cmd.gid(AGENT_GID);
            match nix::pty::openpty(None, None) {
                Ok(pty) => {
                    let master = File::from(pty.master);
                    let slave = pty.slave;
                    let _ = std::os::unix::fs::fchown(&slave, Some(AGENT_UID), Some(AGENT_GID));
                    let slave_fd = slave.as_raw_fd();
                    unsafe {
                        cmd.pre_exec(move || {
                            nix::unistd::setsid().map_err(io::Error::from)?;
                            // Adopt the pty slave as controlling terminal; the
                            // agent still works without one, so best effort.
                            let _ = nix::libc::ioctl(slave_fd, nix::libc::TIOCSCTTY, 0);
                            Ok(())
                        });
                    }
                    let slave_err = slave.try_clone()?;
                    cmd.stdout(Stdio::from(slave));
                    cmd.stderr(Stdio::from(slave_err));
                    relay = Some(master);
                }
                Err(e) => {
                    log_warn_stderr(
                        use_err,
                        &format!("meshrun: pty allocation failed, using inherited stdio: {e}"),
                    );
                    cmd.stdout(Stdio::inherit());
                    cmd.stderr(Stdio::inherit());
                }
            }
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        cmd.stdin(Stdio::null());

        let pid = self.track(Role::Agent, cmd.spawn()?);
        if let Some(master) = relay {
            start_output_relay(master);
        }
        self.state = LifecycleState::Running;
        if self.verbose {
            eprintln!("meshrun: agent started (pid {pid})");
        }
        Ok(pid)
    }

    /// Spawn the companion application with the same base environment and the
    /// instance's own stdio.
    pub fn spawn_app(&mut self, argv: &[String], env: &EnvSet) -> io::Result<u32> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty app command"))?;
        let mut cmd = Command::new(program);
        cmd.args(rest);
        env.apply_to(&mut cmd);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let pid = self.track(Role::App, cmd.spawn()?);
        self.state = LifecycleState::Running;
        if self.verbose {
            eprintln!("meshrun: app started (pid {pid})");
        }
        Ok(pid)
    }

    /// Spawn an auxiliary child that shares the instance lifecycle.
    pub fn spawn_other(&mut self, mut cmd: Command) -> io::Result<u32> {
        let pid = self.track(Role::OtherChild, cmd.spawn()?);
        self.state = LifecycleState::Running;
        Ok(pid)
    }

    fn track(&mut self, role: Role, child: Child) -> u32 {
        let pid = child.id();
        self.children.push(ManagedProcess {
            role,
            pid: pid as i32,
            alive: true,
        });
        self.watch(role, child);
        pid
    }

    fn watch(&self, role: Role, mut child: Child) {
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            let pid = child.id() as i32;
            let status = child.wait();
            let _ = tx.send(ExitEvent { role, pid, status });
        });
    }

    fn mark_exited(&mut self, pid: i32) {
        if let Some(c) = self.children.iter_mut().find(|c| c.pid == pid) {
            c.alive = false;
        }
    }

    /// Block until a shutdown condition and run the shutdown protocol.
    /// Returns the instance exit code.
    #[cfg_attr(feature = "otel", tracing::instrument(skip_all, fields(children = self.children.len())))]
    pub fn supervise(mut self) -> u8 {
        let use_err = color_enabled_stderr();
        if self.children.is_empty() {
            self.state = LifecycleState::Stopped;
            return 0;
        }
        self.state = LifecycleState::Running;

        loop {
            if GOT_SHUTDOWN_SIGNAL.swap(false, Ordering::SeqCst) {
                log_info_stderr(use_err, "meshrun: shutdown signal received");
                return self.shutdown(0);
            }
            let ev = match self.rx.recv_timeout(SIGNAL_POLL) {
                Ok(ev) => ev,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return self.shutdown(0),
            };
            self.mark_exited(ev.pid);
            let code = match &ev.status {
                Ok(st) => st.code(),
                Err(_) => None,
            };
            let clean = matches!(&ev.status, Ok(st) if st.success());

            match ev.role {
                Role::Agent => {
                    if clean {
                        log_info_stderr(use_err, "meshrun: agent exited cleanly");
                    } else if code == Some(AGENT_AUTH_FAILURE_CODE) {
                        log_error_stderr(
                            use_err,
                            "meshrun: agent exited with 255: control plane connection or authentication failure",
                        );
                    } else {
                        log_error_stderr(
                            use_err,
                            &format!("meshrun: agent exited with {}", describe_exit(&ev.status)),
                        );
                    }
                    if self.force_start {
                        log_warn_stderr(
                            use_err,
                            "meshrun: force-start set; instance stays up after agent exit",
                        );
                        continue;
                    }
                    return self.shutdown(if clean { 0 } else { 1 });
                }
                Role::App | Role::OtherChild => {
                    let msg = format!(
                        "meshrun: {} exited with {}",
                        ev.role,
                        describe_exit(&ev.status)
                    );
                    if clean {
                        log_info_stderr(use_err, &msg);
                    } else {
                        log_error_stderr(use_err, &msg);
                    }
                    return self.shutdown(if clean { 0 } else { 1 });
                }
            }
        }
    }

    /// Shutdown protocol: SIGTERM every live child, wait the grace period for
    /// the watchers to report, then SIGKILL the survivors and reap. Terminal.
    pub fn shutdown(&mut self, code: u8) -> u8 {
        self.state = LifecycleState::Stopping;
        let use_err = color_enabled_stderr();

        for c in self.children.iter().filter(|c| c.alive) {
            let _ = signal::kill(Pid::from_raw(c.pid), Signal::SIGTERM);
        }

        let deadline = Instant::now() + GRACE_PERIOD;
        while self.alive_count() > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match self.rx.recv_timeout(left) {
                Ok(ev) => self.mark_exited(ev.pid),
                Err(_) => break,
            }
        }

        let survivors: Vec<(Role, i32)> = self
            .children
            .iter()
            .filter(|c| c.alive)
            .map(|c| (c.role, c.pid))
            .collect();
        for (role, pid) in &survivors {
            log_warn_stderr(
                use_err,
                &format!("meshrun: {role} (pid {pid}) survived the grace period, killing"),
            );
            let _ = signal::kill(Pid::from_raw(*pid), Signal::SIGKILL);
        }
        // The watcher threads reap; collect their reports so nothing leaks.
        while self.alive_count() > 0 {
            match self.rx.recv_timeout(Duration::from_secs(2)) {
                Ok(ev) => self.mark_exited(ev.pid),
                Err(_) => break,
            }
        }

        self.state = LifecycleState::Stopped;
        if self.verbose {
            eprintln!("meshrun: shutdown complete (exit {code})");
        }
        code
    }
}

fn describe_exit(status: &io::Result<ExitStatus>) -> String {
    match status {
        Ok(st) => match st.code() {
            Some(c) => format!("code {c}"),
            None => format!("{st}"),
        },
        Err(e) => format!("wait error: {e}"),
    }
}

/// Copy the pty master to our stdout until the child side closes.
fn start_output_relay(master: File) {
    std::thread::spawn(move || {
        let mut master = master;
        let mut out = io::stdout();
        let mut buf = [0u8; 4096];
        loop {
            match master.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    let _ = out.flush();
                }
                // EIO is the normal end-of-stream for a pty master.
                Err(_) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_cmd(secs: u32) -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg(secs.to_string());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    #[test]
    fn test_states_start_and_stop() {
        let mut sup = Supervisor::new(false, false);
        assert_eq!(sup.state(), LifecycleState::NotStarted);
        sup.spawn_other(sleep_cmd(30)).unwrap();
        assert_eq!(sup.state(), LifecycleState::Running);
        assert_eq!(sup.alive_count(), 1);
        let code = sup.shutdown(0);
        assert_eq!(code, 0);
        assert_eq!(sup.state(), LifecycleState::Stopped);
        assert_eq!(sup.alive_count(), 0, "no child left unsignaled");
    }

    #[test]
    fn test_shutdown_signals_every_child() {
        let mut sup = Supervisor::new(false, false);
        for _ in 0..3 {
            sup.spawn_other(sleep_cmd(30)).unwrap();
        }
        assert_eq!(sup.alive_count(), 3);
        let started = Instant::now();
        sup.shutdown(1);
        assert_eq!(sup.alive_count(), 0);
        assert!(
            started.elapsed() < GRACE_PERIOD,
            "sleep dies on SIGTERM; no grace wait expected"
        );
    }

    #[test]
    fn test_shutdown_force_kills_term_ignorer() {
        let mut sup = Supervisor::new(false, false);
        // The child writes a marker once its trap is installed; without that
        // sync, shutdown() can SIGTERM it before it starts ignoring TERM.
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("trap '' TERM; : > {}; sleep 60", ready.display()));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        sup.spawn_other(cmd).unwrap();
        let wait_start = Instant::now();
        while !ready.exists() {
            assert!(
                wait_start.elapsed() < Duration::from_secs(10),
                "child never reported readiness"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
        let started = Instant::now();
        let code = sup.shutdown(1);
        assert_eq!(code, 1);
        assert_eq!(sup.alive_count(), 0, "survivor must be force-killed");
        assert!(
            started.elapsed() >= GRACE_PERIOD,
            "grace period should elapse before the kill"
        );
        assert!(
            started.elapsed() < GRACE_PERIOD + Duration::from_secs(4),
            "kill and reap should be prompt after the grace period"
        );
    }

    #[test]
    fn test_supervise_exits_on_child_failure() {
        let mut sup = Supervisor::new(false, false);
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        sup.spawn_other(cmd).unwrap();
        assert_eq!(sup.supervise(), 1);
    }

    #[test]
    fn test_supervise_clean_child_exit_is_zero() {
        let mut sup = Supervisor::new(false, false);
        let mut cmd = Command::new("true");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        sup.spawn_other(cmd).unwrap();
        assert_eq!(sup.supervise(), 0);
    }

    #[test]
    fn test_supervise_without_children_is_clean() {
        let sup = Supervisor::new(false, false);
        assert_eq!(sup.supervise(), 0);
    }

    #[test]
    fn test_spawn_app_empty_argv_rejected() {
        let mut sup = Supervisor::new(false, false);
        let env = EnvSet::new();
        let err = sup.spawn_app(&[], &env).expect_err("empty argv must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
