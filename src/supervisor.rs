use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::notify::Notifier;
use crate::runtime::{NodeProvisioner, ProvisionError};
use crate::shell_env::{self, LoginShellRunner, ShellRunner};
use crate::transport::Transport;

pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
const STOP_KILL_WAIT: Duration = Duration::from_secs(2);
const MONITOR_JOIN_WAIT: Duration = Duration::from_secs(2);
const MONITOR_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFailureReason {
    RuntimeNotFound,
    RuntimeSetupFailed,
    RuntimeVersionTooLow,
    EntryFileMissing,
    ModulesMissing,
    ProcessStartException,
}

impl StartFailureReason {
    pub fn tag(&self) -> &'static str {
        match self {
            StartFailureReason::RuntimeNotFound => "runtime-not-found",
            StartFailureReason::RuntimeSetupFailed => "runtime-setup-failed",
            StartFailureReason::RuntimeVersionTooLow => "runtime-version-too-low",
            StartFailureReason::EntryFileMissing => "entry-file-missing",
            StartFailureReason::ModulesMissing => "modules-missing",
            StartFailureReason::ProcessStartException => "process-start-exception",
        }
    }
}

/// Recorded before every failed start so diagnostics UI can render the
/// specific remediation text for the condition that blocked the host.
#[derive(Debug, Clone)]
pub struct StartFailure {
    pub reason: StartFailureReason,
    pub message: String,
}

impl std::fmt::Display for StartFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason.tag(), self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    /// Explicitly configured values in the child environment always win;
    /// proxy settings only fill the gaps.
    fn merge_into(&self, env: &mut BTreeMap<String, String>) {
        let pairs = [
            ("HTTP_PROXY", "http_proxy", self.http_proxy.as_ref()),
            ("HTTPS_PROXY", "https_proxy", self.https_proxy.as_ref()),
            ("NO_PROXY", "no_proxy", self.no_proxy.as_ref()),
        ];
        for (upper, lower, value) in pairs {
            let Some(value) = value else {
                continue;
            };
            if env.contains_key(upper) || env.contains_key(lower) {
                continue;
            }
            env.insert(upper.to_string(), value.clone());
        }
    }
}

pub struct HostConfig {
    pub entry_file: PathBuf,
    pub modules_dir: PathBuf,
    pub proxy: Option<ProxyConfig>,
}

struct HostShared {
    child: Mutex<Option<Child>>,
    pid: u32,
    running: AtomicBool,
    stop_requested: AtomicBool,
    monitor_done: AtomicBool,
}

struct RunningHost {
    shared: Arc<HostShared>,
    monitor: Option<thread::JoinHandle<()>>,
}

impl RunningHost {
    /// Bounded join so a wedged monitor can never block IDE shutdown; a
    /// monitor that outlives the deadline is abandoned, not waited on.
    fn join_monitor(mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.shared.monitor_done.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return;
            }
            thread::sleep(MONITOR_POLL);
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }
}

/// Owns at most one extension host child process. `start` while running is a
/// successful no-op; the monitor thread flips running state on exit whether
/// the exit was requested or a crash.
pub struct HostSupervisor {
    provisioner: NodeProvisioner,
    config: HostConfig,
    notifier: Arc<dyn Notifier>,
    shell_runner: Box<dyn ShellRunner>,
    state: Mutex<Option<RunningHost>>,
    last_failure: Mutex<Option<StartFailure>>,
}

impl HostSupervisor {
    pub fn new(
        provisioner: NodeProvisioner,
        config: HostConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            provisioner,
            config,
            notifier,
            shell_runner: Box::new(LoginShellRunner),
            state: Mutex::new(None),
            last_failure: Mutex::new(None),
        }
    }

    /// Substitutes the shell used for environment capture; tests use this to
    /// avoid spawning a real login shell.
    pub fn with_shell_runner(mut self, runner: Box<dyn ShellRunner>) -> Self {
        self.shell_runner = runner;
        self
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock().expect("supervisor state mutex poisoned");
        state
            .as_ref()
            .is_some_and(|host| host.shared.running.load(Ordering::SeqCst))
    }

    pub fn last_failure(&self) -> Option<StartFailure> {
        self.last_failure
            .lock()
            .expect("last failure mutex poisoned")
            .clone()
    }

    pub fn start(&self, transport: &Transport) -> bool {
        let mut state = self.state.lock().expect("supervisor state mutex poisoned");
        if let Some(host) = state.as_ref()
            && host.shared.running.load(Ordering::SeqCst)
        {
            return true;
        }
        // The previous child exited on its own; reap its monitor first.
        if let Some(host) = state.take() {
            host.join_monitor(MONITOR_JOIN_WAIT);
        }
        *self
            .last_failure
            .lock()
            .expect("last failure mutex poisoned") = None;

        crate::diagnostics::startup_log("supervisor: start requested");
        let runtime = match self.provisioner.ensure() {
            Ok(path) => path,
            Err(err) => {
                self.record_provision_failure(err);
                return false;
            }
        };

        if !self.config.entry_file.is_file() {
            self.record_failure(
                StartFailureReason::EntryFileMissing,
                format!(
                    "extension host entry file not found: {}",
                    self.config.entry_file.display()
                ),
            );
            return false;
        }
        if !self.config.modules_dir.is_dir() {
            self.record_failure(
                StartFailureReason::ModulesMissing,
                format!(
                    "extension host module directory not found: {}",
                    self.config.modules_dir.display()
                ),
            );
            return false;
        }

        // Snapshot refresh is soft; a capture failure never blocks startup.
        if let Err(err) = shell_env::ensure_snapshot(self.shell_runner.as_ref()) {
            eprintln!("[hostlink] shell environment capture failed: {err}");
            crate::event_log::log(
                "snapshot_capture_failed",
                json!({"error": err.to_string()}),
            );
        }
        let snapshot = shell_env::load_filtered();
        let runtime_dir = runtime
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let env = build_child_env(
            current_env(),
            &snapshot,
            &runtime_dir,
            transport,
            self.config.proxy.as_ref(),
        );

        let mut command = Command::new(&runtime);
        command
            .arg("--experimental-global-webcrypto")
            .arg("--no-deprecation")
            .arg(&self.config.entry_file)
            .args(transport.child_args())
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(target_family = "unix")]
        unsafe {
            use std::os::unix::process::CommandExt;
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.record_failure(
                    StartFailureReason::ProcessStartException,
                    format!("failed to launch {}: {err}", runtime.display()),
                );
                return false;
            }
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.record_failure(
                    StartFailureReason::ProcessStartException,
                    format!("extension host exited immediately with status {status}"),
                );
                return false;
            }
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                self.record_failure(
                    StartFailureReason::ProcessStartException,
                    format!("cannot observe extension host process: {err}"),
                );
                return false;
            }
        }

        let pid = child.id();
        // stderr is drained into the same log stream as stdout.
        spawn_log_reader(child.stdout.take());
        spawn_log_reader(child.stderr.take());

        let shared = Arc::new(HostShared {
            child: Mutex::new(Some(child)),
            pid,
            running: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            monitor_done: AtomicBool::new(false),
        });
        let monitor = spawn_monitor(shared.clone());
        *state = Some(RunningHost {
            shared,
            monitor: Some(monitor),
        });

        crate::event_log::log_lazy("host_spawned", || {
            json!({
                "pid": pid,
                "runtime": runtime.to_string_lossy(),
                "transport": transport.describe(),
            })
        });
        crate::diagnostics::startup_log(format!("supervisor: host running (pid {pid})"));
        true
    }

    /// Safe from any thread and idempotent; failure to kill is logged, not
    /// propagated, and supervisor state is cleared regardless.
    pub fn stop(&self) {
        let taken = {
            let mut state = self.state.lock().expect("supervisor state mutex poisoned");
            state.take()
        };
        let Some(host) = taken else {
            return;
        };

        let shared = host.shared.clone();
        if shared.running.load(Ordering::SeqCst) {
            shared.stop_requested.store(true, Ordering::SeqCst);
            if let Err(err) = request_terminate(&shared) {
                eprintln!("[hostlink] graceful termination request failed: {err}");
            }
            wait_for_exit(&shared, STOP_GRACE_PERIOD);
            if shared.running.load(Ordering::SeqCst) {
                force_kill(&shared);
                wait_for_exit(&shared, STOP_KILL_WAIT);
            }
        }
        host.join_monitor(MONITOR_JOIN_WAIT);
        crate::event_log::log("host_stop", json!({"pid": shared.pid}));
    }

    fn record_provision_failure(&self, err: ProvisionError) {
        let (reason, message) = match &err {
            ProvisionError::NotFound(message) => {
                (StartFailureReason::RuntimeNotFound, message.clone())
            }
            ProvisionError::SetupFailed(message) => {
                (StartFailureReason::RuntimeSetupFailed, message.clone())
            }
            ProvisionError::VersionTooLow { .. } => {
                (StartFailureReason::RuntimeVersionTooLow, err.to_string())
            }
        };
        self.record_failure(reason, message);
    }

    fn record_failure(&self, reason: StartFailureReason, message: String) {
        crate::event_log::log(
            "start_failure",
            json!({"reason": reason.tag(), "message": message}),
        );
        // Only a too-low runtime requires user action before the host can
        // ever start; everything else stays passive so the IDE remains
        // usable while the integration is degraded.
        match reason {
            StartFailureReason::RuntimeVersionTooLow => self
                .notifier
                .notify_blocking("Extension host runtime too old", &message),
            _ => self
                .notifier
                .notify_passive("Extension host failed to start", &message),
        }
        *self
            .last_failure
            .lock()
            .expect("last failure mutex poisoned") = Some(StartFailure { reason, message });
    }
}

fn current_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .map(|(key, value)| {
            (
                key.to_string_lossy().to_string(),
                value.to_string_lossy().to_string(),
            )
        })
        .collect()
}

/// Assembles the child environment: inherited process environment, overlaid
/// with the allow-listed shell snapshot, PATH rebuilt with the runtime
/// directory first, transport endpoint variables, then proxy gap-fill.
pub fn build_child_env(
    base: BTreeMap<String, String>,
    snapshot: &BTreeMap<String, String>,
    runtime_dir: &Path,
    transport: &Transport,
    proxy: Option<&ProxyConfig>,
) -> BTreeMap<String, String> {
    let mut env = base;
    for (key, value) in snapshot {
        env.insert(key.clone(), value.clone());
    }
    let inherited_path = env.get("PATH").cloned();
    env.insert(
        "PATH".to_string(),
        enhanced_path(runtime_dir, inherited_path.as_deref()),
    );
    for (key, value) in transport.env_vars() {
        env.insert(key, value);
    }
    if let Some(proxy) = proxy {
        proxy.merge_into(&mut env);
    }
    env
}

/// Runtime directory first, so the provisioned runtime wins even when an
/// unrelated one sits earlier on the inherited PATH; then developer tool
/// directories that exist on disk; then the inherited entries.
fn enhanced_path(runtime_dir: &Path, inherited: Option<&str>) -> String {
    let mut entries: Vec<PathBuf> = vec![runtime_dir.to_path_buf()];
    for dir in developer_tool_dirs() {
        if dir.is_dir() && !entries.contains(&dir) {
            entries.push(dir);
        }
    }
    if let Some(inherited) = inherited {
        for dir in std::env::split_paths(inherited) {
            if !entries.contains(&dir) {
                entries.push(dir);
            }
        }
    }
    match std::env::join_paths(&entries) {
        Ok(joined) => joined.to_string_lossy().to_string(),
        Err(_) => runtime_dir.to_string_lossy().to_string(),
    }
}

fn developer_tool_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    #[cfg(target_family = "unix")]
    {
        dirs.push(PathBuf::from("/usr/local/bin"));
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
        if let Some(home) = crate::shell_env::home_dir() {
            dirs.push(home.join(".local").join("bin"));
            dirs.push(home.join(".cargo").join("bin"));
            dirs.push(home.join(".volta").join("bin"));
        }
    }
    dirs
}

fn spawn_log_reader<R>(stream: Option<R>)
where
    R: Read + Send + 'static,
{
    let Some(stream) = stream else {
        return;
    };
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => {
                    crate::event_log::log_lazy("host_output", || json!({"line": line}));
                    eprintln!("[hostlink][host] {line}");
                }
                Err(_) => break,
            }
        }
    });
}

enum MonitorPoll {
    Alive,
    Gone,
    Exited(std::process::ExitStatus),
    Lost(std::io::Error),
}

fn spawn_monitor(shared: Arc<HostShared>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        loop {
            let polled = {
                let mut guard = shared.child.lock().expect("host child mutex poisoned");
                match guard.as_mut() {
                    None => MonitorPoll::Gone,
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => MonitorPoll::Exited(status),
                        Ok(None) => MonitorPoll::Alive,
                        Err(err) => MonitorPoll::Lost(err),
                    },
                }
            };
            match polled {
                MonitorPoll::Alive => thread::sleep(MONITOR_POLL),
                MonitorPoll::Gone => {
                    shared.running.store(false, Ordering::SeqCst);
                    break;
                }
                MonitorPoll::Exited(status) => {
                    *shared.child.lock().expect("host child mutex poisoned") = None;
                    let requested = shared.stop_requested.load(Ordering::SeqCst);
                    if !status.success() && !requested {
                        eprintln!("[hostlink] {}", describe_exit(&status));
                    }
                    crate::event_log::log_lazy("host_exited", || {
                        json!({
                            "pid": shared.pid,
                            "code": status.code(),
                            "requested": requested,
                            "detail": describe_exit(&status),
                        })
                    });
                    shared.running.store(false, Ordering::SeqCst);
                    break;
                }
                MonitorPoll::Lost(err) => {
                    *shared.child.lock().expect("host child mutex poisoned") = None;
                    eprintln!("[hostlink] lost track of extension host process: {err}");
                    shared.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        shared.monitor_done.store(true, Ordering::SeqCst);
    })
}

fn describe_exit(status: &std::process::ExitStatus) -> String {
    #[cfg(target_family = "unix")]
    if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(status) {
        return format!("extension host exited with signal {signal}");
    }
    match status.code() {
        Some(code) => format!("extension host exited with code {code}"),
        None => "extension host exited with unknown status".to_string(),
    }
}

fn request_terminate(shared: &HostShared) -> std::io::Result<()> {
    #[cfg(target_family = "unix")]
    {
        signal_process_group(shared.pid, libc::SIGTERM)
    }
    #[cfg(not(target_family = "unix"))]
    {
        // No soft-termination channel on Windows; the grace period still
        // gives the host a chance to exit after its transport closes.
        let _ = shared;
        Ok(())
    }
}

fn force_kill(shared: &HostShared) {
    #[cfg(target_family = "unix")]
    {
        if signal_process_group(shared.pid, libc::SIGKILL).is_err() {
            kill_process_tree_scan(shared.pid, libc::SIGKILL);
        }
    }
    let mut guard = shared.child.lock().expect("host child mutex poisoned");
    if let Some(child) = guard.as_mut() {
        let _ = child.kill();
    }
}

#[cfg(target_family = "unix")]
fn signal_process_group(pid: u32, signal: i32) -> std::io::Result<()> {
    let result = unsafe { libc::kill(-(pid as i32), signal) };
    if result == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        // If the process group is already gone, we're done.
        if err.kind() == std::io::ErrorKind::NotFound {
            return Ok(());
        }
        Err(err)
    }
}

#[cfg(target_family = "unix")]
fn kill_process_tree_scan(root_pid: u32, signal: i32) {
    use std::collections::{HashMap, HashSet};
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let root = Pid::from_u32(root_pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (proc_pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*proc_pid);
        }
    }

    let mut stack = vec![root];
    let mut seen: HashSet<Pid> = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(kids) = children.get(&current) {
            for child in kids {
                if !seen.contains(child) {
                    stack.push(*child);
                }
            }
        }
    }

    for pid in seen {
        let _ = unsafe { libc::kill(pid.as_u32() as i32, signal) };
    }
}

fn wait_for_exit(shared: &HostShared, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while shared.running.load(Ordering::SeqCst) {
        if Instant::now() >= deadline {
            return;
        }
        thread::sleep(MONITOR_POLL);
    }
}
