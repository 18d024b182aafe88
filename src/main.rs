use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use hostlink::dispatch::{CommandRegistry, CommandVariant};
use hostlink::notify::StderrNotifier;
use hostlink::runtime::{
    NodeProvisioner, RuntimeVersion, default_install_dir, runtime_version_of,
};
use hostlink::shell_env::{self, LoginShellRunner};
use hostlink::supervisor::{HostConfig, HostSupervisor, ProxyConfig};
use hostlink::transport::{Transport, allocate_loopback_port};
use hostlink::{diagnostics, event_log};

enum CliCommand {
    Run(RunOptions),
    Doctor(ProvisionerOptions),
    Snapshot { force: bool },
}

struct RunOptions {
    entry_file: PathBuf,
    modules_dir: Option<PathBuf>,
    provisioner: ProvisionerOptions,
    socket_path: Option<PathBuf>,
    port: Option<u16>,
    proxy: ProxyConfig,
    debug_events_dir: Option<PathBuf>,
}

#[derive(Default)]
struct ProvisionerOptions {
    bundle_dir: Option<PathBuf>,
    install_dir: Option<PathBuf>,
    mirror: Option<String>,
    min_version: Option<RuntimeVersion>,
    auto_install: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // The host child and our drain threads write to stdout/stderr. If a
    // downstream reader closes its end, writes would raise SIGPIPE and kill
    // the process on Unix; ignore it so broken pipes surface as errors.
    ignore_sigpipe();
    diagnostics::startup_log("main: entry");

    match parse_cli_args()? {
        CliCommand::Run(options) => run(options).await,
        CliCommand::Doctor(options) => doctor(options),
        CliCommand::Snapshot { force } => snapshot(force),
    }
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

async fn run(options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let transport = match (&options.socket_path, options.port) {
        (Some(_), Some(_)) => {
            return Err("cannot combine --socket-path with --port".into());
        }
        (Some(path), None) => Transport::Socket { path: path.clone() },
        (None, Some(port)) => Transport::Tcp { port },
        (None, None) => Transport::Tcp {
            port: allocate_loopback_port()?,
        },
    };

    event_log::initialize(
        options.debug_events_dir.clone(),
        event_log::StartupContext {
            mode: "run".to_string(),
            transport: Some(transport.describe()),
            entry_file: Some(options.entry_file.to_string_lossy().to_string()),
        },
    )?;

    let modules_dir = options
        .modules_dir
        .clone()
        .or_else(|| {
            options
                .entry_file
                .parent()
                .map(|dir| dir.join("node_modules"))
        })
        .ok_or("cannot derive module directory from entry file; pass --modules-dir")?;

    let provisioner = build_provisioner(&options.provisioner)?;
    let config = HostConfig {
        entry_file: options.entry_file.clone(),
        modules_dir,
        proxy: Some(options.proxy),
    };
    let supervisor = Arc::new(HostSupervisor::new(
        provisioner,
        config,
        Arc::new(StderrNotifier),
    ));

    let registry = Arc::new(CommandRegistry::new());
    register_builtin_commands(&registry, supervisor.clone(), transport.clone());

    diagnostics::startup_log("main: starting extension host");
    if !supervisor.start(&transport) {
        let failure = supervisor
            .last_failure()
            .map(|failure| failure.to_string())
            .unwrap_or_else(|| "extension host failed to start".to_string());
        return Err(failure.into());
    }
    eprintln!(
        "[hostlink] extension host up on {} ({} commands registered)",
        transport.describe(),
        registry.list().len()
    );
    if let Some(status) = registry.execute("hostlink.status", Vec::new()).await {
        event_log::log("initial_status", status);
    }

    tokio::signal::ctrl_c().await?;
    diagnostics::startup_log("main: shutdown requested");
    supervisor.stop();
    Ok(())
}

fn register_builtin_commands(
    registry: &CommandRegistry,
    supervisor: Arc<HostSupervisor>,
    transport: Transport,
) {
    let status_supervisor = supervisor.clone();
    registry.register(
        "hostlink.status",
        "hostStatus",
        vec![CommandVariant::blocking(Vec::new(), move |_| {
            Ok(json!({
                "running": status_supervisor.is_running(),
                "lastFailure": status_supervisor
                    .last_failure()
                    .map(|failure| failure.to_string()),
            }))
        })],
    );

    registry.register(
        "hostlink.restart",
        "restartHost",
        vec![CommandVariant::blocking(Vec::new(), move |_| {
            supervisor.stop();
            let started = supervisor.start(&transport);
            Ok(json!({"started": started}))
        })],
    );
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    bundled: Option<String>,
    user_local: Option<String>,
    path: Option<String>,
    offline_installer: Option<String>,
    resolved: Option<String>,
    version: Option<String>,
    minimum: String,
    version_ok: Option<bool>,
    mirror: String,
}

fn doctor(options: ProvisionerOptions) -> Result<(), Box<dyn std::error::Error>> {
    let provisioner = build_provisioner(&options)?;
    let resolved = provisioner.resolve();
    let (version, version_ok) = match &resolved {
        Some(path) => match runtime_version_of(path) {
            Ok(version) => {
                let ok = version >= provisioner.min_version;
                (Some(version.raw().to_string()), Some(ok))
            }
            Err(_) => (None, Some(false)),
        },
        None => (None, None),
    };
    let to_display = |path: Option<PathBuf>| path.map(|path| path.to_string_lossy().to_string());
    let report = DoctorReport {
        bundled: to_display(provisioner.bundled_runtime()),
        user_local: to_display(provisioner.installed_runtime()),
        path: to_display(provisioner.path_runtime()),
        offline_installer: to_display(provisioner.offline_installer()),
        resolved: to_display(resolved),
        version,
        minimum: provisioner.min_version.raw().to_string(),
        version_ok,
        mirror: provisioner.mirror_base,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn snapshot(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if force
        && let Some(path) = shell_env::snapshot_path()
        && path.exists()
    {
        std::fs::remove_file(&path)?;
    }
    let outcome = shell_env::ensure_snapshot(&LoginShellRunner)?;
    let filtered = shell_env::load_filtered();
    let report = json!({
        "outcome": format!("{outcome:?}"),
        "path": shell_env::snapshot_path().map(|path| path.to_string_lossy().to_string()),
        "filtered": filtered,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn build_provisioner(
    options: &ProvisionerOptions,
) -> Result<NodeProvisioner, Box<dyn std::error::Error>> {
    let install_dir = match &options.install_dir {
        Some(dir) => dir.clone(),
        None => default_install_dir()
            .ok_or("cannot determine the runtime install directory (no home directory)")?,
    };
    let mut provisioner = NodeProvisioner::new(options.bundle_dir.clone(), install_dir);
    if let Some(mirror) = &options.mirror {
        provisioner.mirror_base = mirror.clone();
    }
    if let Some(min_version) = &options.min_version {
        provisioner.min_version = min_version.clone();
    }
    provisioner.auto_install = options.auto_install;
    Ok(provisioner)
}

fn parse_cli_args() -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    if let Some(arg) = parser.peek() {
        if arg == "doctor" {
            parser.next();
            return Ok(CliCommand::Doctor(parse_provisioner_args(&mut parser, true)?));
        }
        if arg == "snapshot" {
            parser.next();
            return parse_snapshot_args(&mut parser);
        }
    }

    let mut entry_file = std::env::var_os("HOSTLINK_ENTRY").map(PathBuf::from);
    let mut modules_dir = None;
    let mut socket_path = None;
    let mut port = None;
    let mut proxy = ProxyConfig::default();
    let mut debug_events_dir = None;
    let mut provisioner = ProvisionerOptions {
        bundle_dir: std::env::var_os("HOSTLINK_BUNDLE_DIR").map(PathBuf::from),
        mirror: std::env::var("HOSTLINK_MIRROR").ok().filter(|v| !v.is_empty()),
        auto_install: true,
        ..Default::default()
    };

    while let Some(arg) = parser.next() {
        let (flag, inline_value) = split_flag(&arg);
        match flag {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--entry" => {
                entry_file = Some(PathBuf::from(flag_value(&mut parser, flag, inline_value)?));
            }
            "--modules-dir" => {
                modules_dir = Some(PathBuf::from(flag_value(&mut parser, flag, inline_value)?));
            }
            "--socket-path" => {
                socket_path = Some(PathBuf::from(flag_value(&mut parser, flag, inline_value)?));
            }
            "--port" => {
                let raw = flag_value(&mut parser, flag, inline_value)?;
                port = Some(
                    raw.parse::<u16>()
                        .map_err(|_| format!("invalid --port value: {raw}"))?,
                );
            }
            "--http-proxy" => {
                proxy.http_proxy = Some(flag_value(&mut parser, flag, inline_value)?);
            }
            "--https-proxy" => {
                proxy.https_proxy = Some(flag_value(&mut parser, flag, inline_value)?);
            }
            "--no-proxy" => {
                proxy.no_proxy = Some(flag_value(&mut parser, flag, inline_value)?);
            }
            "--debug-events-dir" => {
                let raw = flag_value(&mut parser, flag, inline_value)?;
                if raw.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(raw));
            }
            _ => {
                if !apply_provisioner_flag(&mut provisioner, &mut parser, flag, inline_value)? {
                    return Err(format!("unknown argument: {arg}").into());
                }
            }
        }
    }

    let Some(entry_file) = entry_file else {
        return Err("missing --entry <path> (or HOSTLINK_ENTRY) for the extension host".into());
    };

    Ok(CliCommand::Run(RunOptions {
        entry_file,
        modules_dir,
        provisioner,
        socket_path,
        port,
        proxy,
        debug_events_dir,
    }))
}

fn parse_snapshot_args(parser: &mut ArgParser) -> Result<CliCommand, Box<dyn std::error::Error>> {
    let mut force = false;
    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--force" => force = true,
            other => return Err(format!("unknown snapshot option: {other}").into()),
        }
    }
    Ok(CliCommand::Snapshot { force })
}

fn parse_provisioner_args(
    parser: &mut ArgParser,
    auto_install: bool,
) -> Result<ProvisionerOptions, Box<dyn std::error::Error>> {
    let mut options = ProvisionerOptions {
        bundle_dir: std::env::var_os("HOSTLINK_BUNDLE_DIR").map(PathBuf::from),
        mirror: std::env::var("HOSTLINK_MIRROR").ok().filter(|v| !v.is_empty()),
        auto_install,
        ..Default::default()
    };
    while let Some(arg) = parser.next() {
        let (flag, inline_value) = split_flag(&arg);
        if flag == "-h" || flag == "--help" {
            print_usage();
            std::process::exit(0);
        }
        if !apply_provisioner_flag(&mut options, parser, flag, inline_value)? {
            return Err(format!("unknown argument: {arg}").into());
        }
    }
    Ok(options)
}

fn apply_provisioner_flag(
    options: &mut ProvisionerOptions,
    parser: &mut ArgParser,
    flag: &str,
    inline_value: Option<&str>,
) -> Result<bool, Box<dyn std::error::Error>> {
    match flag {
        "--bundle-dir" => {
            options.bundle_dir = Some(PathBuf::from(flag_value(parser, flag, inline_value)?));
        }
        "--install-dir" => {
            options.install_dir = Some(PathBuf::from(flag_value(parser, flag, inline_value)?));
        }
        "--mirror" => {
            options.mirror = Some(flag_value(parser, flag, inline_value)?);
        }
        "--min-node-version" => {
            let raw = flag_value(parser, flag, inline_value)?;
            options.min_version = Some(
                RuntimeVersion::parse(&raw)
                    .ok_or_else(|| format!("invalid --min-node-version value: {raw}"))?,
            );
        }
        "--no-auto-install" => {
            options.auto_install = false;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn split_flag(arg: &str) -> (&str, Option<&str>) {
    match arg.split_once('=') {
        Some((flag, value)) if flag.starts_with("--") => (flag, Some(value)),
        _ => (arg, None),
    }
}

fn flag_value(
    parser: &mut ArgParser,
    flag: &str,
    inline_value: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(value) = inline_value {
        if value.is_empty() {
            return Err(format!("missing value for {flag}").into());
        }
        return Ok(value.to_string());
    }
    parser.next_value(flag)
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn peek(&self) -> Option<&str> {
        self.args.get(self.index).map(String::as_str)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
hostlink --entry <main.js> [--modules-dir <dir>] [--socket-path <path> | --port <n>] [options]\n\
hostlink doctor [options]\n\
hostlink snapshot [--force]\n\n\
--entry: extension host entry file (env: HOSTLINK_ENTRY)\n\
--modules-dir: supporting module directory (default: <entry dir>/node_modules)\n\
--socket-path: hand the host a Unix domain socket path instead of a TCP port\n\
--port: loopback TCP port for the host transport (default: allocated)\n\
--bundle-dir: plugin resource bundle with a bundled runtime/installer (env: HOSTLINK_BUNDLE_DIR)\n\
--install-dir: user-local runtime directory (default: per-OS data dir)\n\
--mirror: runtime package mirror (env: HOSTLINK_MIRROR; default: https://nodejs.org/dist)\n\
--min-node-version: minimum runtime version (default: 20.6.0)\n\
--no-auto-install: fail instead of downloading or installing a runtime\n\
--http-proxy/--https-proxy/--no-proxy: proxy values merged into the host environment\n\
--debug-events-dir: directory for per-session JSONL event logs (env: HOSTLINK_DEBUG_EVENTS_DIR)\n\
doctor: print the runtime resolution report as JSON\n\
snapshot: refresh and print the filtered shell environment snapshot"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser_with(args: &[&str]) -> ArgParser {
        ArgParser {
            args: args.iter().map(|arg| arg.to_string()).collect(),
            index: 0,
        }
    }

    #[test]
    fn split_flag_handles_equals_form() {
        assert_eq!(split_flag("--port=7100"), ("--port", Some("7100")));
        assert_eq!(split_flag("--port"), ("--port", None));
        assert_eq!(split_flag("doctor"), ("doctor", None));
    }

    #[test]
    fn flag_value_accepts_separate_and_inline_forms() {
        let mut parser = parser_with(&["7100"]);
        assert_eq!(
            flag_value(&mut parser, "--port", None).expect("separate value"),
            "7100"
        );

        let mut parser = parser_with(&[]);
        assert_eq!(
            flag_value(&mut parser, "--port", Some("7100")).expect("inline value"),
            "7100"
        );

        let mut parser = parser_with(&[]);
        let err = flag_value(&mut parser, "--port", None).expect_err("missing value");
        assert!(
            err.to_string().contains("missing value for --port"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn provisioner_flags_are_recognized() {
        let mut options = ProvisionerOptions {
            auto_install: true,
            ..Default::default()
        };
        let mut parser = parser_with(&["/opt/bundle", "--min-node-version", "22.1.0"]);
        assert!(
            apply_provisioner_flag(&mut options, &mut parser, "--bundle-dir", None)
                .expect("bundle flag")
        );
        let (flag, inline) = ("--min-node-version", None);
        let next = parser.next().expect("flag present");
        assert_eq!(next, "--min-node-version");
        assert!(
            apply_provisioner_flag(&mut options, &mut parser, flag, inline)
                .expect("min version flag")
        );
        assert_eq!(options.bundle_dir, Some(PathBuf::from("/opt/bundle")));
        assert_eq!(
            options.min_version,
            Some(RuntimeVersion::new(22, 1, 0))
        );

        let mut parser = parser_with(&[]);
        assert!(
            !apply_provisioner_flag(&mut options, &mut parser, "--bogus", None)
                .expect("unknown flag is not an error")
        );
    }
}
