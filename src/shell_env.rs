use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue, json};

/// GUI-launched IDE processes on Unix-like systems never went through a login
/// shell, so the toolchain paths a user configures in their shell profile are
/// invisible to them. The reconciler captures the interactive shell
/// environment into a time-boxed cache file and exposes an allow-list
/// filtered view of it for the child process environment.
pub const SNAPSHOT_MARKER_KEY: &str = "__HOSTLINK_SHELL_ENV";
pub const SNAPSHOT_TIMESTAMP_KEY: &str = "__HOSTLINK_SHELL_ENV_TIMESTAMP";
const SNAPSHOT_FILE_NAME: &str = "idea-shell-env.json";

const FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

const ALLOWED_EXACT: &[&str] = &["PATH", "JAVA_HOME", "GOROOT", "GOPATH", "LANG", "LC_ALL"];
const ALLOWED_PREFIXES: &[&str] = &[
    "NVM_",
    "PYENV_",
    "SDKMAN_",
    "CONDA_",
    "BUN_",
    "CARGO_",
    "VSCODE_",
    "GIT_",
    "ANTHROPIC_",
    "JETBRAINS_",
    "GEMINI_",
    "LC_",
    "RUST_",
    "HOSTLINK_",
    "EXTHOST_",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Zsh,
    Bash,
    PowerShell,
    Cmd,
}

pub trait ShellRunner: Send + Sync {
    /// Spawns the given shell in login/interactive mode and returns its
    /// line-oriented `KEY=VALUE` environment dump.
    fn capture(&self, shell: ShellKind) -> std::io::Result<String>;
}

pub struct LoginShellRunner;

impl ShellRunner for LoginShellRunner {
    fn capture(&self, shell: ShellKind) -> std::io::Result<String> {
        let output = match shell {
            ShellKind::Zsh | ShellKind::Bash => {
                let program = std::env::var("SHELL").unwrap_or_else(|_| match shell {
                    ShellKind::Zsh => "zsh".to_string(),
                    _ => "/bin/bash".to_string(),
                });
                // -ilc: interactive login shell, so the user's profile and rc
                // files are sourced before the dump.
                Command::new(program).args(["-ilc", "env"]).output()?
            }
            ShellKind::PowerShell => Command::new("powershell.exe")
                .args([
                    "-Command",
                    "Get-ChildItem env: | ForEach-Object { \"$($_.Name)=$($_.Value)\" }",
                ])
                .output()?,
            ShellKind::Cmd => Command::new("cmd.exe").args(["/c", "set"]).output()?,
        };
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

pub fn detect_shell() -> ShellKind {
    #[cfg(target_family = "windows")]
    {
        if std::env::var_os("PSModulePath").is_some() {
            ShellKind::PowerShell
        } else {
            ShellKind::Cmd
        }
    }
    #[cfg(not(target_family = "windows"))]
    {
        detect_unix_shell(std::env::var_os("SHELL"))
    }
}

#[cfg(not(target_family = "windows"))]
fn detect_unix_shell(shell: Option<OsString>) -> ShellKind {
    match shell {
        Some(value) if value.to_string_lossy().contains("zsh") => ShellKind::Zsh,
        _ => ShellKind::Bash,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Cache file exists and is younger than the freshness window.
    Fresh,
    /// A new snapshot was captured and written.
    Refreshed,
    /// The shell produced no variables; nothing was written.
    EmptyCapture,
}

/// Refreshes the per-OS snapshot cache when stale. Capture failures are soft:
/// the caller logs and proceeds without a snapshot.
pub fn ensure_snapshot(runner: &dyn ShellRunner) -> Result<SnapshotOutcome, Box<dyn std::error::Error>> {
    let Some(path) = snapshot_path() else {
        return Err("cannot determine shell snapshot cache path (no home directory)".into());
    };
    ensure_snapshot_at(&path, runner, Utc::now())
}

pub fn ensure_snapshot_at(
    path: &Path,
    runner: &dyn ShellRunner,
    now: DateTime<Utc>,
) -> Result<SnapshotOutcome, Box<dyn std::error::Error>> {
    if snapshot_is_fresh(path, now) {
        crate::event_log::log(
            "snapshot_skipped_fresh",
            json!({"path": path.to_string_lossy()}),
        );
        return Ok(SnapshotOutcome::Fresh);
    }

    let shell = detect_shell();
    let raw = runner.capture(shell)?;
    let mut env = parse_env_lines(&raw);
    if env.is_empty() {
        crate::event_log::log(
            "snapshot_empty_capture",
            json!({"shell": format!("{shell:?}")}),
        );
        return Ok(SnapshotOutcome::EmptyCapture);
    }

    env.insert(SNAPSHOT_MARKER_KEY.to_string(), "true".to_string());
    env.insert(
        SNAPSHOT_TIMESTAMP_KEY.to_string(),
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    write_snapshot(path, &env)?;
    crate::event_log::log_lazy("snapshot_refreshed", || {
        json!({"path": path.to_string_lossy(), "variables": env.len()})
    });
    Ok(SnapshotOutcome::Refreshed)
}

/// Loads the cached snapshot and applies the allow-list. A missing or
/// unparseable cache yields an empty mapping, never an error.
pub fn load_filtered() -> BTreeMap<String, String> {
    match snapshot_path() {
        Some(path) => load_filtered_from(&path),
        None => BTreeMap::new(),
    }
}

pub fn load_filtered_from(path: &Path) -> BTreeMap<String, String> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    let Ok(JsonValue::Object(map)) = serde_json::from_str::<JsonValue>(&raw) else {
        return BTreeMap::new();
    };
    let mut env = BTreeMap::new();
    for (key, value) in map {
        if let JsonValue::String(value) = value {
            env.insert(key, value);
        }
    }
    filter_allowed(&env)
}

/// Pure allow-list filter: exact names plus name prefixes. Idempotent by
/// construction; reserved snapshot metadata keys never pass.
pub fn filter_allowed(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| is_allowed_key(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn is_allowed_key(key: &str) -> bool {
    if ALLOWED_EXACT.contains(&key) {
        return true;
    }
    ALLOWED_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

pub fn snapshot_path() -> Option<PathBuf> {
    #[cfg(target_family = "windows")]
    {
        std::env::var_os("LOCALAPPDATA").map(|dir| PathBuf::from(dir).join(SNAPSHOT_FILE_NAME))
    }
    #[cfg(target_os = "macos")]
    {
        home_dir().map(|home| home.join("Library").join("Caches").join(SNAPSHOT_FILE_NAME))
    }
    #[cfg(all(target_family = "unix", not(target_os = "macos")))]
    {
        home_dir().map(|home| home.join(".cache").join(SNAPSHOT_FILE_NAME))
    }
}

pub(crate) fn home_dir() -> Option<PathBuf> {
    resolve_home_dir_from_env(
        std::env::var_os("HOME"),
        std::env::var_os("USERPROFILE"),
        std::env::var_os("HOMEDRIVE"),
        std::env::var_os("HOMEPATH"),
    )
}

fn resolve_home_dir_from_env(
    home: Option<OsString>,
    userprofile: Option<OsString>,
    homedrive: Option<OsString>,
    homepath: Option<OsString>,
) -> Option<PathBuf> {
    if let Some(home) = home.filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(home));
    }

    if let Some(userprofile) = userprofile.filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(userprofile));
    }

    let homedrive = homedrive.filter(|value| !value.is_empty())?;
    let homepath = homepath.filter(|value| !value.is_empty())?;
    let absolute_homepath = PathBuf::from(&homepath);
    if absolute_homepath.is_absolute() {
        return Some(absolute_homepath);
    }
    let needs_separator = !matches!(homepath.to_str(), Some(value) if value.starts_with('\\') || value.starts_with('/'));
    let mut combined = homedrive;
    if needs_separator {
        combined.push("\\");
    }
    combined.push(homepath);
    Some(PathBuf::from(combined))
}

fn snapshot_is_fresh(path: &Path, now: DateTime<Utc>) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(JsonValue::Object(map)) = serde_json::from_str::<JsonValue>(&raw) else {
        return false;
    };
    let Some(JsonValue::String(stamp)) = map.get(SNAPSHOT_TIMESTAMP_KEY) else {
        return false;
    };
    let Ok(written) = DateTime::parse_from_rfc3339(stamp) else {
        return false;
    };
    let age = now.signed_duration_since(written.with_timezone(&Utc));
    age.num_seconds() < FRESHNESS_WINDOW.as_secs() as i64
}

fn parse_env_lines(raw: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once('=') else {
            // Continuation of a multi-line value; only the first line is kept.
            continue;
        };
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            continue;
        }
        env.insert(key.to_string(), value.to_string());
    }
    env
}

fn write_snapshot(path: &Path, env: &BTreeMap<String, String>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(parent) = path.parent() else {
        return Err(format!("snapshot path has no parent: {}", path.display()).into());
    };
    std::fs::create_dir_all(parent)?;

    let mut map = JsonMap::new();
    for (key, value) in env {
        map.insert(key.clone(), JsonValue::String(value.clone()));
    }
    let serialized = serde_json::to_string(&JsonValue::Object(map))?;

    // Concurrent writers race on the rename; the loser's snapshot is simply
    // replaced, which is fine — both captured the same environment.
    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("snapshot"),
        std::process::id()
    );
    let tmp_path = parent.join(tmp_name);
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
