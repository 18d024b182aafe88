use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use flate2::read::GzDecoder;
use serde_json::json;
use sha2::{Digest, Sha256};

pub const DEFAULT_MIRROR: &str = "https://nodejs.org/dist";
pub const DEFAULT_DOWNLOAD_VERSION: &str = "20.11.1";

const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(5);
const DOWNLOAD_BODY_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(target_family = "windows")]
const NODE_BINARY: &str = "node.exe";
#[cfg(not(target_family = "windows"))]
const NODE_BINARY: &str = "node";

/// Semantic runtime version. Ordering and equality are component-wise over
/// (major, minor, patch); the original string is kept for display only and
/// never participates in comparison.
#[derive(Debug, Clone)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    raw: String,
}

impl RuntimeVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            raw: format!("{major}.{minor}.{patch}"),
        }
    }

    /// Accepts `v20.6.0`, `20.6.0`, and shorter forms; trailing non-digit
    /// suffixes on the patch component (`20.6.0-nightly`) are tolerated.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let stripped = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let mut parts = stripped.splitn(3, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(part) => part.parse().ok()?,
            None => 0,
        };
        let patch = match parts.next() {
            Some(part) => leading_number(part)?,
            None => 0,
        };
        Some(Self {
            major,
            minor,
            patch,
            raw: trimmed.to_string(),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

impl PartialEq for RuntimeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Eq for RuntimeVersion {}

impl PartialOrd for RuntimeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RuntimeVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.triple().cmp(&other.triple())
    }
}

impl std::fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[derive(Debug)]
pub enum ProvisionError {
    NotFound(String),
    SetupFailed(String),
    VersionTooLow {
        found: RuntimeVersion,
        required: RuntimeVersion,
    },
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionError::NotFound(message) => write!(f, "runtime not found: {message}"),
            ProvisionError::SetupFailed(message) => write!(f, "runtime setup failed: {message}"),
            ProvisionError::VersionTooLow { found, required } => write!(
                f,
                "runtime version {found} is below the required minimum {required}"
            ),
        }
    }
}

impl std::error::Error for ProvisionError {}

/// Resolves a Node.js runtime across three tiers (bundled, user-local,
/// system PATH) and provisions one when absent, either by running a bundled
/// offline installer or by downloading the per-OS/arch archive from a
/// package mirror.
#[derive(Clone)]
pub struct NodeProvisioner {
    pub bundle_dir: Option<PathBuf>,
    pub install_dir: PathBuf,
    pub mirror_base: String,
    pub min_version: RuntimeVersion,
    pub download_version: String,
    pub auto_install: bool,
    /// Overrides the PATH value consulted by the third resolution tier.
    /// `None` reads the process environment at call time.
    pub search_path: Option<std::ffi::OsString>,
}

impl NodeProvisioner {
    pub fn new(bundle_dir: Option<PathBuf>, install_dir: PathBuf) -> Self {
        Self {
            bundle_dir,
            install_dir,
            mirror_base: DEFAULT_MIRROR.to_string(),
            min_version: RuntimeVersion::new(20, 6, 0),
            download_version: DEFAULT_DOWNLOAD_VERSION.to_string(),
            auto_install: true,
            search_path: None,
        }
    }

    /// First hit wins: bundled runtime, previously-downloaded runtime,
    /// system PATH.
    pub fn resolve(&self) -> Option<PathBuf> {
        self.bundled_runtime()
            .or_else(|| self.installed_runtime())
            .or_else(|| self.path_runtime())
    }

    pub fn bundled_runtime(&self) -> Option<PathBuf> {
        let bundle = self.bundle_dir.as_ref()?;
        let candidates = [
            bundle.join("node").join("bin").join(NODE_BINARY),
            bundle.join("node").join(NODE_BINARY),
            bundle.join(NODE_BINARY),
        ];
        candidates.into_iter().find(|path| is_executable(path))
    }

    pub fn installed_runtime(&self) -> Option<PathBuf> {
        let candidates = [
            self.install_dir.join("bin").join(NODE_BINARY),
            self.install_dir.join(NODE_BINARY),
        ];
        candidates.into_iter().find(|path| is_executable(path))
    }

    pub fn path_runtime(&self) -> Option<PathBuf> {
        let path_value = match &self.search_path {
            Some(value) => value.clone(),
            None => std::env::var_os("PATH")?,
        };
        find_program_on_path(NODE_BINARY, &path_value)
    }

    /// Resolves the runtime, provisioning it when missing, and gates the
    /// result on the minimum version. Once a suitable runtime exists this
    /// performs only existence and version checks — no network traffic.
    pub fn ensure(&self) -> Result<PathBuf, ProvisionError> {
        if let Some(path) = self.resolve() {
            return self.gate_version(path);
        }

        if !self.auto_install {
            return Err(ProvisionError::NotFound(
                "no bundled, user-local, or PATH runtime and automatic install is disabled"
                    .to_string(),
            ));
        }

        crate::diagnostics::startup_log("runtime: not resolved, provisioning");
        if let Some(installer) = self.offline_installer() {
            self.run_offline_installer(&installer)?;
        } else {
            self.probe_mirror()?;
            self.download_and_unpack()?;
        }

        let Some(path) = self.resolve() else {
            return Err(ProvisionError::SetupFailed(
                "runtime still unresolved after installation".to_string(),
            ));
        };
        self.gate_version(path)
    }

    fn gate_version(&self, path: PathBuf) -> Result<PathBuf, ProvisionError> {
        let found = runtime_version_of(&path).map_err(ProvisionError::SetupFailed)?;
        if found < self.min_version {
            return Err(ProvisionError::VersionTooLow {
                found,
                required: self.min_version.clone(),
            });
        }
        crate::event_log::log_lazy("runtime_resolved", || {
            json!({"path": path.to_string_lossy(), "version": found.raw()})
        });
        Ok(path)
    }

    pub fn offline_installer(&self) -> Option<PathBuf> {
        let bundle = self.bundle_dir.as_ref()?;
        #[cfg(target_family = "windows")]
        let name = "install-node.cmd";
        #[cfg(not(target_family = "windows"))]
        let name = "install-node.sh";
        let script = bundle.join("installer").join(name);
        script.is_file().then_some(script)
    }

    fn run_offline_installer(&self, script: &Path) -> Result<(), ProvisionError> {
        crate::event_log::log_lazy("runtime_installer_begin", || {
            json!({"script": script.to_string_lossy()})
        });
        let mut child = Command::new(script)
            .arg(&self.install_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                ProvisionError::SetupFailed(format!(
                    "failed to launch bundled installer {}: {err}",
                    script.display()
                ))
            })?;

        let stderr = child.stderr.take();
        let stderr_drain = std::thread::spawn(move || {
            let mut lines = Vec::new();
            if let Some(stderr) = stderr {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    lines.push(line);
                }
            }
            lines
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                crate::diagnostics::startup_log(format!("installer: {line}"));
                crate::event_log::log_lazy("runtime_installer_output", || json!({"line": line}));
            }
        }

        let status = child.wait().map_err(|err| {
            ProvisionError::SetupFailed(format!("bundled installer did not finish: {err}"))
        })?;
        if let Ok(lines) = stderr_drain.join() {
            for line in lines {
                crate::event_log::log_lazy("runtime_installer_output", || {
                    json!({"line": line, "stream": "stderr"})
                });
            }
        }
        if !status.success() {
            return Err(ProvisionError::SetupFailed(format!(
                "bundled installer exited with status {status}"
            )));
        }
        Ok(())
    }

    /// HEAD request against the mirror with short fixed timeouts. Fails
    /// closed: any error means unreachable, and there is no fallback mirror.
    fn probe_mirror(&self) -> Result<(), ProvisionError> {
        let agent = http_agent(PROBE_READ_TIMEOUT);
        let url = format!("{}/", self.mirror_base.trim_end_matches('/'));
        agent.head(&url).call().map_err(|err| {
            ProvisionError::SetupFailed(format!(
                "package mirror {} is unreachable: {err}",
                self.mirror_base
            ))
        })?;
        Ok(())
    }

    fn download_and_unpack(&self) -> Result<(), ProvisionError> {
        let archive = archive_file_name(&self.download_version)?;
        let base = self.mirror_base.trim_end_matches('/');
        let version = &self.download_version;
        let archive_url = format!("{base}/v{version}/{archive}");
        let shasums_url = format!("{base}/v{version}/SHASUMS256.txt");

        let agent = http_agent(DOWNLOAD_BODY_TIMEOUT);
        let shasums = http_get_string(&agent, &shasums_url)?;
        let expected = expected_digest(&shasums, &archive).ok_or_else(|| {
            ProvisionError::SetupFailed(format!("no checksum for {archive} in SHASUMS256.txt"))
        })?;

        std::fs::create_dir_all(&self.install_dir).map_err(|err| {
            ProvisionError::SetupFailed(format!(
                "cannot create install directory {}: {err}",
                self.install_dir.display()
            ))
        })?;

        crate::event_log::log_lazy("runtime_download_begin", || json!({"url": archive_url}));
        let archive_path = self.install_dir.join(&archive);
        download_verify(&agent, &archive_url, &archive_path, &expected)?;

        // The archive wraps everything in a node-v<V>-<os>-<arch>/ directory;
        // strip it so the binary lands at <install_dir>/bin/node.
        let extract_result = if archive.ends_with(".zip") {
            extract_zip(&archive_path, &self.install_dir, 1)
        } else {
            extract_tar_gz(&archive_path, &self.install_dir, 1)
        };
        let _ = std::fs::remove_file(&archive_path);
        extract_result?;

        crate::event_log::log_lazy("runtime_download_done", || {
            json!({"install_dir": self.install_dir.to_string_lossy()})
        });
        Ok(())
    }
}

pub fn default_install_dir() -> Option<PathBuf> {
    #[cfg(target_family = "windows")]
    {
        std::env::var_os("LOCALAPPDATA").map(|dir| PathBuf::from(dir).join("hostlink"))
    }
    #[cfg(target_os = "macos")]
    {
        crate::shell_env::home_dir()
            .map(|home| home.join("Library").join("Application Support").join("hostlink"))
    }
    #[cfg(all(target_family = "unix", not(target_os = "macos")))]
    {
        crate::shell_env::home_dir().map(|home| home.join(".local").join("share").join("hostlink"))
    }
}

/// Runs `<runtime> --version` and parses the reported version.
pub fn runtime_version_of(path: &Path) -> Result<RuntimeVersion, String> {
    let output = Command::new(path)
        .arg("--version")
        .output()
        .map_err(|err| format!("failed to run {} --version: {err}", path.display()))?;
    if !output.status.success() {
        return Err(format!(
            "{} --version exited with status {}",
            path.display(),
            output.status
        ));
    }
    let raw = String::from_utf8_lossy(&output.stdout);
    RuntimeVersion::parse(&raw)
        .ok_or_else(|| format!("unparseable version output from {}: {raw:?}", path.display()))
}

pub fn archive_file_name(version: &str) -> Result<String, ProvisionError> {
    let os = match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "darwin",
        "windows" => "win",
        other => {
            return Err(ProvisionError::SetupFailed(format!(
                "no runtime archive for host OS {other}"
            )));
        }
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => {
            return Err(ProvisionError::SetupFailed(format!(
                "no runtime archive for host architecture {other}"
            )));
        }
    };
    let ext = if os == "win" { "zip" } else { "tar.gz" };
    Ok(format!("node-v{version}-{os}-{arch}.{ext}"))
}

fn http_agent(body_timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_connect(Some(PROBE_CONNECT_TIMEOUT))
        .timeout_recv_response(Some(PROBE_READ_TIMEOUT))
        .timeout_recv_body(Some(body_timeout))
        .build()
        .new_agent()
}

fn http_get_string(agent: &ureq::Agent, url: &str) -> Result<String, ProvisionError> {
    let resp = agent
        .get(url)
        .call()
        .map_err(|err| ProvisionError::SetupFailed(format!("GET {url}: {err}")))?;
    let mut reader = resp.into_body().into_reader();
    let mut buf = String::new();
    reader
        .read_to_string(&mut buf)
        .map_err(|err| ProvisionError::SetupFailed(format!("read {url}: {err}")))?;
    Ok(buf)
}

/// SHASUMS256.txt format: `<hex digest>  <file name>` per line.
fn expected_digest(shasums: &str, archive: &str) -> Option<String> {
    for line in shasums.lines() {
        let mut fields = line.split_whitespace();
        let digest = fields.next()?;
        if let Some(name) = fields.next()
            && name == archive
        {
            return Some(digest.to_string());
        }
    }
    None
}

fn download_verify(
    agent: &ureq::Agent,
    url: &str,
    dest: &Path,
    expected_sha256: &str,
) -> Result<(), ProvisionError> {
    let resp = agent
        .get(url)
        .call()
        .map_err(|err| ProvisionError::SetupFailed(format!("GET {url}: {err}")))?;
    let mut reader = resp.into_body().into_reader();

    let tmp = dest.with_extension("download.tmp");
    let mut file = File::create(&tmp)
        .map_err(|err| ProvisionError::SetupFailed(format!("create {}: {err}", tmp.display())))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|err| ProvisionError::SetupFailed(format!("read download stream: {err}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .map_err(|err| ProvisionError::SetupFailed(format!("write download: {err}")))?;
    }
    let _ = file.flush();
    drop(file);

    let actual = hex_lower(&hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected_sha256.trim()) {
        let _ = std::fs::remove_file(&tmp);
        return Err(ProvisionError::SetupFailed(format!(
            "sha256 mismatch for {url}: expected {expected_sha256}, got {actual}"
        )));
    }

    std::fs::rename(&tmp, dest).map_err(|err| {
        ProvisionError::SetupFailed(format!(
            "rename {} -> {}: {err}",
            tmp.display(),
            dest.display()
        ))
    })?;
    Ok(())
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn extract_tar_gz(path: &Path, out_dir: &Path, strip_components: usize) -> Result<(), ProvisionError> {
    let file = File::open(path)
        .map_err(|err| ProvisionError::SetupFailed(format!("open {}: {err}", path.display())))?;
    let gz = GzDecoder::new(file);
    let mut archive = tar::Archive::new(gz);
    let entries = archive
        .entries()
        .map_err(|err| ProvisionError::SetupFailed(format!("read tar entries: {err}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| ProvisionError::SetupFailed(format!("tar entry: {err}")))?;
        let entry_path = entry
            .path()
            .map_err(|err| ProvisionError::SetupFailed(format!("tar entry path: {err}")))?
            .to_path_buf();
        let rel = sanitize_rel_path(&entry_path)?;
        let Some(rel) = strip_path_components(&rel, strip_components) else {
            continue;
        };
        let out_path = out_dir.join(rel);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                ProvisionError::SetupFailed(format!("create {}: {err}", parent.display()))
            })?;
        }
        entry.unpack(&out_path).map_err(|err| {
            ProvisionError::SetupFailed(format!("unpack {}: {err}", out_path.display()))
        })?;
    }
    Ok(())
}

fn extract_zip(path: &Path, out_dir: &Path, strip_components: usize) -> Result<(), ProvisionError> {
    let file = File::open(path)
        .map_err(|err| ProvisionError::SetupFailed(format!("open {}: {err}", path.display())))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| ProvisionError::SetupFailed(format!("open zip: {err}")))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| ProvisionError::SetupFailed(format!("zip entry: {err}")))?;
        let name = entry.name().to_string();
        let rel = sanitize_rel_path(Path::new(&name))?;
        let Some(rel) = strip_path_components(&rel, strip_components) else {
            continue;
        };
        let out_path = out_dir.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|err| {
                ProvisionError::SetupFailed(format!("create {}: {err}", out_path.display()))
            })?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                ProvisionError::SetupFailed(format!("create {}: {err}", parent.display()))
            })?;
        }
        let mut out = File::create(&out_path).map_err(|err| {
            ProvisionError::SetupFailed(format!("create {}: {err}", out_path.display()))
        })?;
        std::io::copy(&mut entry, &mut out).map_err(|err| {
            ProvisionError::SetupFailed(format!("write {}: {err}", out_path.display()))
        })?;
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> Result<PathBuf, ProvisionError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(ProvisionError::SetupFailed(format!(
                    "invalid archive path (absolute): {}",
                    path.display()
                )));
            }
            Component::ParentDir => {
                return Err(ProvisionError::SetupFailed(format!(
                    "invalid archive path (..): {}",
                    path.display()
                )));
            }
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
        }
    }
    Ok(out)
}

fn strip_path_components(path: &Path, count: usize) -> Option<PathBuf> {
    let mut components = path.components();
    for _ in 0..count {
        components.next()?;
    }
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        return None;
    }
    Some(rest)
}

pub fn find_program_on_path(name: &str, path_value: &OsStr) -> Option<PathBuf> {
    for dir in std::env::split_paths(path_value) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

pub fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(raw: &str) -> RuntimeVersion {
        RuntimeVersion::parse(raw).expect("parse version")
    }

    #[test]
    fn parse_accepts_v_prefix_and_short_forms() {
        assert_eq!(version("v20.6.0"), RuntimeVersion::new(20, 6, 0));
        assert_eq!(version("20.6.0"), RuntimeVersion::new(20, 6, 0));
        assert_eq!(version("20.6"), RuntimeVersion::new(20, 6, 0));
        assert_eq!(version("20"), RuntimeVersion::new(20, 0, 0));
        assert_eq!(version("v21.1.3-nightly"), RuntimeVersion::new(21, 1, 3));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(RuntimeVersion::parse("").is_none());
        assert!(RuntimeVersion::parse("node").is_none());
        assert!(RuntimeVersion::parse("v.1.2").is_none());
    }

    #[test]
    fn ordering_is_component_wise_and_ignores_raw_string() {
        assert!(version("v18.0.0") < version("20.6.0"));
        assert!(version("20.6.0") < version("20.6.1"));
        assert!(version("20.6.1") < version("20.7.0"));
        assert!(version("20.10.0") > version("20.9.9"));
        assert_eq!(version("v20.6.0"), version("20.6.0"));
    }

    #[test]
    fn ordering_is_a_strict_total_order_over_sample_triples() {
        let mut versions = vec![
            version("21.0.0"),
            version("v18.19.1"),
            version("20.6.0"),
            version("v20.5.9"),
            version("20.6.1"),
        ];
        versions.sort();
        let raws: Vec<&str> = versions.iter().map(RuntimeVersion::raw).collect();
        assert_eq!(
            raws,
            vec!["v18.19.1", "v20.5.9", "20.6.0", "20.6.1", "21.0.0"]
        );
    }

    #[test]
    fn expected_digest_matches_archive_line() {
        let shasums = "\
abc123  node-v20.11.1-linux-x64.tar.gz\n\
def456  node-v20.11.1-darwin-arm64.tar.gz\n";
        assert_eq!(
            expected_digest(shasums, "node-v20.11.1-linux-x64.tar.gz"),
            Some("abc123".to_string())
        );
        assert_eq!(expected_digest(shasums, "node-v20.11.1-win-x64.zip"), None);
    }

    #[test]
    fn sanitize_rel_path_rejects_traversal() {
        assert!(sanitize_rel_path(Path::new("bin/node")).is_ok());
        assert!(sanitize_rel_path(Path::new("../escape")).is_err());
        assert!(sanitize_rel_path(Path::new("/abs/path")).is_err());
    }

    #[test]
    fn strip_path_components_drops_leading_directory() {
        assert_eq!(
            strip_path_components(Path::new("node-v20.11.1-linux-x64/bin/node"), 1),
            Some(PathBuf::from("bin/node"))
        );
        assert_eq!(
            strip_path_components(Path::new("node-v20.11.1-linux-x64"), 1),
            None
        );
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn find_program_on_path_requires_execute_permission() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let plain = temp.path().join("node");
        std::fs::write(&plain, "#!/bin/sh\n").expect("write stub");
        let path_value = std::ffi::OsString::from(temp.path());
        assert!(find_program_on_path("node", &path_value).is_none());

        let mut perms = std::fs::metadata(&plain).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&plain, perms).expect("chmod");
        assert_eq!(find_program_on_path("node", &path_value), Some(plain));
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn resolution_prefers_bundle_over_install_dir() {
        use std::os::unix::fs::PermissionsExt;

        fn stub(path: &Path) {
            std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            std::fs::write(path, "#!/bin/sh\nexit 0\n").expect("write stub");
            let mut perms = std::fs::metadata(path).expect("metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(path, perms).expect("chmod");
        }

        let temp = tempfile::tempdir().expect("tempdir");
        let bundle = temp.path().join("bundle");
        let install = temp.path().join("install");
        stub(&bundle.join("node").join("bin").join("node"));
        stub(&install.join("bin").join("node"));

        let mut provisioner = NodeProvisioner::new(Some(bundle.clone()), install.clone());
        provisioner.search_path = Some(std::ffi::OsString::new());
        assert_eq!(
            provisioner.resolve(),
            Some(bundle.join("node").join("bin").join("node"))
        );

        std::fs::remove_dir_all(&bundle).expect("drop bundle");
        assert_eq!(provisioner.resolve(), Some(install.join("bin").join("node")));

        std::fs::remove_dir_all(&install).expect("drop install");
        assert_eq!(provisioner.resolve(), None);
    }
}
