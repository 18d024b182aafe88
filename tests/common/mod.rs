#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use hostlink::notify::Notifier;
use hostlink::shell_env::{ShellKind, ShellRunner};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Stand-in `node` binary: answers `--version` and otherwise runs the given
/// shell body (the extension-host role).
#[cfg(target_family = "unix")]
pub fn write_stub_runtime(path: &Path, version: &str, body: &str) -> TestResult<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then\n  echo \"{version}\"\n  exit 0\nfi\n{body}\n"
    );
    std::fs::write(path, script)?;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

/// Shell runner that never spawns anything; its empty capture keeps the
/// reconciler from writing a cache file during supervisor tests.
pub struct SilentShellRunner;

impl ShellRunner for SilentShellRunner {
    fn capture(&self, _shell: ShellKind) -> std::io::Result<String> {
        Ok(String::new())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    blocking: Mutex<Vec<(String, String)>>,
    passive: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn blocking_messages(&self) -> Vec<(String, String)> {
        self.blocking
            .lock()
            .expect("recording notifier mutex poisoned")
            .clone()
    }

    pub fn passive_messages(&self) -> Vec<(String, String)> {
        self.passive
            .lock()
            .expect("recording notifier mutex poisoned")
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_blocking(&self, title: &str, message: &str) {
        self.blocking
            .lock()
            .expect("recording notifier mutex poisoned")
            .push((title.to_string(), message.to_string()));
    }

    fn notify_passive(&self, title: &str, message: &str) {
        self.passive
            .lock()
            .expect("recording notifier mutex poisoned")
            .push((title.to_string(), message.to_string()));
    }
}

/// Minimal loopback HTTP responder standing in for the package mirror.
/// Answers HEAD with 200 and GET from the given path map.
pub fn serve_mirror(files: HashMap<String, Vec<u8>>) -> TestResult<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let base = format!("http://{}", listener.local_addr()?);
    let files = Arc::new(files);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let files = files.clone();
            thread::spawn(move || {
                let _ = handle_mirror_request(&mut stream, &files);
            });
        }
    });
    Ok(base)
}

fn handle_mirror_request(
    stream: &mut TcpStream,
    files: &HashMap<String, Vec<u8>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 16 * 1024 {
            break;
        }
    }
    let request = String::from_utf8_lossy(&buf);
    let mut parts = request.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    match method {
        "HEAD" => write_response(stream, 200, "OK", &[]),
        "GET" => match files.get(path) {
            Some(body) => write_response(stream, 200, "OK", body),
            None => write_response(stream, 404, "Not Found", b"not found"),
        },
        _ => write_response(stream, 405, "Method Not Allowed", &[]),
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &[u8],
) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(body)?;
    stream.flush()
}

/// Builds a gzipped tarball shaped like a runtime release: a single
/// executable stub at `<top_dir>/bin/node`.
#[cfg(target_family = "unix")]
pub fn build_runtime_archive(top_dir: &str, version: &str) -> TestResult<Vec<u8>> {
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then\n  echo \"v{version}\"\n  exit 0\nfi\nsleep 30\n"
    );
    let mut tar_gz = Vec::new();
    {
        let encoder =
            flate2::write::GzEncoder::new(&mut tar_gz, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(script.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(
            &mut header,
            format!("{top_dir}/bin/node"),
            script.as_bytes(),
        )?;
        let encoder = builder.into_inner()?;
        encoder.finish()?;
    }
    Ok(tar_gz)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
