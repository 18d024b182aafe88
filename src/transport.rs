use std::net::TcpListener;
use std::path::PathBuf;

pub const SOCKET_HOST_ENV: &str = "VSCODE_EXTHOST_SOCKET_HOST";
pub const SOCKET_PORT_ENV: &str = "VSCODE_EXTHOST_SOCKET_PORT";
pub const WILL_SEND_SOCKET_ENV: &str = "VSCODE_EXTHOST_WILL_SEND_SOCKET";
pub const IPC_HOOK_ENV: &str = "VSCODE_IPC_HOOK_CLI";

const LOOPBACK_HOST: &str = "127.0.0.1";

/// IPC endpoint handed to the extension host. The host connects back over
/// whichever endpoint it finds in its environment; the same values are
/// mirrored as CLI flags for hosts that parse argv before env.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp { port: u16 },
    Socket { path: PathBuf },
}

impl Transport {
    pub fn env_vars(&self) -> Vec<(String, String)> {
        match self {
            Transport::Tcp { port } => vec![
                (SOCKET_HOST_ENV.to_string(), LOOPBACK_HOST.to_string()),
                (SOCKET_PORT_ENV.to_string(), port.to_string()),
                (WILL_SEND_SOCKET_ENV.to_string(), "true".to_string()),
            ],
            Transport::Socket { path } => vec![(
                IPC_HOOK_ENV.to_string(),
                path.to_string_lossy().to_string(),
            )],
        }
    }

    pub fn child_args(&self) -> Vec<String> {
        match self {
            Transport::Tcp { port } => vec![
                "--vscode-socket-host".to_string(),
                LOOPBACK_HOST.to_string(),
                "--vscode-socket-port".to_string(),
                port.to_string(),
                "--vscode-will-send-socket".to_string(),
                "true".to_string(),
            ],
            // The socket path travels through the environment alone.
            Transport::Socket { .. } => Vec::new(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Transport::Tcp { port } => format!("tcp:{LOOPBACK_HOST}:{port}"),
            Transport::Socket { path } => format!("socket:{}", path.display()),
        }
    }
}

/// Asks the OS for a free loopback port. The listener is dropped before the
/// child launches; the transport layer that actually accepts the connection
/// re-binds the same port.
pub fn allocate_loopback_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((LOOPBACK_HOST, 0))?;
    Ok(listener.local_addr()?.port())
}
