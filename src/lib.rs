pub mod diagnostics;
pub mod dispatch;
pub mod event_log;
pub mod notify;
pub mod runtime;
pub mod shell_env;
pub mod supervisor;
pub mod transport;
