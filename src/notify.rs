use serde_json::json;

/// Seam through which provisioning and startup failures reach the embedding
/// UI. The host IDE supplies an implementation that marshals onto its UI
/// thread; the default degrades everything to stderr so headless and batch
/// runs keep working.
pub trait Notifier: Send + Sync {
    /// A condition that requires user action before the host can start
    /// (version too low). Interactive embeddings show a modal dialog.
    fn notify_blocking(&self, title: &str, message: &str);

    /// A condition the user should know about but that must not interrupt
    /// them (network trouble, degraded integration).
    fn notify_passive(&self, title: &str, message: &str);
}

pub struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify_blocking(&self, title: &str, message: &str) {
        // No interactive UI context here; fall back to a passive report.
        crate::event_log::log(
            "notification_blocking",
            json!({"title": title, "message": message}),
        );
        eprintln!("[hostlink] {title}: {message}");
    }

    fn notify_passive(&self, title: &str, message: &str) {
        crate::event_log::log(
            "notification_passive",
            json!({"title": title, "message": message}),
        );
        eprintln!("[hostlink] {title}: {message}");
    }
}
