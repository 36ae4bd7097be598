//! User-facing notifications.
//!
//! Desktop delivery is platform specific; the agent only needs a sink for
//! short messages such as `Blocked: /path/to/tool`.

use tracing::info;

/// Delivers user-facing messages.
pub trait Notifier: Send + Sync {
    /// Show a short message to the user.
    fn show_notification(&self, message: &str);
}

/// Notifier that records messages in the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show_notification(&self, message: &str) {
        info!(target: "execgate::notification", message, "notification");
    }
}
