//! User-visible notification seam.
//!
//! Every terminal request failure and every stream reconnect attempt is
//! reported here in addition to the returned error, so the UI layer can show
//! a toast or banner. Silent failure is treated as a defect.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Error,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, level: NotifyLevel, message: &str);
}

/// Default notifier for headless consumers: routes through `tracing` so the
/// events still surface in logs when no UI is attached.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NotifyLevel, message: &str) {
        match level {
            NotifyLevel::Info => tracing::info!(target: "quill::notify", "{message}"),
            NotifyLevel::Error => tracing::error!(target: "quill::notify", "{message}"),
        }
    }
}
