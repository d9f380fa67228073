/// Receives (activity, status) notifications while modules are being resolved.
/// Called from worker threads, possibly concurrently.
pub trait ProgressSink: Send + Sync {
    fn report(&self, activity: &str, status: &str);
}

/// Discards every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _activity: &str, _status: &str) {}
}

/// Forwards notifications as `debug` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, activity: &str, status: &str) {
        tracing::debug!(activity, status, "progress");
    }
}
