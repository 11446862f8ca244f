use crate::error::PlaneError;

/// Receives fatal errors for internal alerting.
///
/// Called inline on dispatch paths, so implementations must not block.
pub trait AlertSink: Send + Sync {
    fn alert(&self, error: &PlaneError, context: &str);
}

/// Logs alerts at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, error: &PlaneError, context: &str) {
        tracing::error!(code = %error.code(), error = %error, context, "Fatal error");
    }
}
