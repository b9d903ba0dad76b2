//! core::context
//!
//! Operation context: cooperative cancellation and progress reporting.
//!
//! # Architecture
//!
//! An [`OpContext`] is threaded through every long operation (fetch,
//! collect, walk, gc). Cancellation is cooperative: the runner checks
//! [`OpContext::check_interrupted`] at each process-spawn boundary, and
//! walkers check between iterations. A set interruption reason causes
//! in-flight operations to terminate with `OperationCancelled`; pending
//! fetches are aborted by killing the child process.
//!
//! Progress messages stream to the caller's sink and are mirrored to the
//! log at debug level.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;

/// Sink for human-readable progress messages.
pub trait ProgressSink: Send + Sync {
    /// Report one progress line.
    fn progress(&self, message: &str);
}

/// A sink that discards all messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn progress(&self, _message: &str) {}
}

/// A sink that collects messages in memory; useful in tests and for
/// callers that batch progress lines.
#[derive(Debug, Default, Clone)]
pub struct BufferedProgress {
    lines: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl BufferedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// The messages reported so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl ProgressSink for BufferedProgress {
    fn progress(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }
}

/// Shared context for one logical VCS operation.
///
/// Cheap to clone; clones share the interruption flag, so interrupting
/// through any clone is observed by all of them.
#[derive(Clone)]
pub struct OpContext {
    operation: Arc<str>,
    interruption: Arc<RwLock<Option<String>>>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("operation", &self.operation)
            .field("interruption", &*self.interruption.read())
            .finish_non_exhaustive()
    }
}

impl OpContext {
    /// Create a context with a no-op progress sink.
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_sink(operation, Arc::new(NullProgress))
    }

    /// Create a context streaming progress into `sink`.
    pub fn with_sink(operation: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            operation: Arc::from(operation.into()),
            interruption: Arc::new(RwLock::new(None)),
            sink,
        }
    }

    /// The label of the enclosing operation ("collecting changes", ...).
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Request cancellation of all work using this context.
    pub fn interrupt(&self, reason: impl Into<String>) {
        *self.interruption.write() = Some(reason.into());
    }

    /// The interruption reason, if one was set.
    pub fn interruption_reason(&self) -> Option<String> {
        self.interruption.read().clone()
    }

    /// Fail with `OperationCancelled` when an interruption reason is set.
    pub fn check_interrupted(&self) -> Result<(), Error> {
        match self.interruption_reason() {
            Some(reason) => Err(Error::OperationCancelled { reason }),
            None => Ok(()),
        }
    }

    /// Stream a progress message to the sink and the debug log.
    pub fn progress(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!(operation = %self.operation, "{}", message);
        self.sink.progress(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_not_interrupted() {
        let ctx = OpContext::new("test");
        assert!(ctx.check_interrupted().is_ok());
        assert_eq!(ctx.interruption_reason(), None);
    }

    #[test]
    fn interruption_is_shared_across_clones() {
        let ctx = OpContext::new("test");
        let clone = ctx.clone();
        clone.interrupt("server shutdown");

        let err = ctx.check_interrupted().unwrap_err();
        match err {
            Error::OperationCancelled { reason } => assert_eq!(reason, "server shutdown"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn progress_reaches_sink() {
        let sink = BufferedProgress::new();
        let ctx = OpContext::with_sink("fetch", Arc::new(sink.clone()));
        ctx.progress("fetching refs/heads/main");

        assert_eq!(sink.lines(), ["fetching refs/heads/main"]);
    }
}
