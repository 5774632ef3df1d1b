use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::Level;

use crate::error::{ForgeError, Result};

/// Receives diagnostics raised while decoding. Implementations must be cheap,
/// parsing code calls them inline.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, level: Level, entity: &str, message: &str);
}

/// Forwards diagnostics to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&self, level: Level, entity: &str, message: &str) {
        log::log!(target: "ntfs_artifact_forge::scan", level, "[{}] {}", entity, message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: Level,
    pub entity: String,
    pub message: String,
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl DiagnosticSink for MemorySink {
    fn report(&self, level: Level, entity: &str, message: &str) {
        let diagnostic = Diagnostic {
            level,
            entity: entity.to_string(),
            message: message.to_string(),
        };
        match self.entries.lock() {
            Ok(mut guard) => guard.push(diagnostic),
            Err(poisoned) => poisoned.into_inner().push(diagnostic),
        }
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State threaded through every parsing call: where diagnostics go and whether
/// the pass has been cancelled.
#[derive(Clone)]
pub struct ScanContext {
    sink: Arc<dyn DiagnosticSink>,
    cancel: CancelToken,
}

impl Default for ScanContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanContext {
    pub fn new() -> Self {
        Self {
            sink: Arc::new(LogSink),
            cancel: CancelToken::default(),
        }
    }

    pub fn with_sink(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            sink,
            cancel: CancelToken::default(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Called between whole records, blocks and compression units.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ForgeError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn warn(&self, entity: &str, message: impl AsRef<str>) {
        self.sink.report(Level::Warn, entity, message.as_ref());
    }

    pub fn info(&self, entity: &str, message: impl AsRef<str>) {
        self.sink.report(Level::Info, entity, message.as_ref());
    }

    pub fn debug(&self, entity: &str, message: impl AsRef<str>) {
        self.sink.report(Level::Debug, entity, message.as_ref());
    }
}
