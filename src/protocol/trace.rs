//! Verbatim mirror of everything sent and received on a session.
//!
//! Each entry is one line `<TAG> <unix-millis>: <text>` where the tag is `TX`
//! (bytes written), `TD` (write metadata), `RX` (bytes read) or `RD` (read
//! metadata). Writing to the mirror never influences the protocol: failures
//! are logged and otherwise ignored.
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use log::warn;

#[derive(Clone)]
pub struct DebugLog {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for DebugLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugLog").finish_non_exhaustive()
    }
}

impl DebugLog {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }

    pub fn tx(&self, text: &str) {
        self.entry("TX", text, false)
    }

    pub fn td(&self, text: &str) {
        self.entry("TD", text, false)
    }

    pub fn rx(&self, text: &str) {
        self.entry("RX", text, true)
    }

    pub fn rd(&self, text: &str) {
        self.entry("RD", text, true)
    }

    /// Flushes pending entries.
    pub fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            if let Err(e) = sink.flush() {
                warn!("failed to flush debug log: {e}");
            }
        }
    }

    fn entry(&self, tag: &str, text: &str, flush: bool) {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        let Ok(mut sink) = self.sink.lock() else {
            warn!("debug log lock poisoned; dropping entry");
            return;
        };
        let res = writeln!(sink, "{tag} {millis}: {text}").and_then(|_| {
            if flush { sink.flush() } else { Ok(()) }
        });
        if let Err(e) = res {
            warn!("failed to write debug log: {e}");
        }
    }
}
