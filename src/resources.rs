//! Bookkeeping for per-call transient buffers.
//!
//! Each input tensor and raw output buffer is covered by a [`Lease`] for the
//! scope of one analyze call; dropping the lease records the release.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::error::AnalyzerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    InputTensor,
    RawOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub acquired: u64,
    pub released: u64,
}

impl LedgerSnapshot {
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

#[derive(Debug, Default)]
pub struct ResourceLedger {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl ResourceLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lease(self: &Arc<Self>, kind: BufferKind) -> Lease {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Lease { kind, ledger: Arc::clone(self) }
    }

    fn release(&self, kind: BufferKind) -> Result<(), AnalyzerError> {
        let released = self.released.fetch_add(1, Ordering::SeqCst) + 1;
        let acquired = self.acquired.load(Ordering::SeqCst);
        if released > acquired {
            return Err(AnalyzerError::ResourceRelease(format!(
                "{:?} released more often than acquired ({} > {})",
                kind, released, acquired
            )));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }
}

/// Scope guard for one transient buffer.
#[must_use]
pub struct Lease {
    kind: BufferKind,
    ledger: Arc<ResourceLedger>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.ledger.release(self.kind) {
            warn!(error = %e, "buffer release");
        }
    }
}
