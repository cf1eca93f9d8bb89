mod admin;
mod booking;
mod dashboard;
mod error;
mod handoff;
mod slots;
#[cfg(test)]
mod tests;

pub use admin::{AppointmentPatch, NewExpense, NewService, ServicePatch, SettingsPatch};
pub use booking::BookingRequest;
pub use dashboard::Dashboard;
pub use error::EngineError;
pub use handoff::{handoff_message, whatsapp_url, Handoff};
pub use slots::{slot_times, validate_config};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use error::Access;

use crate::store::{CommitTicket, RecordStore, StoreError};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Slot generation and availability-checked booking over a [`RecordStore`].
///
/// Holds no occupancy state of its own: every answer comes from a fresh store
/// round trip, and every round trip is bounded by `store_timeout`.
pub struct SlotEngine {
    store: Arc<dyn RecordStore>,
    store_timeout: Duration,
}

impl SlotEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    fn timed_out(&self, access: Access, what: &'static str) -> EngineError {
        metrics::counter!(crate::observability::STORE_TIMEOUTS_TOTAL, "op" => what).increment(1);
        tracing::warn!(op = what, timeout_ms = self.store_timeout.as_millis() as u64, "store call timed out");
        let msg = format!("{what} timed out after {}ms", self.store_timeout.as_millis());
        match access {
            Access::Read => EngineError::Lookup(msg),
            Access::Write => EngineError::Transport(msg),
        }
    }

    pub(super) async fn read<T>(
        &self,
        what: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result.map_err(|e| EngineError::from_store(e, Access::Read)),
            Err(_) => Err(self.timed_out(Access::Read, what)),
        }
    }

    /// Like `read`, except a write the WAL writer has already claimed is not
    /// cut off: it is committed, so the caller waits for the real outcome.
    pub(super) async fn write<T>(
        &self,
        what: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, EngineError> {
        let ticket = CommitTicket::new();
        let call = ticket.scope(call);
        tokio::pin!(call);
        let result = match tokio::time::timeout(self.store_timeout, &mut call).await {
            Ok(result) => result,
            Err(_) if ticket.abandon() => return Err(self.timed_out(Access::Write, what)),
            Err(_) => {
                tracing::warn!(op = what, "store write outlived its timeout after commit began");
                call.await
            }
        };
        result.map_err(|e| EngineError::from_store(e, Access::Write))
    }
}
