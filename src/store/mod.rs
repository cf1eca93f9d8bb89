//! Record storage for shop settings, services, appointments and expenses.
//!
//! [`RecordStore`] is the seam between the slot engine and persistence. The
//! store, not the engine, owns the one-active-appointment-per-(date, time)
//! guarantee: `insert_appointment` and `update_appointment` must check and
//! write atomically.

mod wal_store;

pub use wal_store::WalStore;

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// An active appointment already holds the slot.
    #[error("slot {date} {} already taken by appointment {existing}", slot_label(.time))]
    Conflict {
        date: NaiveDate,
        time: NaiveTime,
        existing: Ulid,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
    /// The backing service could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

fn slot_label(time: &NaiveTime) -> String {
    time_label(*time)
}

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const ABANDONED: u8 = 2;

tokio::task_local! {
    static COMMIT_TICKET: CommitTicket;
}

/// Race between a queued write and the caller waiting on it.
///
/// The WAL writer claims the ticket right before the record is written; a
/// caller that gives up first abandons it and the record is never written.
/// Exactly one side wins, so a write either commits (and is applied) or leaves
/// nothing behind.
#[derive(Debug, Clone, Default)]
pub struct CommitTicket(Arc<AtomicU8>);

impl CommitTicket {
    pub fn new() -> Self {
        Self::default()
    }

    /// The ticket of the enclosing [`CommitTicket::scope`], or a fresh one.
    pub fn current() -> Self {
        COMMIT_TICKET.try_with(CommitTicket::clone).unwrap_or_default()
    }

    /// Run `fut` with this ticket visible to [`CommitTicket::current`].
    pub fn scope<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        COMMIT_TICKET.scope(self.clone(), fut)
    }

    /// `true` if the write may go ahead.
    pub fn claim(&self) -> bool {
        self.settle(CLAIMED)
    }

    /// `true` if the write will never be committed.
    pub fn abandon(&self) -> bool {
        self.settle(ABANDONED)
    }

    fn settle(&self, to: u8) -> bool {
        match self
            .0
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == to,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Settings ─────────────────────────────────────────────

    /// `None` until the shop has been seeded.
    async fn shop_settings(&self) -> Result<Option<ShopSettings>, StoreError>;

    async fn save_settings(&self, settings: ShopSettings) -> Result<(), StoreError>;

    // ── Services ─────────────────────────────────────────────

    /// Active services ordered by name.
    async fn list_active_services(&self) -> Result<Vec<Service>, StoreError>;

    /// Any service, active or not.
    async fn get_service(&self, id: Ulid) -> Result<Option<Service>, StoreError>;

    async fn insert_service(&self, service: Service) -> Result<Service, StoreError>;

    async fn update_service(&self, service: Service) -> Result<Service, StoreError>;

    // ── Appointments ─────────────────────────────────────────

    /// `(time, id)` of every active appointment on `date`, ascending by time.
    async fn list_active_appointments(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<(NaiveTime, Ulid)>, StoreError>;

    async fn exists_appointment(&self, date: NaiveDate, time: NaiveTime) -> Result<bool, StoreError> {
        Ok(self
            .list_active_appointments(date)
            .await?
            .iter()
            .any(|(t, _)| *t == time))
    }

    /// Fails with [`StoreError::Conflict`] if an active appointment holds the slot.
    async fn insert_appointment(&self, appointment: Appointment) -> Result<Appointment, StoreError>;

    async fn get_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError>;

    /// Ordered by (date, time). `None` lists every date.
    async fn list_appointments(&self, date: Option<NaiveDate>) -> Result<Vec<Appointment>, StoreError>;

    /// Replace an appointment. Moving it, or making it active again, is
    /// conflict-checked like an insert.
    async fn update_appointment(&self, appointment: Appointment) -> Result<Appointment, StoreError>;

    async fn delete_appointment(&self, id: Ulid) -> Result<Appointment, StoreError>;

    // ── Expenses ─────────────────────────────────────────────

    /// Newest first.
    async fn list_expenses(&self) -> Result<Vec<Expense>, StoreError>;

    async fn insert_expense(&self, expense: Expense) -> Result<Expense, StoreError>;

    async fn delete_expense(&self, id: Ulid) -> Result<Expense, StoreError>;
}
