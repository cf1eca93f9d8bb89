use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_SERVICES_PER_SHOP;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::{CommitTicket, RecordStore, StoreError};

pub type SharedDayLedger = Arc<RwLock<DayLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        ticket: CommitTicket,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, CommitTicket, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append {
            event,
            ticket,
            response,
        } = cmd
        else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, ticket, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append {
                    event,
                    ticket,
                    response,
                }) => batch.push((event, ticket, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// Write every still-wanted append and fsync once. The batch lands whole or
/// not at all; abandoned appends are answered without touching the log.
fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    let mut written = Vec::with_capacity(batch.len());
    for (event, ticket, tx) in batch {
        if !ticket.claim() {
            let _ = tx.send(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "write abandoned before commit",
            )));
            continue;
        }
        match wal.append_buffered(&event) {
            Ok(()) => written.push(tx),
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    }
    if written.is_empty() {
        return;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(written.len() as f64);
    let started = std::time::Instant::now();
    let result = wal.flush_sync();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for tx in written {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append {
            event,
            ticket,
            response,
        } => commit_batch(wal, vec![(event, ticket, response)]),
    }
}

// ── Replay ───────────────────────────────────────────────

/// Plain state rebuilt from the WAL before the store goes live.
#[derive(Default)]
struct Replayed {
    settings: Option<ShopSettings>,
    services: HashMap<Ulid, Service>,
    days: HashMap<NaiveDate, DayLedger>,
    appointment_dates: HashMap<Ulid, NaiveDate>,
    expenses: HashMap<Ulid, Expense>,
    skipped: usize,
}

impl Replayed {
    fn apply(&mut self, event: Event) {
        match event {
            Event::SettingsSaved { settings } => self.settings = Some(settings),
            Event::ServiceSaved { service } => {
                self.services.insert(service.id, service);
            }
            Event::AppointmentBooked { appointment } => {
                if self.slot_taken(&appointment) {
                    self.skip(&appointment);
                    return;
                }
                self.place(appointment);
            }
            Event::AppointmentUpdated {
                previous_date,
                appointment,
            } => {
                if self.slot_taken(&appointment) {
                    self.skip(&appointment);
                    return;
                }
                if let Some(ledger) = self.days.get_mut(&previous_date) {
                    ledger.remove(appointment.id);
                }
                self.place(appointment);
            }
            Event::AppointmentDeleted { id, date } => {
                if let Some(ledger) = self.days.get_mut(&date) {
                    ledger.remove(id);
                }
                self.appointment_dates.remove(&id);
            }
            Event::ExpenseRecorded { expense } => {
                self.expenses.insert(expense.id, expense);
            }
            Event::ExpenseDeleted { id } => {
                self.expenses.remove(&id);
            }
        }
    }

    /// Another appointment already holds the slot `appointment` wants.
    fn slot_taken(&self, appointment: &Appointment) -> bool {
        appointment.is_active()
            && self.days.get(&appointment.date).is_some_and(|ledger| {
                ledger
                    .active_at(appointment.time)
                    .is_some_and(|held| held.id != appointment.id)
            })
    }

    fn skip(&mut self, appointment: &Appointment) {
        self.skipped += 1;
        tracing::warn!(
            appointment = %appointment.id,
            date = %appointment.date,
            time = %time_label(appointment.time),
            "WAL record would double-book a slot; skipped"
        );
    }

    fn place(&mut self, appointment: Appointment) {
        let date = appointment.date;
        self.appointment_dates.insert(appointment.id, date);
        self.days
            .entry(date)
            .or_insert_with(|| DayLedger::new(date))
            .insert(appointment);
    }
}

/// Another active appointment at `time`, ignoring `except`.
fn check_slot_free(
    ledger: &DayLedger,
    time: NaiveTime,
    except: Option<Ulid>,
) -> Result<(), StoreError> {
    let taken = ledger
        .appointments
        .iter()
        .find(|a| a.time == time && a.is_active() && Some(a.id) != except);
    match taken {
        Some(existing) => Err(StoreError::Conflict {
            date: ledger.date,
            time,
            existing: existing.id,
        }),
        None => Ok(()),
    }
}

/// Write-lock two ledgers in date order so concurrent moves can't deadlock.
async fn write_both(
    from: SharedDayLedger,
    to: SharedDayLedger,
    from_first: bool,
) -> (OwnedRwLockWriteGuard<DayLedger>, OwnedRwLockWriteGuard<DayLedger>) {
    if from_first {
        let f = from.write_owned().await;
        let t = to.write_owned().await;
        (f, t)
    } else {
        let t = to.write_owned().await;
        let f = from.write_owned().await;
        (f, t)
    }
}

/// Abandons the ticket if the caller stops waiting before the write settles.
struct AbandonOnDrop(Option<CommitTicket>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if let Some(ticket) = self.0.take() {
            ticket.abandon();
        }
    }
}

// ── Store ────────────────────────────────────────────────

/// In-memory record store made durable by a write-ahead log.
///
/// Appointments live in per-date ledgers behind their own lock. Booking takes
/// the date's write lock across conflict check, WAL append and apply, which is
/// what makes `(date, time)` uniqueness atomic.
///
/// Every mutation runs on its own task, so a caller that stops waiting can't
/// leave a record in the WAL that memory never saw.
pub struct WalStore {
    state: Arc<StoreState>,
}

struct StoreState {
    days: DashMap<NaiveDate, SharedDayLedger>,
    /// Reverse lookup: appointment id → ledger date.
    appointment_dates: DashMap<Ulid, NaiveDate>,
    services: DashMap<Ulid, Service>,
    expenses: DashMap<Ulid, Expense>,
    settings: RwLock<Option<ShopSettings>>,
    /// Serializes catalog writes (services, expenses) so WAL order matches memory.
    catalog: Mutex<()>,
    /// Mutations hold it shared; compaction holds it exclusively so its
    /// snapshot can't miss a write that is already in the WAL.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
}

impl WalStore {
    /// Replay `wal_path`, cut off any torn tail, and start the WAL writer.
    /// Must run inside a tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, replay) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut state = Replayed::default();
        let replayed = replay.events.len();
        for event in replay.events {
            state.apply(event);
        }
        tracing::debug!(
            path = %wal_path.display(),
            replayed,
            skipped = state.skipped,
            "store opened"
        );

        Ok(Self {
            state: Arc::new(StoreState {
                days: state
                    .days
                    .into_iter()
                    .map(|(date, ledger)| (date, Arc::new(RwLock::new(ledger))))
                    .collect(),
                appointment_dates: state.appointment_dates.into_iter().collect(),
                services: state.services.into_iter().collect(),
                expenses: state.expenses.into_iter().collect(),
                settings: RwLock::new(state.settings),
                catalog: Mutex::new(()),
                commit_gate: RwLock::new(()),
                wal_tx,
                notify,
            }),
        })
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.state.notify
    }

    /// Run a mutation to completion on its own task under the caller's
    /// [`CommitTicket`].
    async fn mutate<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<StoreState>, CommitTicket) -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let ticket = CommitTicket::current();
        let mut guard = AbandonOnDrop(Some(ticket.clone()));
        let result = tokio::spawn(op(self.state.clone(), ticket))
            .await
            .map_err(|e| StoreError::Wal(format!("store task failed: {e}")));
        guard.0 = None;
        result?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .state
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as the minimal event list that recreates current state.
    /// Returns the number of events written.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let state = &self.state;
        let _exclusive = state.commit_gate.write().await;

        let mut events = Vec::new();
        if let Some(settings) = state.settings.read().await.as_ref() {
            events.push(Event::SettingsSaved {
                settings: settings.clone(),
            });
        }

        let mut services: Vec<Service> = state.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(|service| Event::ServiceSaved { service }));

        let mut dates: Vec<NaiveDate> = state.days.iter().map(|e| *e.key()).collect();
        dates.sort();
        for date in dates {
            let Some(ledger) = state.ledger(date) else { continue };
            let guard = ledger.read().await;
            events.extend(guard.appointments.iter().map(|a| Event::AppointmentBooked {
                appointment: a.clone(),
            }));
        }

        let mut expenses: Vec<Expense> = state.expenses.iter().map(|e| e.value().clone()).collect();
        expenses.sort_by_key(|e| e.id);
        events.extend(expenses.into_iter().map(|expense| Event::ExpenseRecorded { expense }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        state
            .wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        Ok(count)
    }
}

impl StoreState {
    async fn wal_append(&self, event: &Event, ticket: CommitTicket) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                ticket,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    fn ledger(&self, date: NaiveDate) -> Option<SharedDayLedger> {
        self.days.get(&date).map(|e| e.value().clone())
    }

    fn ledger_for_write(&self, date: NaiveDate) -> SharedDayLedger {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(date))))
            .value()
            .clone()
    }

    fn date_of(&self, id: Ulid) -> Result<NaiveDate, StoreError> {
        self.appointment_dates
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))
    }

    async fn save_settings(&self, settings: ShopSettings, ticket: CommitTicket) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.settings.write().await;
        let event = Event::SettingsSaved {
            settings: settings.clone(),
        };
        self.wal_append(&event, ticket).await?;
        *guard = Some(settings);
        Ok(())
    }

    async fn save_service(
        &self,
        service: Service,
        is_new: bool,
        ticket: CommitTicket,
    ) -> Result<Service, StoreError> {
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog.lock().await;
        let exists = self.services.contains_key(&service.id);
        if is_new && exists {
            return Err(StoreError::AlreadyExists(service.id));
        }
        if !is_new && !exists {
            return Err(StoreError::NotFound(service.id));
        }
        if is_new && self.services.len() >= MAX_SERVICES_PER_SHOP {
            return Err(StoreError::LimitExceeded("too many services"));
        }
        let event = Event::ServiceSaved {
            service: service.clone(),
        };
        self.wal_append(&event, ticket).await?;
        self.services.insert(service.id, service.clone());
        Ok(service)
    }

    async fn insert_appointment(
        &self,
        appointment: Appointment,
        ticket: CommitTicket,
    ) -> Result<Appointment, StoreError> {
        let _gate = self.commit_gate.read().await;
        if self.appointment_dates.contains_key(&appointment.id) {
            return Err(StoreError::AlreadyExists(appointment.id));
        }
        let ledger = self.ledger_for_write(appointment.date);
        let mut guard = ledger.write().await;
        if appointment.is_active() {
            check_slot_free(&guard, appointment.time, None)?;
        }

        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.wal_append(&event, ticket).await?;
        self.appointment_dates.insert(appointment.id, appointment.date);
        guard.insert(appointment.clone());
        drop(guard);

        self.notify.publish(&event);
        Ok(appointment)
    }

    async fn update_appointment(
        &self,
        appointment: Appointment,
        ticket: CommitTicket,
    ) -> Result<Appointment, StoreError> {
        let _gate = self.commit_gate.read().await;
        let id = appointment.id;
        let previous_date = self.date_of(id)?;
        let from = self.ledger(previous_date).ok_or(StoreError::NotFound(id))?;
        let event = Event::AppointmentUpdated {
            previous_date,
            appointment: appointment.clone(),
        };

        if previous_date == appointment.date {
            let mut guard = from.write().await;
            if guard.get(id).is_none() {
                return Err(StoreError::NotFound(id));
            }
            if appointment.is_active() {
                check_slot_free(&guard, appointment.time, Some(id))?;
            }
            self.wal_append(&event, ticket).await?;
            guard.remove(id);
            guard.insert(appointment.clone());
        } else {
            let to = self.ledger_for_write(appointment.date);
            let (mut from_guard, mut to_guard) =
                write_both(from, to, previous_date < appointment.date).await;
            if from_guard.get(id).is_none() {
                return Err(StoreError::NotFound(id));
            }
            if appointment.is_active() {
                check_slot_free(&to_guard, appointment.time, Some(id))?;
            }
            self.wal_append(&event, ticket).await?;
            from_guard.remove(id);
            to_guard.insert(appointment.clone());
            self.appointment_dates.insert(id, appointment.date);
        }

        self.notify.publish(&event);
        Ok(appointment)
    }

    async fn delete_appointment(&self, id: Ulid, ticket: CommitTicket) -> Result<Appointment, StoreError> {
        let _gate = self.commit_gate.read().await;
        let date = self.date_of(id)?;
        let ledger = self.ledger(date).ok_or(StoreError::NotFound(id))?;
        let mut guard = ledger.write().await;
        if guard.get(id).is_none() {
            return Err(StoreError::NotFound(id));
        }

        let event = Event::AppointmentDeleted { id, date };
        self.wal_append(&event, ticket).await?;
        let removed = guard.remove(id).ok_or(StoreError::NotFound(id))?;
        self.appointment_dates.remove(&id);
        drop(guard);

        self.notify.publish(&event);
        Ok(removed)
    }

    async fn insert_expense(&self, expense: Expense, ticket: CommitTicket) -> Result<Expense, StoreError> {
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog.lock().await;
        if self.expenses.contains_key(&expense.id) {
            return Err(StoreError::AlreadyExists(expense.id));
        }
        let event = Event::ExpenseRecorded {
            expense: expense.clone(),
        };
        self.wal_append(&event, ticket).await?;
        self.expenses.insert(expense.id, expense.clone());
        Ok(expense)
    }

    async fn delete_expense(&self, id: Ulid, ticket: CommitTicket) -> Result<Expense, StoreError> {
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog.lock().await;
        if !self.expenses.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.wal_append(&Event::ExpenseDeleted { id }, ticket).await?;
        self.expenses
            .remove(&id)
            .map(|(_, expense)| expense)
            .ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl RecordStore for WalStore {
    async fn shop_settings(&self) -> Result<Option<ShopSettings>, StoreError> {
        Ok(self.state.settings.read().await.clone())
    }

    async fn save_settings(&self, settings: ShopSettings) -> Result<(), StoreError> {
        self.mutate(|s, t| async move { s.save_settings(settings, t).await })
            .await
    }

    async fn list_active_services(&self) -> Result<Vec<Service>, StoreError> {
        let mut services: Vec<Service> = self
            .state
            .services
            .iter()
            .filter(|e| e.value().active)
            .map(|e| e.value().clone())
            .collect();
        services.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(services)
    }

    async fn get_service(&self, id: Ulid) -> Result<Option<Service>, StoreError> {
        Ok(self.state.services.get(&id).map(|e| e.value().clone()))
    }

    async fn insert_service(&self, service: Service) -> Result<Service, StoreError> {
        self.mutate(|s, t| async move { s.save_service(service, true, t).await })
            .await
    }

    async fn update_service(&self, service: Service) -> Result<Service, StoreError> {
        self.mutate(|s, t| async move { s.save_service(service, false, t).await })
            .await
    }

    async fn list_active_appointments(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<(NaiveTime, Ulid)>, StoreError> {
        let Some(ledger) = self.state.ledger(date) else {
            return Ok(Vec::new());
        };
        let guard = ledger.read().await;
        Ok(guard.active().map(|a| (a.time, a.id)).collect())
    }

    async fn exists_appointment(&self, date: NaiveDate, time: NaiveTime) -> Result<bool, StoreError> {
        let Some(ledger) = self.state.ledger(date) else {
            return Ok(false);
        };
        let guard = ledger.read().await;
        Ok(guard.active_at(time).is_some())
    }

    async fn insert_appointment(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        self.mutate(|s, t| async move { s.insert_appointment(appointment, t).await })
            .await
    }

    async fn get_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        let Ok(date) = self.state.date_of(id) else {
            return Ok(None);
        };
        let Some(ledger) = self.state.ledger(date) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn list_appointments(&self, date: Option<NaiveDate>) -> Result<Vec<Appointment>, StoreError> {
        let mut dates: Vec<NaiveDate> = match date {
            Some(d) => vec![d],
            None => self.state.days.iter().map(|e| *e.key()).collect(),
        };
        dates.sort();

        let mut out = Vec::new();
        for d in dates {
            if let Some(ledger) = self.state.ledger(d) {
                out.extend(ledger.read().await.appointments.iter().cloned());
            }
        }
        Ok(out)
    }

    async fn update_appointment(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        self.mutate(|s, t| async move { s.update_appointment(appointment, t).await })
            .await
    }

    async fn delete_appointment(&self, id: Ulid) -> Result<Appointment, StoreError> {
        self.mutate(|s, t| async move { s.delete_appointment(id, t).await })
            .await
    }

    async fn list_expenses(&self) -> Result<Vec<Expense>, StoreError> {
        let mut expenses: Vec<Expense> = self
            .state
            .expenses
            .iter()
            .map(|e| e.value().clone())
            .collect();
        expenses.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(expenses)
    }

    async fn insert_expense(&self, expense: Expense) -> Result<Expense, StoreError> {
        self.mutate(|s, t| async move { s.insert_expense(expense, t).await })
            .await
    }

    async fn delete_expense(&self, id: Ulid) -> Result<Expense, StoreError> {
        self.mutate(|s, t| async move { s.delete_expense(id, t).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BookingRequest, EngineError, SlotEngine};
    use chrono::Utc;
    use std::io::Write;
    use std::time::Duration;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("barberslot_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open(path: &PathBuf) -> WalStore {
        WalStore::open(path.clone(), Arc::new(NotifyHub::new())).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2099, 1, day).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn appointment(date: NaiveDate, time: NaiveTime, name: &str) -> Appointment {
        let now = Utc::now();
        Appointment {
            id: Ulid::new(),
            customer_name: name.into(),
            service_id: Ulid::new(),
            date,
            time,
            price: 3500,
            status: AppointmentStatus::Scheduled,
            created_at: now,
            updated_at: now,
        }
    }

    fn service(name: &str, active: bool) -> Service {
        let now = Utc::now();
        Service {
            id: Ulid::new(),
            name: name.into(),
            price: 4000,
            duration: 30,
            active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_rejects_taken_slot() {
        let store = open(&test_wal_path("taken_slot.wal"));
        let first = appointment(d(5), t(9, 0), "Ana");
        store.insert_appointment(first.clone()).await.unwrap();

        let err = store
            .insert_appointment(appointment(d(5), t(9, 0), "Beto"))
            .await
            .unwrap_err();
        match err {
            StoreError::Conflict { existing, time, .. } => {
                assert_eq!(existing, first.id);
                assert_eq!(time, t(9, 0));
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
        assert_eq!(store.list_appointments(Some(d(5))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_appointment_frees_slot() {
        let store = open(&test_wal_path("cancel_frees.wal"));
        let mut a = appointment(d(5), t(9, 0), "Ana");
        store.insert_appointment(a.clone()).await.unwrap();
        assert!(store.exists_appointment(d(5), t(9, 0)).await.unwrap());

        a.status = AppointmentStatus::Cancelled;
        store.update_appointment(a).await.unwrap();
        assert!(!store.exists_appointment(d(5), t(9, 0)).await.unwrap());

        store
            .insert_appointment(appointment(d(5), t(9, 0), "Beto"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reactivating_into_taken_slot_conflicts() {
        let store = open(&test_wal_path("reactivate.wal"));
        let mut a = appointment(d(5), t(9, 0), "Ana");
        a.status = AppointmentStatus::Cancelled;
        store.insert_appointment(a.clone()).await.unwrap();
        store
            .insert_appointment(appointment(d(5), t(9, 0), "Beto"))
            .await
            .unwrap();

        a.status = AppointmentStatus::Scheduled;
        assert!(matches!(
            store.update_appointment(a).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn moving_between_dates_updates_both_ledgers() {
        let store = open(&test_wal_path("move_dates.wal"));
        let mut a = appointment(d(5), t(9, 0), "Ana");
        store.insert_appointment(a.clone()).await.unwrap();

        a.date = d(6);
        a.time = t(10, 30);
        store.update_appointment(a.clone()).await.unwrap();

        assert!(store.list_active_appointments(d(5)).await.unwrap().is_empty());
        assert_eq!(
            store.list_active_appointments(d(6)).await.unwrap(),
            vec![(t(10, 30), a.id)]
        );
        assert_eq!(store.get_appointment(a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn moving_onto_taken_slot_conflicts_and_keeps_old_slot() {
        let store = open(&test_wal_path("move_conflict.wal"));
        let mut a = appointment(d(5), t(9, 0), "Ana");
        store.insert_appointment(a.clone()).await.unwrap();
        store
            .insert_appointment(appointment(d(6), t(11, 0), "Beto"))
            .await
            .unwrap();

        a.date = d(6);
        a.time = t(11, 0);
        assert!(matches!(
            store.update_appointment(a.clone()).await,
            Err(StoreError::Conflict { .. })
        ));
        assert!(store.exists_appointment(d(5), t(9, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_and_unknown_is_not_found() {
        let store = open(&test_wal_path("delete.wal"));
        let a = appointment(d(5), t(9, 0), "Ana");
        store.insert_appointment(a.clone()).await.unwrap();

        let removed = store.delete_appointment(a.id).await.unwrap();
        assert_eq!(removed.id, a.id);
        assert!(store.get_appointment(a.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_appointment(a.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_inserts_for_one_slot_admit_exactly_one() {
        let store = Arc::new(open(&test_wal_path("concurrent_inserts.wal")));
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_appointment(appointment(d(5), t(15, 0), &format!("c{i}")))
                    .await
            }));
        }
        let mut ok = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::Conflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((ok, conflicts), (1, 7));
    }

    #[tokio::test]
    async fn services_list_active_sorted_by_name() {
        let store = open(&test_wal_path("services_sorted.wal"));
        store.insert_service(service("corte", true)).await.unwrap();
        store.insert_service(service("Barba", true)).await.unwrap();
        store.insert_service(service("Antigo", false)).await.unwrap();

        let names: Vec<String> = store
            .list_active_services()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Barba", "corte"]);
    }

    #[tokio::test]
    async fn update_unknown_service_is_not_found() {
        let store = open(&test_wal_path("service_unknown.wal"));
        assert!(matches!(
            store.update_service(service("Corte", true)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn expenses_newest_first() {
        let store = open(&test_wal_path("expenses_order.wal"));
        for day in [3, 9, 1] {
            store
                .insert_expense(Expense {
                    id: Ulid::new(),
                    description: format!("day {day}"),
                    amount: 1000,
                    date: d(day),
                    category: ExpenseCategory::Products,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let dates: Vec<NaiveDate> = store
            .list_expenses()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.date)
            .collect();
        assert_eq!(dates, vec![d(9), d(3), d(1)]);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = test_wal_path("reopen.wal");
        let booked = appointment(d(5), t(9, 30), "Ana");
        let moved = {
            let mut a = appointment(d(5), t(10, 0), "Beto");
            let store = open(&path);
            store.save_settings(ShopSettings::seed(Utc::now())).await.unwrap();
            store.insert_service(service("Corte", true)).await.unwrap();
            store.insert_appointment(booked.clone()).await.unwrap();
            store.insert_appointment(a.clone()).await.unwrap();
            a.date = d(7);
            store.update_appointment(a.clone()).await.unwrap();
            a
        };

        let store = open(&path);
        assert!(store.shop_settings().await.unwrap().is_some());
        assert_eq!(store.list_active_services().await.unwrap().len(), 1);
        assert_eq!(store.get_appointment(booked.id).await.unwrap(), Some(booked));
        assert_eq!(store.get_appointment(moved.id).await.unwrap(), Some(moved));
        assert_eq!(store.list_appointments(Some(d(5))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compaction.wal");
        let keep = appointment(d(5), t(9, 0), "Ana");
        {
            let store = open(&path);
            store.save_settings(ShopSettings::seed(Utc::now())).await.unwrap();
            for i in 0..10 {
                let a = appointment(d(5), t(12, i), "churn");
                store.insert_appointment(a.clone()).await.unwrap();
                store.delete_appointment(a.id).await.unwrap();
            }
            store.insert_appointment(keep.clone()).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 22);

            let written = store.compact().await.unwrap();
            assert_eq!(written, 2);
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let store = open(&path);
        assert_eq!(store.list_appointments(None).await.unwrap(), vec![keep]);
    }

    #[tokio::test]
    async fn booking_publishes_to_date_subscribers() {
        let store = open(&test_wal_path("publish.wal"));
        let mut rx = store.notify().subscribe(d(5));
        let a = appointment(d(5), t(9, 0), "Ana");
        store.insert_appointment(a.clone()).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::AppointmentBooked { appointment } => assert_eq!(appointment.id, a.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_insert_commits_nothing() {
        let path = test_wal_path("dropped_insert.wal");
        let store = open(&path);
        let ana = appointment(d(5), t(9, 0), "Ana");

        let mut pending = store.insert_appointment(ana.clone());
        assert!(futures::poll!(pending.as_mut()).is_pending());
        drop(pending);

        let beto = appointment(d(5), t(9, 0), "Beto");
        store.insert_appointment(beto.clone()).await.unwrap();
        assert!(store.get_appointment(ana.id).await.unwrap().is_none());
        drop(store);

        let reopened = open(&path);
        assert_eq!(
            reopened.list_active_appointments(d(5)).await.unwrap(),
            vec![(t(9, 0), beto.id)]
        );
    }

    #[tokio::test]
    async fn engine_write_timeout_leaves_nothing_committed() {
        let path = test_wal_path("engine_timeout.wal");
        let store = Arc::new(open(&path));
        store.save_settings(ShopSettings::seed(Utc::now())).await.unwrap();
        let corte = store.insert_service(service("Corte", true)).await.unwrap();
        let engine = SlotEngine::new(store.clone()).with_timeout(Duration::from_millis(50));

        let stalled = store.state.commit_gate.write().await;
        let err = engine
            .book_slot(BookingRequest::new("Ana", corte.id, d(5), t(9, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)), "got {err:?}");
        drop(stalled);

        // Queued behind the abandoned write on the same ledger.
        let beto = appointment(d(5), t(9, 0), "Beto");
        store.insert_appointment(beto.clone()).await.unwrap();
        assert_eq!(store.list_appointments(Some(d(5))).await.unwrap(), vec![beto.clone()]);
        drop(engine);
        drop(store);

        let reopened = open(&path);
        assert_eq!(reopened.list_appointments(Some(d(5))).await.unwrap(), vec![beto]);
    }

    #[tokio::test]
    async fn bookings_after_a_torn_tail_survive_the_next_restart() {
        let path = test_wal_path("torn_then_book.wal");
        let ana = appointment(d(5), t(9, 0), "Ana");
        {
            let store = open(&path);
            store.insert_appointment(ana.clone()).await.unwrap();
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[7, 0, 0, 0, 1, 2])
            .unwrap();

        let beto = appointment(d(5), t(10, 0), "Beto");
        {
            let store = open(&path);
            store.insert_appointment(beto.clone()).await.unwrap();
        }

        let store = open(&path);
        assert_eq!(store.list_appointments(Some(d(5))).await.unwrap(), vec![ana, beto]);
    }

    #[tokio::test]
    async fn replay_keeps_the_first_booking_of_a_slot() {
        let path = test_wal_path("replay_double_book.wal");
        let first = appointment(d(5), t(9, 0), "Ana");
        let second = appointment(d(5), t(9, 0), "Beto");
        {
            let mut wal = Wal::open(&path).unwrap();
            for a in [&first, &second] {
                wal.append(&Event::AppointmentBooked {
                    appointment: a.clone(),
                })
                .unwrap();
            }
        }

        let store = open(&path);
        assert_eq!(
            store.list_active_appointments(d(5)).await.unwrap(),
            vec![(t(9, 0), first.id)]
        );
        assert!(store.get_appointment(second.id).await.unwrap().is_none());
    }
}
