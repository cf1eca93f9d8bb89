use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use ulid::Ulid;

use super::*;
use crate::auth::{AdminToken, Role};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::{CommitTicket, RecordStore, StoreError, WalStore};

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// 2099-01-05 is a Monday.
fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2099, 1, 5).unwrap()
}

fn sunday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2099, 1, 4).unwrap()
}

fn admin() -> AdminToken {
    Role::Admin.admin_token().unwrap()
}

fn morning(slots_per_hour: u32) -> ShopConfig {
    ShopConfig {
        open_days: OpenDays::all(),
        slots_per_hour,
        working_hours_start: t(9, 0),
        working_hours_end: t(12, 0),
    }
}

fn settings_with(config: ShopConfig) -> ShopSettings {
    ShopSettings {
        name: "Navalha".into(),
        whatsapp: "5511987654321".into(),
        config,
        updated_at: Utc::now(),
    }
}

fn service(price: Cents, active: bool) -> Service {
    let now = Utc::now();
    Service {
        id: Ulid::new(),
        name: "Corte".into(),
        price,
        duration: 30,
        active,
        created_at: now,
        updated_at: now,
    }
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("barberslot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Engine over a fresh WAL store, seeded with a 09:00 to 12:00 shop open every
/// day and one active service.
async fn shop(name: &str, slots_per_hour: u32) -> (SlotEngine, Arc<WalStore>, Service) {
    let store = Arc::new(WalStore::open(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap());
    store
        .save_settings(settings_with(morning(slots_per_hour)))
        .await
        .unwrap();
    let svc = store.insert_service(service(3500, true)).await.unwrap();
    (SlotEngine::new(store.clone()), store, svc)
}

// ── Configurable fake store ──────────────────────────────

#[derive(Default)]
struct FakeStore {
    settings: Option<ShopSettings>,
    service: Option<Service>,
    /// Reads fail as if the backing service were down.
    fail_reads: bool,
    stall_reads: Option<Duration>,
    stall_writes: Option<Duration>,
    /// Writes reach their commit point before stalling.
    claim_writes: bool,
    /// Occupancy reads say free, but the insert loses the race anyway.
    insert_conflicts: bool,
    inserts: AtomicUsize,
}

impl FakeStore {
    fn open_shop() -> Self {
        let svc = service(3500, true);
        FakeStore {
            settings: Some(settings_with(morning(2))),
            service: Some(svc),
            ..Default::default()
        }
    }

    fn service_id(&self) -> Ulid {
        self.service.as_ref().map(|s| s.id).unwrap()
    }

    async fn before_read(&self) -> Result<(), StoreError> {
        if let Some(d) = self.stall_reads {
            tokio::time::sleep(d).await;
        }
        if self.fail_reads {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }

    async fn before_write(&self) {
        if self.claim_writes {
            assert!(CommitTicket::current().claim());
        }
        if let Some(d) = self.stall_writes {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl RecordStore for FakeStore {
    async fn shop_settings(&self) -> Result<Option<ShopSettings>, StoreError> {
        self.before_read().await?;
        Ok(self.settings.clone())
    }

    async fn save_settings(&self, _settings: ShopSettings) -> Result<(), StoreError> {
        self.before_write().await;
        Ok(())
    }

    async fn list_active_services(&self) -> Result<Vec<Service>, StoreError> {
        self.before_read().await?;
        Ok(self.service.iter().filter(|s| s.active).cloned().collect())
    }

    async fn get_service(&self, id: Ulid) -> Result<Option<Service>, StoreError> {
        self.before_read().await?;
        Ok(self.service.clone().filter(|s| s.id == id))
    }

    async fn insert_service(&self, service: Service) -> Result<Service, StoreError> {
        self.before_write().await;
        Ok(service)
    }

    async fn update_service(&self, service: Service) -> Result<Service, StoreError> {
        self.before_write().await;
        Ok(service)
    }

    async fn list_active_appointments(
        &self,
        _date: NaiveDate,
    ) -> Result<Vec<(NaiveTime, Ulid)>, StoreError> {
        self.before_read().await?;
        Ok(Vec::new())
    }

    async fn insert_appointment(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.before_write().await;
        if self.insert_conflicts {
            return Err(StoreError::Conflict {
                date: appointment.date,
                time: appointment.time,
                existing: Ulid::new(),
            });
        }
        Ok(appointment)
    }

    async fn get_appointment(&self, _id: Ulid) -> Result<Option<Appointment>, StoreError> {
        self.before_read().await?;
        Ok(None)
    }

    async fn list_appointments(&self, _date: Option<NaiveDate>) -> Result<Vec<Appointment>, StoreError> {
        self.before_read().await?;
        Ok(Vec::new())
    }

    async fn update_appointment(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        self.before_write().await;
        Err(StoreError::NotFound(appointment.id))
    }

    async fn delete_appointment(&self, id: Ulid) -> Result<Appointment, StoreError> {
        self.before_write().await;
        Err(StoreError::NotFound(id))
    }

    async fn list_expenses(&self) -> Result<Vec<Expense>, StoreError> {
        self.before_read().await?;
        Ok(Vec::new())
    }

    async fn insert_expense(&self, expense: Expense) -> Result<Expense, StoreError> {
        self.before_write().await;
        Ok(expense)
    }

    async fn delete_expense(&self, id: Ulid) -> Result<Expense, StoreError> {
        self.before_write().await;
        Err(StoreError::NotFound(id))
    }
}

// ── Slot grid ────────────────────────────────────────────

#[test]
fn two_slots_per_hour_morning() {
    let times = slot_times(&morning(2)).unwrap();
    assert_eq!(
        times,
        vec![t(9, 0), t(9, 30), t(10, 0), t(10, 30), t(11, 0), t(11, 30)]
    );
}

#[test]
fn three_slots_per_hour_use_twenty_minute_steps() {
    let times = slot_times(&morning(3)).unwrap();
    assert_eq!(times.len(), 9);
    assert_eq!(&times[..3], &[t(9, 0), t(9, 20), t(9, 40)]);
}

#[test]
fn uneven_split_truncates_end_of_hour() {
    // 60 / 7 = 8 minutes; 09:56 to 10:00 is not bookable
    let times = slot_times(&morning(7)).unwrap();
    let nine: Vec<u32> = times
        .iter()
        .filter(|tm| tm.hour() == 9)
        .map(|tm| tm.minute())
        .collect();
    assert_eq!(nine, vec![0, 8, 16, 24, 32, 40, 48]);
}

#[test]
fn slots_strictly_ascending_for_every_granularity() {
    for n in 1..=60 {
        let times = slot_times(&morning(n)).unwrap();
        assert_eq!(times.len(), (3 * n) as usize, "slots_per_hour={n}");
        assert!(times.windows(2).all(|w| w[0] < w[1]), "slots_per_hour={n}");
    }
}

#[test]
fn only_hour_of_working_hours_counts() {
    let cfg = ShopConfig {
        working_hours_start: t(9, 45),
        working_hours_end: t(11, 15),
        ..morning(1)
    };
    assert_eq!(slot_times(&cfg).unwrap(), vec![t(9, 0), t(10, 0)]);
}

#[test]
fn malformed_configs_rejected() {
    for cfg in [
        morning(0),
        morning(61),
        ShopConfig {
            working_hours_start: t(12, 0),
            working_hours_end: t(9, 0),
            ..morning(2)
        },
        ShopConfig {
            working_hours_start: t(9, 0),
            working_hours_end: t(9, 0),
            ..morning(2)
        },
    ] {
        assert!(
            matches!(slot_times(&cfg), Err(EngineError::Configuration(_))),
            "{cfg:?}"
        );
    }
}

// ── Slot queries ─────────────────────────────────────────

#[tokio::test]
async fn booked_slot_shows_unavailable() {
    let (engine, _store, svc) = shop("booked_unavailable.wal", 2).await;
    engine
        .book_slot(BookingRequest::new("Ana", svc.id, monday(), t(10, 0)))
        .await
        .unwrap();

    let slots = engine.generate_slots(monday(), &morning(2)).await.unwrap();
    let taken: Vec<String> = slots.iter().filter(|s| !s.available).map(|s| s.label()).collect();
    assert_eq!(taken, vec!["10:00"]);
    assert_eq!(slots[2].id, "2099-01-05-10:00");
}

#[tokio::test]
async fn generate_slots_is_idempotent() {
    let (engine, _store, svc) = shop("idempotent.wal", 3).await;
    engine
        .book_slot(BookingRequest::new("Ana", svc.id, monday(), t(9, 20)))
        .await
        .unwrap();

    let first = engine.slots_for(monday()).await.unwrap();
    let second = engine.slots_for(monday()).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn closed_day_has_no_slots() {
    let (engine, _store, _svc) = shop("closed_day.wal", 2).await;
    let cfg = ShopConfig {
        open_days: OpenDays::none().with(Weekday::Tue),
        ..morning(2)
    };
    assert!(engine.generate_slots(monday(), &cfg).await.unwrap().is_empty());
}

#[tokio::test]
async fn slots_without_settings_is_configuration_error() {
    let store = Arc::new(FakeStore::default());
    let engine = SlotEngine::new(store);
    assert!(matches!(
        engine.slots_for(monday()).await,
        Err(EngineError::Configuration(_))
    ));
}

#[tokio::test]
async fn occupied_exactly_while_active() {
    let (engine, _store, svc) = shop("occupied_active.wal", 2).await;
    assert!(!engine.is_occupied(monday(), t(9, 30)).await.unwrap());

    let booked = engine
        .book_slot(BookingRequest::new("Ana", svc.id, monday(), t(9, 30)))
        .await
        .unwrap();
    assert!(engine.is_occupied(monday(), t(9, 30)).await.unwrap());
    assert!(!engine.is_occupied(monday(), t(10, 0)).await.unwrap());

    engine.cancel_appointment(&admin(), booked.id).await.unwrap();
    assert!(!engine.is_occupied(monday(), t(9, 30)).await.unwrap());
}

#[tokio::test]
async fn upcoming_days_flags_closed_weekdays() {
    let (engine, store, _svc) = shop("upcoming.wal", 2).await;
    store
        .save_settings(settings_with(ShopConfig::default()))
        .await
        .unwrap();

    let days = engine.upcoming_days(sunday(), 7).await.unwrap();
    assert_eq!(days.len(), 7);
    assert_eq!(days[0], BookableDay { date: sunday(), open: false });
    assert!(days[1..].iter().all(|d| d.open));
    assert_eq!(days[6].date, NaiveDate::from_ymd_opt(2099, 1, 10).unwrap());
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn booking_snapshots_service_price() {
    let (engine, _store, svc) = shop("price_snapshot.wal", 2).await;
    let booked = engine
        .book_slot(BookingRequest::new("  Ana  ", svc.id, monday(), t(11, 0)))
        .await
        .unwrap();
    assert_eq!(booked.customer_name, "Ana");
    assert_eq!(booked.price, 3500);
    assert_eq!(booked.status, AppointmentStatus::Scheduled);

    let patch = ServicePatch {
        price: Some(5000),
        ..Default::default()
    };
    engine.update_service(&admin(), svc.id, patch).await.unwrap();
    let listed = engine.list_appointments(&admin(), Some(monday())).await.unwrap();
    assert_eq!(listed[0].price, 3500);
}

#[tokio::test]
async fn concurrent_double_booking_one_wins() {
    let (engine, _store, svc) = shop("double_booking.wal", 2).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for name in ["Ana", "Beto"] {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .book_slot(BookingRequest::new(name, svc.id, monday(), t(9, 0)))
                .await
        }));
    }

    let mut booked = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => booked += 1,
            Err(EngineError::SlotConflict { date, time }) => {
                assert_eq!((date, time), (monday(), t(9, 0)));
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((booked, conflicts), (1, 1));
}

#[tokio::test]
async fn taken_slot_rejected_by_precheck() {
    let (engine, store, svc) = shop("precheck.wal", 2).await;
    engine
        .book_slot(BookingRequest::new("Ana", svc.id, monday(), t(9, 0)))
        .await
        .unwrap();
    let err = engine
        .book_slot(BookingRequest::new("Beto", svc.id, monday(), t(9, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotConflict { .. }));
    assert_eq!(store.list_appointments(Some(monday())).await.unwrap().len(), 1);
}

#[tokio::test]
async fn store_conflict_after_clean_precheck_is_slot_conflict() {
    let store = Arc::new(FakeStore {
        insert_conflicts: true,
        ..FakeStore::open_shop()
    });
    let engine = SlotEngine::new(store.clone());
    let err = engine
        .book_slot(BookingRequest::new("Ana", store.service_id(), monday(), t(9, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotConflict { .. }));
    // reported, not retried
    assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blank_name_rejected_without_touching_store() {
    let store = Arc::new(FakeStore::open_shop());
    let engine = SlotEngine::new(store.clone());
    for name in ["", "   ", "\t\n"] {
        let err = engine
            .book_slot(BookingRequest::new(name, store.service_id(), monday(), t(9, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{name:?}");
    }
    assert_eq!(store.inserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_fields_rejected() {
    let store = Arc::new(FakeStore::open_shop());
    let engine = SlotEngine::new(store.clone());
    let full = BookingRequest::new("Ana", store.service_id(), monday(), t(9, 0));

    let requests = [
        BookingRequest { service_id: None, ..full.clone() },
        BookingRequest { date: None, ..full.clone() },
        BookingRequest { time: None, ..full.clone() },
        BookingRequest {
            customer_name: "x".repeat(crate::limits::MAX_NAME_LEN + 1),
            ..full.clone()
        },
    ];
    for request in requests {
        assert!(matches!(
            engine.book_slot(request).await,
            Err(EngineError::Validation(_))
        ));
    }
    assert_eq!(store.inserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unavailable_service_rejected() {
    let store = Arc::new(FakeStore {
        service: Some(service(3500, false)),
        ..FakeStore::open_shop()
    });
    let engine = SlotEngine::new(store.clone());

    for service_id in [store.service_id(), Ulid::new()] {
        assert!(matches!(
            engine
                .book_slot(BookingRequest::new("Ana", service_id, monday(), t(9, 0)))
                .await,
            Err(EngineError::Validation(_))
        ));
    }
    assert_eq!(store.inserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn off_grid_closed_and_past_bookings_rejected() {
    let store = Arc::new(FakeStore {
        settings: Some(settings_with(ShopConfig {
            open_days: OpenDays::none().with(Weekday::Mon),
            ..morning(2)
        })),
        ..FakeStore::open_shop()
    });
    let engine = SlotEngine::new(store.clone());
    let sid = store.service_id();
    let yesterday = Utc::now().date_naive().pred_opt().unwrap();

    for request in [
        BookingRequest::new("Ana", sid, monday(), t(9, 15)),
        BookingRequest::new("Ana", sid, monday(), t(12, 0)),
        BookingRequest::new("Ana", sid, monday(), t(8, 30)),
        BookingRequest::new("Ana", sid, NaiveDate::from_ymd_opt(2099, 1, 6).unwrap(), t(9, 0)),
        BookingRequest::new("Ana", sid, yesterday, t(9, 0)),
    ] {
        let result = engine.book_slot(request.clone()).await;
        assert!(matches!(result, Err(EngineError::Validation(_))), "{request:?}");
    }
    assert_eq!(store.inserts.load(Ordering::SeqCst), 0);
}

// ── Store failures ───────────────────────────────────────

#[tokio::test]
async fn lookup_failure_is_never_free_or_booked() {
    let store = Arc::new(FakeStore {
        fail_reads: true,
        ..FakeStore::open_shop()
    });
    let engine = SlotEngine::new(store.clone());

    assert!(matches!(
        engine.is_occupied(monday(), t(9, 0)).await,
        Err(EngineError::Lookup(_))
    ));
    assert!(matches!(
        engine.generate_slots(monday(), &morning(2)).await,
        Err(EngineError::Lookup(_))
    ));
    assert!(matches!(
        engine
            .book_slot(BookingRequest::new("Ana", store.service_id(), monday(), t(9, 0)))
            .await,
        Err(EngineError::Lookup(_))
    ));
    assert_eq!(store.inserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn slow_read_times_out_as_lookup_error() {
    let store = Arc::new(FakeStore {
        stall_reads: Some(Duration::from_secs(5)),
        ..FakeStore::open_shop()
    });
    let engine = SlotEngine::new(store).with_timeout(Duration::from_millis(20));
    assert!(matches!(
        engine.is_occupied(monday(), t(9, 0)).await,
        Err(EngineError::Lookup(_))
    ));
}

#[tokio::test]
async fn slow_write_times_out_as_transport_error() {
    let store = Arc::new(FakeStore {
        stall_writes: Some(Duration::from_secs(5)),
        ..FakeStore::open_shop()
    });
    let engine = SlotEngine::new(store.clone()).with_timeout(Duration::from_millis(20));
    let err = engine
        .book_slot(BookingRequest::new("Ana", store.service_id(), monday(), t(9, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transport(_)), "{err:?}");
}

#[tokio::test]
async fn committed_write_is_awaited_past_the_timeout() {
    let store = Arc::new(FakeStore {
        stall_writes: Some(Duration::from_millis(100)),
        claim_writes: true,
        ..FakeStore::open_shop()
    });
    let engine = SlotEngine::new(store.clone()).with_timeout(Duration::from_millis(20));
    let booked = engine
        .book_slot(BookingRequest::new("Ana", store.service_id(), monday(), t(9, 0)))
        .await
        .unwrap();
    assert_eq!(booked.customer_name, "Ana");
}

// ── Admin ────────────────────────────────────────────────

#[tokio::test]
async fn invalid_settings_rejected_and_not_saved() {
    let (engine, _store, _svc) = shop("bad_settings.wal", 2).await;
    let patch = SettingsPatch {
        slots_per_hour: Some(0),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_settings(&admin(), patch).await,
        Err(EngineError::Configuration(_))
    ));
    assert_eq!(engine.shop_settings().await.unwrap().config.slots_per_hour, 2);
}

#[tokio::test]
async fn settings_update_normalizes_whatsapp() {
    let (engine, _store, _svc) = shop("settings_update.wal", 2).await;
    let patch = SettingsPatch {
        whatsapp: Some("+55 (11) 91234-5678".into()),
        working_hours_end: Some(t(18, 0)),
        ..Default::default()
    };
    let saved = engine.update_settings(&admin(), patch).await.unwrap();
    assert_eq!(saved.whatsapp, "5511912345678");
    assert_eq!(engine.slots_for(monday()).await.unwrap().len(), 18);

    let bad = SettingsPatch {
        whatsapp: Some("call me".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_settings(&admin(), bad).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn deactivated_service_leaves_catalog() {
    let (engine, _store, svc) = shop("deactivate.wal", 2).await;
    let extra = engine
        .create_service(
            &admin(),
            NewService {
                name: "Barba".into(),
                price: 2500,
                duration: 20,
            },
        )
        .await
        .unwrap();
    assert_eq!(engine.list_services().await.unwrap().len(), 2);

    let gone = engine.deactivate_service(&admin(), svc.id).await.unwrap();
    assert!(!gone.active);
    let names: Vec<String> = engine
        .list_services()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec![extra.name]);
    assert!(matches!(
        engine
            .book_slot(BookingRequest::new("Ana", svc.id, monday(), t(9, 0)))
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn service_input_validated() {
    let (engine, _store, _svc) = shop("service_validation.wal", 2).await;
    for new in [
        NewService { name: " ".into(), price: 100, duration: 30 },
        NewService { name: "Corte".into(), price: -1, duration: 30 },
        NewService { name: "Corte".into(), price: 100, duration: 0 },
    ] {
        assert!(matches!(
            engine.create_service(&admin(), new).await,
            Err(EngineError::Validation(_))
        ));
    }
    assert!(matches!(
        engine
            .update_service(&admin(), Ulid::new(), ServicePatch::default())
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn reschedule_onto_taken_slot_conflicts() {
    let (engine, _store, svc) = shop("reschedule.wal", 2).await;
    let ana = engine
        .book_slot(BookingRequest::new("Ana", svc.id, monday(), t(9, 0)))
        .await
        .unwrap();
    engine
        .book_slot(BookingRequest::new("Beto", svc.id, monday(), t(10, 0)))
        .await
        .unwrap();

    let onto_beto = AppointmentPatch {
        time: Some(t(10, 0)),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_appointment(&admin(), ana.id, onto_beto).await,
        Err(EngineError::SlotConflict { .. })
    ));

    let later = AppointmentPatch {
        date: Some(NaiveDate::from_ymd_opt(2099, 1, 6).unwrap()),
        time: Some(t(11, 30)),
        ..Default::default()
    };
    let moved = engine.update_appointment(&admin(), ana.id, later).await.unwrap();
    assert_eq!(moved.time, t(11, 30));
    assert!(!engine.is_occupied(monday(), t(9, 0)).await.unwrap());
}

#[tokio::test]
async fn deleted_appointment_frees_slot() {
    let (engine, _store, svc) = shop("delete_frees.wal", 2).await;
    let booked = engine
        .book_slot(BookingRequest::new("Ana", svc.id, monday(), t(9, 0)))
        .await
        .unwrap();
    engine.delete_appointment(&admin(), booked.id).await.unwrap();
    assert!(!engine.is_occupied(monday(), t(9, 0)).await.unwrap());
    assert!(matches!(
        engine.delete_appointment(&admin(), booked.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn expenses_validated_and_listed() {
    let (engine, _store, _svc) = shop("expenses.wal", 2).await;
    let blank = NewExpense {
        description: "".into(),
        amount: 1000,
        date: monday(),
        category: ExpenseCategory::Energy,
    };
    assert!(matches!(
        engine.record_expense(&admin(), blank).await,
        Err(EngineError::Validation(_))
    ));

    let rent = engine
        .record_expense(
            &admin(),
            NewExpense {
                description: "Aluguel janeiro".into(),
                amount: 120_000,
                date: monday(),
                category: ExpenseCategory::Rent,
            },
        )
        .await
        .unwrap();
    assert_eq!(engine.list_expenses(&admin()).await.unwrap(), vec![rent.clone()]);
    engine.delete_expense(&admin(), rent.id).await.unwrap();
    assert!(engine.list_expenses(&admin()).await.unwrap().is_empty());
}

// ── Dashboard ────────────────────────────────────────────

#[test]
fn dashboard_counts_active_appointments_only() {
    let now = Utc::now();
    let appt = |date: NaiveDate, price: Cents, status: AppointmentStatus| Appointment {
        id: Ulid::new(),
        customer_name: "Ana".into(),
        service_id: Ulid::new(),
        date,
        time: t(9, 0),
        price,
        status,
        created_at: now,
        updated_at: now,
    };
    let expense = |date: NaiveDate, amount: Cents| Expense {
        id: Ulid::new(),
        description: "luz".into(),
        amount,
        date,
        category: ExpenseCategory::Energy,
        created_at: now,
    };
    let other_day = NaiveDate::from_ymd_opt(2099, 1, 20).unwrap();
    let other_month = NaiveDate::from_ymd_opt(2099, 2, 5).unwrap();

    let appointments = vec![
        appt(monday(), 3500, AppointmentStatus::Scheduled),
        appt(monday(), 2000, AppointmentStatus::Completed),
        appt(monday(), 9900, AppointmentStatus::Cancelled),
        appt(other_day, 4000, AppointmentStatus::Scheduled),
        appt(other_month, 7000, AppointmentStatus::Scheduled),
    ];
    let expenses = vec![expense(monday(), 10_000), expense(other_month, 500)];

    let dash = Dashboard::compute(monday(), &appointments, &expenses);
    assert_eq!(dash.today_appointments, 2);
    assert_eq!(dash.today_revenue, 5500);
    assert_eq!(dash.month_appointments, 3);
    assert_eq!(dash.month_revenue, 9500);
    assert_eq!(dash.month_expenses, 10_000);
    assert_eq!(dash.month_profit, -500);
}

#[tokio::test]
async fn dashboard_reads_through_store() {
    let (engine, _store, svc) = shop("dashboard.wal", 2).await;
    engine
        .book_slot(BookingRequest::new("Ana", svc.id, monday(), t(9, 0)))
        .await
        .unwrap();
    let dash = engine.dashboard(&admin(), monday()).await.unwrap();
    assert_eq!((dash.today_appointments, dash.today_revenue), (1, 3500));
}

// ── Handoff ──────────────────────────────────────────────

#[tokio::test]
async fn handoff_builds_encoded_whatsapp_link() {
    let (engine, _store, svc) = shop("handoff.wal", 2).await;
    let booked = engine
        .book_slot(BookingRequest::new("Ana Luz", svc.id, monday(), t(9, 30)))
        .await
        .unwrap();

    let handoff = engine.handoff(booked.id).await.unwrap();
    assert!(handoff.message.contains("Ana Luz"));
    assert!(handoff.message.contains("05/01/2099"));
    assert!(handoff.message.contains("09:30"));
    assert!(handoff.message.contains("R$ 35.00"));
    assert!(handoff.url.starts_with("https://wa.me/5511987654321?text="));
    assert!(!handoff.url.contains(' '));
    assert!(!handoff.url.contains('\n'));
    assert!(handoff.url.contains("Ana%20Luz"));
}

#[tokio::test]
async fn handoff_needs_number_and_known_appointment() {
    let (engine, store, svc) = shop("handoff_errors.wal", 2).await;
    assert!(matches!(
        engine.handoff(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));

    let booked = engine
        .book_slot(BookingRequest::new("Ana", svc.id, monday(), t(9, 0)))
        .await
        .unwrap();
    let mut settings = store.shop_settings().await.unwrap().unwrap();
    settings.whatsapp.clear();
    store.save_settings(settings).await.unwrap();
    assert!(matches!(
        engine.handoff(booked.id).await,
        Err(EngineError::Configuration(_))
    ));
}
