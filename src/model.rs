use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Money in integer cents.
pub type Cents = i64;

/// Render cents as a plain two-decimal amount (`3550` → `35.50`).
pub fn format_cents(amount: Cents) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Zero-padded `HH:MM` label used for slots and appointment times.
pub fn time_label(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

// ── Shop configuration ───────────────────────────────────────────

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

fn weekday_tag(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Set of weekdays the shop takes bookings on, one bit per day (Monday = bit 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenDays(u8);

impl OpenDays {
    pub fn none() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self(0b0111_1111)
    }

    pub fn with(mut self, day: Weekday) -> Self {
        self.insert(day);
        self
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        WEEKDAYS.into_iter().filter(|d| self.contains(*d))
    }
}

/// Comma-separated weekday tags, e.g. `monday,tuesday,saturday`.
impl fmt::Display for OpenDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.iter().map(weekday_tag).collect();
        write!(f, "{}", tags.join(","))
    }
}

impl FromStr for OpenDays {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut days = OpenDays::none();
        for raw in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let tag = raw.to_lowercase();
            let day = WEEKDAYS
                .into_iter()
                .find(|d| weekday_tag(*d) == tag || d.to_string().to_lowercase() == tag)
                .ok_or_else(|| format!("unknown weekday: {raw}"))?;
            days.insert(day);
        }
        Ok(days)
    }
}

/// Operating hours and slot granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopConfig {
    pub open_days: OpenDays,
    pub slots_per_hour: u32,
    pub working_hours_start: NaiveTime,
    pub working_hours_end: NaiveTime,
}

impl ShopConfig {
    pub fn is_open(&self, date: NaiveDate) -> bool {
        self.open_days.contains(date.weekday())
    }
}

impl Default for ShopConfig {
    /// Monday to Saturday, 09:00 to 18:00, half-hour slots.
    fn default() -> Self {
        let open_days = WEEKDAYS[..6]
            .iter()
            .fold(OpenDays::none(), |days, d| days.with(*d));
        Self {
            open_days,
            slots_per_hour: 2,
            working_hours_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            working_hours_end: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopSettings {
    pub name: String,
    /// Digits only, country code first (what `wa.me` expects).
    pub whatsapp: String,
    pub config: ShopConfig,
    pub updated_at: DateTime<Utc>,
}

impl ShopSettings {
    pub fn seed(now: DateTime<Utc>) -> Self {
        Self {
            name: "Barbershop".into(),
            whatsapp: String::new(),
            config: ShopConfig::default(),
            updated_at: now,
        }
    }
}

// ── Catalog, bookings, expenses ──────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub price: Cents,
    /// Minutes.
    pub duration: u32,
    /// `false` once removed from the catalog; never hard-deleted.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    /// Active appointments claim their slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" | "confirmed" => Ok(AppointmentStatus::Scheduled),
            "completed" | "done" => Ok(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub customer_name: String,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub time: NaiveTime,
    /// Service price at booking time.
    pub price: Cents,
    pub status: AppointmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpenseCategory {
    Energy,
    Water,
    Rent,
    Products,
    Equipment,
    Marketing,
    Other,
}

impl ExpenseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpenseCategory::Energy => "energy",
            ExpenseCategory::Water => "water",
            ExpenseCategory::Rent => "rent",
            ExpenseCategory::Products => "products",
            ExpenseCategory::Equipment => "equipment",
            ExpenseCategory::Marketing => "marketing",
            ExpenseCategory::Other => "other",
        }
    }
}

impl FromStr for ExpenseCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "energy" | "energia" => Ok(ExpenseCategory::Energy),
            "water" | "agua" => Ok(ExpenseCategory::Water),
            "rent" | "aluguel" => Ok(ExpenseCategory::Rent),
            "products" | "produtos" => Ok(ExpenseCategory::Products),
            "equipment" | "equipamentos" => Ok(ExpenseCategory::Equipment),
            "marketing" => Ok(ExpenseCategory::Marketing),
            "other" | "outros" => Ok(ExpenseCategory::Other),
            other => Err(format!("unknown expense category: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub id: Ulid,
    pub description: String,
    pub amount: Cents,
    pub date: NaiveDate,
    pub category: ExpenseCategory,
    pub created_at: DateTime<Utc>,
}

// ── Derived, never persisted ─────────────────────────────────────

/// One bookable interval of a working day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeSlot {
    /// `YYYY-MM-DD-HH:MM`
    pub id: String,
    pub time: NaiveTime,
    pub available: bool,
}

impl TimeSlot {
    pub fn new(date: NaiveDate, time: NaiveTime, available: bool) -> Self {
        Self {
            id: format!("{date}-{}", time_label(time)),
            time,
            available,
        }
    }

    pub fn label(&self) -> String {
        time_label(self.time)
    }
}

/// A date offered by the booking wizard's date picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookableDay {
    pub date: NaiveDate,
    pub open: bool,
}

// ── Per-day appointment ledger ───────────────────────────────────

/// All appointments of one calendar date, sorted by time.
/// Cancelled appointments stay in the ledger; only active ones claim a slot.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub date: NaiveDate,
    pub appointments: Vec<Appointment>,
}

impl DayLedger {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by time (stable for equal times).
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.time <= appointment.time);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    /// The active appointment claiming `time`, if any.
    pub fn active_at(&self, time: NaiveTime) -> Option<&Appointment> {
        let start = self.appointments.partition_point(|a| a.time < time);
        self.appointments[start..]
            .iter()
            .take_while(|a| a.time == time)
            .find(|a| a.is_active())
    }

    pub fn active(&self) -> impl Iterator<Item = &Appointment> {
        self.appointments.iter().filter(|a| a.is_active())
    }
}

/// WAL record format. Every store mutation is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SettingsSaved {
        settings: ShopSettings,
    },
    /// Create or replace, including deactivation.
    ServiceSaved {
        service: Service,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    /// `previous_date` locates the ledger the appointment is moving out of.
    AppointmentUpdated {
        previous_date: NaiveDate,
        appointment: Appointment,
    },
    AppointmentDeleted {
        id: Ulid,
        date: NaiveDate,
    },
    ExpenseRecorded {
        expense: Expense,
    },
    ExpenseDeleted {
        id: Ulid,
    },
}

impl Event {
    /// Dates whose slot availability this event can change.
    pub fn affected_dates(&self) -> Vec<NaiveDate> {
        match self {
            Event::AppointmentBooked { appointment } => vec![appointment.date],
            Event::AppointmentUpdated {
                previous_date,
                appointment,
            } if *previous_date != appointment.date => vec![*previous_date, appointment.date],
            Event::AppointmentUpdated { appointment, .. } => vec![appointment.date],
            Event::AppointmentDeleted { date, .. } => vec![*date],
            _ => Vec::new(),
        }
    }
}
