use chrono::{NaiveDate, NaiveTime, Utc};
use ulid::Ulid;

use crate::auth::AdminToken;
use crate::limits::*;
use crate::model::*;

use super::slots::validate_config;
use super::{EngineError, SlotEngine};

/// Partial update of the shop settings; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub name: Option<String>,
    pub whatsapp: Option<String>,
    pub open_days: Option<OpenDays>,
    pub slots_per_hour: Option<u32>,
    pub working_hours_start: Option<NaiveTime>,
    pub working_hours_end: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewService {
    pub name: String,
    pub price: Cents,
    pub duration: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePatch {
    pub name: Option<String>,
    pub price: Option<Cents>,
    pub duration: Option<u32>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub customer_name: Option<String>,
    pub status: Option<AppointmentStatus>,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub price: Option<Cents>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExpense {
    pub description: String,
    pub amount: Cents,
    pub date: NaiveDate,
    pub category: ExpenseCategory,
}

fn checked_name(raw: &str, what: &str) -> Result<String, EngineError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(EngineError::validation(format!("{what} is required")));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::validation(format!(
            "{what} longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

fn checked_amount(amount: Cents, what: &str) -> Result<Cents, EngineError> {
    if !(0..=MAX_AMOUNT_CENTS).contains(&amount) {
        return Err(EngineError::validation(format!(
            "{what} must be between 0.00 and {}",
            format_cents(MAX_AMOUNT_CENTS)
        )));
    }
    Ok(amount)
}

fn checked_duration(minutes: u32) -> Result<u32, EngineError> {
    if minutes == 0 || minutes > MAX_SERVICE_DURATION_MIN {
        return Err(EngineError::validation(format!(
            "duration must be between 1 and {MAX_SERVICE_DURATION_MIN} minutes"
        )));
    }
    Ok(minutes)
}

/// Keep the digits of a phone number; `+55 (11) 98765-4321` → `5511987654321`.
fn checked_whatsapp(raw: &str) -> Result<String, EngineError> {
    if let Some(bad) = raw
        .chars()
        .find(|c| !c.is_ascii_digit() && !matches!(c, ' ' | '+' | '-' | '(' | ')'))
    {
        return Err(EngineError::validation(format!(
            "unexpected character {bad:?} in WhatsApp number"
        )));
    }
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() > MAX_WHATSAPP_LEN {
        return Err(EngineError::validation(format!(
            "WhatsApp number longer than {MAX_WHATSAPP_LEN} digits"
        )));
    }
    Ok(digits)
}

impl SlotEngine {
    // ── Settings ─────────────────────────────────────────────

    pub async fn shop_settings(&self) -> Result<ShopSettings, EngineError> {
        self.read("load shop settings", self.store.shop_settings())
            .await?
            .ok_or_else(|| EngineError::Configuration("shop settings not found".into()))
    }

    pub async fn update_settings(
        &self,
        _admin: &AdminToken,
        patch: SettingsPatch,
    ) -> Result<ShopSettings, EngineError> {
        let now = Utc::now();
        let mut settings = self
            .read("load shop settings", self.store.shop_settings())
            .await?
            .unwrap_or_else(|| ShopSettings::seed(now));

        if let Some(name) = patch.name {
            settings.name = checked_name(&name, "shop name")?;
        }
        if let Some(whatsapp) = patch.whatsapp {
            settings.whatsapp = checked_whatsapp(&whatsapp)?;
        }
        let config = &mut settings.config;
        if let Some(days) = patch.open_days {
            config.open_days = days;
        }
        if let Some(n) = patch.slots_per_hour {
            config.slots_per_hour = n;
        }
        if let Some(start) = patch.working_hours_start {
            config.working_hours_start = start;
        }
        if let Some(end) = patch.working_hours_end {
            config.working_hours_end = end;
        }
        validate_config(config)?;
        settings.updated_at = now;

        self.write("save shop settings", self.store.save_settings(settings.clone()))
            .await?;
        tracing::info!(
            open_days = %settings.config.open_days,
            slots_per_hour = settings.config.slots_per_hour,
            "shop settings updated"
        );
        Ok(settings)
    }

    // ── Services ─────────────────────────────────────────────

    /// Active services, ordered by name.
    pub async fn list_services(&self) -> Result<Vec<Service>, EngineError> {
        self.read("list services", self.store.list_active_services())
            .await
    }

    pub async fn create_service(
        &self,
        _admin: &AdminToken,
        new: NewService,
    ) -> Result<Service, EngineError> {
        let now = Utc::now();
        let service = Service {
            id: Ulid::new(),
            name: checked_name(&new.name, "service name")?,
            price: checked_amount(new.price, "price")?,
            duration: checked_duration(new.duration)?,
            active: true,
            created_at: now,
            updated_at: now,
        };
        self.write("insert service", self.store.insert_service(service))
            .await
    }

    pub async fn update_service(
        &self,
        _admin: &AdminToken,
        id: Ulid,
        patch: ServicePatch,
    ) -> Result<Service, EngineError> {
        let mut service = self
            .read("load service", self.store.get_service(id))
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if let Some(name) = patch.name {
            service.name = checked_name(&name, "service name")?;
        }
        if let Some(price) = patch.price {
            service.price = checked_amount(price, "price")?;
        }
        if let Some(duration) = patch.duration {
            service.duration = checked_duration(duration)?;
        }
        if let Some(active) = patch.active {
            service.active = active;
        }
        service.updated_at = Utc::now();
        self.write("update service", self.store.update_service(service))
            .await
    }

    /// Soft delete: the service leaves the catalog but past appointments keep
    /// pointing at it.
    pub async fn deactivate_service(
        &self,
        admin: &AdminToken,
        id: Ulid,
    ) -> Result<Service, EngineError> {
        let patch = ServicePatch {
            active: Some(false),
            ..Default::default()
        };
        self.update_service(admin, id, patch).await
    }

    // ── Appointments ─────────────────────────────────────────

    pub async fn list_appointments(
        &self,
        _admin: &AdminToken,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Appointment>, EngineError> {
        self.read("list appointments", self.store.list_appointments(date))
            .await
    }

    /// Edit an appointment. Rescheduling or reactivating is conflict-checked
    /// by the store exactly like a new booking.
    pub async fn update_appointment(
        &self,
        _admin: &AdminToken,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        let mut appointment = self
            .read("load appointment", self.store.get_appointment(id))
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if let Some(name) = patch.customer_name {
            appointment.customer_name = checked_name(&name, "customer name")?;
        }
        if let Some(status) = patch.status {
            appointment.status = status;
        }
        if let Some(date) = patch.date {
            appointment.date = date;
        }
        if let Some(time) = patch.time {
            appointment.time = time;
        }
        if let Some(price) = patch.price {
            appointment.price = checked_amount(price, "price")?;
        }
        appointment.updated_at = Utc::now();

        let updated = self
            .write("update appointment", self.store.update_appointment(appointment))
            .await?;
        tracing::info!(
            appointment_id = %updated.id,
            date = %updated.date,
            time = %time_label(updated.time),
            status = updated.status.as_str(),
            "appointment updated"
        );
        Ok(updated)
    }

    /// Cancelling frees the slot but keeps the record.
    pub async fn cancel_appointment(
        &self,
        admin: &AdminToken,
        id: Ulid,
    ) -> Result<Appointment, EngineError> {
        let patch = AppointmentPatch {
            status: Some(AppointmentStatus::Cancelled),
            ..Default::default()
        };
        self.update_appointment(admin, id, patch).await
    }

    pub async fn delete_appointment(
        &self,
        _admin: &AdminToken,
        id: Ulid,
    ) -> Result<Appointment, EngineError> {
        let removed = self
            .write("delete appointment", self.store.delete_appointment(id))
            .await?;
        tracing::info!(appointment_id = %id, date = %removed.date, "appointment deleted");
        Ok(removed)
    }

    // ── Expenses ─────────────────────────────────────────────

    /// Newest first.
    pub async fn list_expenses(&self, _admin: &AdminToken) -> Result<Vec<Expense>, EngineError> {
        self.read("list expenses", self.store.list_expenses()).await
    }

    pub async fn record_expense(
        &self,
        _admin: &AdminToken,
        new: NewExpense,
    ) -> Result<Expense, EngineError> {
        let description = new.description.trim();
        if description.is_empty() {
            return Err(EngineError::validation("expense description is required"));
        }
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::validation(format!(
                "expense description longer than {MAX_DESCRIPTION_LEN} characters"
            )));
        }
        let expense = Expense {
            id: Ulid::new(),
            description: description.to_string(),
            amount: checked_amount(new.amount, "amount")?,
            date: new.date,
            category: new.category,
            created_at: Utc::now(),
        };
        self.write("insert expense", self.store.insert_expense(expense))
            .await
    }

    pub async fn delete_expense(
        &self,
        _admin: &AdminToken,
        id: Ulid,
    ) -> Result<Expense, EngineError> {
        self.write("delete expense", self.store.delete_expense(id))
            .await
    }
}
