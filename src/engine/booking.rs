use chrono::{NaiveDate, NaiveTime, Utc};
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::*;

use super::slots::slot_times;
use super::{EngineError, SlotEngine};

/// A public booking submission. Every field is required; `None` or a blank
/// name is rejected before the store is touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingRequest {
    pub customer_name: String,
    pub service_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
}

impl BookingRequest {
    pub fn new(customer_name: impl Into<String>, service_id: Ulid, date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            customer_name: customer_name.into(),
            service_id: Some(service_id),
            date: Some(date),
            time: Some(time),
        }
    }
}

struct CheckedRequest {
    customer_name: String,
    service_id: Ulid,
    date: NaiveDate,
    time: NaiveTime,
}

fn check_fields(request: BookingRequest) -> Result<CheckedRequest, EngineError> {
    let customer_name = request.customer_name.trim().to_string();
    if customer_name.is_empty() {
        return Err(EngineError::validation("customer name is required"));
    }
    if customer_name.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::validation(format!(
            "customer name longer than {MAX_NAME_LEN} characters"
        )));
    }
    let service_id = request
        .service_id
        .ok_or_else(|| EngineError::validation("service is required"))?;
    let date = request
        .date
        .ok_or_else(|| EngineError::validation("date is required"))?;
    let time = request
        .time
        .ok_or_else(|| EngineError::validation("time is required"))?;
    Ok(CheckedRequest {
        customer_name,
        service_id,
        date,
        time,
    })
}

impl SlotEngine {
    /// Book a slot for a customer.
    ///
    /// The occupancy pre-check only saves a doomed insert; the store's
    /// uniqueness check is what actually decides a race. Conflicts are
    /// reported, never retried.
    pub async fn book_slot(&self, request: BookingRequest) -> Result<Appointment, EngineError> {
        let request = match check_fields(request) {
            Ok(r) => r,
            Err(e) => {
                metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "invalid")
                    .increment(1);
                return Err(e);
            }
        };

        let result = self.book_checked(request).await;
        let outcome = match &result {
            Ok(_) => "booked",
            Err(EngineError::SlotConflict { .. }) => "conflict",
            Err(EngineError::Validation(_)) => "invalid",
            Err(_) => "error",
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn book_checked(&self, request: CheckedRequest) -> Result<Appointment, EngineError> {
        let CheckedRequest {
            customer_name,
            service_id,
            date,
            time,
        } = request;

        let now = Utc::now();
        if date < now.date_naive() {
            return Err(EngineError::validation(format!("{date} is in the past")));
        }

        let config = self.shop_config().await?;
        if !config.is_open(date) {
            return Err(EngineError::validation(format!(
                "the shop is closed on {}",
                date.format("%A")
            )));
        }
        if !slot_times(&config)?.contains(&time) {
            return Err(EngineError::validation(format!(
                "{} is not a bookable time",
                time_label(time)
            )));
        }

        let service = self
            .read("load service", self.store.get_service(service_id))
            .await?
            .filter(|s| s.active)
            .ok_or_else(|| EngineError::validation(format!("service {service_id} is not available")))?;

        if self.is_occupied(date, time).await? {
            tracing::debug!(%date, time = %time_label(time), "slot taken before insert");
            return Err(EngineError::SlotConflict { date, time });
        }

        let appointment = Appointment {
            id: Ulid::new(),
            customer_name,
            service_id: service.id,
            date,
            time,
            price: service.price,
            status: AppointmentStatus::Scheduled,
            created_at: now,
            updated_at: now,
        };

        match self
            .write("insert appointment", self.store.insert_appointment(appointment))
            .await
        {
            Ok(booked) => {
                tracing::info!(
                    appointment_id = %booked.id,
                    %date,
                    time = %time_label(time),
                    service = %service.name,
                    "slot booked"
                );
                Ok(booked)
            }
            Err(e @ EngineError::SlotConflict { .. }) => {
                tracing::info!(%date, time = %time_label(time), "slot lost to a concurrent booking");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
