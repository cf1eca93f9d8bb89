use std::collections::HashSet;

use chrono::{Days, NaiveDate, NaiveTime, Timelike};

use crate::limits::MAX_SLOTS_PER_HOUR;
use crate::model::*;

use super::{EngineError, SlotEngine};

pub fn validate_config(config: &ShopConfig) -> Result<(), EngineError> {
    if config.slots_per_hour == 0 || config.slots_per_hour > MAX_SLOTS_PER_HOUR {
        return Err(EngineError::Configuration(format!(
            "slots_per_hour must be between 1 and {MAX_SLOTS_PER_HOUR}, got {}",
            config.slots_per_hour
        )));
    }
    if config.working_hours_start >= config.working_hours_end {
        return Err(EngineError::Configuration(format!(
            "working hours start {} is not before end {}",
            time_label(config.working_hours_start),
            time_label(config.working_hours_end)
        )));
    }
    Ok(())
}

/// Start times of a working day, ascending.
///
/// Hours run over `[start.hour, end.hour)`. Each hour splits into
/// `slots_per_hour` slots of `60 / slots_per_hour` whole minutes; leftover
/// minutes at the end of an hour are not bookable.
pub fn slot_times(config: &ShopConfig) -> Result<Vec<NaiveTime>, EngineError> {
    validate_config(config)?;
    let step = 60 / config.slots_per_hour;
    let first = config.working_hours_start.hour();
    let last = config.working_hours_end.hour();

    let mut times = Vec::with_capacity(((last - first) * config.slots_per_hour) as usize);
    for hour in first..last {
        for i in 0..config.slots_per_hour {
            let time = NaiveTime::from_hms_opt(hour, i * step, 0).ok_or_else(|| {
                EngineError::Configuration(format!("slot {hour}:{} out of range", i * step))
            })?;
            times.push(time);
        }
    }
    Ok(times)
}

impl SlotEngine {
    /// Slots for `date` under `config`, each marked available unless an active
    /// appointment holds it. Closed weekdays have no slots.
    pub async fn generate_slots(
        &self,
        date: NaiveDate,
        config: &ShopConfig,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let times = slot_times(config)?;
        metrics::counter!(crate::observability::SLOT_QUERIES_TOTAL).increment(1);
        if !config.is_open(date) {
            return Ok(Vec::new());
        }

        let taken: HashSet<NaiveTime> = self
            .read("list active appointments", self.store.list_active_appointments(date))
            .await?
            .into_iter()
            .map(|(time, _)| time)
            .collect();

        Ok(times
            .into_iter()
            .map(|time| TimeSlot::new(date, time, !taken.contains(&time)))
            .collect())
    }

    /// [`generate_slots`](Self::generate_slots) with the shop's stored configuration.
    pub async fn slots_for(&self, date: NaiveDate) -> Result<Vec<TimeSlot>, EngineError> {
        let config = self.shop_config().await?;
        self.generate_slots(date, &config).await
    }

    pub async fn is_occupied(&self, date: NaiveDate, time: NaiveTime) -> Result<bool, EngineError> {
        self.read("check appointment", self.store.exists_appointment(date, time))
            .await
    }

    /// `count` consecutive dates from `from`, flagged open or closed.
    pub async fn upcoming_days(
        &self,
        from: NaiveDate,
        count: u32,
    ) -> Result<Vec<BookableDay>, EngineError> {
        let config = self.shop_config().await?;
        Ok((0..count)
            .filter_map(|offset| from.checked_add_days(Days::new(offset.into())))
            .map(|date| BookableDay {
                date,
                open: config.is_open(date),
            })
            .collect())
    }

    pub(super) async fn shop_config(&self) -> Result<ShopConfig, EngineError> {
        let settings = self
            .read("load shop settings", self.store.shop_settings())
            .await?
            .ok_or_else(|| EngineError::Configuration("shop settings not found".into()))?;
        Ok(settings.config)
    }
}
