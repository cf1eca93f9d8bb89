use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, time_label};

const CHANNEL_CAPACITY: usize = 256;

/// LISTEN channel carrying slot changes for one date: `slots_2099_01_05`.
pub fn channel_name(date: NaiveDate) -> String {
    format!("slots_{}", date.format("%Y_%m_%d"))
}

pub fn parse_channel(channel: &str) -> Option<NaiveDate> {
    let rest = channel.trim().strip_prefix("slots_")?;
    NaiveDate::parse_from_str(rest, "%Y_%m_%d").ok()
}

/// JSON payload sent to LISTENers. Customer data stays out of it.
pub fn notice_payload(event: &Event) -> String {
    let notice = match event {
        Event::AppointmentBooked { appointment } => serde_json::json!({
            "event": "booked",
            "appointment_id": appointment.id.to_string(),
            "date": appointment.date.to_string(),
            "time": time_label(appointment.time),
        }),
        Event::AppointmentUpdated { previous_date, appointment } => serde_json::json!({
            "event": "updated",
            "appointment_id": appointment.id.to_string(),
            "previous_date": previous_date.to_string(),
            "date": appointment.date.to_string(),
            "time": time_label(appointment.time),
            "status": appointment.status.as_str(),
        }),
        Event::AppointmentDeleted { id, date } => serde_json::json!({
            "event": "deleted",
            "appointment_id": id.to_string(),
            "date": date.to_string(),
        }),
        _ => serde_json::json!({ "event": "changed" }),
    };
    notice.to_string()
}

/// Broadcast hub: one channel per calendar date with live subscribers.
pub struct NotifyHub {
    channels: DashMap<NaiveDate, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, date: NaiveDate) -> broadcast::Receiver<Event> {
        self.channels
            .entry(date)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fan an event out to every date it touches. No-op without subscribers.
    pub fn publish(&self, event: &Event) {
        for date in event.affected_dates() {
            let orphaned = match self.channels.get(&date) {
                Some(sender) => sender.send(event.clone()).is_err(),
                None => false,
            };
            if orphaned {
                self.channels
                    .remove_if(&date, |_, sender| sender.receiver_count() == 0);
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
