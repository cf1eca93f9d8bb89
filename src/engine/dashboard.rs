use chrono::{Datelike, NaiveDate};

use crate::auth::AdminToken;
use crate::model::*;

use super::{EngineError, SlotEngine};

/// Headline numbers for the admin dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dashboard {
    pub date: NaiveDate,
    pub today_appointments: u64,
    pub today_revenue: Cents,
    pub month_appointments: u64,
    pub month_revenue: Cents,
    pub month_expenses: Cents,
    pub month_profit: Cents,
}

fn same_month(a: NaiveDate, b: NaiveDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

impl Dashboard {
    /// Revenue counts active appointments only; cancelled ones earned nothing.
    pub fn compute(today: NaiveDate, appointments: &[Appointment], expenses: &[Expense]) -> Self {
        let mut dash = Dashboard {
            date: today,
            ..Default::default()
        };
        for a in appointments.iter().filter(|a| a.is_active()) {
            if a.date == today {
                dash.today_appointments += 1;
                dash.today_revenue += a.price;
            }
            if same_month(a.date, today) {
                dash.month_appointments += 1;
                dash.month_revenue += a.price;
            }
        }
        dash.month_expenses = expenses
            .iter()
            .filter(|e| same_month(e.date, today))
            .map(|e| e.amount)
            .sum();
        dash.month_profit = dash.month_revenue - dash.month_expenses;
        dash
    }
}

impl SlotEngine {
    pub async fn dashboard(
        &self,
        _admin: &AdminToken,
        today: NaiveDate,
    ) -> Result<Dashboard, EngineError> {
        let appointments = self
            .read("list appointments", self.store.list_appointments(None))
            .await?;
        let expenses = self.read("list expenses", self.store.list_expenses()).await?;
        Ok(Dashboard::compute(today, &appointments, &expenses))
    }
}
