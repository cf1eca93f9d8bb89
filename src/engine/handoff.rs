use ulid::Ulid;

use crate::model::*;

use super::{EngineError, SlotEngine};

/// Pre-filled WhatsApp chat announcing a booking to the shop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub appointment_id: Ulid,
    pub message: String,
    pub url: String,
}

pub fn handoff_message(appointment: &Appointment, service_name: &str) -> String {
    format!(
        "🔥 *NOVO AGENDAMENTO* 🔥\n\n\
         👤 *Cliente:* {}\n\
         ✂️ *Serviço:* {}\n\
         📅 *Data:* {}\n\
         ⏰ *Horário:* {}\n\
         💰 *Valor:* R$ {}\n\n\
         📱 Agendamento realizado pelo sistema online!\n\
         ✅ Confirme sua presença por favor.",
        appointment.customer_name,
        service_name,
        appointment.date.format("%d/%m/%Y"),
        time_label(appointment.time),
        format_cents(appointment.price),
    )
}

pub fn whatsapp_url(number: &str, message: &str) -> String {
    format!("https://wa.me/{number}?text={}", urlencoding::encode(message))
}

impl SlotEngine {
    pub async fn handoff(&self, appointment_id: Ulid) -> Result<Handoff, EngineError> {
        let appointment = self
            .read("load appointment", self.store.get_appointment(appointment_id))
            .await?
            .ok_or(EngineError::NotFound(appointment_id))?;
        let service = self
            .read("load service", self.store.get_service(appointment.service_id))
            .await?
            .ok_or(EngineError::NotFound(appointment.service_id))?;
        let settings = self.shop_settings().await?;
        if settings.whatsapp.is_empty() {
            return Err(EngineError::Configuration(
                "shop has no WhatsApp number".into(),
            ));
        }

        let message = handoff_message(&appointment, &service.name);
        Ok(Handoff {
            appointment_id,
            url: whatsapp_url(&settings.whatsapp, &message),
            message,
        })
    }
}
