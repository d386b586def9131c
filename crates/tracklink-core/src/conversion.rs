//! Conversion ingestion: webhook payload, validation and the processing
//! pipeline (duplicate finder → merger → session linker).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attribution::ConversionKind;
use crate::contact::{Contact, ContactCandidate, ContactStatus, MergeReport};
use crate::engine::EngineBackend;
use crate::error::EngineError;
use crate::session::SessionLinkOutcome;

/// Custom attribution fields a CRM forwards with the contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributionFields {
    pub ad_id: Option<String>,
    pub source: Option<String>,
    pub visitor_id: Option<String>,
}

/// The payload a CRM webhook posts for a lead, appointment or sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversionInput {
    pub kind: ConversionKind,
    pub ext_crm_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    /// When the conversion happened. Defaults to receipt time.
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attribution: AttributionFields,
    /// Natural key of the appointment (required for appointments).
    pub appointment_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Natural key of the payment (required for sales).
    pub payment_id: Option<String>,
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRecord {
    pub appointment_id: String,
    pub contact_id: String,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Only `completed` payments count as sales.
pub const PAYMENT_COMPLETED: &str = "completed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub contact_id: String,
    pub amount: f64,
    pub status: String,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionOutcome {
    pub contact: Contact,
    pub merge: MergeReport,
    /// `None` when no visitor is known or linking failed (failures are
    /// logged, never returned).
    pub session_link: Option<SessionLinkOutcome>,
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

impl ConversionInput {
    pub fn validate(&self) -> Result<(), EngineError> {
        if blank(&self.ext_crm_id) {
            return Err(EngineError::validation("ext_crm_id", "is required"));
        }
        match self.kind {
            ConversionKind::Lead => {}
            ConversionKind::Appointment => {
                if blank(&self.appointment_id) {
                    return Err(EngineError::validation(
                        "appointment_id",
                        "is required for appointments",
                    ));
                }
            }
            ConversionKind::Sale => {
                if blank(&self.payment_id) {
                    return Err(EngineError::validation("payment_id", "is required for sales"));
                }
                match self.amount {
                    Some(amount) if amount.is_finite() && amount >= 0.0 => {}
                    _ => {
                        return Err(EngineError::validation(
                            "amount",
                            "must be a non-negative number for sales",
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    pub fn status(&self) -> ContactStatus {
        match self.kind {
            ConversionKind::Lead => ContactStatus::Lead,
            ConversionKind::Appointment => ContactStatus::Appointment,
            ConversionKind::Sale => ContactStatus::Client,
        }
    }

    pub fn to_candidate(&self, now: DateTime<Utc>) -> ContactCandidate {
        ContactCandidate {
            ext_crm_id: self.ext_crm_id.as_ref().map(|v| v.trim().to_string()),
            contact_id: None,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            company: self.company.clone(),
            visitor_id: self.attribution.visitor_id.clone(),
            rstk_adid: self.attribution.ad_id.clone(),
            rstk_source: self.attribution.source.clone(),
            status: self.status(),
            created_at: Some(self.occurred_at.unwrap_or(now)),
        }
    }
}

/// Run one conversion through the engine.
///
/// Validation and merge failures are returned; session linking is a
/// best-effort side effect whose errors are only logged.
pub async fn process_conversion(
    backend: &dyn EngineBackend,
    input: &ConversionInput,
    now: DateTime<Utc>,
) -> Result<ConversionOutcome, EngineError> {
    input.validate()?;
    let candidate = input.to_candidate(now);
    let occurred_at = input.occurred_at.unwrap_or(now);

    let duplicates = backend.find_duplicates(&candidate).await?;
    let (contact, merge) = backend.unify_contacts(&duplicates, &candidate).await?;

    match input.kind {
        ConversionKind::Lead => {}
        ConversionKind::Appointment => {
            let appointment = AppointmentRecord {
                appointment_id: input.appointment_id.clone().unwrap_or_default(),
                contact_id: contact.contact_id.clone(),
                status: "booked".to_string(),
                scheduled_at: input.scheduled_at,
                created_at: occurred_at,
            };
            backend.record_appointment(&appointment).await?;
        }
        ConversionKind::Sale => {
            let payment = PaymentRecord {
                payment_id: input.payment_id.clone().unwrap_or_default(),
                contact_id: contact.contact_id.clone(),
                amount: input.amount.unwrap_or_default(),
                status: PAYMENT_COMPLETED.to_string(),
                paid_at: occurred_at,
            };
            backend.record_payment(&payment).await?;
        }
    }

    let visitor_id = input
        .attribution
        .visitor_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or(contact.visitor_id.as_deref());

    let session_link = match visitor_id {
        Some(visitor_id) => link_sessions(backend, &contact.contact_id, visitor_id).await,
        None => None,
    };

    info!(
        contact_id = %contact.contact_id,
        kind = input.kind.as_str(),
        merged = merge.merged_contact_ids.len(),
        created = merge.created,
        "Conversion processed"
    );

    Ok(ConversionOutcome {
        contact,
        merge,
        session_link,
    })
}

async fn link_sessions(
    backend: &dyn EngineBackend,
    contact_id: &str,
    visitor_id: &str,
) -> Option<SessionLinkOutcome> {
    let session = match backend.latest_session_for_visitor(visitor_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            debug!(visitor_id, "No sessions for visitor; skipping session linking");
            return None;
        }
        Err(e) => {
            warn!(visitor_id, error = %e, "Session lookup failed; skipping session linking");
            return None;
        }
    };

    match backend.unify_sessions_on_conversion(contact_id, &session).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(contact_id, visitor_id, error = %e, "Session linking failed");
            None
        }
    }
}
