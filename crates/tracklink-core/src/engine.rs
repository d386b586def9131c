//! Storage-facing seams of the engine.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::attribution::{AdTouchpoint, Attribution, AttributionReport, AttributionWindow, ConversionEvent};
use crate::config::EngineSettings;
use crate::contact::{CleanupReport, Contact, ContactCandidate, MergeReport};
use crate::conversion::{AppointmentRecord, PaymentRecord};
use crate::error::EngineError;
use crate::identity::{IdentifierType, IdentityLink, IdentityState, LinkOutcome, NewIdentityLink};
use crate::session::{Session, SessionLinkOutcome, SimilarSession};

/// A held named lock. Pass it back to [`NamedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    /// Random token identifying this acquisition.
    pub holder: String,
}

/// Cross-process mutual exclusion keyed by name.
///
/// `try_acquire` never blocks: `Ok(None)` means someone else holds the key.
#[async_trait]
pub trait NamedLock: Send + Sync + 'static {
    async fn try_acquire(&self, key: &str) -> anyhow::Result<Option<LockHandle>>;
    async fn release(&self, handle: LockHandle) -> anyhow::Result<()>;
}

#[async_trait]
pub trait EngineBackend: Send + Sync + 'static {
    fn settings(&self) -> &EngineSettings;

    // Session telemetry
    async fn record_session(&self, session: &Session) -> Result<bool, EngineError>;
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, EngineError>;
    async fn latest_session_for_visitor(
        &self,
        visitor_id: &str,
    ) -> Result<Option<Session>, EngineError>;

    // Identity graph
    async fn link_identifier(&self, link: &NewIdentityLink) -> Result<LinkOutcome, EngineError>;
    async fn resolve_identity(
        &self,
        identifier_type: IdentifierType,
        identifier_value: &str,
    ) -> Result<Option<String>, EngineError>;
    async fn identity_links(&self, primary_identity_id: &str)
        -> Result<Vec<IdentityLink>, EngineError>;
    async fn visitor_state(&self, visitor_id: &str) -> Result<IdentityState, EngineError>;

    // Session linker
    async fn find_similar_sessions(
        &self,
        current: &Session,
    ) -> Result<Vec<SimilarSession>, EngineError>;
    async fn unify_sessions_on_conversion(
        &self,
        contact_id: &str,
        current: &Session,
    ) -> Result<SessionLinkOutcome, EngineError>;

    // Contacts
    async fn get_contact(&self, contact_id: &str) -> Result<Option<Contact>, EngineError>;
    async fn find_duplicates(
        &self,
        candidate: &ContactCandidate,
    ) -> Result<Vec<Contact>, EngineError>;
    async fn unify_contacts(
        &self,
        duplicates: &[Contact],
        incoming: &ContactCandidate,
    ) -> Result<(Contact, MergeReport), EngineError>;
    async fn cleanup_duplicates(&self) -> Result<CleanupReport, EngineError>;
    async fn record_appointment(&self, appointment: &AppointmentRecord) -> Result<bool, EngineError>;
    async fn record_payment(&self, payment: &PaymentRecord) -> Result<bool, EngineError>;

    // Attribution
    async fn attribute(
        &self,
        event: &ConversionEvent,
        window: &AttributionWindow,
    ) -> Result<Option<Attribution>, EngineError>;
    async fn attribute_contacts(
        &self,
        contact_ids: &[String],
        window: &AttributionWindow,
    ) -> Result<HashMap<String, Option<Attribution>>, EngineError>;
    async fn attribution_report(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        window: &AttributionWindow,
    ) -> Result<AttributionReport, EngineError>;

    // Touchpoint feed
    async fn replace_touchpoints(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        rows: &[AdTouchpoint],
    ) -> Result<usize, EngineError>;
}
