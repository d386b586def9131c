use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::debug;

use tracklink_core::attribution::{
    validate_touchpoint_feed, AdTouchpoint, Attribution, AttributionReport, AttributionWindow,
    ConversionEvent,
};
use tracklink_core::config::EngineSettings;
use tracklink_core::contact::{CleanupReport, Contact, ContactCandidate, MergeReport};
use tracklink_core::conversion::{AppointmentRecord, PaymentRecord};
use tracklink_core::engine::EngineBackend;
use tracklink_core::error::EngineError;
use tracklink_core::identity::{
    IdentifierType, IdentityLink, IdentityState, LinkOutcome, NewIdentityLink,
};
use tracklink_core::session::{Session, SessionLinkOutcome, SimilarSession};

use crate::DuckDbBackend;

fn require(field: &'static str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        Err(EngineError::validation(field, "must not be empty"))
    } else {
        Ok(())
    }
}

#[async_trait]
impl EngineBackend for DuckDbBackend {
    fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    async fn record_session(&self, session: &Session) -> Result<bool, EngineError> {
        require("session_id", &session.session_id)?;
        require("visitor_id", &session.visitor_id)?;
        let conn = self.conn.lock().await;
        let inserted = crate::sessions::insert_session_sync(&conn, session)?;
        if !inserted {
            debug!(session_id = %session.session_id, "Session already recorded");
        }
        Ok(inserted)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, EngineError> {
        let conn = self.conn.lock().await;
        Ok(crate::sessions::get_session_sync(&conn, session_id)?)
    }

    async fn latest_session_for_visitor(
        &self,
        visitor_id: &str,
    ) -> Result<Option<Session>, EngineError> {
        let conn = self.conn.lock().await;
        Ok(crate::sessions::latest_session_for_visitor_sync(
            &conn, visitor_id,
        )?)
    }

    async fn link_identifier(&self, link: &NewIdentityLink) -> Result<LinkOutcome, EngineError> {
        require("primary_identity_id", &link.primary_identity_id)?;
        require("identifier_value", &link.identifier_value)?;
        if !(0.0..=1.0).contains(&link.confidence) {
            return Err(EngineError::validation(
                "confidence",
                "must be within 0..=1",
            ));
        }
        crate::identity::link_identifier_inner(self, link, Utc::now())
            .await
            .map_err(EngineError::Transaction)
    }

    async fn resolve_identity(
        &self,
        identifier_type: IdentifierType,
        identifier_value: &str,
    ) -> Result<Option<String>, EngineError> {
        let conn = self.conn.lock().await;
        Ok(crate::identity::resolve_sync(
            &conn,
            identifier_type,
            identifier_value,
        )?)
    }

    async fn identity_links(
        &self,
        primary_identity_id: &str,
    ) -> Result<Vec<IdentityLink>, EngineError> {
        let conn = self.conn.lock().await;
        let root = crate::identity::find_root_sync(&conn, primary_identity_id)?;
        Ok(crate::identity::set_links_sync(&conn, &root, None)?)
    }

    async fn visitor_state(&self, visitor_id: &str) -> Result<IdentityState, EngineError> {
        let conn = self.conn.lock().await;
        Ok(crate::identity::visitor_state_sync(&conn, visitor_id)?)
    }

    async fn find_similar_sessions(
        &self,
        current: &Session,
    ) -> Result<Vec<SimilarSession>, EngineError> {
        Ok(crate::linker::find_similar_sessions_inner(self, current).await?)
    }

    async fn unify_sessions_on_conversion(
        &self,
        contact_id: &str,
        current: &Session,
    ) -> Result<SessionLinkOutcome, EngineError> {
        require("contact_id", contact_id)?;
        crate::linker::unify_sessions_on_conversion_inner(self, contact_id, current, Utc::now())
            .await
            .map_err(EngineError::Transaction)
    }

    async fn get_contact(&self, contact_id: &str) -> Result<Option<Contact>, EngineError> {
        let conn = self.conn.lock().await;
        Ok(crate::contacts::get_contact_sync(&conn, contact_id)?)
    }

    async fn find_duplicates(
        &self,
        candidate: &ContactCandidate,
    ) -> Result<Vec<Contact>, EngineError> {
        let conn = self.conn.lock().await;
        Ok(crate::contacts::find_duplicates_sync(&conn, candidate)?)
    }

    async fn unify_contacts(
        &self,
        duplicates: &[Contact],
        incoming: &ContactCandidate,
    ) -> Result<(Contact, MergeReport), EngineError> {
        crate::contacts::unify_contacts_inner(self, duplicates, incoming, Utc::now())
            .await
            .map_err(EngineError::Transaction)
    }

    async fn cleanup_duplicates(&self) -> Result<CleanupReport, EngineError> {
        Ok(crate::contacts::cleanup_duplicates_inner(self, Utc::now()).await?)
    }

    async fn record_appointment(
        &self,
        appointment: &AppointmentRecord,
    ) -> Result<bool, EngineError> {
        require("appointment_id", &appointment.appointment_id)?;
        let conn = self.conn.lock().await;
        Ok(crate::contacts::record_appointment_sync(&conn, appointment)?)
    }

    async fn record_payment(&self, payment: &PaymentRecord) -> Result<bool, EngineError> {
        require("payment_id", &payment.payment_id)?;
        let conn = self.conn.lock().await;
        Ok(crate::contacts::record_payment_sync(&conn, payment)?)
    }

    async fn attribute(
        &self,
        event: &ConversionEvent,
        window: &AttributionWindow,
    ) -> Result<Option<Attribution>, EngineError> {
        let contact = self
            .get_contact(&event.contact_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("contact {}", event.contact_id)))?;
        Ok(crate::attribution::attribute_contact_inner(self, &contact, window).await?)
    }

    async fn attribute_contacts(
        &self,
        contact_ids: &[String],
        window: &AttributionWindow,
    ) -> Result<HashMap<String, Option<Attribution>>, EngineError> {
        Ok(crate::attribution::attribute_contacts_inner(self, contact_ids, window).await?)
    }

    async fn attribution_report(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        window: &AttributionWindow,
    ) -> Result<AttributionReport, EngineError> {
        if end < start {
            return Err(EngineError::validation(
                "end_date",
                "must be on or after start_date",
            ));
        }
        Ok(crate::attribution::attribution_report_inner(self, start, end, window).await?)
    }

    async fn replace_touchpoints(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        rows: &[AdTouchpoint],
    ) -> Result<usize, EngineError> {
        validate_touchpoint_feed(start, end, rows)?;
        crate::touchpoints::replace_touchpoints_inner(self, start, end, rows)
            .await
            .map_err(EngineError::Transaction)
    }
}
