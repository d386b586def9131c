//! Last-touch attribution of conversions to ad touchpoints.
//!
//! The strategy chain is evaluated strictly in order and the first success
//! wins:
//!
//! 1. **Session**: the latest qualifying session before the anchor.
//! 2. **Contact fallback**: the ad id stored on the contact at creation,
//!    if the ad was running on the anchor date or up to `fallback_days`
//!    before it.
//!
//! Anything else is unattributed and returned as `None`. The anchor is the
//! contact's `created_at` for every conversion kind, so a contact's leads,
//! appointments and sales always share one attribution.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::error::EngineError;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionKind {
    Lead,
    Appointment,
    Sale,
}

impl ConversionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversionKind::Lead => "lead",
            ConversionKind::Appointment => "appointment",
            ConversionKind::Sale => "sale",
        }
    }
}

/// A lead, appointment or sale belonging to a contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub kind: ConversionKind,
    pub contact_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Daily delivery record for one ad, as synced from the ad platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdTouchpoint {
    pub ad_id: String,
    pub campaign_id: String,
    pub adset_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub spend: f64,
    #[serde(default)]
    pub clicks: i64,
    #[serde(default)]
    pub reach: i64,
}

/// Case-insensitive substring allowlist for ad-platform traffic descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdPlatformMatcher {
    patterns: Vec<String>,
}

impl AdPlatformMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return false;
        };
        let value = value.to_lowercase();
        self.patterns.iter().any(|p| value.contains(p.as_str()))
    }

    /// True if the session's channel, source platform or utm source matches.
    pub fn matches_session(&self, session: &Session) -> bool {
        self.matches(session.channel.as_deref())
            || self.matches(session.source_platform.as_deref())
            || self.matches(session.utm_source.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionWindow {
    /// Only sessions this many days before the anchor qualify. `None` means
    /// any earlier session.
    pub session_lookback_days: Option<i64>,
    /// Days before the anchor date (inclusive) a fallback touchpoint may be
    /// dated.
    pub fallback_days: i64,
}

impl Default for AttributionWindow {
    fn default() -> Self {
        Self {
            session_lookback_days: None,
            fallback_days: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributionStrategy {
    Session { session_id: String },
    ContactFallback,
}

/// The touchpoint a conversion is credited to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribution {
    pub ad_id: String,
    pub campaign_id: String,
    pub adset_id: String,
    pub touchpoint_date: NaiveDate,
    pub strategy: AttributionStrategy,
    pub anchor: DateTime<Utc>,
}

/// The contact fields attribution reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactAnchor {
    pub contact_id: String,
    pub created_at: DateTime<Utc>,
    pub rstk_adid: Option<String>,
    pub rstk_source: Option<String>,
}

impl From<&Contact> for ContactAnchor {
    fn from(c: &Contact) -> Self {
        Self {
            contact_id: c.contact_id.clone(),
            created_at: c.created_at,
            rstk_adid: c.rstk_adid.clone(),
            rstk_source: c.rstk_source.clone(),
        }
    }
}

/// Touchpoints grouped by ad id, each list sorted by date.
#[derive(Debug, Clone, Default)]
pub struct TouchpointIndex {
    by_ad: HashMap<String, Vec<AdTouchpoint>>,
}

impl TouchpointIndex {
    pub fn from_rows(rows: impl IntoIterator<Item = AdTouchpoint>) -> Self {
        let mut by_ad: HashMap<String, Vec<AdTouchpoint>> = HashMap::new();
        for row in rows {
            by_ad.entry(row.ad_id.clone()).or_default().push(row);
        }
        for rows in by_ad.values_mut() {
            rows.sort_by(|a, b| a.date.cmp(&b.date));
        }
        Self { by_ad }
    }

    pub fn contains(&self, ad_id: &str) -> bool {
        self.by_ad.contains_key(ad_id)
    }

    /// Latest touchpoint dated within `[start, end]`.
    pub fn latest_between(&self, ad_id: &str, start: NaiveDate, end: NaiveDate) -> Option<&AdTouchpoint> {
        self.by_ad
            .get(ad_id)?
            .iter()
            .rev()
            .find(|t| t.date >= start && t.date <= end)
    }

    /// Latest touchpoint on or before `date`, else the earliest one after it.
    pub fn closest_to(&self, ad_id: &str, date: NaiveDate) -> Option<&AdTouchpoint> {
        let rows = self.by_ad.get(ad_id)?;
        rows.iter()
            .rev()
            .find(|t| t.date <= date)
            .or_else(|| rows.first())
    }
}

/// Walks the strategy chain for one contact at a time.
pub struct AttributionResolver<'a> {
    matcher: &'a AdPlatformMatcher,
    touchpoints: &'a TouchpointIndex,
    window: AttributionWindow,
}

impl<'a> AttributionResolver<'a> {
    pub fn new(
        matcher: &'a AdPlatformMatcher,
        touchpoints: &'a TouchpointIndex,
        window: AttributionWindow,
    ) -> Self {
        Self {
            matcher,
            touchpoints,
            window,
        }
    }

    /// Attribute a contact given the sessions known to belong to it.
    pub fn resolve(&self, anchor: &ContactAnchor, sessions: &[Session]) -> Option<Attribution> {
        self.from_sessions(anchor, sessions)
            .or_else(|| self.from_contact_fallback(anchor))
    }

    fn from_sessions(&self, anchor: &ContactAnchor, sessions: &[Session]) -> Option<Attribution> {
        let earliest = self
            .window
            .session_lookback_days
            .and_then(|days| anchor.created_at.checked_sub_signed(Duration::days(days)));

        let session = sessions
            .iter()
            .filter(|s| s.started_at < anchor.created_at)
            .filter(|s| earliest.map_or(true, |e| s.started_at >= e))
            .filter(|s| {
                s.ad_id
                    .as_deref()
                    .is_some_and(|ad| self.touchpoints.contains(ad))
            })
            .filter(|s| self.matcher.matches_session(s))
            .max_by(|a, b| {
                a.started_at
                    .cmp(&b.started_at)
                    .then_with(|| a.session_id.cmp(&b.session_id))
            })?;

        let ad_id = session.ad_id.as_deref()?;
        let touchpoint = self
            .touchpoints
            .closest_to(ad_id, anchor.created_at.date_naive())?;
        Some(Attribution {
            ad_id: ad_id.to_string(),
            campaign_id: touchpoint.campaign_id.clone(),
            adset_id: touchpoint.adset_id.clone(),
            touchpoint_date: touchpoint.date,
            strategy: AttributionStrategy::Session {
                session_id: session.session_id.clone(),
            },
            anchor: anchor.created_at,
        })
    }

    fn from_contact_fallback(&self, anchor: &ContactAnchor) -> Option<Attribution> {
        let ad_id = anchor
            .rstk_adid
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())?;
        if !self.matcher.matches(anchor.rstk_source.as_deref()) {
            return None;
        }
        let anchor_date = anchor.created_at.date_naive();
        let start = anchor_date
            .checked_sub_signed(Duration::days(self.window.fallback_days))
            .unwrap_or(NaiveDate::MIN);
        let touchpoint = self.touchpoints.latest_between(ad_id, start, anchor_date)?;
        Some(Attribution {
            ad_id: ad_id.to_string(),
            campaign_id: touchpoint.campaign_id.clone(),
            adset_id: touchpoint.adset_id.clone(),
            touchpoint_date: touchpoint.date,
            strategy: AttributionStrategy::ContactFallback,
            anchor: anchor.created_at,
        })
    }
}

/// Reject feed rows that fall outside the replaced range or repeat an
/// `(ad_id, date)` pair.
pub fn validate_touchpoint_feed(
    start: NaiveDate,
    end: NaiveDate,
    rows: &[AdTouchpoint],
) -> Result<(), EngineError> {
    if end < start {
        return Err(EngineError::validation(
            "end_date",
            "must be on or after start_date",
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for row in rows {
        if row.ad_id.trim().is_empty() {
            return Err(EngineError::validation("ad_id", "must not be empty"));
        }
        if row.date < start || row.date > end {
            return Err(EngineError::validation(
                "date",
                format!("{} for ad {} is outside {start}..={end}", row.date, row.ad_id),
            ));
        }
        if !row.spend.is_finite() || row.spend < 0.0 {
            return Err(EngineError::validation("spend", "must be a non-negative number"));
        }
        if !seen.insert((row.ad_id.as_str(), row.date)) {
            return Err(EngineError::validation(
                "ad_id",
                format!("duplicate row for ad {} on {}", row.ad_id, row.date),
            ));
        }
    }
    Ok(())
}

// ─── Reporting ──────────────────────────────────────────────────────────

/// One conversion as seen by the report, already tied to its contact.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRecord {
    pub kind: ConversionKind,
    pub contact_id: String,
    pub occurred_at: DateTime<Utc>,
    /// Payment amount for sales, zero otherwise.
    pub amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversionTotals {
    pub leads: i64,
    pub appointments: i64,
    pub sales: i64,
    pub revenue: f64,
}

impl ConversionTotals {
    fn add(&mut self, record: &ConversionRecord) {
        match record.kind {
            ConversionKind::Lead => self.leads += 1,
            ConversionKind::Appointment => self.appointments += 1,
            ConversionKind::Sale => {
                self.sales += 1;
                self.revenue += record.amount;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdReportRow {
    pub ad_id: String,
    pub campaign_id: String,
    pub adset_id: String,
    pub spend: f64,
    pub clicks: i64,
    pub reach: i64,
    pub leads: i64,
    pub appointments: i64,
    pub sales: i64,
    pub revenue: f64,
    /// `revenue / spend`; absent when nothing was spent.
    pub roas: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionReport {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub rows: Vec<AdReportRow>,
    /// Conversions with no touchpoint. Counted in totals only.
    pub unattributed: ConversionTotals,
    pub totals: ConversionTotals,
    pub total_spend: f64,
}

/// Aggregate spend and attributed conversions per ad.
///
/// `attributions` must hold an entry (possibly `None`) for every contact
/// referenced by `conversions`; a missing entry counts as unattributed.
pub fn build_report(
    start_date: NaiveDate,
    end_date: NaiveDate,
    spend_rows: &[AdTouchpoint],
    conversions: &[ConversionRecord],
    attributions: &HashMap<String, Option<Attribution>>,
) -> AttributionReport {
    let mut rows: BTreeMap<String, AdReportRow> = BTreeMap::new();
    let mut total_spend = 0.0;

    let blank_row = |ad_id: &str, campaign_id: &str, adset_id: &str| AdReportRow {
        ad_id: ad_id.to_string(),
        campaign_id: campaign_id.to_string(),
        adset_id: adset_id.to_string(),
        spend: 0.0,
        clicks: 0,
        reach: 0,
        leads: 0,
        appointments: 0,
        sales: 0,
        revenue: 0.0,
        roas: None,
    };

    for tp in spend_rows {
        let row = rows
            .entry(tp.ad_id.clone())
            .or_insert_with(|| blank_row(&tp.ad_id, &tp.campaign_id, &tp.adset_id));
        row.spend += tp.spend;
        row.clicks += tp.clicks;
        row.reach += tp.reach;
        total_spend += tp.spend;
    }

    let mut totals = ConversionTotals::default();
    let mut unattributed = ConversionTotals::default();

    for record in conversions {
        totals.add(record);
        match attributions.get(&record.contact_id).and_then(Option::as_ref) {
            Some(attr) => {
                let row = rows
                    .entry(attr.ad_id.clone())
                    .or_insert_with(|| blank_row(&attr.ad_id, &attr.campaign_id, &attr.adset_id));
                match record.kind {
                    ConversionKind::Lead => row.leads += 1,
                    ConversionKind::Appointment => row.appointments += 1,
                    ConversionKind::Sale => {
                        row.sales += 1;
                        row.revenue += record.amount;
                    }
                }
            }
            None => unattributed.add(record),
        }
    }

    let mut rows: Vec<AdReportRow> = rows
        .into_values()
        .map(|mut row| {
            row.roas = (row.spend > 0.0).then(|| row.revenue / row.spend);
            row
        })
        .collect();
    rows.sort_by(|a, b| {
        b.revenue
            .partial_cmp(&a.revenue)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.leads.cmp(&a.leads))
            .then_with(|| a.ad_id.cmp(&b.ad_id))
    });

    AttributionReport {
        start_date,
        end_date,
        rows,
        unattributed,
        totals,
        total_spend,
    }
}
