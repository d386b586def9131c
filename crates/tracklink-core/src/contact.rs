//! CRM contacts: match-key normalisation, master selection and field merge.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Contact lifecycle stage. Ordering follows rank, so `max()` is the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    #[default]
    Lead,
    Appointment,
    Client,
}

impl ContactStatus {
    pub fn rank(self) -> u8 {
        match self {
            ContactStatus::Lead => 1,
            ContactStatus::Appointment => 2,
            ContactStatus::Client => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContactStatus::Lead => "lead",
            ContactStatus::Appointment => "appointment",
            ContactStatus::Client => "client",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lead" => Ok(ContactStatus::Lead),
            "appointment" => Ok(ContactStatus::Appointment),
            "client" => Ok(ContactStatus::Client),
            _ => Err(EngineError::validation(
                "status",
                "must be one of: lead, appointment, client",
            )),
        }
    }
}

impl fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub contact_id: String,
    pub ext_crm_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub visitor_id: Option<String>,
    /// Ad id captured when the contact was created.
    pub rstk_adid: Option<String>,
    pub rstk_source: Option<String>,
    pub status: ContactStatus,
    /// Attribution anchor. Merges never move it.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Incoming contact data from a conversion, before it is matched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactCandidate {
    pub ext_crm_id: Option<String>,
    pub contact_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub visitor_id: Option<String>,
    pub rstk_adid: Option<String>,
    pub rstk_source: Option<String>,
    #[serde(default)]
    pub status: ContactStatus,
    /// Creation time to use if no existing contact matches.
    pub created_at: Option<DateTime<Utc>>,
}

/// Normalised duplicate-detection keys. Absent keys contribute no predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchKeys {
    pub ext_crm_id: Option<String>,
    pub contact_id: Option<String>,
    pub email: Option<String>,
    /// Last 10 digits of the phone number.
    pub phone_tail: Option<String>,
}

impl MatchKeys {
    pub fn is_empty(&self) -> bool {
        self.ext_crm_id.is_none()
            && self.contact_id.is_none()
            && self.email.is_none()
            && self.phone_tail.is_none()
    }
}

impl ContactCandidate {
    pub fn match_keys(&self) -> MatchKeys {
        MatchKeys {
            ext_crm_id: trimmed(self.ext_crm_id.as_deref()),
            contact_id: trimmed(self.contact_id.as_deref()),
            email: self.email.as_deref().and_then(normalize_email),
            phone_tail: self.phone.as_deref().and_then(phone_match_key),
        }
    }
}

fn trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn is_present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Trim and lowercase an email address.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        None
    } else {
        Some(email)
    }
}

/// Strip everything but ASCII digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// The last 10 digits of a phone number, which tolerates country-code
/// prefixes such as `+1`.
pub fn phone_match_key(raw: &str) -> Option<String> {
    let digits = normalize_phone(raw)?;
    let start = digits.len().saturating_sub(10);
    Some(digits[start..].to_string())
}

/// Weighted count of populated fields; higher means more complete.
pub fn completeness_score(contact: &Contact) -> i64 {
    let weighted = [
        (&contact.first_name, 2),
        (&contact.last_name, 2),
        (&contact.email, 3),
        (&contact.phone, 3),
        (&contact.company, 1),
        (&contact.rstk_adid, 2),
        (&contact.ext_crm_id, 5),
    ];
    let fields: i64 = weighted
        .iter()
        .filter(|(value, _)| is_present(value))
        .map(|(_, weight)| weight)
        .sum();
    let status = if contact.status == ContactStatus::Client {
        10
    } else {
        0
    };
    fields + status
}

/// Index of the master record: highest completeness, then earliest
/// `created_at`, then smallest `contact_id`.
pub fn select_master(contacts: &[Contact]) -> Option<usize> {
    contacts
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            completeness_score(b)
                .cmp(&completeness_score(a))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.contact_id.cmp(&b.contact_id))
        })
        .map(|(idx, _)| idx)
}

/// Prefer a non-empty value; when both are set keep the longer one.
/// Equal lengths keep `current`.
pub fn pick_best(current: Option<String>, other: Option<&str>) -> Option<String> {
    let other = other.filter(|v| !v.trim().is_empty());
    match (current.filter(|v| !v.trim().is_empty()), other) {
        (None, None) => None,
        (Some(cur), None) => Some(cur),
        (None, Some(o)) => Some(o.to_string()),
        (Some(cur), Some(o)) => {
            if o.chars().count() > cur.chars().count() {
                Some(o.to_string())
            } else {
                Some(cur)
            }
        }
    }
}

/// Outcome of [`plan_merge`]: the merged master and who it absorbs.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub master: Contact,
    pub loser_ids: Vec<String>,
    /// The merged master differs from the stored row.
    pub changed: bool,
}

/// What a unify call did, reported back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub master_contact_id: String,
    pub merged_contact_ids: Vec<String>,
    pub created: bool,
    pub payments_migrated: usize,
    pub appointments_migrated: usize,
    pub sessions_migrated: usize,
}

/// Totals from a retroactive duplicate sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub contacts_scanned: usize,
    pub groups_found: usize,
    pub groups_merged: usize,
    pub contacts_removed: usize,
    /// Groups whose merge rolled back; safe to retry on the next sweep.
    pub groups_failed: usize,
}

/// Group contacts that share a normalised email or phone key.
///
/// Sharing is transitive: A~B by email and B~C by phone yield one group.
/// Only groups with more than one member are returned, each ordered by
/// `contact_id`.
pub fn group_duplicates(contacts: &[Contact]) -> Vec<Vec<String>> {
    use std::collections::HashMap;

    let mut set = crate::disjoint_set::DisjointSet::new();
    let mut first_by_key: HashMap<(u8, String), &str> = HashMap::new();

    for contact in contacts {
        set.insert(contact.contact_id.clone());
        let keys = [
            contact.email.as_deref().and_then(normalize_email).map(|k| (0u8, k)),
            contact.phone.as_deref().and_then(phone_match_key).map(|k| (1u8, k)),
        ];
        for key in keys.into_iter().flatten() {
            match first_by_key.get(&key) {
                Some(first) => {
                    set.union(first.to_string(), contact.contact_id.clone());
                }
                None => {
                    first_by_key.insert(key, contact.contact_id.as_str());
                }
            }
        }
    }

    set.groups().into_iter().filter(|g| g.len() > 1).collect()
}

struct Donor<'a> {
    first_name: Option<&'a str>,
    last_name: Option<&'a str>,
    email: Option<&'a str>,
    phone: Option<&'a str>,
    company: Option<&'a str>,
    ext_crm_id: Option<&'a str>,
    visitor_id: Option<&'a str>,
    rstk_adid: Option<&'a str>,
    rstk_source: Option<&'a str>,
    status: ContactStatus,
}

impl<'a> From<&'a Contact> for Donor<'a> {
    fn from(c: &'a Contact) -> Self {
        Donor {
            first_name: c.first_name.as_deref(),
            last_name: c.last_name.as_deref(),
            email: c.email.as_deref(),
            phone: c.phone.as_deref(),
            company: c.company.as_deref(),
            ext_crm_id: c.ext_crm_id.as_deref(),
            visitor_id: c.visitor_id.as_deref(),
            rstk_adid: c.rstk_adid.as_deref(),
            rstk_source: c.rstk_source.as_deref(),
            status: c.status,
        }
    }
}

impl<'a> From<&'a ContactCandidate> for Donor<'a> {
    fn from(c: &'a ContactCandidate) -> Self {
        Donor {
            first_name: c.first_name.as_deref(),
            last_name: c.last_name.as_deref(),
            email: c.email.as_deref(),
            phone: c.phone.as_deref(),
            company: c.company.as_deref(),
            ext_crm_id: c.ext_crm_id.as_deref(),
            visitor_id: c.visitor_id.as_deref(),
            rstk_adid: c.rstk_adid.as_deref(),
            rstk_source: c.rstk_source.as_deref(),
            status: c.status,
        }
    }
}

fn absorb(master: &mut Contact, donor: &Donor<'_>) {
    master.first_name = pick_best(master.first_name.take(), donor.first_name);
    master.last_name = pick_best(master.last_name.take(), donor.last_name);
    master.email = pick_best(master.email.take(), donor.email);
    master.phone = pick_best(master.phone.take(), donor.phone);
    master.company = pick_best(master.company.take(), donor.company);
    master.ext_crm_id = pick_best(master.ext_crm_id.take(), donor.ext_crm_id);
    master.visitor_id = pick_best(master.visitor_id.take(), donor.visitor_id);
    // The ad id and its source travel together.
    if !is_present(&master.rstk_adid) && donor.rstk_adid.is_some_and(|v| !v.trim().is_empty()) {
        master.rstk_adid = donor.rstk_adid.map(str::to_string);
        master.rstk_source = donor.rstk_source.map(str::to_string);
    }
    master.status = master.status.max(donor.status);
}

/// Plan the merge of `duplicates` (any order) with `incoming`.
///
/// Returns `None` when there is nothing to merge into. Losers are folded into
/// the master oldest first, then the incoming candidate, which keeps the
/// result independent of input order and stable when re-run.
pub fn plan_merge(duplicates: &[Contact], incoming: &ContactCandidate) -> Option<MergePlan> {
    let master_idx = select_master(duplicates)?;
    let original = duplicates[master_idx].clone();
    let mut master = original.clone();

    let mut losers: Vec<&Contact> = duplicates
        .iter()
        .enumerate()
        .filter(|(idx, c)| *idx != master_idx && c.contact_id != original.contact_id)
        .map(|(_, c)| c)
        .collect();
    losers.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.contact_id.cmp(&b.contact_id))
    });
    losers.dedup_by(|a, b| a.contact_id == b.contact_id);

    for loser in &losers {
        absorb(&mut master, &Donor::from(*loser));
    }
    absorb(&mut master, &Donor::from(incoming));

    let changed = master != original;
    Some(MergePlan {
        master,
        loser_ids: losers.iter().map(|c| c.contact_id.clone()).collect(),
        changed,
    })
}

/// Generate a new contact id: "ct_" + 32 hex chars.
pub fn new_contact_id() -> String {
    format!("ct_{}", uuid::Uuid::new_v4().simple())
}

/// Build a fresh contact when no duplicate exists.
pub fn contact_from_candidate(candidate: &ContactCandidate, now: DateTime<Utc>) -> Contact {
    let clean = |v: &Option<String>| trimmed(v.as_deref());
    Contact {
        contact_id: clean(&candidate.contact_id).unwrap_or_else(new_contact_id),
        ext_crm_id: clean(&candidate.ext_crm_id),
        first_name: clean(&candidate.first_name),
        last_name: clean(&candidate.last_name),
        email: clean(&candidate.email),
        phone: clean(&candidate.phone),
        company: clean(&candidate.company),
        visitor_id: clean(&candidate.visitor_id),
        rstk_adid: clean(&candidate.rstk_adid),
        rstk_source: clean(&candidate.rstk_source),
        status: candidate.status,
        created_at: candidate.created_at.unwrap_or(now),
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn contact(id: &str, day: u32) -> Contact {
        let ts = Utc.with_ymd_and_hms(2025, 1, day, 9, 0, 0).unwrap();
        Contact {
            contact_id: id.to_string(),
            ext_crm_id: None,
            first_name: None,
            last_name: None,
            email: None,
            phone: None,
            company: None,
            visitor_id: None,
            rstk_adid: None,
            rstk_source: None,
            status: ContactStatus::Lead,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn phone_key_tolerates_country_code() {
        assert_eq!(phone_match_key("+1-555-111-2222").as_deref(), Some("5551112222"));
        assert_eq!(phone_match_key("(555) 111 2222").as_deref(), Some("5551112222"));
        assert_eq!(phone_match_key("555-1234").as_deref(), Some("5551234"));
        assert_eq!(phone_match_key("n/a"), None);
    }

    #[test]
    fn email_is_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  A@X.com ").as_deref(), Some("a@x.com"));
        assert_eq!(normalize_email("   "), None);
    }

    #[test]
    fn empty_candidate_has_no_match_keys() {
        let candidate = ContactCandidate {
            email: Some(" ".to_string()),
            phone: Some("--".to_string()),
            ..Default::default()
        };
        assert!(candidate.match_keys().is_empty());
    }

    #[test]
    fn pick_best_prefers_non_empty_then_longer() {
        assert_eq!(pick_best(None, Some("x")).as_deref(), Some("x"));
        assert_eq!(pick_best(Some("abc".into()), None).as_deref(), Some("abc"));
        assert_eq!(pick_best(Some("abc".into()), Some("")).as_deref(), Some("abc"));
        assert_eq!(pick_best(Some("ab".into()), Some("abc")).as_deref(), Some("abc"));
        assert_eq!(pick_best(Some("abc".into()), Some("xyz")).as_deref(), Some("abc"));
    }

    #[test]
    fn client_status_dominates_master_selection() {
        let mut rich = contact("c_rich", 1);
        rich.first_name = Some("Ann".into());
        rich.last_name = Some("Lee".into());
        rich.email = Some("ann@x.com".into());
        rich.phone = Some("5551112222".into());
        let mut client = contact("c_client", 2);
        client.status = ContactStatus::Client;
        client.ext_crm_id = Some("ghl_9".into());

        assert_eq!(completeness_score(&rich), 10);
        assert_eq!(completeness_score(&client), 15);
        assert_eq!(select_master(&[rich, client]), Some(1));
    }

    #[test]
    fn ties_go_to_the_oldest_contact() {
        let newer = contact("c_new", 5);
        let older = contact("c_old", 2);
        assert_eq!(select_master(&[newer, older]), Some(1));
    }

    #[test]
    fn merges_email_and_phone_scenario() {
        let mut a = contact("c_a", 1);
        a.email = Some("a@x.com".into());
        a.phone = Some("5551112222".into());
        let mut b = contact("c_b", 3);
        b.phone = Some("+1-555-111-2222".into());
        b.ext_crm_id = Some("ghl_1".into());
        b.status = ContactStatus::Client;

        let plan = plan_merge(&[a.clone(), b.clone()], &ContactCandidate::default()).unwrap();
        assert_eq!(plan.master.contact_id, "c_b");
        assert_eq!(plan.loser_ids, vec!["c_a".to_string()]);
        assert_eq!(plan.master.email.as_deref(), Some("a@x.com"));
        assert_eq!(plan.master.ext_crm_id.as_deref(), Some("ghl_1"));
        assert_eq!(plan.master.status, ContactStatus::Client);
        assert_eq!(
            plan.master.phone.as_deref().and_then(phone_match_key),
            Some("5551112222".to_string())
        );
        // The anchor is the master's own creation time.
        assert_eq!(plan.master.created_at, b.created_at);
        assert!(plan.changed);
    }

    #[test]
    fn status_never_regresses() {
        let mut appt = contact("c_appt", 1);
        appt.status = ContactStatus::Appointment;
        let lead = contact("c_lead", 2);
        let incoming = ContactCandidate {
            status: ContactStatus::Lead,
            ..Default::default()
        };
        let plan = plan_merge(&[lead, appt], &incoming).unwrap();
        assert_eq!(plan.master.status, ContactStatus::Appointment);
    }

    #[test]
    fn replanning_the_merged_master_is_a_no_op() {
        let mut a = contact("c_a", 1);
        a.email = Some("a@x.com".into());
        let mut b = contact("c_b", 2);
        b.phone = Some("5551112222".into());
        b.first_name = Some("Bo".into());
        let incoming = ContactCandidate {
            email: Some("a@x.com".into()),
            last_name: Some("Smith".into()),
            ..Default::default()
        };
        let first = plan_merge(&[a, b], &incoming).unwrap();
        let second = plan_merge(&[first.master.clone()], &incoming).unwrap();
        assert!(second.loser_ids.is_empty());
        assert!(!second.changed);
        assert_eq!(second.master, first.master);
    }

    #[test]
    fn ad_attribution_pair_is_not_split() {
        let mut master = contact("c_master", 1);
        master.ext_crm_id = Some("ghl_1".into());
        master.rstk_source = Some("organic".into());
        let mut donor = contact("c_donor", 2);
        donor.rstk_adid = Some("ad_7".into());
        donor.rstk_source = Some("fb_ad".into());

        let plan = plan_merge(&[master, donor], &ContactCandidate::default()).unwrap();
        assert_eq!(plan.master.contact_id, "c_master");
        assert_eq!(plan.master.rstk_adid.as_deref(), Some("ad_7"));
        assert_eq!(plan.master.rstk_source.as_deref(), Some("fb_ad"));
    }

    #[test]
    fn cleanup_groups_are_transitive_across_email_and_phone() {
        let mut a = contact("c_a", 1);
        a.email = Some("Ann@X.com".into());
        let mut b = contact("c_b", 2);
        b.email = Some(" ann@x.com".into());
        b.phone = Some("+1 555 111 2222".into());
        let mut c = contact("c_c", 3);
        c.phone = Some("5551112222".into());
        let mut d = contact("c_d", 4);
        d.email = Some("dee@x.com".into());

        let groups = group_duplicates(&[a, b, c, d]);
        assert_eq!(
            groups,
            vec![vec!["c_a".to_string(), "c_b".to_string(), "c_c".to_string()]]
        );
    }

    #[test]
    fn new_contact_keeps_candidate_creation_time() {
        let created = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 11, 8, 0, 0).unwrap();
        let candidate = ContactCandidate {
            ext_crm_id: Some(" ghl_5 ".into()),
            created_at: Some(created),
            ..Default::default()
        };
        let c = contact_from_candidate(&candidate, now);
        assert!(c.contact_id.starts_with("ct_"));
        assert_eq!(c.ext_crm_id.as_deref(), Some("ghl_5"));
        assert_eq!(c.created_at, created);
        assert_eq!(c.updated_at, now);
    }
}
