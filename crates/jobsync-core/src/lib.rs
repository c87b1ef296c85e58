//! Core domain model for job offer sync: providers, unified jobs, persisted offers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-core";

/// Placeholder used when an upstream record carries no company name.
pub const UNKNOWN_COMPANY: &str = "Unknown Company";
/// Placeholder used when an upstream record carries no location.
pub const UNKNOWN_LOCATION: &str = "Unknown Location";
pub const DEFAULT_CURRENCY: &str = "USD";

/// The closed set of upstream job providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Provider1,
    Provider2,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Provider1, Provider::Provider2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Provider1 => "provider1",
            Provider::Provider2 => "provider2",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// Canonical provider-agnostic job record produced by a normalization rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedJob {
    pub external_id: String,
    pub provider: Provider,
    pub title: String,
    pub company: String,
    pub description: String,
    pub location: String,
    pub employment_type: String,
    pub experience_level: String,
    pub min_salary: Option<f64>,
    pub max_salary: Option<f64>,
    pub currency: Option<String>,
    pub posted_date: Option<DateTime<Utc>>,
    pub application_deadline: Option<DateTime<Utc>>,
    pub application_url: String,
    pub skills: Vec<String>,
    pub benefits: Vec<String>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experience_years: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<JsonValue>,
}

impl UnifiedJob {
    /// Reconciliation key: unique per provider, never the storage id.
    pub fn natural_key(&self) -> (&str, Provider) {
        (self.external_id.as_str(), self.provider)
    }
}

/// Persisted job offer row. `id`, `created_at`, `updated_at` and
/// `last_synced_at` belong to the store; everything else mirrors [`UnifiedJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOffer {
    pub id: Uuid,
    #[serde(flatten)]
    pub job: UnifiedJob,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

impl JobOffer {
    pub fn new(job: UnifiedJob, synced_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            created_at: synced_at,
            updated_at: synced_at,
            last_synced_at: synced_at,
        }
    }

    /// Overwrite the normalized fields, keeping identity and creation time.
    pub fn refresh(&mut self, job: UnifiedJob, synced_at: DateTime<Utc>) {
        self.job = job;
        self.updated_at = synced_at;
        self.last_synced_at = synced_at;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub saved: u64,
    pub updated: u64,
}

impl UpsertOutcome {
    pub fn merge(self, other: UpsertOutcome) -> Self {
        Self {
            saved: self.saved + other.saved,
            updated: self.updated + other.updated,
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Filters and paging for the read side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOfferQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub title: Option<String>,
    pub location: Option<String>,
    pub company: Option<String>,
    pub min_salary: Option<f64>,
    pub max_salary: Option<f64>,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl JobOfferQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.page_size())
    }

    /// In-process evaluation of the filter set. Only active offers match.
    pub fn matches(&self, offer: &JobOffer) -> bool {
        let job = &offer.job;
        if !job.active {
            return false;
        }
        if !contains_ci(&job.title, self.title.as_deref())
            || !contains_ci(&job.location, self.location.as_deref())
            || !contains_ci(&job.company, self.company.as_deref())
        {
            return false;
        }
        if let Some(min) = self.min_salary {
            if !job.max_salary.is_some_and(|max| max >= min) {
                return false;
            }
        }
        if let Some(max) = self.max_salary {
            if !job.min_salary.is_some_and(|min| min <= max) {
                return false;
            }
        }
        if !self.skills.is_empty() && !job.skills.iter().any(|s| self.skills.contains(s)) {
            return false;
        }
        true
    }
}

fn contains_ci(haystack: &str, needle: Option<&str>) -> bool {
    match needle {
        Some(needle) if !needle.is_empty() => haystack
            .to_lowercase()
            .contains(&needle.to_lowercase()),
        _ => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub provider: String,
    pub count: u64,
    pub active_count: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Read-only aggregate surfaced by the sync status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub last_sync: Option<DateTime<Utc>>,
    pub total_count: u64,
    pub active_count: u64,
    pub providers: Vec<ProviderStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(title: &str, skills: &[&str], min: Option<f64>, max: Option<f64>) -> JobOffer {
        JobOffer::new(
            UnifiedJob {
                external_id: "x-1".into(),
                provider: Provider::Provider1,
                title: title.into(),
                company: "Acme".into(),
                description: String::new(),
                location: "Boston, MA".into(),
                employment_type: "Full Time".into(),
                experience_level: "Senior".into(),
                min_salary: min,
                max_salary: max,
                currency: Some(DEFAULT_CURRENCY.into()),
                posted_date: None,
                application_deadline: None,
                application_url: String::new(),
                skills: skills.iter().map(|s| s.to_string()).collect(),
                benefits: vec![],
                active: true,
                industry: None,
                company_website: None,
                experience_years: None,
                raw_data: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn provider_keys_round_trip_through_from_str() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert_eq!(
            "provider3".parse::<Provider>(),
            Err(UnknownProvider("provider3".into()))
        );
        assert_eq!(serde_json::to_string(&Provider::Provider2).unwrap(), "\"provider2\"");
    }

    #[test]
    fn query_paging_is_clamped() {
        let q = JobOfferQuery {
            page: Some(0),
            page_size: Some(500),
            ..Default::default()
        };
        assert_eq!(q.page(), 1);
        assert_eq!(q.page_size(), MAX_PAGE_SIZE);
        assert_eq!(JobOfferQuery::default().page_size(), DEFAULT_PAGE_SIZE);
        let q = JobOfferQuery {
            page: Some(3),
            page_size: Some(10),
            ..Default::default()
        };
        assert_eq!(q.offset(), 20);
    }

    #[test]
    fn query_filters_match_salary_overlap_and_skills() {
        let offer = job("Senior Rust Engineer", &["Rust", "SQL"], Some(90_000.0), Some(130_000.0));
        let q = JobOfferQuery {
            title: Some("rust".into()),
            min_salary: Some(120_000.0),
            max_salary: Some(95_000.0),
            skills: vec!["SQL".into()],
            ..Default::default()
        };
        assert!(q.matches(&offer));

        let too_high = JobOfferQuery {
            min_salary: Some(140_000.0),
            ..Default::default()
        };
        assert!(!too_high.matches(&offer));

        let other_skill = JobOfferQuery {
            skills: vec!["Go".into()],
            ..Default::default()
        };
        assert!(!other_skill.matches(&offer));

        let mut inactive = offer.clone();
        inactive.job.active = false;
        assert!(!JobOfferQuery::default().matches(&inactive));
    }

    #[test]
    fn refresh_keeps_identity_and_creation_time() {
        let mut offer = job("A", &[], None, None);
        let id = offer.id;
        let created = offer.created_at;
        let later = created + chrono::Duration::minutes(5);
        let mut next = offer.job.clone();
        next.title = "B".into();
        offer.refresh(next, later);
        assert_eq!(offer.id, id);
        assert_eq!(offer.created_at, created);
        assert_eq!(offer.last_synced_at, later);
        assert_eq!(offer.job.title, "B");
    }
}
