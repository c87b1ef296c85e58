//! Provider normalization rules, shared field normalizers and the transform dispatcher.

use std::any::Any;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use jobsync_core::{
    Provider, UnifiedJob, UnknownProvider, DEFAULT_CURRENCY, UNKNOWN_COMPANY, UNKNOWN_LOCATION,
};
use regex::Regex;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, warn};

pub const CRATE_NAME: &str = "jobsync-adapters";

pub const NOT_SPECIFIED: &str = "Not Specified";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
    #[error("{rule} rule registered in the {slot} slot")]
    MisplacedRule { slot: Provider, rule: Provider },
}

/// Output of one rule invocation. `skipped` counts records that could not be decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub jobs: Vec<UnifiedJob>,
    pub skipped: usize,
}

/// Maps one provider's raw payload to unified jobs.
///
/// A payload whose top-level shape does not match the provider's schema yields
/// an empty [`Normalized`], not an error.
pub trait NormalizationRule: Send + Sync {
    fn provider(&self) -> Provider;
    fn normalize(&self, raw: &JsonValue) -> Result<Normalized, AdapterError>;
}

pub fn load_payload(path: impl AsRef<Path>) -> Result<JsonValue> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Field normalizers
// ---------------------------------------------------------------------------

const EMPLOYMENT_TYPES: &[(&str, &str)] = &[
    ("full-time", "Full Time"),
    ("full time", "Full Time"),
    ("part-time", "Part Time"),
    ("part time", "Part Time"),
    ("contract", "Contract"),
    ("temporary", "Temporary"),
    ("internship", "Internship"),
    ("remote", "Remote"),
    ("on-site", "On-site"),
    ("hybrid", "Hybrid"),
];

const EXPERIENCE_LEVELS: &[(&str, &str)] = &[
    ("entry", "Entry Level"),
    ("junior", "Junior"),
    ("mid", "Mid Level"),
    ("senior", "Senior"),
    ("lead", "Lead"),
    ("principal", "Principal"),
    ("staff", "Staff"),
    ("manager", "Manager"),
];

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    let key = key.trim().to_lowercase();
    table
        .iter()
        .find(|(raw, _)| *raw == key)
        .map(|(_, canonical)| *canonical)
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.and_then(|v| text_or_none(v))
}

pub fn normalize_employment_type(raw: Option<&str>) -> String {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return NOT_SPECIFIED.to_string();
    };
    lookup(EMPLOYMENT_TYPES, raw)
        .map(ToString::to_string)
        .unwrap_or_else(|| raw.to_string())
}

/// Experience as providers report it: a number of years or a free-text label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExperienceInput<'a> {
    Years(f64),
    Label(&'a str),
}

impl<'a> ExperienceInput<'a> {
    /// Numbers and numeric strings become years; other strings stay labels.
    /// Absent values count as zero years.
    pub fn from_json(value: Option<&'a JsonValue>) -> Self {
        match value {
            Some(JsonValue::Number(n)) => ExperienceInput::Years(n.as_f64().unwrap_or(0.0)),
            Some(JsonValue::String(s)) => match s.trim().parse::<f64>() {
                Ok(years) => ExperienceInput::Years(years),
                Err(_) => ExperienceInput::Label(s),
            },
            _ => ExperienceInput::Years(0.0),
        }
    }
}

pub fn normalize_experience_level(input: ExperienceInput<'_>) -> String {
    match input {
        ExperienceInput::Years(years) if !years.is_finite() => NOT_SPECIFIED.to_string(),
        ExperienceInput::Years(years) => {
            let level = if years <= 0.0 {
                "Entry Level"
            } else if years <= 2.0 {
                "Junior"
            } else if years <= 5.0 {
                "Mid Level"
            } else if years <= 8.0 {
                "Senior"
            } else {
                "Principal"
            };
            level.to_string()
        }
        ExperienceInput::Label(label) if label.trim().is_empty() => NOT_SPECIFIED.to_string(),
        ExperienceInput::Label(label) => lookup(EXPERIENCE_LEVELS, label)
            .map(ToString::to_string)
            .unwrap_or_else(|| infer_experience_from_title(label)),
    }
}

pub fn infer_experience_from_title(title: &str) -> String {
    let lower = title.to_lowercase();
    let level = if lower.contains("senior") || lower.contains("sr.") {
        "Senior"
    } else if lower.contains("junior") || lower.contains("jr.") {
        "Junior"
    } else if lower.contains("lead") {
        "Lead"
    } else if lower.contains("principal") || lower.contains("staff") {
        "Principal"
    } else if lower.contains("manager") {
        "Manager"
    } else {
        "Mid Level"
    };
    level.to_string()
}

/// Accepts RFC 3339, naive date-times (read as UTC) and plain `YYYY-MM-DD`.
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn parse_array(input: Option<&JsonValue>) -> Vec<String> {
    match input {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .filter_map(text_or_none)
            .collect(),
        Some(JsonValue::String(s)) => s.split(',').filter_map(text_or_none).collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SalaryRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: String,
}

static SALARY_K_WITH_SYMBOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\$(\d+)k\s*-\s*\$(\d+)k").unwrap());
static SALARY_GROUPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d[\d,]*)\s*-\s*\$(\d[\d,]*)").unwrap());
static SALARY_K_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)k\s*-\s*(\d+)k").unwrap());

/// Best-effort salary text parser. Text matching none of the known shapes
/// yields empty bounds rather than an error.
pub fn parse_salary_range(text: &str) -> SalaryRange {
    let patterns: [(&Regex, f64); 3] = [
        (&SALARY_K_WITH_SYMBOL, 1000.0),
        (&SALARY_GROUPED, 1.0),
        (&SALARY_K_BARE, 1000.0),
    ];
    for (pattern, scale) in patterns {
        let Some(caps) = pattern.captures(text) else {
            continue;
        };
        let min = amount(&caps[1], scale);
        let max = amount(&caps[2], scale);
        if let (Some(min), Some(max)) = (min, max) {
            return SalaryRange {
                min: Some(min),
                max: Some(max),
                currency: DEFAULT_CURRENCY.to_string(),
            };
        }
    }
    SalaryRange {
        min: None,
        max: None,
        currency: DEFAULT_CURRENCY.to_string(),
    }
}

fn amount(digits: &str, scale: f64) -> Option<f64> {
    digits
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .map(|v| v * scale)
}

// Record fields drift in type between provider releases. Optional leaves decode
// through these helpers so a mismatch nulls the field instead of dropping the record.

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    })
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Bool(b) => Some(b),
        JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Record ids arrive as strings or bare numbers; anything else is unusable.
fn record_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => text_or_none(&s).ok_or_else(|| D::Error::custom("blank job id")),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("unusable job id: {other}"))),
    }
}

fn format_years(years: f64) -> String {
    if years.fract() == 0.0 {
        format!("{}", years as i64)
    } else {
        years.to_string()
    }
}

// ---------------------------------------------------------------------------
// Provider 1: `{ jobs: [ ... ] }`
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Provider1Job {
    #[serde(deserialize_with = "record_id")]
    job_id: String,
    title: String,
    #[serde(default, deserialize_with = "lenient")]
    details: Option<Provider1Details>,
    #[serde(default, deserialize_with = "lenient")]
    company: Option<Provider1Company>,
    skills: Option<JsonValue>,
    #[serde(default, deserialize_with = "lenient")]
    posted_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Provider1Details {
    #[serde(default, deserialize_with = "lenient")]
    location: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    salary_range: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Provider1Company {
    #[serde(default, deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    industry: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Provider1Rule;

impl Provider1Rule {
    fn map_job(&self, job: Provider1Job, raw: &JsonValue) -> UnifiedJob {
        let details = job.details.as_ref();
        let location = non_empty(details.and_then(|d| d.location.as_ref()));
        let kind = non_empty(details.and_then(|d| d.kind.as_ref()));
        let company_name = non_empty(job.company.as_ref().and_then(|c| c.name.as_ref()));
        let industry = non_empty(job.company.as_ref().and_then(|c| c.industry.as_ref()));
        let salary = parse_salary_range(
            details
                .and_then(|d| d.salary_range.as_deref())
                .unwrap_or_default(),
        );
        let company = company_name.unwrap_or_else(|| UNKNOWN_COMPANY.to_string());

        let mut description = format!("{} position at {}", job.title, company);
        if let Some(industry) = &industry {
            description.push_str(&format!(" in the {industry} industry"));
        }
        if let Some(location) = &location {
            description.push_str(&format!(" located in {location}"));
        }
        if let Some(kind) = &kind {
            description.push_str(&format!(" ({kind})"));
        }
        description.push('.');

        UnifiedJob {
            external_id: job.job_id,
            provider: Provider::Provider1,
            experience_level: infer_experience_from_title(&job.title),
            title: job.title,
            company,
            description,
            location: location.unwrap_or_else(|| UNKNOWN_LOCATION.to_string()),
            employment_type: normalize_employment_type(kind.as_deref()),
            min_salary: salary.min,
            max_salary: salary.max,
            currency: Some(salary.currency),
            posted_date: job.posted_date.as_deref().and_then(parse_date),
            application_deadline: None,
            application_url: String::new(),
            skills: parse_array(job.skills.as_ref()),
            benefits: Vec::new(),
            active: true,
            industry,
            company_website: None,
            experience_years: None,
            raw_data: Some(raw.clone()),
        }
    }
}

impl NormalizationRule for Provider1Rule {
    fn provider(&self) -> Provider {
        Provider::Provider1
    }

    fn normalize(&self, raw: &JsonValue) -> Result<Normalized, AdapterError> {
        let Some(records) = raw.get("jobs").and_then(JsonValue::as_array) else {
            return Ok(Normalized::default());
        };
        let mut out = Normalized::default();
        for record in records {
            match Provider1Job::deserialize(record) {
                Ok(job) => out.jobs.push(self.map_job(job, record)),
                Err(_) => out.skipped += 1,
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Provider 2: `{ status: "success", data: { jobsList: { <id>: { ... } } } }`
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Provider2Job {
    position: String,
    #[serde(default, deserialize_with = "lenient")]
    location: Option<Provider2Location>,
    #[serde(default, deserialize_with = "lenient")]
    compensation: Option<Provider2Compensation>,
    #[serde(default, deserialize_with = "lenient")]
    employer: Option<Provider2Employer>,
    #[serde(default, deserialize_with = "lenient")]
    requirements: Option<Provider2Requirements>,
    #[serde(default, deserialize_with = "lenient")]
    date_posted: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Provider2Location {
    #[serde(default, deserialize_with = "lenient")]
    city: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    state: Option<String>,
    #[serde(default, deserialize_with = "lenient_flag")]
    remote: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct Provider2Compensation {
    #[serde(default, deserialize_with = "lenient_amount")]
    min: Option<f64>,
    #[serde(default, deserialize_with = "lenient_amount")]
    max: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Provider2Employer {
    #[serde(default, deserialize_with = "lenient")]
    company_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    website: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Provider2Requirements {
    #[serde(default)]
    experience: Option<JsonValue>,
    technologies: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Provider2Rule;

impl Provider2Rule {
    fn format_location(location: Option<&Provider2Location>) -> String {
        let Some(location) = location else {
            return UNKNOWN_LOCATION.to_string();
        };
        let remote = location.remote.unwrap_or(false);
        let parts = [non_empty(location.city.as_ref()), non_empty(location.state.as_ref())]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        match (parts.is_empty(), remote) {
            (true, true) => "Remote".to_string(),
            (true, false) => UNKNOWN_LOCATION.to_string(),
            (false, true) => format!("{} (Remote)", parts.join(", ")),
            (false, false) => parts.join(", "),
        }
    }

    fn map_job(&self, external_id: &str, job: Provider2Job, raw: &JsonValue) -> UnifiedJob {
        let remote = job
            .location
            .as_ref()
            .and_then(|l| l.remote)
            .unwrap_or(false);
        let company = non_empty(job.employer.as_ref().and_then(|e| e.company_name.as_ref()))
            .unwrap_or_else(|| UNKNOWN_COMPANY.to_string());
        let website = non_empty(job.employer.as_ref().and_then(|e| e.website.as_ref()));
        let experience_raw = job.requirements.as_ref().and_then(|r| r.experience.as_ref());
        let experience = ExperienceInput::from_json(experience_raw);
        let experience_years = match experience {
            ExperienceInput::Years(years) if experience_raw.is_some() => Some(years),
            _ => None,
        };
        let compensation = job.compensation.as_ref();
        let positive = |v: Option<f64>| v.filter(|amount| *amount > 0.0);

        let mut description = format!("{} at {}", job.position, company);
        if let Some(years) = experience_years.filter(|y| *y > 0.0) {
            description.push_str(&format!(
                ", requiring {} years of experience",
                format_years(years)
            ));
        }
        description.push('.');

        UnifiedJob {
            external_id: external_id.to_string(),
            provider: Provider::Provider2,
            title: job.position.clone(),
            company,
            description,
            location: Self::format_location(job.location.as_ref()),
            employment_type: (if remote { "Remote" } else { "On-site" }).to_string(),
            experience_level: normalize_experience_level(experience),
            min_salary: positive(compensation.and_then(|c| c.min)),
            max_salary: positive(compensation.and_then(|c| c.max)),
            currency: Some(
                non_empty(compensation.and_then(|c| c.currency.as_ref()))
                    .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            ),
            posted_date: job.date_posted.as_deref().and_then(parse_date),
            application_deadline: None,
            application_url: website.clone().unwrap_or_default(),
            skills: parse_array(job.requirements.as_ref().and_then(|r| r.technologies.as_ref())),
            benefits: Vec::new(),
            active: true,
            industry: None,
            company_website: website,
            experience_years,
            raw_data: Some(raw.clone()),
        }
    }
}

impl NormalizationRule for Provider2Rule {
    fn provider(&self) -> Provider {
        Provider::Provider2
    }

    fn normalize(&self, raw: &JsonValue) -> Result<Normalized, AdapterError> {
        if raw.get("status").and_then(JsonValue::as_str) != Some("success") {
            return Ok(Normalized::default());
        }
        let Some(jobs) = raw.pointer("/data/jobsList").and_then(JsonValue::as_object) else {
            return Ok(Normalized::default());
        };
        let mut out = Normalized::default();
        for (job_id, record) in jobs {
            match Provider2Job::deserialize(record) {
                Ok(job) => out.jobs.push(self.map_job(job_id, job, record)),
                Err(_) => out.skipped += 1,
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes raw payloads to the rule registered for each provider.
pub struct TransformDispatcher {
    provider1: Box<dyn NormalizationRule>,
    provider2: Box<dyn NormalizationRule>,
}

impl Default for TransformDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformDispatcher {
    pub fn new() -> Self {
        Self {
            provider1: Box::new(Provider1Rule),
            provider2: Box::new(Provider2Rule),
        }
    }

    /// Each rule must report the provider of the slot it fills.
    pub fn with_rules(
        provider1: Box<dyn NormalizationRule>,
        provider2: Box<dyn NormalizationRule>,
    ) -> Result<Self, TransformError> {
        for (slot, rule) in [(Provider::Provider1, &provider1), (Provider::Provider2, &provider2)] {
            if rule.provider() != slot {
                return Err(TransformError::MisplacedRule {
                    slot,
                    rule: rule.provider(),
                });
            }
        }
        Ok(Self {
            provider1,
            provider2,
        })
    }

    fn rule_for(&self, provider: Provider) -> &dyn NormalizationRule {
        match provider {
            Provider::Provider1 => self.provider1.as_ref(),
            Provider::Provider2 => self.provider2.as_ref(),
        }
    }

    /// Fails only for an unregistered provider key.
    pub fn transform(
        &self,
        provider_key: &str,
        raw: JsonValue,
    ) -> Result<Vec<UnifiedJob>, TransformError> {
        let provider = provider_key.parse::<Provider>()?;
        Ok(self.transform_provider(provider, raw))
    }

    /// Rule errors and panics are logged and degrade to an empty batch.
    pub fn transform_provider(&self, provider: Provider, raw: JsonValue) -> Vec<UnifiedJob> {
        let rule = self.rule_for(provider);
        match catch_unwind(AssertUnwindSafe(|| rule.normalize(&raw))) {
            Ok(Ok(normalized)) => {
                if normalized.skipped > 0 {
                    warn!(
                        provider = %provider,
                        skipped = normalized.skipped,
                        kept = normalized.jobs.len(),
                        "skipped malformed job records"
                    );
                }
                normalized.jobs
            }
            Ok(Err(err)) => {
                error!(provider = %provider, error = %err, "error transforming provider data");
                Vec::new()
            }
            Err(panic) => {
                error!(
                    provider = %provider,
                    panic = %panic_message(panic.as_ref()),
                    "normalization rule panicked"
                );
                Vec::new()
            }
        }
    }

    pub fn is_provider_supported(&self, provider_key: &str) -> bool {
        provider_key.parse::<Provider>().is_ok()
    }

    pub fn supported_providers(&self) -> Vec<Provider> {
        Provider::ALL.to_vec()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
