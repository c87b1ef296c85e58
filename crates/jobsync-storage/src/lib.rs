//! Provider fetch with retry, plus the job offer store (Postgres and in-memory).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsync_core::{
    JobOffer, JobOfferQuery, Provider, ProviderStats, SyncSummary, UnifiedJob, UpsertOutcome,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-storage";

/// Rows written per `INSERT ... ON CONFLICT` statement.
pub const UPSERT_BATCH_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Linear: the pause after failed attempt `n` (1-based) is `base_delay * n`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        execute_with_retry(operation, self.max_attempts, self.base_delay).await
    }
}

/// Runs `operation` up to `max_attempts` times (at least once), sleeping
/// linearly longer between failures. Returns the last error when exhausted.
pub async fn execute_with_retry<T, E, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let policy = RetryPolicy {
        max_attempts: max_attempts.max(1),
        base_delay,
    };
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "request failed (attempt {attempt}/{})",
                    policy.max_attempts
                );
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Provider fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One GET of a provider feed, decoded as JSON.
#[async_trait]
pub trait ProviderFetcher: Send + Sync {
    async fn fetch(&self, provider: Provider, url: &str) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.bytes().await?;
        debug!(bytes = body.len(), "fetched provider payload");
        decode_payload(&body)
    }
}

#[async_trait]
impl ProviderFetcher for HttpFetcher {
    async fn fetch(&self, provider: Provider, url: &str) -> Result<JsonValue, FetchError> {
        let _permit = self.global_limit.acquire().await.ok();
        let span = info_span!("http_fetch", %provider, url);
        self.get_json(url).instrument(span).await
    }
}

/// A blank body decodes to JSON `null`. Emptiness is judged by the caller
/// once retries are over.
pub fn decode_payload(body: &[u8]) -> Result<JsonValue, FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(JsonValue::Null);
    }
    Ok(serde_json::from_slice(body)?)
}

// ---------------------------------------------------------------------------
// Job store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Persistence keyed by `(external_id, provider)`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert new jobs, overwrite existing ones. Safe to repeat.
    async fn batch_upsert(&self, jobs: &[UnifiedJob]) -> Result<UpsertOutcome, StoreError>;

    /// Mark active rows of `provider` last synced before `cutoff` inactive.
    async fn deactivate_stale(
        &self,
        provider: Provider,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn sync_summary(&self) -> Result<SyncSummary, StoreError>;

    /// One page of active offers, newest first, plus the total match count.
    async fn find_with_filters(
        &self,
        query: &JobOfferQuery,
    ) -> Result<(Vec<JobOffer>, u64), StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobOffer>, StoreError>;
}

/// Later occurrences of a natural key win; order of survivors is kept.
pub fn dedupe_by_natural_key(jobs: &[UnifiedJob]) -> Vec<&UnifiedJob> {
    let mut seen = HashSet::new();
    let mut out = jobs
        .iter()
        .rev()
        .filter(|&job| seen.insert(job.natural_key()))
        .collect::<Vec<_>>();
    out.reverse();
    out
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    rows: RwLock<HashMap<(String, Provider), JobOffer>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert with an explicit sync timestamp.
    pub async fn upsert_at(&self, jobs: &[UnifiedJob], synced_at: DateTime<Utc>) -> UpsertOutcome {
        let mut rows = self.rows.write().await;
        let mut outcome = UpsertOutcome::default();
        for job in dedupe_by_natural_key(jobs) {
            let key = (job.external_id.clone(), job.provider);
            match rows.get_mut(&key) {
                Some(existing) => {
                    existing.refresh(job.clone(), synced_at);
                    outcome.updated += 1;
                }
                None => {
                    rows.insert(key, JobOffer::new(job.clone(), synced_at));
                    outcome.saved += 1;
                }
            }
        }
        outcome
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn get(&self, external_id: &str, provider: Provider) -> Option<JobOffer> {
        self.rows
            .read()
            .await
            .get(&(external_id.to_string(), provider))
            .cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn batch_upsert(&self, jobs: &[UnifiedJob]) -> Result<UpsertOutcome, StoreError> {
        Ok(self.upsert_at(jobs, Utc::now()).await)
    }

    async fn deactivate_stale(
        &self,
        provider: Provider,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.write().await;
        let mut count = 0;
        for offer in rows.values_mut() {
            if offer.job.provider == provider && offer.job.active && offer.last_synced_at < cutoff {
                offer.job.active = false;
                offer.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn sync_summary(&self) -> Result<SyncSummary, StoreError> {
        let rows = self.rows.read().await;
        let mut per_provider: BTreeMap<Provider, ProviderStats> = BTreeMap::new();
        for offer in rows.values() {
            let stats = per_provider
                .entry(offer.job.provider)
                .or_insert_with(|| ProviderStats {
                    provider: offer.job.provider.to_string(),
                    count: 0,
                    active_count: 0,
                    last_sync: None,
                });
            stats.count += 1;
            if offer.job.active {
                stats.active_count += 1;
            }
            stats.last_sync = stats.last_sync.max(Some(offer.last_synced_at));
        }
        Ok(summarize(per_provider.into_values().collect()))
    }

    async fn find_with_filters(
        &self,
        query: &JobOfferQuery,
    ) -> Result<(Vec<JobOffer>, u64), StoreError> {
        let rows = self.rows.read().await;
        let mut matched = rows
            .values()
            .filter(|offer| query.matches(offer))
            .cloned()
            .collect::<Vec<_>>();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.page_size() as usize)
            .collect();
        Ok((page, total))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobOffer>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|offer| offer.id == id)
            .cloned())
    }
}

fn summarize(providers: Vec<ProviderStats>) -> SyncSummary {
    SyncSummary {
        last_sync: providers.iter().filter_map(|p| p.last_sync).max(),
        total_count: providers.iter().map(|p| p.count).sum(),
        active_count: providers.iter().map(|p| p.active_count).sum(),
        providers,
    }
}

const OFFER_COLUMNS: &str = "id, external_id, provider, title, company, description, location, \
     employment_type, experience_level, min_salary, max_salary, currency, posted_date, \
     application_deadline, application_url, skills, benefits, active, industry, \
     company_website, experience_years, raw_data, created_at, updated_at, last_synced_at";

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn upsert_chunk(
        &self,
        chunk: &[&UnifiedJob],
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("INSERT INTO job_offers ({OFFER_COLUMNS}) "));
        builder.push_values(chunk, |mut b, job| {
            b.push_bind(Uuid::new_v4())
                .push_bind(job.external_id.clone())
                .push_bind(job.provider.as_str())
                .push_bind(job.title.clone())
                .push_bind(job.company.clone())
                .push_bind(job.description.clone())
                .push_bind(job.location.clone())
                .push_bind(job.employment_type.clone())
                .push_bind(job.experience_level.clone())
                .push_bind(job.min_salary)
                .push_bind(job.max_salary)
                .push_bind(job.currency.clone())
                .push_bind(job.posted_date)
                .push_bind(job.application_deadline)
                .push_bind(job.application_url.clone())
                .push_bind(job.skills.clone())
                .push_bind(job.benefits.clone())
                .push_bind(job.active)
                .push_bind(job.industry.clone())
                .push_bind(job.company_website.clone())
                .push_bind(job.experience_years)
                .push_bind(job.raw_data.clone())
                .push_bind(synced_at)
                .push_bind(synced_at)
                .push_bind(synced_at);
        });
        builder.push(
            r#"
            ON CONFLICT (external_id, provider) DO UPDATE SET
                title = EXCLUDED.title,
                company = EXCLUDED.company,
                description = EXCLUDED.description,
                location = EXCLUDED.location,
                employment_type = EXCLUDED.employment_type,
                experience_level = EXCLUDED.experience_level,
                min_salary = EXCLUDED.min_salary,
                max_salary = EXCLUDED.max_salary,
                currency = EXCLUDED.currency,
                posted_date = EXCLUDED.posted_date,
                application_deadline = EXCLUDED.application_deadline,
                application_url = EXCLUDED.application_url,
                skills = EXCLUDED.skills,
                benefits = EXCLUDED.benefits,
                active = EXCLUDED.active,
                industry = EXCLUDED.industry,
                company_website = EXCLUDED.company_website,
                experience_years = EXCLUDED.experience_years,
                raw_data = EXCLUDED.raw_data,
                updated_at = EXCLUDED.updated_at,
                last_synced_at = EXCLUDED.last_synced_at
            RETURNING (xmax = 0) AS inserted
            "#,
        );

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut outcome = UpsertOutcome::default();
        for row in rows {
            if row.try_get::<bool, _>("inserted")? {
                outcome.saved += 1;
            } else {
                outcome.updated += 1;
            }
        }
        Ok(outcome)
    }
}

fn like_pattern(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &JobOfferQuery) {
    builder.push(" WHERE active = TRUE");
    for (column, value) in [
        ("title", &query.title),
        ("location", &query.location),
        ("company", &query.company),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            builder
                .push(format!(" AND {column} ILIKE "))
                .push_bind(like_pattern(value));
        }
    }
    if let Some(min) = query.min_salary {
        builder.push(" AND max_salary >= ").push_bind(min);
    }
    if let Some(max) = query.max_salary {
        builder.push(" AND min_salary <= ").push_bind(max);
    }
    if !query.skills.is_empty() {
        builder.push(" AND skills && ").push_bind(query.skills.clone());
    }
}

fn offer_from_row(row: &PgRow) -> Result<JobOffer, StoreError> {
    let provider: String = row.try_get("provider")?;
    let provider = provider
        .parse::<Provider>()
        .map_err(|err| StoreError::InvalidRow(err.to_string()))?;
    Ok(JobOffer {
        id: row.try_get("id")?,
        job: UnifiedJob {
            external_id: row.try_get("external_id")?,
            provider,
            title: row.try_get("title")?,
            company: row.try_get("company")?,
            description: row.try_get("description")?,
            location: row.try_get("location")?,
            employment_type: row.try_get("employment_type")?,
            experience_level: row.try_get("experience_level")?,
            min_salary: row.try_get("min_salary")?,
            max_salary: row.try_get("max_salary")?,
            currency: row.try_get("currency")?,
            posted_date: row.try_get("posted_date")?,
            application_deadline: row.try_get("application_deadline")?,
            application_url: row.try_get("application_url")?,
            skills: row.try_get("skills")?,
            benefits: row.try_get("benefits")?,
            active: row.try_get("active")?,
            industry: row.try_get("industry")?,
            company_website: row.try_get("company_website")?,
            experience_years: row.try_get("experience_years")?,
            raw_data: row.try_get("raw_data")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn batch_upsert(&self, jobs: &[UnifiedJob]) -> Result<UpsertOutcome, StoreError> {
        let unique = dedupe_by_natural_key(jobs);
        let synced_at = Utc::now();
        let mut outcome = UpsertOutcome::default();
        for (index, chunk) in unique.chunks(UPSERT_BATCH_SIZE).enumerate() {
            let chunk_outcome = self.upsert_chunk(chunk, synced_at).await?;
            debug!(
                chunk = index,
                rows = chunk.len(),
                saved = chunk_outcome.saved,
                updated = chunk_outcome.updated,
                "upserted job offer chunk"
            );
            outcome = outcome.merge(chunk_outcome);
        }
        Ok(outcome)
    }

    async fn deactivate_stale(
        &self,
        provider: Provider,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_offers
               SET active = FALSE, updated_at = now()
             WHERE provider = $1
               AND last_synced_at < $2
               AND active = TRUE
            "#,
        )
        .bind(provider.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn sync_summary(&self) -> Result<SyncSummary, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT provider,
                   COUNT(*) AS count,
                   COUNT(*) FILTER (WHERE active) AS active_count,
                   MAX(last_synced_at) AS last_sync
              FROM job_offers
             GROUP BY provider
             ORDER BY provider
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut providers = Vec::with_capacity(rows.len());
        for row in rows {
            providers.push(ProviderStats {
                provider: row.try_get("provider")?,
                count: row.try_get::<i64, _>("count")?.max(0) as u64,
                active_count: row.try_get::<i64, _>("active_count")?.max(0) as u64,
                last_sync: row.try_get("last_sync")?,
            });
        }
        Ok(summarize(providers))
    }

    async fn find_with_filters(
        &self,
        query: &JobOfferQuery,
    ) -> Result<(Vec<JobOffer>, u64), StoreError> {
        let mut count_builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM job_offers");
        push_filters(&mut count_builder, query);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {OFFER_COLUMNS} FROM job_offers"));
        push_filters(&mut builder, query);
        builder
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(i64::from(query.page_size()))
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);
        let rows = builder.build().fetch_all(&self.pool).await?;
        let offers = rows.iter().map(offer_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((offers, total.max(0) as u64))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobOffer>, StoreError> {
        let row = sqlx::query(&format!("SELECT {OFFER_COLUMNS} FROM job_offers WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(offer_from_row).transpose()
    }
}
