//! Shared I/O substrate for GRIP: the rate-limited portal fetcher, the raw
//! page archive, and the project repository backends.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grip_core::{ProjectRecord, ProjectStatus, ProjectType, Provenance};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "grip-storage";

// ---------------------------------------------------------------------------
// Page archive
// ---------------------------------------------------------------------------

/// A raw fetched body stored immutably under a hash-addressed path, so that
/// extraction regressions against a drifted portal can be replayed offline.
#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        host: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(host)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes using an atomic temp-file rename. Identical bodies land on
    /// the same path and are reported as deduplicated.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        host: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, host, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(StoredPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredPage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Portal fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Portal-wide request budget. Keeping this on by default is deliberate: the
/// source is a government portal and must not be hammered.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            refill_every: Duration::from_millis(750),
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_host_concurrency: 3,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedBody {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn looks_like_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("json"))
            .unwrap_or(false)
            || self.body.first().is_some_and(|b| *b == b'{' || *b == b'[')
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrying, rate-limited GET client for the portal. Concurrency is bounded
/// globally and per host; an optional token bucket spaces requests out.
#[derive(Debug)]
pub struct PortalFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<TokenBucket>>,
    backoff: BackoffPolicy,
}

impl PortalFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(TokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        host: &str,
        url: &str,
    ) -> Result<FetchedBody, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_host = self.per_host_semaphore(host).await;
        let _host = per_host.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("portal_fetch", %run_id, host, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedBody {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Project repository
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("registration id {0} already exists")]
    DuplicateRegistration(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectQuery {
    pub city: Option<String>,
    pub status: Option<ProjectStatus>,
    pub project_type: Option<ProjectType>,
    pub search: Option<String>,
    pub page: usize,
    pub limit: usize,
}

impl ProjectQuery {
    pub fn by_city(city: impl Into<String>, page: usize, limit: usize) -> Self {
        Self {
            city: Some(city.into()),
            page,
            limit,
            ..Default::default()
        }
    }

    fn page_bounds(&self, total: usize) -> (usize, usize, usize, usize) {
        let limit = self.limit.clamp(1, 200);
        let total_pages = total.max(1).div_ceil(limit);
        let page = self.page.max(1).min(total_pages);
        let offset = (page - 1) * limit;
        (page, limit, total_pages, offset)
    }

    fn matches(&self, record: &ProjectRecord) -> bool {
        if let Some(city) = &self.city {
            if !record.district.eq_ignore_ascii_case(city) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(project_type) = self.project_type {
            if record.project_type != project_type {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let haystack = format!(
                "{} {} {}",
                record.name.to_lowercase(),
                record.promoter_name.to_lowercase(),
                record.locality.to_lowercase()
            );
            if !haystack.contains(&needle) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    #[serde(rename = "totalPages")]
    pub total_pages: usize,
}

#[derive(Debug, Clone)]
pub struct PagedProjects {
    pub projects: Vec<ProjectRecord>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RepositoryStats {
    pub total: u64,
    pub by_city: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    pub by_provenance: BTreeMap<String, u64>,
    /// Projects approved within the last 180 days. Records whose approval
    /// date could not be parsed are excluded, never an error.
    pub recently_approved: u64,
}

fn recent_approval_cutoff() -> chrono::NaiveDate {
    Utc::now().date_naive() - chrono::Days::new(180)
}

/// The pipeline's sole output sink. Upsert is keyed on `registration_id`;
/// batch upserts are atomic so readers never observe a torn run.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn upsert_batch(
        &self,
        records: &[ProjectRecord],
    ) -> Result<UpsertOutcome, RepositoryError>;

    /// Insert refusing to overwrite: the admin single-add path. Distinct from
    /// the batch-upsert path used by ingestion.
    async fn insert_new(&self, record: &ProjectRecord) -> Result<(), RepositoryError>;

    async fn find_by_registration_id(
        &self,
        registration_id: &str,
    ) -> Result<Option<ProjectRecord>, RepositoryError>;

    async fn query(&self, query: &ProjectQuery) -> Result<PagedProjects, RepositoryError>;

    async fn stats(&self) -> Result<RepositoryStats, RepositoryError>;

    async fn clear_all(&self) -> Result<u64, RepositoryError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// BTreeMap-backed repository used by tests and local development. Iteration
/// order (registration id) makes pagination deterministic.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: RwLock<BTreeMap<String, ProjectRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectRepository for MemoryRepository {
    async fn upsert_batch(
        &self,
        records: &[ProjectRecord],
    ) -> Result<UpsertOutcome, RepositoryError> {
        let mut map = self.records.write().await;
        let mut outcome = UpsertOutcome::default();
        for record in records {
            match map.insert(record.registration_id.clone(), record.clone()) {
                Some(_) => outcome.updated += 1,
                None => outcome.inserted += 1,
            }
        }
        Ok(outcome)
    }

    async fn insert_new(&self, record: &ProjectRecord) -> Result<(), RepositoryError> {
        let mut map = self.records.write().await;
        if map.contains_key(&record.registration_id) {
            return Err(RepositoryError::DuplicateRegistration(
                record.registration_id.clone(),
            ));
        }
        map.insert(record.registration_id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_registration_id(
        &self,
        registration_id: &str,
    ) -> Result<Option<ProjectRecord>, RepositoryError> {
        Ok(self.records.read().await.get(registration_id).cloned())
    }

    async fn query(&self, query: &ProjectQuery) -> Result<PagedProjects, RepositoryError> {
        let map = self.records.read().await;
        let matched: Vec<&ProjectRecord> =
            map.values().filter(|record| query.matches(record)).collect();
        let total = matched.len();
        let (page, limit, total_pages, offset) = query.page_bounds(total);
        let projects = matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(PagedProjects {
            projects,
            pagination: Pagination {
                page,
                limit,
                total,
                total_pages,
            },
        })
    }

    async fn stats(&self) -> Result<RepositoryStats, RepositoryError> {
        let map = self.records.read().await;
        let cutoff = recent_approval_cutoff();
        let mut stats = RepositoryStats {
            total: map.len() as u64,
            ..Default::default()
        };
        for record in map.values() {
            *stats.by_city.entry(record.district.clone()).or_default() += 1;
            *stats.by_status.entry(record.status.to_string()).or_default() += 1;
            *stats
                .by_provenance
                .entry(record.provenance.to_string())
                .or_default() += 1;
            if record.approved_on.is_some_and(|date| date >= cutoff) {
                stats.recently_approved += 1;
            }
        }
        Ok(stats)
    }

    async fn clear_all(&self) -> Result<u64, RepositoryError> {
        let mut map = self.records.write().await;
        let removed = map.len() as u64;
        map.clear();
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                registration_id    TEXT PRIMARY KEY,
                name               TEXT NOT NULL,
                promoter_name      TEXT NOT NULL,
                project_type       TEXT NOT NULL,
                status             TEXT NOT NULL,
                district           TEXT NOT NULL,
                locality           TEXT NOT NULL,
                pincode            TEXT NOT NULL,
                address            TEXT NOT NULL,
                approved_on        DATE,
                completion_date    DATE,
                total_units        INTEGER NOT NULL,
                available_units    INTEGER NOT NULL,
                booking_percentage SMALLINT NOT NULL,
                project_area       DOUBLE PRECISION NOT NULL,
                total_buildings    INTEGER NOT NULL,
                provenance         TEXT NOT NULL,
                low_confidence     BOOLEAN NOT NULL,
                fetched_at         TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_projects_district ON projects (LOWER(district))")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<ProjectRecord, sqlx::Error> {
        let project_type: String = row.try_get("project_type")?;
        let status: String = row.try_get("status")?;
        let provenance: String = row.try_get("provenance")?;
        Ok(ProjectRecord {
            registration_id: row.try_get("registration_id")?,
            name: row.try_get("name")?,
            promoter_name: row.try_get("promoter_name")?,
            project_type: project_type.parse().unwrap_or(ProjectType::Other),
            status: status.parse().unwrap_or(ProjectStatus::Other),
            district: row.try_get("district")?,
            locality: row.try_get("locality")?,
            pincode: row.try_get("pincode")?,
            address: row.try_get("address")?,
            approved_on: row.try_get("approved_on")?,
            completion_date: row.try_get("completion_date")?,
            total_units: row.try_get::<i32, _>("total_units")? as u32,
            available_units: row.try_get::<i32, _>("available_units")? as u32,
            booking_percentage: row.try_get::<i16, _>("booking_percentage")? as u8,
            project_area: row.try_get("project_area")?,
            total_buildings: row.try_get::<i32, _>("total_buildings")? as u32,
            provenance: provenance.parse().unwrap_or(Provenance::LiveExtraction),
            low_confidence: row.try_get("low_confidence")?,
            fetched_at: row.try_get("fetched_at")?,
        })
    }

    fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &ProjectQuery) {
        let mut first = true;
        let mut sep = |builder: &mut QueryBuilder<'a, Postgres>| {
            builder.push(if std::mem::take(&mut first) {
                " WHERE "
            } else {
                " AND "
            });
        };
        if let Some(city) = &query.city {
            sep(builder);
            builder
                .push("LOWER(district) = LOWER(")
                .push_bind(city.clone())
                .push(")");
        }
        if let Some(status) = query.status {
            sep(builder);
            builder.push("status = ").push_bind(status.to_string());
        }
        if let Some(project_type) = query.project_type {
            sep(builder);
            builder
                .push("project_type = ")
                .push_bind(project_type.to_string());
        }
        if let Some(search) = &query.search {
            sep(builder);
            builder
                .push("(name ILIKE ")
                .push_bind(format!("%{search}%"))
                .push(" OR promoter_name ILIKE ")
                .push_bind(format!("%{search}%"))
                .push(" OR locality ILIKE ")
                .push_bind(format!("%{search}%"))
                .push(")");
        }
    }
}

#[async_trait]
impl ProjectRepository for PgRepository {
    async fn upsert_batch(
        &self,
        records: &[ProjectRecord],
    ) -> Result<UpsertOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = UpsertOutcome::default();
        for record in records {
            let row = sqlx::query(
                r#"
                INSERT INTO projects (
                    registration_id, name, promoter_name, project_type, status,
                    district, locality, pincode, address, approved_on,
                    completion_date, total_units, available_units,
                    booking_percentage, project_area, total_buildings,
                    provenance, low_confidence, fetched_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
                ON CONFLICT (registration_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    promoter_name = EXCLUDED.promoter_name,
                    project_type = EXCLUDED.project_type,
                    status = EXCLUDED.status,
                    district = EXCLUDED.district,
                    locality = EXCLUDED.locality,
                    pincode = EXCLUDED.pincode,
                    address = EXCLUDED.address,
                    approved_on = EXCLUDED.approved_on,
                    completion_date = EXCLUDED.completion_date,
                    total_units = EXCLUDED.total_units,
                    available_units = EXCLUDED.available_units,
                    booking_percentage = EXCLUDED.booking_percentage,
                    project_area = EXCLUDED.project_area,
                    total_buildings = EXCLUDED.total_buildings,
                    provenance = EXCLUDED.provenance,
                    low_confidence = EXCLUDED.low_confidence,
                    fetched_at = EXCLUDED.fetched_at
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(&record.registration_id)
            .bind(&record.name)
            .bind(&record.promoter_name)
            .bind(record.project_type.to_string())
            .bind(record.status.to_string())
            .bind(&record.district)
            .bind(&record.locality)
            .bind(&record.pincode)
            .bind(&record.address)
            .bind(record.approved_on)
            .bind(record.completion_date)
            .bind(record.total_units as i32)
            .bind(record.available_units as i32)
            .bind(record.booking_percentage as i16)
            .bind(record.project_area)
            .bind(record.total_buildings as i32)
            .bind(record.provenance.to_string())
            .bind(record.low_confidence)
            .bind(record.fetched_at)
            .fetch_one(&mut *tx)
            .await?;

            if row.try_get::<bool, _>("inserted")? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn insert_new(&self, record: &ProjectRecord) -> Result<(), RepositoryError> {
        if self
            .find_by_registration_id(&record.registration_id)
            .await?
            .is_some()
        {
            return Err(RepositoryError::DuplicateRegistration(
                record.registration_id.clone(),
            ));
        }
        self.upsert_batch(std::slice::from_ref(record)).await?;
        Ok(())
    }

    async fn find_by_registration_id(
        &self,
        registration_id: &str,
    ) -> Result<Option<ProjectRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM projects WHERE registration_id = $1")
            .bind(registration_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose().map_err(Into::into)
    }

    async fn query(&self, query: &ProjectQuery) -> Result<PagedProjects, RepositoryError> {
        let mut count_builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM projects");
        Self::push_filters(&mut count_builder, query);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let (page, limit, total_pages, offset) = query.page_bounds(total as usize);

        let mut select_builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM projects");
        Self::push_filters(&mut select_builder, query);
        select_builder
            .push(" ORDER BY registration_id LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = select_builder.build().fetch_all(&self.pool).await?;
        let projects = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PagedProjects {
            projects,
            pagination: Pagination {
                page,
                limit,
                total: total as usize,
                total_pages,
            },
        })
    }

    async fn stats(&self) -> Result<RepositoryStats, RepositoryError> {
        let mut stats = RepositoryStats::default();
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM projects")
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;
        stats.total = total as u64;

        stats.by_city = self.count_grouped_by("district").await?;
        stats.by_status = self.count_grouped_by("status").await?;
        stats.by_provenance = self.count_grouped_by("provenance").await?;

        let recent: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM projects WHERE approved_on IS NOT NULL AND approved_on >= $1",
        )
        .bind(recent_approval_cutoff())
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;
        stats.recently_approved = recent as u64;

        Ok(stats)
    }

    async fn clear_all(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM projects")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

impl PgRepository {
    async fn count_grouped_by(
        &self,
        column: &'static str,
    ) -> Result<BTreeMap<String, u64>, RepositoryError> {
        let sql = format!("SELECT {column} AS key, COUNT(*) AS n FROM projects GROUP BY {column}");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let n: i64 = row.try_get("n")?;
            out.insert(key, n as u64);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(registration_id: &str, district: &str) -> ProjectRecord {
        ProjectRecord {
            registration_id: registration_id.to_string(),
            name: format!("Project {registration_id}"),
            promoter_name: "Acme Developers".to_string(),
            project_type: ProjectType::Residential,
            status: ProjectStatus::Ongoing,
            district: district.to_string(),
            locality: "Bopal".to_string(),
            pincode: "380058".to_string(),
            address: "Near SG Highway".to_string(),
            approved_on: None,
            completion_date: None,
            total_units: 100,
            available_units: 40,
            booking_percentage: grip_core::booking_percentage(100, 40),
            project_area: 12000.0,
            total_buildings: 4,
            provenance: Provenance::LiveExtraction,
            low_confidence: false,
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn page_hashing_is_stable() {
        let hash = PageArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();

        let first = archive
            .store_page(fetched_at, "gujrera.gujarat.gov.in", "html", b"<html>same</html>")
            .await
            .expect("first store");
        let second = archive
            .store_page(fetched_at, "gujrera.gujarat.gov.in", "html", b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn memory_upsert_is_keyed_on_registration_id() {
        let repo = MemoryRepository::new();
        let a = record("PR/GJ/AHMEDABAD/A/AUDA/MAA00001/010120", "Ahmedabad");
        let mut a2 = a.clone();
        a2.name = "Renamed".to_string();

        let first = repo.upsert_batch(&[a.clone()]).await.unwrap();
        assert_eq!(first, UpsertOutcome { inserted: 1, updated: 0 });

        let second = repo.upsert_batch(&[a2.clone()]).await.unwrap();
        assert_eq!(second, UpsertOutcome { inserted: 0, updated: 1 });

        let found = repo
            .find_by_registration_id(&a.registration_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "Renamed");
    }

    #[tokio::test]
    async fn insert_new_rejects_duplicates() {
        let repo = MemoryRepository::new();
        let a = record("PR/GJ/SURAT/S/SUDA/RAA00001/010120", "Surat");
        repo.insert_new(&a).await.unwrap();
        let err = repo.insert_new(&a).await.unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateRegistration(_)));
    }

    #[tokio::test]
    async fn city_query_is_case_insensitive_and_paged() {
        let repo = MemoryRepository::new();
        let mut batch = Vec::new();
        for i in 0..40 {
            batch.push(record(
                &format!("PR/GJ/AHMEDABAD/A/AUDA/MAA{i:05}/010120"),
                "Ahmedabad",
            ));
        }
        for i in 0..10 {
            batch.push(record(
                &format!("PR/GJ/SURAT/S/SUDA/RAA{i:05}/010120"),
                "Surat",
            ));
        }
        repo.upsert_batch(&batch).await.unwrap();

        let page = repo
            .query(&ProjectQuery::by_city("ahmedabad", 1, 20))
            .await
            .unwrap();
        assert_eq!(page.pagination.total, 40);
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.projects.len(), 20);
        assert!(page.projects.iter().all(|p| p.district == "Ahmedabad"));
    }

    #[tokio::test]
    async fn stats_break_down_by_provenance() {
        let repo = MemoryRepository::new();
        let mut synthetic = record("PR/GJ/RAJKOT/R/RUDA/RAA00009/010120", "Rajkot");
        synthetic.provenance = Provenance::Synthetic;
        repo.upsert_batch(&[
            record("PR/GJ/RAJKOT/R/RUDA/RAA00008/010120", "Rajkot"),
            synthetic,
        ])
        .await
        .unwrap();

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_city.get("Rajkot"), Some(&2));
        assert_eq!(stats.by_provenance.get("synthetic"), Some(&1));
        assert_eq!(stats.by_provenance.get("live_extraction"), Some(&1));
    }

    #[tokio::test]
    async fn recently_approved_excludes_dateless_records() {
        let repo = MemoryRepository::new();
        let mut fresh = record("PR/GJ/ANAND/A/AUDA/MAA00100/010120", "Anand");
        fresh.approved_on = Some(Utc::now().date_naive() - chrono::Days::new(30));
        let mut stale = record("PR/GJ/ANAND/A/AUDA/MAA00101/010120", "Anand");
        stale.approved_on = Some(Utc::now().date_naive() - chrono::Days::new(400));
        // unparsable approval date ended up as None; excluded, not an error
        let dateless = record("PR/GJ/ANAND/A/AUDA/MAA00102/010120", "Anand");

        repo.upsert_batch(&[fresh, stale, dateless]).await.unwrap();
        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.recently_approved, 1);
    }

    #[tokio::test]
    async fn clear_all_reports_removed_count() {
        let repo = MemoryRepository::new();
        repo.upsert_batch(&[record("PR/GJ/SURAT/S/SUDA/RAA00002/010120", "Surat")])
            .await
            .unwrap();
        assert_eq!(repo.clear_all().await.unwrap(), 1);
        assert_eq!(repo.stats().await.unwrap().total, 0);
    }
}
