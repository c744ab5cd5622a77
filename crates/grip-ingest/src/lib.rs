//! Ingestion pipeline orchestration: normalization, deduplication, strategy
//! selection and the run lifecycle.
//!
//! The flow per run is fixed: strategies are tried in priority order until
//! one clears the viability threshold, the accepted raw set is deduplicated,
//! normalized into canonical records and upserted in one batch. When every
//! strategy comes back dry the synthetic generator fills in, and the run is
//! reported as partial rather than completed.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use grip_core::{
    booking_percentage, district_from_registration_id, synthesized_registration_key, CancelFlag,
    ProjectRecord, ProjectStatus, ProjectType, Provenance, RawRecord,
};
use grip_extract::{
    fields, strategy_for_kind, ExtractTarget, ExtractionContext, ExtractionStrategy, StrategyKind,
    DEFAULT_STRATEGY_ORDER,
};
use grip_storage::{FetcherConfig, PageArchive, PortalFetcher, ProjectRepository};
use grip_synth::{generate_fallback, CityWeight};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grip-ingest";

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Why a raw record was excluded from the persisted batch. Dropped records
/// are counted in the run summary, never fatal to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("record carries neither a registration id nor a name")]
    MissingIdentity,
    #[error("district could not be extracted or derived")]
    MissingDistrict,
}

const NAME_ALIASES: &[&str] = &["project_name", "projectName", "name", "project"];
const PROMOTER_ALIASES: &[&str] = &[
    "promoter_name",
    "promoterName",
    "promoter",
    "developer",
    "builder_name",
    "builderName",
];
const TYPE_ALIASES: &[&str] = &["project_type", "projectType", "type", "category"];
const STATUS_ALIASES: &[&str] = &["status", "project_status", "projectStatus", "work_status"];
const DISTRICT_ALIASES: &[&str] = &["district", "district_name", "districtName", "city"];
const LOCALITY_ALIASES: &[&str] = &["locality", "area", "taluka", "village"];
const PINCODE_ALIASES: &[&str] = &["pincode", "pin_code", "pinCode", "postal_code"];
const ADDRESS_ALIASES: &[&str] = &["address", "project_address", "projectAddress", "site_address"];
const APPROVED_ALIASES: &[&str] = &[
    "approved_on",
    "approvedOn",
    "approval_date",
    "approvalDate",
    "registration_date",
    "registrationDate",
];
const COMPLETION_ALIASES: &[&str] = &[
    "completion_date",
    "completionDate",
    "end_date",
    "endDate",
    "proposed_completion",
];
const TOTAL_UNITS_ALIASES: &[&str] = &["total_units", "totalUnits", "units", "total_flats", "no_of_units"];
const AVAILABLE_UNITS_ALIASES: &[&str] = &[
    "available_units",
    "availableUnits",
    "unsold_units",
    "vacant_units",
];
const AREA_ALIASES: &[&str] = &["project_area", "projectArea", "area_sqmt", "total_area", "land_area"];
const BUILDINGS_ALIASES: &[&str] = &["total_buildings", "totalBuildings", "buildings", "towers", "blocks"];

/// Priority-ordered keyword table: first match wins, so the more specific
/// classes sit above the catch-alls.
const TYPE_KEYWORDS: &[(&str, ProjectType)] = &[
    ("township", ProjectType::Township),
    ("plot", ProjectType::Plotted),
    ("mixed", ProjectType::Mixed),
    ("commer", ProjectType::Commercial),
    ("shop", ProjectType::Commercial),
    ("office", ProjectType::Commercial),
    ("resid", ProjectType::Residential),
    ("group housing", ProjectType::Residential),
    ("apartment", ProjectType::Residential),
    ("flat", ProjectType::Residential),
];

const STATUS_KEYWORDS: &[(&str, ProjectStatus)] = &[
    ("under construction", ProjectStatus::Ongoing),
    ("ongoing", ProjectStatus::Ongoing),
    ("in progress", ProjectStatus::Ongoing),
    ("complet", ProjectStatus::Completed),
    ("delay", ProjectStatus::Delayed),
    ("stall", ProjectStatus::Stalled),
    ("registered", ProjectStatus::New),
    ("new", ProjectStatus::New),
];

/// Free source text into the closed type set. Empty input takes the
/// portal-wide default; text matching nothing in the table is `Other`.
pub fn classify_project_type(text: &str) -> ProjectType {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return ProjectType::default();
    }
    TYPE_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, t)| *t)
        .unwrap_or(ProjectType::Other)
}

pub fn classify_status(text: &str) -> ProjectStatus {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return ProjectStatus::default();
    }
    STATUS_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, s)| *s)
        .unwrap_or(ProjectStatus::Other)
}

fn coerce_u32(text: Option<&str>) -> u32 {
    text.and_then(fields::count)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

fn coerce_f64(text: Option<&str>) -> f64 {
    let Some(text) = text else { return 0.0 };
    fields::area(text)
        .or_else(|| text.trim().replace(',', "").parse().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0)
}

fn name_placeholder(registration_id: &str) -> String {
    let tail = registration_id
        .split('/')
        .rev()
        .find(|segment| !segment.trim().is_empty())
        .unwrap_or(registration_id);
    format!("Project {tail}")
}

/// Map a raw extraction into the canonical shape. Pure: no I/O, never
/// panics, coercion failures default instead of erroring. The booking
/// percentage is derived here (via the core helper) and nowhere else; any
/// incoming pre-computed value is discarded.
pub fn normalize(
    raw: &RawRecord,
    provenance: Provenance,
    fetched_at: DateTime<Utc>,
) -> Result<ProjectRecord, DropReason> {
    let registration_id = raw.registration_id().map(str::trim).filter(|s| !s.is_empty());
    let name = raw.first_of(NAME_ALIASES).map(str::trim).filter(|s| !s.is_empty());

    if registration_id.is_none() && name.is_none() {
        return Err(DropReason::MissingIdentity);
    }

    let district = raw
        .first_of(DISTRICT_ALIASES)
        .map(ToString::to_string)
        .or_else(|| registration_id.and_then(district_from_registration_id))
        .ok_or(DropReason::MissingDistrict)?;

    let mut low_confidence = raw.get("confidence") == Some("low");
    let registration_id = match registration_id {
        Some(id) => {
            if id.starts_with("SYN/") {
                low_confidence = true;
            }
            id.to_string()
        }
        None => {
            low_confidence = true;
            synthesized_registration_key(&district, name.unwrap_or_default())
        }
    };

    let name = name
        .map(ToString::to_string)
        .unwrap_or_else(|| name_placeholder(&registration_id));

    let total_units = coerce_u32(raw.first_of(TOTAL_UNITS_ALIASES));
    let available_units = coerce_u32(raw.first_of(AVAILABLE_UNITS_ALIASES)).min(total_units);

    Ok(ProjectRecord {
        name,
        promoter_name: raw.first_of(PROMOTER_ALIASES).unwrap_or_default().to_string(),
        project_type: classify_project_type(raw.first_of(TYPE_ALIASES).unwrap_or_default()),
        status: classify_status(raw.first_of(STATUS_ALIASES).unwrap_or_default()),
        district,
        locality: raw.first_of(LOCALITY_ALIASES).unwrap_or_default().to_string(),
        pincode: raw.first_of(PINCODE_ALIASES).unwrap_or_default().to_string(),
        address: raw.first_of(ADDRESS_ALIASES).unwrap_or_default().to_string(),
        approved_on: raw.first_of(APPROVED_ALIASES).and_then(fields::date),
        completion_date: raw.first_of(COMPLETION_ALIASES).and_then(fields::date),
        total_units,
        available_units,
        booking_percentage: booking_percentage(total_units, available_units),
        project_area: coerce_f64(raw.first_of(AREA_ALIASES)),
        total_buildings: coerce_u32(raw.first_of(BUILDINGS_ALIASES)),
        provenance,
        low_confidence,
        fetched_at,
        registration_id,
    })
}

// ---------------------------------------------------------------------------
// Deduplicator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub records: Vec<RawRecord>,
    pub collapsed: usize,
    pub synthesized_keys: usize,
    pub dropped_unidentified: usize,
}

/// Collapse raw extractions sharing a registration id, keeping the most
/// complete one (ties go to first-seen). Records without a registration id
/// get a deterministic synthesized key over `(district, name)` and are
/// flagged low-confidence; records with neither id nor name are dropped.
pub fn dedupe(records: Vec<RawRecord>) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    let mut index_by_key: HashMap<String, usize> = HashMap::new();

    for mut record in records {
        let key = match record.registration_id() {
            Some(id) => id.to_string(),
            None => {
                let name = record.first_of(NAME_ALIASES).unwrap_or_default().trim().to_string();
                if name.is_empty() {
                    outcome.dropped_unidentified += 1;
                    continue;
                }
                let district = record.first_of(DISTRICT_ALIASES).unwrap_or_default().to_string();
                let key = synthesized_registration_key(&district, &name);
                record.set("registration_no", key.clone());
                record.set("confidence", "low");
                outcome.synthesized_keys += 1;
                key
            }
        };

        match index_by_key.get(&key) {
            Some(&idx) => {
                outcome.collapsed += 1;
                if record.completeness() > outcome.records[idx].completeness() {
                    outcome.records[idx] = record;
                }
            }
            None => {
                index_by_key.insert(key, outcome.records.len());
                outcome.records.push(record);
            }
        }
    }

    outcome
}

// ---------------------------------------------------------------------------
// District registry
// ---------------------------------------------------------------------------

/// Districts the portal partitions by, plus the city weights the synthetic
/// generator uses. Real and fallback data cover the same geography because
/// both read this registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistrictRegistry {
    pub districts: Vec<String>,
    pub city_weights: Vec<CityWeight>,
}

impl DistrictRegistry {
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("reading {}: {err}", path.display()))?;
        serde_yaml::from_str(&text)
            .map_err(|err| anyhow::anyhow!("parsing {}: {err}", path.display()))
    }

    pub fn builtin() -> Self {
        let districts = [
            "Ahmedabad", "Amreli", "Anand", "Aravalli", "Banaskantha", "Bharuch",
            "Bhavnagar", "Botad", "Chhota Udaipur", "Dahod", "Dang", "Devbhoomi Dwarka",
            "Gandhinagar", "Gir Somnath", "Jamnagar", "Junagadh", "Kheda", "Kutch",
            "Mahisagar", "Mehsana", "Morbi", "Narmada", "Navsari", "Panchmahal",
            "Patan", "Porbandar", "Rajkot", "Sabarkantha", "Surat", "Surendranagar",
            "Tapi", "Vadodara", "Valsad",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        let weight = |city: &str, district: &str, localities: &[&str], target_count: usize| CityWeight {
            city: city.to_string(),
            district: district.to_string(),
            localities: localities.iter().map(ToString::to_string).collect(),
            target_count,
        };

        Self {
            districts,
            city_weights: vec![
                weight("Ahmedabad", "Ahmedabad", &["Bopal", "Shela", "Gota", "Satellite"], 40),
                weight("Surat", "Surat", &["Vesu", "Adajan", "Pal"], 25),
                weight("Vadodara", "Vadodara", &["Alkapuri", "Gotri", "Waghodia"], 15),
                weight("Rajkot", "Rajkot", &["Kalawad Road", "Mavdi"], 12),
                weight("Gandhinagar", "Gandhinagar", &["Kudasan", "Sargasan"], 8),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Run lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyAttempt {
    pub strategy: StrategyKind,
    pub pass: usize,
    pub records: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub state: RunState,
    pub scope_city: Option<String>,
    pub strategy_used: Option<StrategyKind>,
    pub record_count: usize,
    pub inserted: usize,
    pub updated: usize,
    pub provenance_breakdown: BTreeMap<String, usize>,
    pub duplicates_collapsed: usize,
    pub synthesized_keys: usize,
    pub dropped_records: usize,
    pub attempts: Vec<StrategyAttempt>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunSummary {
    fn running(run_id: Uuid, scope_city: Option<String>) -> Self {
        Self {
            run_id,
            state: RunState::Running,
            scope_city,
            strategy_used: None,
            record_count: 0,
            inserted: 0,
            updated: 0,
            provenance_breakdown: BTreeMap::new(),
            duplicates_collapsed: 0,
            synthesized_keys: 0,
            dropped_records: 0,
            attempts: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }
}

/// In-memory registry of run summaries, shared between the trigger endpoint
/// and in-flight runs. This is the only process-wide ingestion state; the
/// records themselves always live in the repository.
#[derive(Debug, Clone, Default)]
pub struct RunTracker {
    runs: Arc<RwLock<HashMap<Uuid, RunSummary>>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, summary: RunSummary) {
        self.runs.write().await.insert(summary.run_id, summary);
    }

    pub async fn get(&self, run_id: Uuid) -> Option<RunSummary> {
        self.runs.read().await.get(&run_id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub base_url: String,
    pub strategy_order: Vec<StrategyKind>,
    /// A strategy's result is accepted once it reaches this many records.
    pub min_viable_records: usize,
    pub max_pages: usize,
    /// Pause before the single whole-list retry pass.
    pub retry_cooldown: Duration,
    pub seed: u64,
    pub synthetic_fallback: bool,
    pub archive_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub registry: DistrictRegistry,
    pub fetcher: FetcherConfig,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gujrera.gujarat.gov.in".to_string(),
            strategy_order: DEFAULT_STRATEGY_ORDER.to_vec(),
            min_viable_records: 1,
            max_pages: 100,
            retry_cooldown: Duration::from_secs(30),
            seed: 17,
            synthetic_fallback: true,
            archive_dir: None,
            reports_dir: None,
            registry: DistrictRegistry::builtin(),
            fetcher: FetcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunScope {
    pub city: Option<String>,
    pub all_districts: bool,
}

impl RunScope {
    pub fn all() -> Self {
        Self {
            city: None,
            all_districts: true,
        }
    }

    pub fn city(name: impl Into<String>) -> Self {
        Self {
            city: Some(name.into()),
            all_districts: false,
        }
    }
}

pub struct Orchestrator {
    config: IngestionConfig,
    fetcher: Arc<PortalFetcher>,
    archive: Option<Arc<PageArchive>>,
    repository: Arc<dyn ProjectRepository>,
    strategies: Vec<Arc<dyn ExtractionStrategy>>,
    tracker: RunTracker,
}

impl Orchestrator {
    pub fn new(
        config: IngestionConfig,
        repository: Arc<dyn ProjectRepository>,
    ) -> anyhow::Result<Self> {
        let strategies = config
            .strategy_order
            .iter()
            .map(|kind| strategy_for_kind(*kind, config.seed))
            .collect();
        Self::with_strategies(config, repository, strategies)
    }

    /// Seam for tests and custom deployments: caller supplies the strategy
    /// list, priority order preserved.
    pub fn with_strategies(
        config: IngestionConfig,
        repository: Arc<dyn ProjectRepository>,
        strategies: Vec<Arc<dyn ExtractionStrategy>>,
    ) -> anyhow::Result<Self> {
        let fetcher = Arc::new(PortalFetcher::new(config.fetcher.clone())?);
        let archive = config
            .archive_dir
            .as_ref()
            .map(|dir| Arc::new(PageArchive::new(dir.clone())));
        Ok(Self {
            config,
            fetcher,
            archive,
            repository,
            strategies,
            tracker: RunTracker::new(),
        })
    }

    pub fn tracker(&self) -> RunTracker {
        self.tracker.clone()
    }

    pub fn repository(&self) -> Arc<dyn ProjectRepository> {
        self.repository.clone()
    }

    /// Execute one ingestion run to completion. Never returns an error: every
    /// failure mode is folded into the summary's terminal state so the
    /// scheduler and the status endpoint see the same picture.
    pub async fn run(&self, scope: RunScope, cancel: CancelFlag) -> RunSummary {
        let run_id = Uuid::new_v4();
        self.tracker
            .insert(RunSummary::running(run_id, scope.city.clone()))
            .await;
        self.run_registered(run_id, scope, cancel).await
    }

    /// Register a run as `Running` and return its id immediately; the run
    /// itself proceeds on a background task. This is the HTTP-trigger path:
    /// the returned id is already queryable through the tracker.
    pub async fn start_detached(self: Arc<Self>, scope: RunScope, cancel: CancelFlag) -> Uuid {
        let run_id = Uuid::new_v4();
        self.tracker
            .insert(RunSummary::running(run_id, scope.city.clone()))
            .await;
        tokio::spawn(async move {
            let summary = self.run_registered(run_id, scope, cancel).await;
            info!(%run_id, state = ?summary.state, "detached run finished");
        });
        run_id
    }

    async fn run_registered(
        &self,
        run_id: Uuid,
        scope: RunScope,
        cancel: CancelFlag,
    ) -> RunSummary {
        let mut summary = RunSummary::running(run_id, scope.city.clone());

        let ctx = ExtractionContext {
            run_id,
            base_url: self.config.base_url.clone(),
            fetcher: self.fetcher.clone(),
            archive: self.archive.clone(),
            districts: Arc::new(self.config.registry.districts.clone()),
            cancel: cancel.clone(),
            max_pages: self.config.max_pages,
        };
        let target = match &scope.city {
            Some(city) => ExtractTarget::district(city.clone()),
            None => ExtractTarget::portal_wide(),
        };

        let accepted = self.select_strategy(&target, &ctx, &cancel, &mut summary).await;

        match accepted {
            Some((kind, raw_records)) => {
                summary.strategy_used = Some(kind);
                let deduped = dedupe(raw_records);
                summary.duplicates_collapsed = deduped.collapsed;
                summary.synthesized_keys = deduped.synthesized_keys;
                summary.dropped_records = deduped.dropped_unidentified;

                let fetched_at = Utc::now();
                let mut records = Vec::with_capacity(deduped.records.len());
                for raw in &deduped.records {
                    match normalize(raw, Provenance::LiveExtraction, fetched_at) {
                        Ok(record) => records.push(record),
                        Err(reason) => {
                            summary.dropped_records += 1;
                            warn!(%run_id, %reason, "raw record dropped during normalization");
                        }
                    }
                }
                self.persist(records, RunState::Completed, &mut summary).await;
            }
            None if cancel.is_cancelled() => {
                summary.state = RunState::Partial;
                summary.error = Some("run cancelled before a strategy was accepted".to_string());
            }
            None if self.config.synthetic_fallback => {
                info!(%run_id, "all strategies exhausted, generating synthetic fallback");
                let records = generate_fallback(
                    self.config.seed,
                    Utc::now().date_naive(),
                    &self.config.registry.city_weights,
                );
                let records = match &scope.city {
                    Some(city) => records
                        .into_iter()
                        .filter(|r| r.district.eq_ignore_ascii_case(city))
                        .collect(),
                    None => records,
                };
                self.persist(records, RunState::Partial, &mut summary).await;
            }
            None => {
                summary.state = RunState::Failed;
                summary.error = Some("all extraction strategies exhausted".to_string());
            }
        }

        summary.finished_at = Some(Utc::now());
        self.write_report(&summary).await;
        self.tracker.insert(summary.clone()).await;
        summary
    }

    /// Try the configured strategies in priority order, with one whole-list
    /// retry after a cooldown. First result at or above the viability
    /// threshold wins; later strategies are skipped.
    async fn select_strategy(
        &self,
        target: &ExtractTarget,
        ctx: &ExtractionContext,
        cancel: &CancelFlag,
        summary: &mut RunSummary,
    ) -> Option<(StrategyKind, Vec<RawRecord>)> {
        for pass in 0..=1 {
            for strategy in &self.strategies {
                if cancel.is_cancelled() {
                    return None;
                }
                let kind = strategy.kind();
                match strategy.attempt(target, ctx).await {
                    Ok(records) => {
                        summary.attempts.push(StrategyAttempt {
                            strategy: kind,
                            pass,
                            records: records.len(),
                            error: None,
                        });
                        if records.len() >= self.config.min_viable_records {
                            info!(run_id = %ctx.run_id, strategy = %kind, count = records.len(), "strategy accepted");
                            return Some((kind, records));
                        }
                        info!(run_id = %ctx.run_id, strategy = %kind, count = records.len(), "below viability threshold");
                    }
                    Err(err) => {
                        warn!(run_id = %ctx.run_id, strategy = %kind, attempt = pass + 1, error = %err, "strategy failed");
                        summary.attempts.push(StrategyAttempt {
                            strategy: kind,
                            pass,
                            records: 0,
                            error: Some(err.to_string()),
                        });
                    }
                }
            }
            if pass == 0 && !self.strategies.is_empty() && !cancel.is_cancelled() {
                tokio::time::sleep(self.config.retry_cooldown).await;
            }
        }
        None
    }

    async fn persist(
        &self,
        records: Vec<ProjectRecord>,
        success_state: RunState,
        summary: &mut RunSummary,
    ) {
        for record in &records {
            *summary
                .provenance_breakdown
                .entry(record.provenance.to_string())
                .or_default() += 1;
        }
        summary.record_count = records.len();

        // A persistence failure is the one thing that fails the whole run:
        // silently losing extracted data is unacceptable.
        match self.repository.upsert_batch(&records).await {
            Ok(outcome) => {
                summary.inserted = outcome.inserted;
                summary.updated = outcome.updated;
                summary.state = success_state;
            }
            Err(err) => {
                summary.state = RunState::Failed;
                summary.error = Some(format!("repository upsert failed: {err}"));
            }
        }
    }

    async fn write_report(&self, summary: &RunSummary) {
        let Some(reports_dir) = &self.config.reports_dir else {
            return;
        };
        let dir = reports_dir.join(summary.run_id.to_string());
        let write = async {
            tokio::fs::create_dir_all(&dir).await?;
            let body = serde_json::to_vec_pretty(summary)?;
            tokio::fs::write(dir.join("summary.json"), body).await?;
            Ok::<_, anyhow::Error>(())
        };
        if let Err(err) = write.await {
            warn!(run_id = %summary.run_id, error = %err, "failed to write run report");
        }
    }
}
