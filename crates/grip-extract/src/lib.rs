//! Extraction strategy family for the Gujarat RERA portal.
//!
//! Each strategy encapsulates one technique for obtaining raw project rows
//! from the portal. All of them are best-effort: column-to-field assignment
//! is heuristic and a strategy returning an empty set is a normal outcome,
//! not an error. Only unrecoverable conditions (host unreachable, expected
//! page structure absent) surface as `StrategyError`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use grip_core::{CancelFlag, RawRecord};
use grip_storage::{FetchError, PageArchive, PortalFetcher};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grip-extract";

pub mod fields;

use fields::registration_id as match_registration_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    ApiProbe,
    PaginatedTable,
    DistrictPartitioned,
    HumanPaced,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::ApiProbe => "api-probe",
            StrategyKind::PaginatedTable => "paginated-table",
            StrategyKind::DistrictPartitioned => "district-partitioned",
            StrategyKind::HumanPaced => "human-paced",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("portal unreachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("page structure mismatch at {url}: {reason}")]
    StructuralMismatch { url: String, reason: String },
}

/// What a single attempt is scoped to. `district: None` means the portal-wide
/// listing.
#[derive(Debug, Clone, Default)]
pub struct ExtractTarget {
    pub district: Option<String>,
}

impl ExtractTarget {
    pub fn portal_wide() -> Self {
        Self::default()
    }

    pub fn district(name: impl Into<String>) -> Self {
        Self {
            district: Some(name.into()),
        }
    }
}

/// Shared per-run session state handed to every attempt. Cheap to clone;
/// everything heavyweight is behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    pub run_id: Uuid,
    pub base_url: String,
    pub fetcher: Arc<PortalFetcher>,
    pub archive: Option<Arc<PageArchive>>,
    pub districts: Arc<Vec<String>>,
    pub cancel: CancelFlag,
    pub max_pages: usize,
}

impl ExtractionContext {
    pub fn host(&self) -> String {
        let trimmed = self
            .base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        trimmed
            .split('/')
            .next()
            .unwrap_or(trimmed)
            .to_string()
    }

    async fn archive_body(&self, body: &grip_storage::FetchedBody) {
        let Some(archive) = &self.archive else {
            return;
        };
        let ext = if body.looks_like_json() { "json" } else { "html" };
        if let Err(err) = archive
            .store_page(Utc::now(), &self.host(), ext, &body.body)
            .await
        {
            warn!(run_id = %self.run_id, error = %err, "failed to archive fetched page");
        }
    }
}

#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Attempt one extraction pass. Empty success means "reachable, nothing
    /// matched"; `StrategyError` means this technique cannot work right now.
    async fn attempt(
        &self,
        target: &ExtractTarget,
        ctx: &ExtractionContext,
    ) -> Result<Vec<RawRecord>, StrategyError>;
}

// ---------------------------------------------------------------------------
// Listing-page parsing (shared by the table-walking strategies)
// ---------------------------------------------------------------------------

const HEADER_KEYWORDS: &[&str] = &["project", "rera", "promoter", "registration"];

#[derive(Debug, Default)]
pub struct ListingPage {
    pub records: Vec<RawRecord>,
    pub has_next: bool,
    pub table_found: bool,
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn selector(input: &str) -> Selector {
    Selector::parse(input).expect("static selector is valid")
}

/// Scan an HTML listing page for project tables. A table qualifies when its
/// header row mentions any project/RERA/promoter keyword; each following row
/// that contains a registration-id-shaped cell becomes a candidate record.
pub fn parse_listing_page(
    html: &str,
    source_url: &str,
    known_districts: &[String],
) -> ListingPage {
    let document = Html::parse_document(html);
    let table_sel = selector("table");
    let row_sel = selector("tr");
    let cell_sel = selector("th, td");

    let mut page = ListingPage::default();

    for table in document.select(&table_sel) {
        let mut rows = table.select(&row_sel);
        let Some(header) = rows.next() else {
            continue;
        };
        let header_text = element_text(header).to_lowercase();
        if !HEADER_KEYWORDS.iter().any(|kw| header_text.contains(kw)) {
            continue;
        }
        page.table_found = true;

        for row in rows {
            let cells: Vec<String> = row.select(&cell_sel).map(element_text).collect();
            if let Some(record) = record_from_cells(&cells, source_url, known_districts) {
                page.records.push(record);
            }
        }
    }

    page.has_next = find_next_control(&document);
    page
}

fn find_next_control(document: &Html) -> bool {
    let anchor_sel = selector("a");
    for anchor in document.select(&anchor_sel) {
        if anchor.value().attr("rel") == Some("next") {
            return true;
        }
        let text = element_text(anchor).to_lowercase();
        if matches!(text.as_str(), "next" | "next »" | "»" | ">") {
            return true;
        }
    }
    false
}

/// Heuristic row-to-record mapping. A row without a registration-id-shaped
/// cell is not a candidate. Remaining cells are assigned by content pattern
/// (dates, pincode, counts, known district names, enum keywords) and then by
/// position for the free-text fields. Approximate by design; the normalizer
/// downstream treats every field as optional.
pub fn record_from_cells(
    cells: &[String],
    source_url: &str,
    known_districts: &[String],
) -> Option<RawRecord> {
    let mut registration = None;
    let mut registration_idx = usize::MAX;
    for (idx, cell) in cells.iter().enumerate() {
        if let Some(id) = match_registration_id(cell) {
            registration = Some(id);
            registration_idx = idx;
            break;
        }
    }
    let registration = registration?;

    let mut record = RawRecord::new();
    record.source_url = Some(source_url.to_string());
    record.set("registration_no", registration);

    let mut dates_seen = 0usize;
    let mut counts: Vec<u64> = Vec::new();
    let mut texts: Vec<&str> = Vec::new();

    for (idx, cell) in cells.iter().enumerate() {
        if idx == registration_idx || cell.trim().is_empty() {
            continue;
        }
        if let Some(date) = fields::date(cell) {
            let key = if dates_seen == 0 {
                "approved_on"
            } else {
                "completion_date"
            };
            record.set(key, date.format("%d-%m-%Y").to_string());
            dates_seen += 1;
            continue;
        }
        if let Some(pincode) = fields::pincode(cell) {
            record.set("pincode", pincode);
            continue;
        }
        if let Some(area) = fields::area(cell) {
            record.set("project_area", area.to_string());
            continue;
        }
        if let Some(count) = fields::count(cell) {
            counts.push(count);
            continue;
        }
        if let Some(district) = known_districts
            .iter()
            .find(|d| d.eq_ignore_ascii_case(cell.trim()))
        {
            record.set("district", district.clone());
            continue;
        }
        if fields::looks_like_project_type(cell) {
            record.set("project_type", cell.clone());
            continue;
        }
        if fields::looks_like_status(cell) {
            record.set("status", cell.clone());
            continue;
        }
        texts.push(cell);
    }

    // positional fallback for the free-text columns: name, promoter, address
    let mut texts = texts.into_iter();
    if let Some(name) = texts.next() {
        record.set("project_name", name);
    }
    if let Some(promoter) = texts.next() {
        record.set("promoter_name", promoter);
    }
    if let Some(address) = texts.next() {
        record.set("address", address);
    }

    // positional fallback for the count columns: total, available, buildings
    let mut counts = counts.into_iter();
    if let Some(total) = counts.next() {
        record.set("total_units", total.to_string());
    }
    if let Some(available) = counts.next() {
        record.set("available_units", available.to_string());
    }
    if let Some(buildings) = counts.next() {
        record.set("total_buildings", buildings.to_string());
    }

    Some(record)
}

// ---------------------------------------------------------------------------
// JSON probing (shared by the API strategy)
// ---------------------------------------------------------------------------

const JSON_LIST_KEYS: &[&str] = &["data", "projects", "items", "rows", "result", "list"];

/// Flatten a JSON payload into raw records. Accepts a top-level array or an
/// object carrying an array under one of the usual envelope keys (one level
/// of nesting, e.g. `{"data": {"projects": [...]}}`).
pub fn records_from_json(value: &JsonValue, source_url: &str) -> Vec<RawRecord> {
    let items = match find_record_array(value) {
        Some(items) => items,
        None => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            let object = item.as_object()?;
            let mut record = RawRecord::new();
            record.source_url = Some(source_url.to_string());
            for (key, field) in object {
                match field {
                    JsonValue::String(s) => record.set(key.clone(), s.clone()),
                    JsonValue::Number(n) => record.set(key.clone(), n.to_string()),
                    JsonValue::Bool(b) => record.set(key.clone(), b.to_string()),
                    _ => {}
                }
            }
            if record.is_empty() {
                None
            } else {
                Some(record)
            }
        })
        .collect()
}

fn find_record_array(value: &JsonValue) -> Option<&Vec<JsonValue>> {
    if let Some(array) = value.as_array() {
        return Some(array);
    }
    let object = value.as_object()?;
    for key in JSON_LIST_KEYS {
        match object.get(*key) {
            Some(JsonValue::Array(array)) => return Some(array),
            Some(inner @ JsonValue::Object(_)) => {
                if let Some(array) = find_record_array(inner) {
                    return Some(array);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// URL building
// ---------------------------------------------------------------------------

fn encode_query_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '&' => out.push_str("%26"),
            '?' => out.push_str("%3F"),
            '#' => out.push_str("%23"),
            _ => out.push(c),
        }
    }
    out
}

fn listing_url(base_url: &str, district: Option<&str>, page: usize) -> String {
    let mut url = format!("{}/project-list?page={page}", base_url.trim_end_matches('/'));
    if let Some(district) = district {
        url.push_str("&district=");
        url.push_str(&encode_query_component(district));
    }
    url
}

// ---------------------------------------------------------------------------
// Page crawling (shared by paginated, district-partitioned, human-paced)
// ---------------------------------------------------------------------------

/// Randomized inter-page pacing for the human-paced variant. The delay is
/// drawn from an injected rng so runs are reproducible under a fixed seed.
#[derive(Debug)]
pub struct HumanPacer {
    min: Duration,
    max: Duration,
    rng: Mutex<StdRng>,
}

impl HumanPacer {
    pub fn new(min: Duration, max: Duration, seed: u64) -> Self {
        Self {
            min,
            max: max.max(min),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub async fn pause(&self) {
        let millis = {
            let mut rng = self.rng.lock().await;
            rng.gen_range(self.min.as_millis() as u64..=self.max.as_millis() as u64)
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

/// Walk sequential listing pages. Stops on: the page budget, the first page
/// that yields zero new records, a missing "next" control, cancellation, or
/// a mid-walk fetch failure (partial results are kept). A failure on page 1
/// is unrecoverable for the walk and propagates.
async fn crawl_pages(
    ctx: &ExtractionContext,
    district: Option<&str>,
    max_pages: usize,
    pacer: Option<&HumanPacer>,
) -> Result<Vec<RawRecord>, StrategyError> {
    let host = ctx.host();
    let mut seen: HashSet<String> = HashSet::new();
    let mut records = Vec::new();

    for page in 1..=max_pages.max(1) {
        if ctx.cancel.is_cancelled() {
            debug!(run_id = %ctx.run_id, page, "crawl cancelled between pages");
            break;
        }
        if page > 1 {
            if let Some(pacer) = pacer {
                pacer.pause().await;
            }
        }

        let url = listing_url(&ctx.base_url, district, page);
        let body = match ctx.fetcher.fetch(ctx.run_id, &host, &url).await {
            Ok(body) => body,
            Err(err) if page == 1 => {
                return Err(StrategyError::Unreachable { url, source: err });
            }
            Err(err) => {
                warn!(run_id = %ctx.run_id, page, error = %err, "stopping walk on fetch failure");
                break;
            }
        };
        ctx.archive_body(&body).await;

        let parsed = parse_listing_page(&body.text(), &body.final_url, &ctx.districts);
        if page == 1 && !parsed.table_found {
            return Err(StrategyError::StructuralMismatch {
                url,
                reason: "no listing table with a recognizable header".to_string(),
            });
        }

        let mut new_count = 0usize;
        for record in parsed.records {
            let key = record
                .registration_id()
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("row:{}:{}", page, new_count));
            if seen.insert(key) {
                records.push(record);
                new_count += 1;
            }
        }
        debug!(run_id = %ctx.run_id, page, new_count, "listing page walked");

        if new_count == 0 || !parsed.has_next {
            break;
        }
    }

    Ok(records)
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Probes a list of well-known REST-ish endpoint shapes. Any JSON-parseable
/// body counts as structural success; the first endpoint yielding records
/// wins.
pub struct ApiProbeStrategy {
    endpoint_patterns: Vec<String>,
}

impl ApiProbeStrategy {
    pub fn new() -> Self {
        Self {
            endpoint_patterns: [
                "/api/projects",
                "/api/project/list",
                "/api/v1/projects",
                "/projectlist/api/projects",
                "/reraapp/api/project-search",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }

    pub fn with_patterns(patterns: Vec<String>) -> Self {
        Self {
            endpoint_patterns: patterns,
        }
    }
}

impl Default for ApiProbeStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtractionStrategy for ApiProbeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ApiProbe
    }

    async fn attempt(
        &self,
        target: &ExtractTarget,
        ctx: &ExtractionContext,
    ) -> Result<Vec<RawRecord>, StrategyError> {
        let host = ctx.host();
        let base = ctx.base_url.trim_end_matches('/');
        let mut reachable = 0usize;
        let mut json_seen = false;
        let mut last_unreachable: Option<(String, FetchError)> = None;

        for pattern in &self.endpoint_patterns {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let mut url = format!("{base}{pattern}");
            if let Some(district) = &target.district {
                let sep = if url.contains('?') { '&' } else { '?' };
                url.push(sep);
                url.push_str("district=");
                url.push_str(&encode_query_component(district));
            }

            let body = match ctx.fetcher.fetch(ctx.run_id, &host, &url).await {
                Ok(body) => body,
                Err(err) => {
                    debug!(run_id = %ctx.run_id, url, error = %err, "endpoint probe failed");
                    last_unreachable = Some((url, err));
                    continue;
                }
            };
            reachable += 1;

            if !body.looks_like_json() {
                continue;
            }
            let Ok(value) = serde_json::from_slice::<JsonValue>(&body.body) else {
                continue;
            };
            json_seen = true;
            ctx.archive_body(&body).await;

            let records = records_from_json(&value, &body.final_url);
            if !records.is_empty() {
                return Ok(records);
            }
        }

        if reachable == 0 {
            if let Some((url, source)) = last_unreachable {
                return Err(StrategyError::Unreachable { url, source });
            }
        }
        if !json_seen {
            return Err(StrategyError::StructuralMismatch {
                url: format!("{base}/api/*"),
                reason: "no probed endpoint returned a JSON body".to_string(),
            });
        }
        Ok(Vec::new())
    }
}

/// Walks the portal-wide paginated listing table.
pub struct PaginatedTableStrategy;

#[async_trait]
impl ExtractionStrategy for PaginatedTableStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PaginatedTable
    }

    async fn attempt(
        &self,
        target: &ExtractTarget,
        ctx: &ExtractionContext,
    ) -> Result<Vec<RawRecord>, StrategyError> {
        crawl_pages(ctx, target.district.as_deref(), ctx.max_pages, None).await
    }
}

/// Iterates the fixed district list with a bounded worker pool, walking the
/// per-district listing for each. Used when the portal-wide pagination is
/// unavailable. One district failing does not abort the others; the attempt
/// only fails when every district does.
pub struct DistrictPartitionedStrategy {
    worker_count: usize,
    pages_per_district: usize,
}

impl DistrictPartitionedStrategy {
    pub fn new(worker_count: usize, pages_per_district: usize) -> Self {
        Self {
            worker_count: worker_count.clamp(1, 5),
            pages_per_district: pages_per_district.max(1),
        }
    }
}

impl Default for DistrictPartitionedStrategy {
    fn default() -> Self {
        Self::new(3, 10)
    }
}

#[async_trait]
impl ExtractionStrategy for DistrictPartitionedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DistrictPartitioned
    }

    async fn attempt(
        &self,
        target: &ExtractTarget,
        ctx: &ExtractionContext,
    ) -> Result<Vec<RawRecord>, StrategyError> {
        let districts: Vec<String> = match &target.district {
            Some(district) => vec![district.clone()],
            None => ctx.districts.as_ref().clone(),
        };
        if districts.is_empty() {
            return Ok(Vec::new());
        }

        // Workers accumulate locally; results are merged after join so no
        // shared record list is held across suspension points.
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut handles = Vec::with_capacity(districts.len());
        for district in districts {
            let semaphore = semaphore.clone();
            let ctx = ctx.clone();
            let pages = self.pages_per_district;
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                if ctx.cancel.is_cancelled() {
                    return (district, Ok(Vec::new()));
                }
                let result = crawl_pages(&ctx, Some(&district), pages, None).await;
                (district, result)
            }));
        }

        let mut merged = Vec::new();
        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut last_error = None;
        for handle in handles {
            let Ok((district, result)) = handle.await else {
                warn!(run_id = %ctx.run_id, "district worker panicked");
                failed += 1;
                attempted += 1;
                continue;
            };
            attempted += 1;
            match result {
                Ok(records) => {
                    debug!(run_id = %ctx.run_id, district, count = records.len(), "district walked");
                    merged.extend(records);
                }
                Err(err) => {
                    warn!(run_id = %ctx.run_id, district, error = %err, "district walk failed");
                    failed += 1;
                    last_error = Some(err);
                }
            }
        }

        if failed == attempted {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        Ok(merged)
    }
}

/// Functionally the paginated-table walk, but with randomized inter-page
/// delays to approximate a human reading pace. No fingerprint masking.
pub struct HumanPacedStrategy {
    pacer: HumanPacer,
}

impl HumanPacedStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            pacer: HumanPacer::new(Duration::from_millis(1200), Duration::from_millis(4500), seed),
        }
    }
}

#[async_trait]
impl ExtractionStrategy for HumanPacedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HumanPaced
    }

    async fn attempt(
        &self,
        target: &ExtractTarget,
        ctx: &ExtractionContext,
    ) -> Result<Vec<RawRecord>, StrategyError> {
        crawl_pages(ctx, target.district.as_deref(), ctx.max_pages, Some(&self.pacer)).await
    }
}

/// Build a strategy for a configured kind. Variants are selected by
/// configuration rather than by separate scraper scripts.
pub fn strategy_for_kind(kind: StrategyKind, seed: u64) -> Arc<dyn ExtractionStrategy> {
    match kind {
        StrategyKind::ApiProbe => Arc::new(ApiProbeStrategy::new()),
        StrategyKind::PaginatedTable => Arc::new(PaginatedTableStrategy),
        StrategyKind::DistrictPartitioned => Arc::new(DistrictPartitionedStrategy::default()),
        StrategyKind::HumanPaced => Arc::new(HumanPacedStrategy::new(seed)),
    }
}

/// The default priority order: cheapest and most structured first.
pub const DEFAULT_STRATEGY_ORDER: &[StrategyKind] = &[
    StrategyKind::ApiProbe,
    StrategyKind::PaginatedTable,
    StrategyKind::DistrictPartitioned,
];
