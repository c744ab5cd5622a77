//! Core domain model and provenance types for GRIP.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grip-core";

/// Namespace for synthesized registration keys (UUIDv5 over `district|name`).
pub const SYNTHESIZED_KEY_NAMESPACE: Uuid = Uuid::NAMESPACE_URL;

/// Where a persisted record came from. Downstream analytics must be able to
/// tell real extractions apart from fallback data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    LiveExtraction,
    ManualUpload,
    Synthetic,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::LiveExtraction => "live_extraction",
            Provenance::ManualUpload => "manual_upload",
            Provenance::Synthetic => "synthetic",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed project-type set; free source text is classified into this by the
/// normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Residential,
    Commercial,
    Mixed,
    Plotted,
    Township,
    Other,
}

impl std::fmt::Display for ProjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectType::Residential => "residential",
            ProjectType::Commercial => "commercial",
            ProjectType::Mixed => "mixed",
            ProjectType::Plotted => "plotted",
            ProjectType::Township => "township",
            ProjectType::Other => "other",
        };
        f.write_str(s)
    }
}

impl Default for ProjectType {
    fn default() -> Self {
        ProjectType::Residential
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    New,
    Ongoing,
    Completed,
    Delayed,
    Stalled,
    Other,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::New => "new",
            ProjectStatus::Ongoing => "ongoing",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Delayed => "delayed",
            ProjectStatus::Stalled => "stalled",
            ProjectStatus::Other => "other",
        };
        f.write_str(s)
    }
}

impl Default for ProjectStatus {
    fn default() -> Self {
        ProjectStatus::Ongoing
    }
}

impl std::str::FromStr for ProjectType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "residential" => Ok(ProjectType::Residential),
            "commercial" => Ok(ProjectType::Commercial),
            "mixed" => Ok(ProjectType::Mixed),
            "plotted" => Ok(ProjectType::Plotted),
            "township" => Ok(ProjectType::Township),
            "other" => Ok(ProjectType::Other),
            other => Err(UnknownVariant {
                kind: "project type",
                value: other.to_string(),
            }),
        }
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(ProjectStatus::New),
            "ongoing" => Ok(ProjectStatus::Ongoing),
            "completed" => Ok(ProjectStatus::Completed),
            "delayed" => Ok(ProjectStatus::Delayed),
            "stalled" => Ok(ProjectStatus::Stalled),
            "other" => Ok(ProjectStatus::Other),
            other => Err(UnknownVariant {
                kind: "project status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::str::FromStr for Provenance {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live_extraction" => Ok(Provenance::LiveExtraction),
            "manual_upload" => Ok(Provenance::ManualUpload),
            "synthetic" => Ok(Provenance::Synthetic),
            other => Err(UnknownVariant {
                kind: "provenance",
                value: other.to_string(),
            }),
        }
    }
}

/// Parse failure for one of the closed enum sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl std::fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Canonical persisted project representation. `registration_id` is the
/// unique key for upserts; everything else is best-effort extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub registration_id: String,
    pub name: String,
    pub promoter_name: String,
    pub project_type: ProjectType,
    pub status: ProjectStatus,
    pub district: String,
    pub locality: String,
    pub pincode: String,
    pub address: String,
    pub approved_on: Option<NaiveDate>,
    pub completion_date: Option<NaiveDate>,
    pub total_units: u32,
    pub available_units: u32,
    pub booking_percentage: u8,
    pub project_area: f64,
    pub total_buildings: u32,
    pub provenance: Provenance,
    pub low_confidence: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Single source of truth for the booking derivation. Every call site that
/// needs a booking percentage goes through here; the value is never stored
/// independently of the unit counts it was computed from.
pub fn booking_percentage(total_units: u32, available_units: u32) -> u8 {
    if total_units == 0 {
        return 0;
    }
    let available = available_units.min(total_units);
    let booked = f64::from(total_units - available);
    let pct = (booked / f64::from(total_units) * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Deterministic key for a raw record that carries no registration id.
/// Stable across runs for the same `(district, name)` pair.
pub fn synthesized_registration_key(district: &str, name: &str) -> String {
    let material = format!(
        "{}|{}",
        district.trim().to_ascii_lowercase(),
        name.trim().to_ascii_lowercase()
    );
    let id = Uuid::new_v5(&SYNTHESIZED_KEY_NAMESPACE, material.as_bytes());
    format!("SYN/{}", id.simple())
}

/// Pull the district segment out of a slash-delimited registration id.
/// The id is otherwise opaque; this is only a back-fill when the source row
/// carried no district column. Gujarat ids read like
/// `PR/GJ/AHMEDABAD/AHMEDABAD CITY/AUDA/MAA06794/071117`, district third.
pub fn district_from_registration_id(registration_id: &str) -> Option<String> {
    let segments: Vec<&str> = registration_id.split('/').collect();
    if segments.len() < 4 {
        return None;
    }
    let candidate = segments[2].trim();
    if candidate.is_empty() || candidate.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(title_case(candidate))
}

fn title_case(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pre-normalization handoff contract from extraction strategies into the
/// ingestion pipeline: an ordered bag of raw field name/value pairs exactly
/// as guessed from the source, plus where they were seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: BTreeMap<String, String>,
    pub source_url: Option<String>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if !value.trim().is_empty() {
            self.fields.insert(key.into(), value.trim().to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// First non-empty value among the given aliases, in priority order.
    pub fn first_of(&self, aliases: &[&str]) -> Option<&str> {
        aliases.iter().find_map(|alias| self.get(alias))
    }

    /// How many populated fields the record carries. Used by dedup to keep
    /// the most complete of two extractions of the same project.
    pub fn completeness(&self) -> usize {
        self.fields.values().filter(|v| !v.trim().is_empty()).count()
    }

    pub fn registration_id(&self) -> Option<&str> {
        self.first_of(REGISTRATION_ID_ALIASES)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Accepted spellings for the registration id across source shapes, in
/// priority order. Shared by the deduplicator and the normalizer so both
/// agree on which raw field is the key.
pub const REGISTRATION_ID_ALIASES: &[&str] = &[
    "registration_no",
    "registrationNo",
    "registration_number",
    "registrationNumber",
    "rera_no",
    "reraNo",
    "rera_number",
    "reg_no",
    "regNo",
    "project_reg_no",
];

/// Cooperative cancellation handle shared between an in-flight run and its
/// trigger. Strategies check it between page fetches, never mid-fetch.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_percentage_is_derived_and_bounded() {
        assert_eq!(booking_percentage(0, 0), 0);
        assert_eq!(booking_percentage(0, 10), 0);
        assert_eq!(booking_percentage(100, 25), 75);
        assert_eq!(booking_percentage(100, 0), 100);
        assert_eq!(booking_percentage(100, 100), 0);
        // available exceeding total clamps instead of underflowing
        assert_eq!(booking_percentage(50, 80), 0);
        assert_eq!(booking_percentage(3, 1), 67);
    }

    #[test]
    fn synthesized_keys_are_stable_and_case_insensitive() {
        let a = synthesized_registration_key("Ahmedabad", "Sky Heights");
        let b = synthesized_registration_key("ahmedabad", "sky heights");
        let c = synthesized_registration_key("Surat", "Sky Heights");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("SYN/"));
    }

    #[test]
    fn district_backfill_reads_third_segment() {
        assert_eq!(
            district_from_registration_id("PR/GJ/AHMEDABAD/AHMEDABAD CITY/AUDA/MAA06794/071117"),
            Some("Ahmedabad".to_string())
        );
        assert_eq!(
            district_from_registration_id("PR/GJ/RAJKOT/RAJKOT/RUDA/RAA00123/010120"),
            Some("Rajkot".to_string())
        );
        assert_eq!(district_from_registration_id("PR/GJ"), None);
        // numeric third segment is not a district name
        assert_eq!(district_from_registration_id("PR/GJ/12345/X"), None);
    }

    #[test]
    fn raw_record_alias_lookup_honors_priority_order() {
        let mut raw = RawRecord::new();
        raw.set("reraNo", "PR/GJ/SURAT/SURAT CITY/SUDA/RAA11111/010120");
        raw.set("registration_no", "PR/GJ/SURAT/SURAT CITY/SUDA/RAA00001/010120");
        assert_eq!(
            raw.registration_id(),
            Some("PR/GJ/SURAT/SURAT CITY/SUDA/RAA00001/010120")
        );
        assert_eq!(raw.completeness(), 2);
    }

    #[test]
    fn raw_record_ignores_blank_values() {
        let mut raw = RawRecord::new();
        raw.set("project_name", "   ");
        assert!(raw.is_empty());
        raw.set("project_name", " Sky Heights ");
        assert_eq!(raw.get("project_name"), Some("Sky Heights"));
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
