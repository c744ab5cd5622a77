//! Per-field extraction heuristics.
//!
//! Each extractor is a pure `&str -> Option<T>` function so the row processor
//! can compose them and each heuristic can be replaced independently as the
//! portal's markup drifts. All of them are best-effort, not authoritative.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

/// Structural template of a RERA registration id: an alphabetic prefix
/// followed by at least three further slash-delimited alphanumeric segments
/// (segments may contain spaces, e.g. `AHMEDABAD CITY`).
fn registration_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[A-Z]{2,5}(?:/[A-Z0-9][A-Z0-9 ._-]*){3,}").expect("static regex is valid")
    })
}

pub fn registration_id(text: &str) -> Option<String> {
    let found = registration_id_pattern().find(text)?;
    let id = found.as_str().trim_end_matches([' ', '.', '-', '_']).to_string();
    // at least four segments once trimmed, or it is not an id
    if id.split('/').count() < 4 {
        return None;
    }
    Some(id)
}

const DATE_FORMATS: &[&str] = &["%d-%m-%Y", "%d/%m/%Y", "%Y-%m-%d", "%d-%b-%Y"];

/// Source dates are DD-MM-YYYY with a few observed variations. Anything else
/// is treated as unparsable rather than guessed at.
pub fn date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}

/// Exactly six digits, not starting with zero: an Indian postal code.
pub fn pincode(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.len() == 6
        && trimmed.chars().all(|c| c.is_ascii_digit())
        && !trimmed.starts_with('0')
    {
        return Some(trimmed.to_string());
    }
    None
}

/// Plain non-negative count (unit totals, building counts). Grouping commas
/// are tolerated; anything with letters or punctuation is not a count.
pub fn count(text: &str) -> Option<u64> {
    let cleaned: String = text.trim().replace(',', "");
    if cleaned.is_empty() || cleaned.len() > 7 || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse().ok()
}

/// Area measure: needs either an explicit unit hint or a decimal separator,
/// so that bare integers keep flowing to the count columns.
pub fn area(text: &str) -> Option<f64> {
    let lower = text.trim().to_lowercase();
    let has_unit = ["sq", "hectare", "acre"].iter().any(|u| lower.contains(u));
    let numeric: String = lower
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    if numeric.is_empty() {
        return None;
    }
    if !has_unit && !numeric.contains('.') {
        return None;
    }
    numeric.parse().ok().filter(|v: &f64| *v > 0.0)
}

const TYPE_HINTS: &[&str] = &[
    "residential",
    "commercial",
    "mixed",
    "plot",
    "township",
    "group housing",
    "apartment",
];

const STATUS_HINTS: &[&str] = &[
    "ongoing",
    "under construction",
    "completed",
    "delayed",
    "stalled",
    "registered",
    "new project",
];

pub fn looks_like_project_type(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    !lower.is_empty() && lower.len() <= 40 && TYPE_HINTS.iter().any(|h| lower.contains(h))
}

pub fn looks_like_status(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() || lower.len() > 25 {
        return false;
    }
    lower == "new" || STATUS_HINTS.iter().any(|h| lower.contains(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_ids_match_the_slash_template() {
        assert_eq!(
            registration_id("PR/GJ/AHMEDABAD/AHMEDABAD CITY/AUDA/MAA06794/071117"),
            Some("PR/GJ/AHMEDABAD/AHMEDABAD CITY/AUDA/MAA06794/071117".to_string())
        );
        assert_eq!(
            registration_id("reg: PR/GJ/RAJKOT/RAJKOT/RUDA/RAA00123/010120 (active)"),
            Some("PR/GJ/RAJKOT/RAJKOT/RUDA/RAA00123/010120".to_string())
        );
        assert_eq!(registration_id("not an id"), None);
        assert_eq!(registration_id("PR/GJ"), None);
        assert_eq!(registration_id("12/06/2023"), None);
        assert_eq!(registration_id(""), None);
    }

    #[test]
    fn dates_parse_source_local_formats() {
        let expected = NaiveDate::from_ymd_opt(2023, 6, 12).unwrap();
        assert_eq!(date("12-06-2023"), Some(expected));
        assert_eq!(date("12/06/2023"), Some(expected));
        assert_eq!(date("2023-06-12"), Some(expected));
        assert_eq!(date("12-Jun-2023"), Some(expected));
        assert_eq!(date("June 12th 2023"), None);
        assert_eq!(date("31-02-2023"), None);
    }

    #[test]
    fn pincode_requires_exactly_six_digits() {
        assert_eq!(pincode("380058"), Some("380058".to_string()));
        assert_eq!(pincode(" 395007 "), Some("395007".to_string()));
        assert_eq!(pincode("38005"), None);
        assert_eq!(pincode("3800589"), None);
        assert_eq!(pincode("038005"), None);
        assert_eq!(pincode("38O058"), None);
    }

    #[test]
    fn counts_tolerate_grouping_commas_only() {
        assert_eq!(count("240"), Some(240));
        assert_eq!(count("1,240"), Some(1240));
        assert_eq!(count("240 units"), None);
        assert_eq!(count("-4"), None);
        assert_eq!(count("12.5"), None);
    }

    #[test]
    fn area_needs_a_unit_or_a_decimal_point() {
        assert_eq!(area("12,500.5 sq.mt"), Some(12500.5));
        assert_eq!(area("4500 sq m"), Some(4500.0));
        assert_eq!(area("2.5 Hectare"), Some(2.5));
        assert_eq!(area("12500.5"), Some(12500.5));
        assert_eq!(area("240"), None);
        assert_eq!(area("n/a"), None);
    }

    #[test]
    fn enum_hints_are_substring_based() {
        assert!(looks_like_project_type("Residential/Group Housing"));
        assert!(looks_like_project_type("Mixed Development"));
        assert!(!looks_like_project_type("Acme Developers"));
        assert!(looks_like_status("Under Construction"));
        assert!(looks_like_status("New"));
        assert!(!looks_like_status("New Heights Phase II is a very long name"));
    }
}
