//! Weighted multi-field identity matching.

use super::{EntryType, SanctionEntry, ScreeningRequest};
use crate::{config::ScreeningConfig, types::clamp_unit};
use std::collections::HashSet;

const NAME_WEIGHT: f64 = 0.5;
const DOB_WEIGHT: f64 = 0.2;
const NATIONALITY_WEIGHT: f64 = 0.15;
const ADDRESS_WEIGHT: f64 = 0.15;
const IDENTIFIER_WEIGHT: f64 = 0.3;

const STREET_SUFFIXES: [&str; 12] = [
    "street", "st", "avenue", "ave", "road", "rd", "boulevard", "blvd", "lane", "ln", "drive", "dr",
];

#[derive(Debug, Clone, PartialEq)]
pub struct MatchScore {
    pub score: f64,
    pub matched_fields: Vec<String>,
}

/// Lowercase, punctuation to spaces, single spaces, trimmed.
pub fn normalize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `normalize` with street-type words removed.
pub fn normalize_address(s: &str) -> String {
    normalize(s)
        .split(' ')
        .filter(|t| !t.is_empty() && !STREET_SUFFIXES.contains(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shared tokens over the larger token count.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let left: HashSet<&str> = a.split_whitespace().collect();
    let right: HashSet<&str> = b.split_whitespace().collect();
    let larger = left.len().max(right.len());
    if larger == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / larger as f64
}

/// Best similarity between any subject name and any target name.
/// Both sides must already be normalized. An exact match returns 1.0 at once.
pub fn name_score(subjects: &[String], targets: &[String]) -> f64 {
    let mut best: f64 = 0.0;
    for subject in subjects.iter().filter(|s| !s.is_empty()) {
        for target in targets.iter().filter(|t| !t.is_empty()) {
            if subject == target {
                return 1.0;
            }
            let max_len = subject.chars().count().max(target.chars().count());
            let edit = 1.0 - strsim::levenshtein(subject, target) as f64 / max_len as f64;
            best = best.max(edit.max(token_overlap(subject, target)));
        }
    }
    best
}

/// Best per-address ratio of subject tokens found (exactly or within one
/// edit) in the target, over the larger token count.
pub fn address_score(subject: &str, targets: &[String]) -> f64 {
    let subject = normalize_address(subject);
    let tokens: Vec<&str> = subject.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let mut best: f64 = 0.0;
    for target in targets {
        let target = normalize_address(target);
        let target_tokens: Vec<&str> = target.split_whitespace().collect();
        if target_tokens.is_empty() {
            continue;
        }
        let matched = tokens
            .iter()
            .filter(|t| {
                target_tokens
                    .iter()
                    .any(|o| t == &o || strsim::levenshtein(t, o) <= 1)
            })
            .count();
        best = best.max(matched as f64 / tokens.len().max(target_tokens.len()) as f64);
    }
    best
}

/// Subjects screen against entries of their own type and against entities.
pub fn type_compatible(subject: EntryType, entry: EntryType) -> bool {
    subject == entry || entry == EntryType::Entity
}

/// Normalized primary and alternate names of a request.
pub fn subject_names(request: &ScreeningRequest) -> Vec<String> {
    std::iter::once(&request.name)
        .chain(request.alternate_names.iter())
        .map(|n| normalize(n))
        .filter(|n| !n.is_empty())
        .collect()
}

/// Score one entry. Only qualifying components enter the weighted mean.
pub fn score_entry(
    subjects: &[String],
    request: &ScreeningRequest,
    entry: &SanctionEntry,
    cfg: &ScreeningConfig,
) -> MatchScore {
    let mut total = 0.0;
    let mut weights = 0.0;
    let mut matched_fields = Vec::new();

    let targets: Vec<String> = entry
        .names
        .iter()
        .chain(entry.aliases.iter())
        .map(|n| normalize(n))
        .collect();
    let name = name_score(subjects, &targets);
    if name > cfg.name_threshold {
        total += name * NAME_WEIGHT;
        weights += NAME_WEIGHT;
        matched_fields.push("name".to_string());
    }

    if let (Some(dob), Some(entry_dob)) = (present(&request.date_of_birth), present(&entry.date_of_birth)) {
        if dob == entry_dob {
            total += DOB_WEIGHT;
            weights += DOB_WEIGHT;
            matched_fields.push("date_of_birth".to_string());
        }
    }

    if let Some(nationality) = present(&request.nationality) {
        if entry
            .nationality
            .iter()
            .any(|n| n.trim().eq_ignore_ascii_case(nationality))
        {
            total += NATIONALITY_WEIGHT;
            weights += NATIONALITY_WEIGHT;
            matched_fields.push("nationality".to_string());
        }
    }

    if let Some(address) = present(&request.address) {
        let ratio = address_score(address, &entry.addresses);
        if ratio > cfg.address_threshold {
            total += ratio * ADDRESS_WEIGHT;
            weights += ADDRESS_WEIGHT;
            matched_fields.push("address".to_string());
        }
    }

    for id in &request.identifiers {
        let found = entry.identifiers.iter().any(|e| {
            e.id_type.trim().eq_ignore_ascii_case(id.id_type.trim()) && e.value.trim() == id.value.trim()
        });
        if found {
            total += IDENTIFIER_WEIGHT;
            weights += IDENTIFIER_WEIGHT;
            matched_fields.push(format!("identifier:{}", id.id_type));
        }
    }

    let score = if weights > 0.0 { clamp_unit(total / weights) } else { 0.0 };
    MatchScore {
        score,
        matched_fields,
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screening::Identifier;

    fn entry() -> SanctionEntry {
        SanctionEntry {
            id: "e1".into(),
            entry_type: EntryType::Individual,
            names: vec!["Ivan Petrovich Sidorov".into()],
            aliases: vec!["I. P. Sidorov".into()],
            identifiers: vec![Identifier {
                id_type: "passport".into(),
                value: "AB123456".into(),
            }],
            addresses: vec!["12 Tverskaya Street, Moscow".into()],
            date_of_birth: Some("1970-01-15".into()),
            place_of_birth: None,
            nationality: vec!["RU".into()],
            programs: vec!["UKRAINE-EO13661".into()],
            remarks: None,
            risk_score: 100.0,
        }
    }

    fn request(name: &str) -> ScreeningRequest {
        ScreeningRequest {
            name: name.into(),
            ..ScreeningRequest::default()
        }
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize("  O'Brien,   JOHN-Paul "), "o brien john paul");
        assert_eq!(normalize_address("12 Tverskaya St., Moscow"), "12 tverskaya moscow");
    }

    #[test]
    fn exact_name_short_circuits() {
        let subjects = vec![normalize("IVAN petrovich SIDOROV!")];
        let targets = vec![normalize("Ivan Petrovich Sidorov"), normalize("Something Else")];
        assert_eq!(name_score(&subjects, &targets), 1.0);
    }

    #[test]
    fn token_reordering_scores_full_overlap() {
        let subjects = vec![normalize("Sidorov Ivan Petrovich")];
        let targets = vec![normalize("Ivan Petrovich Sidorov")];
        assert_eq!(name_score(&subjects, &targets), 1.0);
    }

    #[test]
    fn one_typo_stays_above_name_threshold() {
        let subjects = vec![normalize("Ivan Petrovich Sidorow")];
        let targets = vec![normalize("Ivan Petrovich Sidorov")];
        let score = name_score(&subjects, &targets);
        assert!(score > 0.9 && score < 1.0, "score {score}");
    }

    #[test]
    fn address_tokens_tolerate_one_edit() {
        let score = address_score("12 Tverskaja Road Moscow", &["12 Tverskaya Street, Moscow".into()]);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn name_and_dob_combine() {
        let cfg = ScreeningConfig::default();
        let mut req = request("Ivan Petrovich Sidorov");
        req.date_of_birth = Some("1970-01-15".into());
        let subjects = subject_names(&req);
        let m = score_entry(&subjects, &req, &entry(), &cfg);
        assert_eq!(m.score, 1.0);
        assert_eq!(m.matched_fields, vec!["name", "date_of_birth"]);
    }

    #[test]
    fn identifier_alone_is_a_full_match() {
        let cfg = ScreeningConfig::default();
        let mut req = request("Completely Different");
        req.identifiers = vec![Identifier {
            id_type: "Passport".into(),
            value: "AB123456".into(),
        }];
        let subjects = subject_names(&req);
        let m = score_entry(&subjects, &req, &entry(), &cfg);
        assert_eq!(m.score, 1.0);
        assert_eq!(m.matched_fields, vec!["identifier:Passport"]);
    }

    #[test]
    fn unrelated_subject_scores_zero() {
        let cfg = ScreeningConfig::default();
        let req = request("Maria Garcia Lopez");
        let subjects = subject_names(&req);
        assert_eq!(score_entry(&subjects, &req, &entry(), &cfg).score, 0.0);
    }

    #[test]
    fn entity_entries_match_every_subject_type() {
        assert!(type_compatible(EntryType::Individual, EntryType::Entity));
        assert!(type_compatible(EntryType::Vessel, EntryType::Vessel));
        assert!(!type_compatible(EntryType::Entity, EntryType::Individual));
    }
}
