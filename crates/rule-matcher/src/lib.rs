//! Sensitive-data rule matcher.
//!
//! Given a change's `(table, field)` pairs and a project's (already
//! enabled-filtered) rule set, returns the rules that matched and the
//! strongest level among them. Matching is pure and allocation-light;
//! regex compilation happens per call since rule sets are expected to be
//! small and callers may mutate rules between calls.

#![deny(unsafe_code)]

use approval_core::model::{FieldPattern, Level, SensitiveDataRule};
use regex::Regex;

/// One affected `(table, field)` pair extracted from a proposed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeField {
    pub table: String,
    pub field: String,
}

impl ChangeField {
    pub fn new(table: impl Into<String>, field: impl Into<String>) -> Self {
        Self { table: table.into(), field: field.into() }
    }
}

/// A rule that matched at least one `(table, field)` pair, with the
/// specific pairs it matched (for the audit trail).
#[derive(Debug, Clone)]
pub struct MatchedRule<'a> {
    pub rule: &'a SensitiveDataRule,
    pub matched_fields: Vec<ChangeField>,
}

/// Match `changes` against `rules`, returning the matched rules and the
/// strongest level seen (`Level::Unspecified` if nothing matched).
///
/// `rules` is assumed pre-filtered to enabled rules by the caller.
pub fn match_changes<'a>(
    changes: &[ChangeField],
    rules: &'a [SensitiveDataRule],
) -> (Vec<MatchedRule<'a>>, Level) {
    let mut matched = Vec::new();
    let mut max_level = Level::Unspecified;

    for rule in rules {
        let mut hits = Vec::new();
        for change in changes {
            if rule_matches_change(rule, change) {
                hits.push(change.clone());
            }
        }
        if !hits.is_empty() {
            if rule.level > max_level {
                max_level = rule.level;
            }
            matched.push(MatchedRule { rule, matched_fields: hits });
        }
    }

    (matched, max_level)
}

/// Whether `rule` matches a single `(table, field)` pair.
fn rule_matches_change(rule: &SensitiveDataRule, change: &ChangeField) -> bool {
    if !table_matches(rule.table_pattern.as_deref(), &change.table) {
        return false;
    }
    if rule.field_patterns.is_empty() {
        // A rule with an empty table pattern and no field patterns
        // matches every (table, field).
        return true;
    }
    rule.field_patterns.iter().any(|fp| field_pattern_matches(fp, &change.field))
}

fn table_matches(table_pattern: Option<&str>, table: &str) -> bool {
    match table_pattern {
        None => true,
        Some(pattern) if pattern.is_empty() => true,
        Some(pattern) => pattern.eq_ignore_ascii_case(table),
    }
}

fn field_pattern_matches(pattern: &FieldPattern, field: &str) -> bool {
    if glob_matches(&pattern.name_or_glob, field) {
        return true;
    }
    if let Some(src) = pattern.regex.as_deref() {
        if !src.is_empty() {
            // Invalid regexes are skipped, not treated as a fatal rule
            // error.
            if let Ok(re) = Regex::new(src) {
                return re.is_match(field);
            }
        }
    }
    false
}

/// Match `name_or_glob` against `field`, expanding `*` to `.*` and anchoring
/// the whole field name.
fn glob_matches(name_or_glob: &str, field: &str) -> bool {
    if !name_or_glob.contains('*') {
        return name_or_glob == field;
    }
    let escaped = regex::escape(name_or_glob).replace("\\*", ".*");
    match Regex::new(&format!("^{escaped}$")) {
        Ok(re) => re.is_match(field),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_core::ids::{ProjectId, RuleId};
    use chrono::Utc;

    fn rule(
        title: &str,
        level: Level,
        table_pattern: Option<&str>,
        field_patterns: Vec<FieldPattern>,
    ) -> SensitiveDataRule {
        let now = Utc::now();
        SensitiveDataRule {
            id: RuleId::new(),
            project: ProjectId::from("proj-1"),
            title: title.to_string(),
            level,
            enabled: true,
            table_pattern: table_pattern.map(str::to_string),
            field_patterns,
            creator: "alice".into(),
            updater: "alice".into(),
            create_time: now,
            update_time: now,
        }
    }

    fn field(name_or_glob: &str) -> FieldPattern {
        FieldPattern { name_or_glob: name_or_glob.to_string(), regex: None }
    }

    #[test]
    fn exact_table_and_field_match() {
        let rules = vec![rule("pii", Level::High, Some("users"), vec![field("email")])];
        let (matched, max) = match_changes(&[ChangeField::new("users", "email")], &rules);
        assert_eq!(matched.len(), 1);
        assert_eq!(max, Level::High);
    }

    #[test]
    fn table_match_is_case_insensitive() {
        let rules = vec![rule("pii", Level::Medium, Some("Users"), vec![field("email")])];
        let (matched, _) = match_changes(&[ChangeField::new("users", "email")], &rules);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn glob_field_pattern_expands_star() {
        let rules = vec![rule("secrets", Level::High, None, vec![field("*_token")])];
        let (matched, _) = match_changes(&[ChangeField::new("sessions", "api_token")], &rules);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn regex_field_pattern_matches() {
        let rules = vec![rule(
            "cards",
            Level::High,
            Some("payments"),
            vec![FieldPattern { name_or_glob: "nomatch".into(), regex: Some("^card_.*".into()) }],
        )];
        let (matched, _) = match_changes(&[ChangeField::new("payments", "card_no")], &rules);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn invalid_regex_is_skipped_not_fatal() {
        let rules = vec![rule(
            "broken",
            Level::High,
            None,
            vec![FieldPattern { name_or_glob: "nomatch".into(), regex: Some("(".into()) }],
        )];
        let (matched, max) = match_changes(&[ChangeField::new("t", "f")], &rules);
        assert!(matched.is_empty());
        assert_eq!(max, Level::Unspecified);
    }

    #[test]
    fn empty_table_and_field_patterns_match_everything() {
        let rules = vec![rule("catch-all", Level::Low, None, vec![])];
        let (matched, max) = match_changes(&[ChangeField::new("anything", "whatever")], &rules);
        assert_eq!(matched.len(), 1);
        assert_eq!(max, Level::Low);
    }

    #[test]
    fn no_match_yields_unspecified() {
        let rules = vec![rule("pii", Level::High, Some("users"), vec![field("email")])];
        let (matched, max) = match_changes(&[ChangeField::new("orders", "total")], &rules);
        assert!(matched.is_empty());
        assert_eq!(max, Level::Unspecified);
    }

    #[test]
    fn max_level_across_multiple_matched_rules() {
        let rules = vec![
            rule("low-rule", Level::Low, Some("users"), vec![field("name")]),
            rule("high-rule", Level::High, Some("users"), vec![field("ssn")]),
        ];
        let changes = vec![ChangeField::new("users", "name"), ChangeField::new("users", "ssn")];
        let (matched, max) = match_changes(&changes, &rules);
        assert_eq!(matched.len(), 2);
        assert_eq!(max, Level::High);
    }
}
