//! Boolean keyword matcher for alert rules.
//!
//! A rule holds three term lists evaluated against a lower-cased corpus:
//! 1. `must_not`: any hit rejects
//! 2. `must_have`: any miss rejects
//! 3. `any_of`: when non-empty, at least one must hit
//!
//! Terms match as whole tokens. A term edge that is a word character gets a
//! `\b` boundary, so `3080` does not match inside `3080ti`. An edge that is
//! punctuation (`$500`, `c++`) instead requires start/end of text or a
//! non-word neighbour, since `\b` never fires between two non-word chars.
//!
//! Compiled patterns are memoized per normalized term and shared across
//! threads.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::pipeline::types::AlertRule;

/// Thread-safe term matcher with a compiled-pattern cache.
#[derive(Debug, Default)]
pub struct Matcher {
    patterns: RwLock<HashMap<String, Regex>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the three term lists against `corpus`.
    pub fn matches<S: AsRef<str>>(
        &self,
        corpus: &str,
        must_have: &[S],
        any_of: &[S],
        must_not: &[S],
    ) -> bool {
        let corpus = corpus.to_lowercase();

        let present = |term: &S| self.contains(&corpus, term.as_ref());

        if let Some(term) = must_not.iter().find(|t| present(t)) {
            let term: &str = term.as_ref();
            debug!(term, "Rejected by must_not term");
            return false;
        }

        if !must_have.iter().all(present) {
            return false;
        }

        if !any_of.is_empty() && !any_of.iter().any(present) {
            return false;
        }

        true
    }

    /// Evaluate a stored rule.
    pub fn matches_rule(&self, corpus: &str, rule: &AlertRule) -> bool {
        self.matches(corpus, &rule.must_have, &rule.any_of, &rule.must_not)
    }

    /// Number of distinct terms compiled so far.
    pub fn pattern_count(&self) -> usize {
        self.patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether `term` occurs as a whole token in an already lower-cased corpus.
    fn contains(&self, corpus: &str, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return false;
        }

        {
            let patterns = self.patterns.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(re) = patterns.get(&term) {
                return re.is_match(corpus);
            }
        }

        let re = match Regex::new(&term_pattern(&term)) {
            Ok(re) => re,
            Err(e) => {
                warn!(term = %term, error = %e, "Failed to compile term pattern");
                return false;
            }
        };
        let hit = re.is_match(corpus);

        self.patterns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(term)
            .or_insert(re);
        hit
    }
}

/// Build the anchored, case-insensitive pattern for a normalized term.
fn term_pattern(term: &str) -> String {
    let starts_word = term.chars().next().is_some_and(is_word_char);
    let ends_word = term.chars().last().is_some_and(is_word_char);

    let lead = if starts_word { r"\b" } else { r"(?:^|\W)" };
    let trail = if ends_word { r"\b" } else { r"(?:$|\W)" };

    format!("(?i){lead}{}{trail}", regex::escape(term))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORPUS: &str = "Selling my RTX 3080ti for $500 in Toronto. BNIB.";
    const NONE: &[&str] = &[];

    fn check(must_have: &[&str], any_of: &[&str], must_not: &[&str]) -> bool {
        Matcher::new().matches(CORPUS, must_have, any_of, must_not)
    }

    #[test]
    fn whole_token_matches() {
        assert!(check(&["3080ti"], NONE, NONE));
        assert!(check(&["rtx"], NONE, NONE));
    }

    #[test]
    fn partial_token_does_not_match() {
        assert!(!check(&["3080"], NONE, NONE));
        assert!(!check(NONE, &["3080"], NONE));
    }

    #[test]
    fn must_not_overrides_everything() {
        assert!(!check(NONE, NONE, &["3080ti"]));
        assert!(!check(&["3080ti"], NONE, &["bnib"]));
        assert!(!check(&["3080ti"], &["toronto"], &["toronto"]));
    }

    #[test]
    fn any_of_needs_one_hit() {
        assert!(check(NONE, &["toronto", "vancouver"], NONE));
        assert!(check(&["bnib"], &["3080ti"], NONE));
        assert!(!check(&["3080ti"], &["vancouver"], NONE));
    }

    #[test]
    fn multiple_must_have_all_required() {
        assert!(check(&["3080ti", "toronto"], NONE, NONE));
        assert!(!check(&["3080ti", "vancouver"], NONE, NONE));
    }

    #[test]
    fn empty_any_of_is_vacuously_true() {
        assert!(check(NONE, NONE, NONE));
        assert!(check(&["rtx"], NONE, NONE));
    }

    #[test]
    fn punctuation_edges_use_relaxed_boundary() {
        assert!(check(&["$500"], NONE, NONE));
        assert!(!check(&["$50"], NONE, NONE));
        let matcher = Matcher::new();
        assert!(matcher.matches("looking for c++ books", &["c++"], NONE, NONE));
        assert!(!matcher.matches("looking for c++books", &["c++"], NONE, NONE));
    }

    #[test]
    fn special_characters_are_literal() {
        let matcher = Matcher::new();
        assert!(!matcher.matches("rtx 3080 ti", &["3080.ti"], NONE, NONE));
        assert!(matcher.matches("asus (rog) strix", &["(rog)"], NONE, NONE));
    }

    #[test]
    fn terms_are_trimmed_and_case_folded() {
        assert!(check(&["  RTX  "], NONE, NONE));
        assert!(check(&["Toronto"], NONE, NONE));
    }

    #[test]
    fn empty_terms_are_never_present() {
        assert!(!check(&[""], NONE, NONE));
        assert!(!check(&["   "], NONE, NONE));
        assert!(check(NONE, NONE, &[""]));
    }

    #[test]
    fn patterns_are_memoized_by_normalized_term() {
        let matcher = Matcher::new();
        matcher.matches(CORPUS, &["rtx"], NONE, NONE);
        matcher.matches(CORPUS, &["RTX ", "bnib"], NONE, NONE);
        assert_eq!(matcher.pattern_count(), 2);
    }

    #[test]
    fn matches_rule_uses_all_three_lists() {
        let matcher = Matcher::new();
        let rule = AlertRule::new("u1", "s1", &["3080ti"], &["toronto"], &["broken"]);
        assert!(matcher.matches_rule(CORPUS, &rule));
        let rule = AlertRule::new("u1", "s1", &["3080ti"], &["toronto"], &["bnib"]);
        assert!(!matcher.matches_rule(CORPUS, &rule));
    }

    #[test]
    fn shared_across_threads() {
        let matcher = std::sync::Arc::new(Matcher::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = matcher.clone();
                std::thread::spawn(move || m.matches(CORPUS, &["rtx", "toronto"], NONE, NONE))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(matcher.pattern_count(), 2);
    }
}
