//! Pair filter
//!
//! Decides which symbols the pipeline tracks, from a blob of literal and
//! regex rules. Literal membership is O(1); regex rules keep LRU order so
//! recently matched patterns are re-tested first.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Lines matching this are plain symbols; anything else also compiles as a
/// case-insensitive regex rule.
const PLAIN_SYMBOL: &str = r"^[A-Za-z][\w:/-]+$";

/// Literal + regex symbol membership predicate
///
/// An empty filter accepts every symbol.
#[derive(Debug)]
pub struct PairFilter {
    literals: BTreeSet<String>,
    regexes: Mutex<Vec<Regex>>,
    plain: Regex,
}

impl PairFilter {
    pub fn new() -> Self {
        Self {
            literals: BTreeSet::new(),
            regexes: Mutex::new(Vec::new()),
            plain: Regex::new(PLAIN_SYMBOL).expect("plain symbol pattern is valid"),
        }
    }

    /// Build a filter from a rules blob
    pub fn from_rules(text: &str) -> Self {
        let mut filter = Self::new();
        filter.add_rules(text);
        filter
    }

    /// Parse a rules blob
    ///
    /// Rules are separated by newlines, carriage returns or semicolons.
    /// Lines starting with `#` or `//` are comments. Every remaining line is
    /// a case-insensitive literal; lines that are not plain symbols are also
    /// compiled as case-insensitive regexes.
    pub fn add_rules(&mut self, text: &str) {
        for line in text.split(['\r', '\n', ';']) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }

            self.literals.insert(line.to_uppercase());

            if !self.plain.is_match(line) {
                match RegexBuilder::new(line).case_insensitive(true).build() {
                    Ok(regex) => self.regexes.lock().push(regex),
                    Err(error) => {
                        warn!(rule = %line, error = %error, "Skipping unparseable regex rule")
                    }
                }
            }
        }
    }

    /// Number of literal rules
    pub fn len(&self) -> usize {
        self.literals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }

    /// Test a symbol against the filter
    ///
    /// A matching regex rule is promoted to the head of the rule list.
    pub fn matches(&self, input: &str) -> bool {
        if self.literals.is_empty() {
            return true;
        }
        let input = input.trim();
        if input.is_empty() {
            return false;
        }
        if self.literals.contains(&input.to_uppercase()) {
            return true;
        }

        let mut regexes = self.regexes.lock();
        if let Some(hit) = regexes.iter().position(|r| r.is_match(input)) {
            if hit > 0 {
                let regex = regexes.remove(hit);
                regexes.insert(0, regex);
            }
            return true;
        }
        false
    }

    #[cfg(test)]
    fn regex_order(&self) -> Vec<String> {
        self.regexes.lock().iter().map(|r| r.to_string()).collect()
    }
}

impl Default for PairFilter {
    fn default() -> Self {
        Self::new()
    }
}
