//! Conservative near-duplicate detection.
//!
//! Records are bucketed by normalized address; only records in the same bucket are
//! compared, by Jaro-Winkler similarity of their normalized names. Differing phone
//! numbers veto a match, and so do differing numbers inside the names (store or
//! branch numbers). Memory grows with the number of admitted records that carry
//! both a name and an address.

use std::collections::HashMap;

use strsim::jaro_winkler;

use crate::types::{FuzzyOptions, Record};

#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyMatch {
    /// Identifier of the already admitted record.
    pub existing: String,
    pub similarity: f64,
}

#[derive(Debug, Clone)]
struct Entry {
    identifier: String,
    name: String,
    phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    options: FuzzyOptions,
    blocks: HashMap<String, Vec<Entry>>,
}

impl FuzzyMatcher {
    #[must_use]
    pub fn new(options: FuzzyOptions) -> Self {
        Self {
            options,
            blocks: HashMap::new(),
        }
    }

    /// Best match above the threshold among records sharing this record's address.
    #[must_use]
    pub fn find_match(&self, record: &Record) -> Option<FuzzyMatch> {
        let (block, name, phone) = self.keys(record)?;
        let entries = self.blocks.get(&block)?;

        entries
            .iter()
            .filter(|entry| entry.identifier != record.identifier)
            .filter(|entry| match (&entry.phone, &phone) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
            .filter(|entry| name_numbers(&entry.name).eq(name_numbers(&name)))
            .map(|entry| FuzzyMatch {
                existing: entry.identifier.clone(),
                similarity: jaro_winkler(&entry.name, &name),
            })
            .filter(|found| found.similarity >= self.options.name_threshold)
            .max_by(|a, b| a.similarity.total_cmp(&b.similarity))
    }

    pub fn insert(&mut self, record: &Record) {
        if let Some((block, name, phone)) = self.keys(record) {
            self.blocks.entry(block).or_default().push(Entry {
                identifier: record.identifier.clone(),
                name,
                phone,
            });
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    fn keys(&self, record: &Record) -> Option<(String, String, Option<String>)> {
        let name = comparable(&record.field(&self.options.name_field)?.to_string());
        let address = comparable(&record.field(&self.options.address_field)?.to_string());
        if name.is_empty() || address.is_empty() {
            return None;
        }
        let phone = record
            .field(&self.options.phone_field)
            .map(|value| digits(&value.to_string()))
            .filter(|digits| !digits.is_empty());
        Some((address, name, phone))
    }
}

/// Lowercase alphanumerics separated by single spaces; punctuation dropped.
fn comparable(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c.to_ascii_lowercase())
            } else if c.is_whitespace() {
                Some(' ')
            } else {
                None
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Runs of digits in a name, in order: `"cvs 1042 store 7"` yields `1042`, `7`.
fn name_numbers(name: &str) -> impl Iterator<Item = &str> {
    name.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
}

fn digits(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    // Drop a leading North American trunk prefix so 1-555... equals 555...
    if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    }
}
