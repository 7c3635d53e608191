//! crates/textlift_core/src/isbn.rs
//!
//! ISBN-13 sniffing over extracted front-matter text.
//!
//! A candidate is any run of groups of digits (a trailing `X` is tolerated so
//! ISBN-10 look-alikes are still recognised as runs) joined by single hyphens
//! or spaces, whose contiguous groups add up to exactly 13 characters.

use regex::Regex;
use std::sync::OnceLock;

/// Characters read from the start of the extracted text when looking for an ISBN.
pub const FRONT_MATTER_CHARS: usize = 200_000;

/// How far before a candidate the `ISBN` label may appear to count as labelled.
const LABEL_WINDOW_BYTES: usize = 32;

const ISBN13_LEN: usize = 13;

fn group_run() -> &'static Regex {
    static RUN: OnceLock<Regex> = OnceLock::new();
    RUN.get_or_init(|| Regex::new(r"\d+[Xx]?(?:[ -]\d+[Xx]?)*").expect("static ISBN pattern"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    start: usize,
    digits: String,
}

/// Validates an ISBN-13, ignoring hyphens and spaces.
pub fn is_valid_isbn13(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate
        .chars()
        .filter(|c| *c != '-' && *c != ' ')
        .map(|c| c.to_digit(10))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default();
    if digits.len() != ISBN13_LEN {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { *d } else { d * 3 })
        .sum();
    sum % 10 == 0
}

/// Returns the best valid ISBN-13 in `text`, normalised to 13 digits.
///
/// A valid candidate preceded by the `ISBN` label wins; otherwise the first
/// valid candidate in document order is taken.
pub fn find_best_isbn13(text: &str) -> Option<String> {
    let valid: Vec<Candidate> = candidates(text)
        .into_iter()
        .filter(|c| is_valid_isbn13(&c.digits))
        .collect();

    valid
        .iter()
        .find(|c| has_label_before(text, c.start))
        .or_else(|| valid.first())
        .map(|c| c.digits.clone())
}

fn candidates(text: &str) -> Vec<Candidate> {
    let mut out = Vec::new();
    for run in group_run().find_iter(text) {
        // (byte offset in text, group characters)
        let mut groups: Vec<(usize, &str)> = Vec::new();
        let mut offset = run.start();
        for group in run.as_str().split(|c| c == '-' || c == ' ') {
            groups.push((offset, group));
            offset += group.len() + 1;
        }

        for first in 0..groups.len() {
            let mut len = 0;
            for last in first..groups.len() {
                len += groups[last].1.len();
                if len == ISBN13_LEN {
                    out.push(Candidate {
                        start: groups[first].0,
                        digits: groups[first..=last].iter().map(|(_, g)| *g).collect(),
                    });
                }
                if len >= ISBN13_LEN {
                    break;
                }
            }
        }
    }
    out
}

fn has_label_before(text: &str, start: usize) -> bool {
    let mut from = start.saturating_sub(LABEL_WINDOW_BYTES);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    text[from..start].to_ascii_uppercase().contains("ISBN")
}
