//! FOMC-specific helpers: meeting dates to minutes URLs, and a keyword tone
//! classifier for statements and minutes.

use crate::error::{RagError, RagResult};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt;

pub const MINUTES_BASE_URL: &str = "https://www.federalreserve.gov/monetarypolicy/files/";

/// Parses a meeting date written like `September 20, 2023`.
pub fn parse_meeting_date(text: &str) -> RagResult<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%B %d, %Y")
        .map_err(|e| RagError::InvalidArgument(format!("'{}' is not a meeting date: {e}", text.trim())))
}

pub fn minutes_url(date: NaiveDate) -> String {
    format!("{MINUTES_BASE_URL}fomcminutes{}.pdf", date.format("%Y%m%d"))
}

pub fn minutes_urls(dates: &[NaiveDate]) -> Vec<String> {
    dates.iter().copied().map(minutes_url).collect()
}

pub const HAWKISH_TERMS: [&str; 5] = ["tighten", "inflation", "hike", "reduce liquidity", "restrictive"];
pub const DOVISH_TERMS: [&str; 5] = ["accommodative", "stimulus", "easing", "cut rates", "lower interest"];

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("valid regex");
    static ref NON_LETTER: Regex = Regex::new(r"[^a-zA-Z\s]").expect("valid regex");
}

/// Policy stance suggested by a document's wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tone {
    Hawkish,
    Dovish,
    Neutral,
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tone::Hawkish => "Hawkish",
            Tone::Dovish => "Dovish",
            Tone::Neutral => "Neutral",
        };
        f.write_str(name)
    }
}

/// Collapses whitespace, drops everything but ASCII letters and spaces, lowercases.
fn clean_text(text: &str) -> String {
    let collapsed = WHITESPACE.replace_all(text, " ");
    NON_LETTER.replace_all(&collapsed, "").to_lowercase()
}

fn count_terms(text: &str, terms: &[&str]) -> usize {
    terms.iter().map(|term| text.matches(term).count()).sum()
}

/// Scores `text` against the hawkish and dovish keyword lists.
///
/// Returns the tone with the hawkish and dovish counts; equal counts are neutral.
/// Terms match as substrings, so "inflationary" counts toward "inflation".
pub fn classify_sentiment(text: &str) -> (Tone, usize, usize) {
    let cleaned = clean_text(text);
    let hawkish = count_terms(&cleaned, &HAWKISH_TERMS);
    let dovish = count_terms(&cleaned, &DOVISH_TERMS);

    let tone = match hawkish.cmp(&dovish) {
        std::cmp::Ordering::Greater => Tone::Hawkish,
        std::cmp::Ordering::Less => Tone::Dovish,
        std::cmp::Ordering::Equal => Tone::Neutral,
    };
    (tone, hawkish, dovish)
}
