//! services/api/src/adapters/books.rs
//!
//! This module contains the book lookup adapter, which implements the
//! `BookLookupService` port against the Google Books volumes API.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use textlift_core::domain::BookMetadata;
use textlift_core::ports::{BookLookupService, PortError, PortResult};
use tracing::debug;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Clone)]
pub struct GoogleBooksAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleBooksAdapter {
    pub fn new(base_url: String) -> PortResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self { client, base_url })
    }
}

//=========================================================================================
// Wire Types
//=========================================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumesResponse {
    #[serde(default)]
    items: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    volume_info: VolumeInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeInfo {
    title: Option<String>,
    subtitle: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
    publisher: Option<String>,
    published_date: Option<String>,
}

impl VolumeInfo {
    fn to_domain(self) -> BookMetadata {
        let edition = [self.subtitle.as_deref(), self.title.as_deref()]
            .into_iter()
            .flatten()
            .find_map(edition_from);
        BookMetadata {
            title: self.title,
            authors: self.authors,
            edition,
            publisher: self.publisher,
            published_date: self.published_date,
        }
    }
}

/// Picks an edition statement such as "3rd Edition" out of a title line.
fn edition_from(text: &str) -> Option<String> {
    static EDITION: OnceLock<Regex> = OnceLock::new();
    EDITION
        .get_or_init(|| {
            Regex::new(r"(?i)\b(\d+(?:st|nd|rd|th)|first|second|third|fourth|fifth|sixth|seventh|eighth|ninth|tenth)\s+edition\b")
                .expect("static edition pattern")
        })
        .find(text)
        .map(|m| m.as_str().to_string())
}

//=========================================================================================
// `BookLookupService` Trait Implementation
//=========================================================================================

#[async_trait]
impl BookLookupService for GoogleBooksAdapter {
    async fn lookup_by_isbn(&self, isbn: &str) -> PortResult<Option<BookMetadata>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", format!("isbn:{}", isbn))])
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("Book lookup request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(PortError::Unexpected(format!(
                "Book lookup returned {}",
                response.status()
            )));
        }

        let body: VolumesResponse = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("Book lookup returned malformed JSON: {}", e)))?;
        debug!(isbn, matches = body.items.len(), "Book lookup finished");

        Ok(body.items.into_iter().next().map(|v| v.volume_info.to_domain()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_first_volume() {
        let json = r#"{
            "kind": "books#volumes",
            "totalItems": 1,
            "items": [{
                "volumeInfo": {
                    "title": "Operating Systems",
                    "subtitle": "Three Easy Pieces, 2nd Edition",
                    "authors": ["Remzi Arpaci-Dusseau", "Andrea Arpaci-Dusseau"],
                    "publishedDate": "2018"
                }
            }]
        }"#;
        let body: VolumesResponse = serde_json::from_str(json).unwrap();
        let book = body.items.into_iter().next().unwrap().volume_info.to_domain();
        assert_eq!(book.title.as_deref(), Some("Operating Systems"));
        assert_eq!(book.authors.len(), 2);
        assert_eq!(book.edition.as_deref(), Some("2nd Edition"));
        assert_eq!(book.published_date.as_deref(), Some("2018"));
    }

    #[test]
    fn no_items_means_no_match() {
        let body: VolumesResponse = serde_json::from_str(r#"{"kind":"books#volumes","totalItems":0}"#).unwrap();
        assert!(body.items.is_empty());
    }

    #[test]
    fn edition_words_are_recognised() {
        assert_eq!(edition_from("Calculus, Third Edition").as_deref(), Some("Third Edition"));
        assert_eq!(edition_from("Calculus"), None);
    }
}
