//! Full-text search across every section of a document.

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cfi::Cfi;
use crate::config::SearchConfig;
use crate::engine::{Section, SectionLease};
use crate::error::Result;
use crate::locations::LocationIndex;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub cfi: Cfi,
    pub excerpt: String,
    /// Spine index of the section the hit came from.
    pub section: usize,
}

impl SearchResult {
    /// Position of the hit in the document. Derived on demand, never stored.
    pub fn percentage(&self, index: &LocationIndex) -> Result<f32> {
        index.percentage_from_cfi(&self.cfi)
    }
}

/// A result prepared for display, with its progress when the location index
/// is available.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEntry {
    pub result: SearchResult,
    pub percentage: Option<f32>,
}

/// Keeps the first `limit` results and attaches their percentages.
pub fn present(
    results: Vec<SearchResult>,
    index: Option<&LocationIndex>,
    limit: usize,
) -> Vec<ResultEntry> {
    results
        .into_iter()
        .take(limit)
        .map(|result| {
            let percentage = index.and_then(|index| match result.percentage(index) {
                Ok(percentage) => Some(percentage),
                Err(err) => {
                    debug!(cfi = %result.cfi, %err, "no percentage for result");
                    None
                }
            });
            ResultEntry { result, percentage }
        })
        .collect()
}

/// Drops leading ellipses and whitespace, then bounds the excerpt to
/// `window` characters.
pub fn clean_excerpt(excerpt: &str, window: usize) -> String {
    let mut rest = excerpt;
    loop {
        let trimmed = rest.trim_start().trim_start_matches("...");
        if trimmed.len() == rest.len() {
            break;
        }
        rest = trimmed;
    }
    rest.chars().take(window).collect()
}

#[derive(Debug, Clone)]
pub struct SearchAggregator {
    concurrency: Option<usize>,
    excerpt_window: usize,
}

impl Default for SearchAggregator {
    fn default() -> Self {
        Self::from_config(&SearchConfig::default())
    }
}

impl SearchAggregator {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            excerpt_window: config.excerpt_window,
        }
    }

    /// Searches every section and returns the hits in reading order.
    ///
    /// Sections are searched concurrently; a section that fails to load or
    /// to search contributes nothing and never fails the whole search.
    #[instrument(skip(self, sections), fields(sections = sections.len()))]
    pub async fn search(
        &self,
        sections: &[Arc<dyn Section>],
        query: &str,
    ) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let passes = sections
            .iter()
            .map(|section| self.search_section(Arc::clone(section), query));
        let per_section: Vec<Vec<SearchResult>> = match self.concurrency {
            None => join_all(passes).await,
            Some(limit) => stream::iter(passes).buffered(limit.max(1)).collect().await,
        };

        let results: Vec<SearchResult> = per_section.into_iter().flatten().collect();
        info!(results = results.len(), "search finished");
        Ok(results)
    }

    async fn search_section(&self, section: Arc<dyn Section>, query: &str) -> Vec<SearchResult> {
        let spine_index = section.index();
        let mut lease = SectionLease::acquire(section);
        let content = match lease.load().await {
            Ok(content) => content,
            Err(err) => {
                warn!(section = spine_index, %err, "skipping section in search");
                return Vec::new();
            }
        };
        if content.map_or(true, |content| content.is_empty()) {
            debug!(section = spine_index, "section has no content to search");
            return Vec::new();
        }
        match lease.section().find(query) {
            Ok(matches) => matches
                .into_iter()
                .map(|found| SearchResult {
                    cfi: found.cfi,
                    excerpt: clean_excerpt(&found.excerpt, self.excerpt_window),
                    section: spine_index,
                })
                .collect(),
            Err(err) => {
                warn!(section = spine_index, %err, "search failed in section");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use crate::testing::{ascending_cfis, FakeSection};

    fn as_spine(sections: &[Arc<FakeSection>]) -> Vec<Arc<dyn Section>> {
        sections
            .iter()
            .map(|section| Arc::clone(section) as Arc<dyn Section>)
            .collect()
    }

    fn sections_of(results: &[SearchResult]) -> Vec<usize> {
        results.iter().map(|result| result.section).collect()
    }

    #[tokio::test]
    async fn failing_section_is_skipped() {
        let sections = vec![
            FakeSection::with_text(0, &["a whale"]),
            FakeSection::failing(1),
            FakeSection::with_text(2, &["another whale"]),
        ];
        let results = SearchAggregator::default()
            .search(&as_spine(&sections), "whale")
            .await
            .unwrap();

        assert_eq!(sections_of(&results), vec![0, 2]);
        for section in &sections {
            assert_eq!(section.load_calls(), 1);
            assert_eq!(section.unload_calls(), 1);
            assert!(!section.is_loaded());
        }
    }

    #[tokio::test]
    async fn results_follow_spine_order_not_completion_order() {
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sections = vec![
            Arc::new(
                FakeSection::text(0, &["sea one"])
                    .waiting_for(gate.clone())
                    .logging_to(log.clone()),
            ),
            Arc::new(
                FakeSection::text(1, &["sea two"])
                    .notifying(gate.clone())
                    .logging_to(log.clone()),
            ),
            Arc::new(FakeSection::text(2, &["sea three"]).logging_to(log.clone())),
        ];
        let results = SearchAggregator::default()
            .search(&as_spine(&sections), "sea")
            .await
            .unwrap();

        assert_eq!(log.lock().first(), Some(&1));
        assert_eq!(log.lock().last(), Some(&0));
        assert_eq!(sections_of(&results), vec![0, 1, 2]);
        assert!(results.windows(2).all(|pair| pair[0].cfi < pair[1].cfi));
    }

    #[tokio::test]
    async fn bounded_fan_out_preserves_order() {
        let gate = Arc::new(Notify::new());
        let sections = vec![
            Arc::new(FakeSection::text(0, &["sea"]).waiting_for(gate.clone())),
            Arc::new(FakeSection::text(1, &["sea"]).notifying(gate.clone())),
            FakeSection::with_text(2, &["sea"]),
            FakeSection::with_text(3, &["sea"]),
        ];
        let aggregator = SearchAggregator::from_config(&SearchConfig {
            concurrency: Some(2),
            ..SearchConfig::default()
        });
        let results = aggregator.search(&as_spine(&sections), "sea").await.unwrap();
        assert_eq!(sections_of(&results), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_sections_and_misses_yield_nothing() {
        let sections = vec![
            FakeSection::empty(0),
            FakeSection::with_text(1, &["   "]),
            FakeSection::with_text(2, &["no hits here"]),
        ];
        let results = SearchAggregator::default()
            .search(&as_spine(&sections), "whale")
            .await
            .unwrap();
        assert!(results.is_empty());
        assert!(sections.iter().all(|section| section.unload_calls() == 1));
    }

    #[tokio::test]
    async fn blank_query_loads_nothing() {
        let sections = vec![FakeSection::with_text(0, &["text"])];
        let results = SearchAggregator::default()
            .search(&as_spine(&sections), "  \t")
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(sections[0].load_calls(), 0);
    }

    #[tokio::test]
    async fn loaded_section_is_reloaded_from_scratch() {
        let section = FakeSection::with_text(0, &["sea"]);
        section.load().await.unwrap();
        let results = SearchAggregator::default()
            .search(&as_spine(&[section.clone()]), "sea")
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(section.unload_calls(), 2);
        assert_eq!(section.load_calls(), 2);
    }

    #[tokio::test]
    async fn excerpts_are_cleaned() {
        let text = format!("{} the whale {}", "x".repeat(200), "y".repeat(200));
        let sections = vec![FakeSection::with_text(0, &[text.as_str()])];
        let results = SearchAggregator::default()
            .search(&as_spine(&sections), "whale")
            .await
            .unwrap();
        let excerpt = &results[0].excerpt;
        assert!(!excerpt.starts_with("..."));
        assert!(excerpt.contains("whale"));
        assert!(excerpt.chars().count() <= 150);
    }

    #[test]
    fn clean_excerpt_strips_leading_noise() {
        assert_eq!(clean_excerpt("... ...  the sea", 150), "the sea");
        assert_eq!(clean_excerpt("\n...whale...", 150), "whale...");
        assert_eq!(clean_excerpt("abcdef", 3), "abc");
        assert_eq!(clean_excerpt("", 3), "");
    }

    #[test]
    fn present_limits_and_derives_percentages() {
        let index = LocationIndex::from_cfis(10, ascending_cfis(5)).unwrap();
        let results: Vec<SearchResult> = ascending_cfis(5)
            .into_iter()
            .map(|cfi| SearchResult {
                cfi,
                excerpt: String::new(),
                section: 0,
            })
            .collect();

        let entries = present(results.clone(), Some(&index), 3);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].percentage, Some(0.5));

        let without_index = present(results, None, 10);
        assert_eq!(without_index.len(), 5);
        assert!(without_index.iter().all(|entry| entry.percentage.is_none()));
    }
}
