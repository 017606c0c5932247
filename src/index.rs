use crate::entry::{FieldValue, LogEntry};
use chrono::{DateTime, Timelike, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::RwLock,
    time::Instant,
};

/// Default page size for searches.
const DEFAULT_LIMIT: usize = 50;
/// Hard ceiling on page size, whatever the query asks for.
const MAX_LIMIT: usize = 1000;

lazy_static! {
    static ref TOKEN_BOUNDARY: Regex = Regex::new(r"[^\w]+").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index {0} is closed")]
    Closed(String),
}

/// Splits text into lowercase terms, dropping single-character tokens.
fn tokenize(text: &str) -> Vec<String> {
    TOKEN_BOUNDARY
        .split(text)
        .filter(|token| token.len() > 1)
        .map(|token| token.to_lowercase())
        .collect()
}

/// An index-internal record: the original entry plus its document id, the
/// terms it produced, and the per-field string values used by filters and
/// aggregations.
#[derive(Clone, Debug)]
pub struct IndexedEntry {
    pub id: String,
    pub entry: LogEntry,
    pub terms: Vec<String>,
    pub field_values: BTreeMap<String, String>,
}

impl IndexedEntry {
    fn build(entry: &LogEntry, ordinal: u64) -> IndexedEntry {
        // Document ids derive deterministically from (timestamp, logger,
        // ordinal) and are unique per index thanks to the ordinal.
        let id = format!(
            "{}-{}-{}",
            entry.timestamp.timestamp_nanos(),
            entry.logger,
            ordinal
        );

        let mut terms = tokenize(&entry.message);
        terms.extend(tokenize(&entry.logger));
        terms.extend(tokenize(entry.level.as_str()));

        let mut field_values = BTreeMap::new();
        field_values.insert("level".to_owned(), entry.level.to_string());
        field_values.insert("logger".to_owned(), entry.logger.clone());
        for (key, value) in &entry.fields {
            if let FieldValue::String(text) = value {
                terms.extend(tokenize(text));
            }
            field_values.insert(key.clone(), value.to_string());
        }
        for (key, value) in &entry.labels {
            terms.extend(tokenize(value));
            field_values.insert(key.clone(), value.clone());
        }

        IndexedEntry {
            id,
            entry: entry.clone(),
            terms,
            field_values,
        }
    }

    /// Numeric view of a field, for the stats aggregation.
    fn numeric_field(&self, field: &str) -> Option<f64> {
        self.entry.fields.get(field).and_then(FieldValue::as_f64)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TimeRange {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SortClause {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HighlightOptions {
    #[serde(default)]
    pub pre_tag: Option<String>,
    #[serde(default)]
    pub post_tag: Option<String>,
}

/// One requested aggregation.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationRequest {
    Terms {
        field: String,
        #[serde(default = "default_terms_size")]
        size: usize,
    },
    DateHistogram {
        #[serde(default = "default_interval")]
        interval: String,
    },
    Stats {
        field: String,
    },
}

fn default_terms_size() -> usize {
    10
}

fn default_interval() -> String {
    "hour".to_owned()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SearchQuery {
    /// Free-text query. Empty means every document is a candidate.
    #[serde(default)]
    pub query: String,
    /// Exact string equality per field.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub sort: Vec<SortClause>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub highlight: Option<HighlightOptions>,
    #[serde(default)]
    pub aggregations: BTreeMap<String, AggregationRequest>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        SearchQuery {
            query: String::new(),
            filters: BTreeMap::new(),
            time_range: None,
            sort: Vec::new(),
            offset: 0,
            limit: None,
            highlight: None,
            aggregations: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub entry: LogEntry,
    /// The message with query terms wrapped in highlight tags, when
    /// highlighting was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TermsBucket {
    pub key: String,
    pub doc_count: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct HistogramBucket {
    pub key: String,
    pub doc_count: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationResult {
    Terms { buckets: Vec<TermsBucket> },
    DateHistogram { buckets: Vec<HistogramBucket> },
    Stats {
        count: u64,
        min: f64,
        max: f64,
        avg: f64,
        sum: f64,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub total: u64,
    pub took_ms: u64,
    pub hits: Vec<SearchHit>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub aggregations: BTreeMap<String, AggregationResult>,
}

/// A point-in-time summary of the index.
#[derive(Clone, Debug, Serialize)]
pub struct IndexStats {
    pub name: String,
    pub doc_count: u64,
    pub term_count: u64,
    pub size_estimate_bytes: u64,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct IndexInner {
    /// term -> (doc id -> TF-IDF score)
    terms: HashMap<String, HashMap<String, f64>>,
    /// doc id -> indexed record
    docs: HashMap<String, IndexedEntry>,
    /// field -> set of values seen for it
    field_values: BTreeMap<String, BTreeSet<String>>,
    ordinal: u64,
    size_estimate_bytes: u64,
    closed: bool,
}

/// The in-memory inverted index. Reads go through the shared side of the
/// lock; every mutation takes the exclusive side.
#[derive(Debug)]
pub struct InvertedIndex {
    name: String,
    inner: RwLock<IndexInner>,
}

impl InvertedIndex {
    pub fn new(name: &str) -> InvertedIndex {
        InvertedIndex {
            name: name.to_owned(),
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Indexes one entry, returning its document id.
    pub fn index(&self, entry: &LogEntry) -> Result<String, IndexError> {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(IndexError::Closed(self.name.clone()));
        }

        let ordinal = inner.ordinal;
        inner.ordinal += 1;
        let indexed = IndexedEntry::build(entry, ordinal);
        let id = indexed.id.clone();

        // TF = term count / doc token count, IDF = 1 + docCount/termDocCount,
        // both computed against the index as it stands at insert time.
        let token_count = indexed.terms.len().max(1) as f64;
        let doc_count = (inner.docs.len() + 1) as f64;
        let mut term_counts: HashMap<&str, usize> = HashMap::new();
        for term in &indexed.terms {
            *term_counts.entry(term).or_insert(0) += 1;
        }
        for (term, count) in term_counts {
            let term_doc_count = inner
                .terms
                .get(term)
                .map(|postings| postings.len() + 1)
                .unwrap_or(1) as f64;
            let tf = count as f64 / token_count;
            let idf = 1.0 + doc_count / term_doc_count;
            inner
                .terms
                .entry(term.to_owned())
                .or_insert_with(HashMap::new)
                .insert(id.clone(), tf * idf);
        }

        for (field, value) in &indexed.field_values {
            inner
                .field_values
                .entry(field.clone())
                .or_insert_with(BTreeSet::new)
                .insert(value.clone());
        }

        inner.size_estimate_bytes += (entry.message.len()
            + entry.logger.len()
            + indexed.terms.iter().map(String::len).sum::<usize>())
            as u64;
        inner.docs.insert(id.clone(), indexed);

        Ok(id)
    }

    /// Runs a search over the index per the query's terms, filters, time
    /// range, sort, pagination, highlighting and aggregations.
    pub fn search(&self, query: &SearchQuery) -> Result<SearchResult, IndexError> {
        let started = Instant::now();
        let inner = self.inner.read().unwrap();
        if inner.closed {
            return Err(IndexError::Closed(self.name.clone()));
        }

        let query_terms = tokenize(&query.query);

        // Candidate set: every document when the query is empty, otherwise
        // the union of postings for the query terms with summed scores.
        let mut candidates: Vec<(f64, &IndexedEntry)> = if query_terms.is_empty() {
            inner.docs.values().map(|doc| (0.0, doc)).collect()
        } else {
            let mut scores: HashMap<&str, f64> = HashMap::new();
            for term in &query_terms {
                if let Some(postings) = inner.terms.get(term) {
                    for (doc_id, score) in postings {
                        *scores.entry(doc_id.as_str()).or_insert(0.0) += score;
                    }
                }
            }
            scores
                .into_iter()
                .filter_map(|(doc_id, score)| inner.docs.get(doc_id).map(|doc| (score, doc)))
                .collect()
        };

        candidates.retain(|(_, doc)| {
            for (field, expected) in &query.filters {
                if doc.field_values.get(field) != Some(expected) {
                    return false;
                }
            }
            if let Some(range) = &query.time_range {
                if let Some(from) = range.from {
                    if doc.entry.timestamp < from {
                        return false;
                    }
                }
                if let Some(to) = range.to {
                    if doc.entry.timestamp > to {
                        return false;
                    }
                }
            }
            true
        });

        // Sort before pagination. Explicit sort clauses compare field
        // values lexicographically; the default is newest first. Document
        // ids break every tie so that identical queries return identical
        // orderings.
        if query.sort.is_empty() {
            candidates.sort_by(|(_, a), (_, b)| {
                b.entry
                    .timestamp
                    .cmp(&a.entry.timestamp)
                    .then_with(|| b.id.cmp(&a.id))
            });
        } else {
            candidates.sort_by(|(_, a), (_, b)| {
                for clause in &query.sort {
                    let left = a.field_values.get(&clause.field);
                    let right = b.field_values.get(&clause.field);
                    let ordering = match clause.order {
                        SortOrder::Asc => left.cmp(&right),
                        SortOrder::Desc => right.cmp(&left),
                    };
                    if ordering != std::cmp::Ordering::Equal {
                        return ordering;
                    }
                }
                b.id.cmp(&a.id)
            });
        }

        let total = candidates.len() as u64;

        let mut aggregations = BTreeMap::new();
        for (name, request) in &query.aggregations {
            aggregations.insert(name.clone(), Self::aggregate(request, &candidates));
        }

        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let highlighter = query.highlight.as_ref().map(|options| {
            Highlighter::new(&query_terms, options)
        });

        let hits = candidates
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .map(|(score, doc)| {
                let highlight = highlighter
                    .as_ref()
                    .and_then(|h| h.apply(&doc.entry.message));
                SearchHit {
                    id: doc.id.clone(),
                    score,
                    entry: doc.entry.clone(),
                    highlight,
                }
            })
            .collect();

        Ok(SearchResult {
            total,
            took_ms: started.elapsed().as_millis() as u64,
            hits,
            aggregations,
        })
    }

    fn aggregate(
        request: &AggregationRequest,
        candidates: &[(f64, &IndexedEntry)],
    ) -> AggregationResult {
        match request {
            AggregationRequest::Terms { field, size } => {
                let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
                for (_, doc) in candidates {
                    if let Some(value) = doc.field_values.get(field) {
                        *counts.entry(value.as_str()).or_insert(0) += 1;
                    }
                }
                let mut buckets: Vec<TermsBucket> = counts
                    .into_iter()
                    .map(|(key, doc_count)| TermsBucket {
                        key: key.to_owned(),
                        doc_count,
                    })
                    .collect();
                // Descending count, ascending key on ties.
                buckets.sort_by(|a, b| {
                    b.doc_count.cmp(&a.doc_count).then_with(|| a.key.cmp(&b.key))
                });
                buckets.truncate(*size);
                AggregationResult::Terms { buckets }
            }
            AggregationRequest::DateHistogram { interval: _ } => {
                // Only hourly buckets are supported.
                let mut counts: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
                for (_, doc) in candidates {
                    let hour = doc
                        .entry
                        .timestamp
                        .with_minute(0)
                        .and_then(|t| t.with_second(0))
                        .and_then(|t| t.with_nanosecond(0))
                        .unwrap_or(doc.entry.timestamp);
                    *counts.entry(hour).or_insert(0) += 1;
                }
                let buckets = counts
                    .into_iter()
                    .map(|(hour, doc_count)| HistogramBucket {
                        key: hour.to_rfc3339(),
                        doc_count,
                    })
                    .collect();
                AggregationResult::DateHistogram { buckets }
            }
            AggregationRequest::Stats { field } => {
                let values: Vec<f64> = candidates
                    .iter()
                    .filter_map(|(_, doc)| doc.numeric_field(field))
                    .collect();
                let count = values.len() as u64;
                let sum: f64 = values.iter().sum();
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                AggregationResult::Stats {
                    count,
                    min: if count == 0 { 0.0 } else { min },
                    max: if count == 0 { 0.0 } else { max },
                    avg: if count == 0 { 0.0 } else { sum / count as f64 },
                    sum,
                }
            }
        }
    }

    /// The set of values seen per field, for the fields API.
    pub fn fields(&self) -> BTreeMap<String, Vec<String>> {
        let inner = self.inner.read().unwrap();
        inner
            .field_values
            .iter()
            .map(|(field, values)| (field.clone(), values.iter().cloned().collect()))
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read().unwrap();
        IndexStats {
            name: self.name.clone(),
            doc_count: inner.docs.len() as u64,
            term_count: inner.terms.len() as u64,
            size_estimate_bytes: inner.size_estimate_bytes,
            healthy: !inner.closed,
        }
    }

    /// Closes the index. Subsequent index and search calls fail; the data
    /// itself is released when the index is dropped.
    pub fn close(&self) {
        self.inner.write().unwrap().closed = true;
    }
}

/// Wraps case-insensitive whole-word occurrences of the query terms in the
/// configured tags.
struct Highlighter {
    regex: Option<Regex>,
    pre_tag: String,
    post_tag: String,
}

impl Highlighter {
    fn new(query_terms: &[String], options: &HighlightOptions) -> Highlighter {
        let regex = if query_terms.is_empty() {
            None
        } else {
            let alternation = query_terms
                .iter()
                .map(|term| regex::escape(term))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&format!(r"(?i)\b({})\b", alternation)).ok()
        };
        Highlighter {
            regex,
            pre_tag: options.pre_tag.clone().unwrap_or_else(|| "<em>".to_owned()),
            post_tag: options.post_tag.clone().unwrap_or_else(|| "</em>".to_owned()),
        }
    }

    fn apply(&self, message: &str) -> Option<String> {
        let regex = self.regex.as_ref()?;
        if !regex.is_match(message) {
            return None;
        }
        Some(
            regex
                .replace_all(message, format!("{}$1{}", self.pre_tag, self.post_tag))
                .into_owned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogLevel;
    use chrono::TimeZone;

    fn seeded_index() -> InvertedIndex {
        let index = InvertedIndex::new("logs");
        index
            .index(
                &LogEntry::new(LogLevel::Error, "Payment failed for order 42", "billing")
                    .with_field("amount", 1250i64),
            )
            .unwrap();
        index
            .index(&LogEntry::new(LogLevel::Info, "User login succeeded", "auth"))
            .unwrap();
        index
            .index(&LogEntry::new(LogLevel::Warn, "Auth token expiring", "auth"))
            .unwrap();
        index
    }

    #[test]
    fn query_matches_only_relevant_docs() {
        let index = seeded_index();
        let result = index
            .search(&SearchQuery {
                query: "payment".to_owned(),
                ..SearchQuery::default()
            })
            .unwrap();

        assert_eq!(result.total, 1);
        assert!(result.hits[0].entry.message.contains("Payment"));
        assert!(result.hits[0].score > 0.0);
    }

    #[test]
    fn empty_query_returns_everything_newest_first() {
        let index = seeded_index();
        let result = index.search(&SearchQuery::default()).unwrap();
        assert_eq!(result.total, 3);
        for window in result.hits.windows(2) {
            assert!(window[0].entry.timestamp >= window[1].entry.timestamp);
        }
    }

    #[test]
    fn search_is_idempotent() {
        let index = seeded_index();
        let query = SearchQuery {
            query: "auth".to_owned(),
            ..SearchQuery::default()
        };
        let first = index.search(&query).unwrap();
        let second = index.search(&query).unwrap();
        let first_ids: Vec<&str> = first.hits.iter().map(|h| h.id.as_str()).collect();
        let second_ids: Vec<&str> = second.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn filters_are_exact_string_matches() {
        let index = seeded_index();
        let mut filters = BTreeMap::new();
        filters.insert("level".to_owned(), "warn".to_owned());
        let result = index
            .search(&SearchQuery {
                filters,
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.hits[0].entry.level, LogLevel::Warn);
    }

    #[test]
    fn time_range_window() {
        let index = InvertedIndex::new("logs");
        for (seconds, message) in [(100, "early"), (200, "middle"), (300, "late")] {
            let mut entry = LogEntry::new(LogLevel::Info, message, "app");
            entry.timestamp = Utc.timestamp_opt(seconds, 0).unwrap();
            index.index(&entry).unwrap();
        }

        let result = index
            .search(&SearchQuery {
                time_range: Some(TimeRange {
                    from: Some(Utc.timestamp_opt(150, 0).unwrap()),
                    to: Some(Utc.timestamp_opt(250, 0).unwrap()),
                }),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.hits[0].entry.message, "middle");
    }

    #[test]
    fn pagination_defaults_and_ceiling() {
        let index = InvertedIndex::new("logs");
        for i in 0..60 {
            index
                .index(&LogEntry::new(LogLevel::Info, &format!("entry {}", i), "app"))
                .unwrap();
        }

        let defaulted = index.search(&SearchQuery::default()).unwrap();
        assert_eq!(defaulted.total, 60);
        assert_eq!(defaulted.hits.len(), DEFAULT_LIMIT);

        let capped = index
            .search(&SearchQuery {
                limit: Some(10_000),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(capped.hits.len(), 60);

        let offset = index
            .search(&SearchQuery {
                offset: 55,
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(offset.hits.len(), 5);
    }

    #[test]
    fn highlight_wraps_terms() {
        let index = seeded_index();
        let result = index
            .search(&SearchQuery {
                query: "payment".to_owned(),
                highlight: Some(HighlightOptions {
                    pre_tag: None,
                    post_tag: None,
                }),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(
            result.hits[0].highlight.as_deref(),
            Some("<em>Payment</em> failed for order 42")
        );
    }

    #[test]
    fn terms_aggregation_sorted_by_count_then_key() {
        let index = seeded_index();
        let mut aggregations = BTreeMap::new();
        aggregations.insert(
            "levels".to_owned(),
            AggregationRequest::Terms {
                field: "level".to_owned(),
                size: 10,
            },
        );
        let result = index
            .search(&SearchQuery {
                aggregations,
                ..SearchQuery::default()
            })
            .unwrap();

        match result.aggregations.get("levels").unwrap() {
            AggregationResult::Terms { buckets } => {
                assert_eq!(buckets.len(), 3);
                for bucket in buckets {
                    assert_eq!(bucket.doc_count, 1);
                }
                // Equal counts fall back to key order.
                let keys: Vec<&str> = buckets.iter().map(|b| b.key.as_str()).collect();
                assert_eq!(keys, vec!["error", "info", "warn"]);
            }
            other => panic!("unexpected aggregation result {:?}", other),
        }
    }

    #[test]
    fn stats_aggregation_coerces_ints() {
        let index = InvertedIndex::new("logs");
        for value in [10i64, 20, 30] {
            index
                .index(&LogEntry::new(LogLevel::Info, "m", "app").with_field("latency", value))
                .unwrap();
        }
        let mut aggregations = BTreeMap::new();
        aggregations.insert(
            "latency".to_owned(),
            AggregationRequest::Stats {
                field: "latency".to_owned(),
            },
        );
        let result = index
            .search(&SearchQuery {
                aggregations,
                ..SearchQuery::default()
            })
            .unwrap();

        match result.aggregations.get("latency").unwrap() {
            AggregationResult::Stats {
                count,
                min,
                max,
                avg,
                sum,
            } => {
                assert_eq!(*count, 3);
                assert_eq!(*min, 10.0);
                assert_eq!(*max, 30.0);
                assert_eq!(*avg, 20.0);
                assert_eq!(*sum, 60.0);
            }
            other => panic!("unexpected aggregation result {:?}", other),
        }
    }

    #[test]
    fn date_histogram_buckets_by_hour() {
        let index = InvertedIndex::new("logs");
        for (hour, minute) in [(10, 5), (10, 40), (11, 1)] {
            let mut entry = LogEntry::new(LogLevel::Info, "m", "app");
            entry.timestamp = Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap();
            index.index(&entry).unwrap();
        }
        let mut aggregations = BTreeMap::new();
        aggregations.insert(
            "over_time".to_owned(),
            AggregationRequest::DateHistogram {
                interval: "hour".to_owned(),
            },
        );
        let result = index
            .search(&SearchQuery {
                aggregations,
                ..SearchQuery::default()
            })
            .unwrap();

        match result.aggregations.get("over_time").unwrap() {
            AggregationResult::DateHistogram { buckets } => {
                assert_eq!(buckets.len(), 2);
                assert_eq!(buckets[0].key, "2024-03-01T10:00:00+00:00");
                assert_eq!(buckets[0].doc_count, 2);
                assert_eq!(buckets[1].doc_count, 1);
            }
            other => panic!("unexpected aggregation result {:?}", other),
        }
    }

    #[test]
    fn explicit_sort_compares_field_values() {
        let index = InvertedIndex::new("logs");
        for logger in ["zeta", "alpha", "mike"] {
            index
                .index(&LogEntry::new(LogLevel::Info, "m", logger))
                .unwrap();
        }
        let result = index
            .search(&SearchQuery {
                sort: vec![SortClause {
                    field: "logger".to_owned(),
                    order: SortOrder::Asc,
                }],
                ..SearchQuery::default()
            })
            .unwrap();
        let loggers: Vec<&str> = result
            .hits
            .iter()
            .map(|h| h.entry.logger.as_str())
            .collect();
        assert_eq!(loggers, vec!["alpha", "mike", "zeta"]);
    }

    #[test]
    fn closed_index_rejects_operations() {
        let index = seeded_index();
        index.close();
        assert!(matches!(
            index.index(&LogEntry::new(LogLevel::Info, "m", "app")),
            Err(IndexError::Closed(_))
        ));
        assert!(index.search(&SearchQuery::default()).is_err());
        assert!(!index.stats().healthy);
    }

    #[test]
    fn fields_registry_accumulates_values() {
        let index = seeded_index();
        let fields = index.fields();
        assert!(fields.get("level").unwrap().contains(&"error".to_owned()));
        assert!(fields.get("logger").unwrap().contains(&"auth".to_owned()));
        assert!(fields.get("amount").unwrap().contains(&"1250".to_owned()));
    }
}
