//! Index role: search tables, queued mutations and the index job queue.
//!
//! Query evaluation over an in-memory table lives here so every backend
//! answers queries the same way.

use super::{DocClock, Storage, Timestamp};
use crate::error::Result;
use crate::events::Subscription;
use crate::signal::AbortSignal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DOC_TABLE: &str = "doc";
pub const BLOCK_TABLE: &str = "block";
pub const DOC_PREVIEW_TABLE: &str = "docPreview";

/// A schema-less index entry: each field holds one or more string values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub fields: BTreeMap<String, Vec<String>>,
}

impl IndexDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style insert; repeated calls append values.
    pub fn with(mut self, field: &str, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: &str, value: impl Into<String>) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .push(value.into());
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn first(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(|v| v.first()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Occur {
    Must,
    Should,
    MustNot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Query {
    All,
    /// Exact value equality
    Match { field: String, value: String },
    /// Case-insensitive substring, the full-text query
    Contains { field: String, text: String },
    Exists { field: String },
    Boolean { occur: Occur, queries: Vec<Query> },
}

impl Query {
    pub fn match_field(field: &str, value: impl Into<String>) -> Self {
        Query::Match {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn contains(field: &str, text: impl Into<String>) -> Self {
        Query::Contains {
            field: field.to_string(),
            text: text.into(),
        }
    }

    /// Relevance of `doc`, or `None` when it does not match.
    pub fn score(&self, doc: &IndexDocument) -> Option<f64> {
        match self {
            Query::All => Some(1.0),
            Query::Match { field, value } => doc
                .get(field)
                .filter(|values| values.iter().any(|v| v == value))
                .map(|_| 1.0),
            Query::Contains { field, text } => {
                let needle = text.to_lowercase();
                let hits: usize = doc
                    .get(field)?
                    .iter()
                    .map(|v| v.to_lowercase().matches(needle.as_str()).count())
                    .sum();
                (hits > 0).then_some(hits as f64)
            }
            Query::Exists { field } => doc.get(field).filter(|v| !v.is_empty()).map(|_| 1.0),
            Query::Boolean { occur, queries } => {
                let scores: Vec<Option<f64>> = queries.iter().map(|q| q.score(doc)).collect();
                match occur {
                    Occur::Must => scores
                        .iter()
                        .try_fold(0.0, |acc, s| s.map(|s| acc + s)),
                    Occur::Should => {
                        let matched: Vec<f64> = scores.into_iter().flatten().collect();
                        (!matched.is_empty()).then(|| matched.iter().sum())
                    }
                    Occur::MustNot => scores.iter().all(Option::is_none).then_some(1.0),
                }
            }
        }
    }

    pub fn matches(&self, doc: &IndexDocument) -> bool {
        self.score(doc).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: default_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightOption {
    pub field: String,
    pub before: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    #[serde(default)]
    pub pagination: Pagination,
    /// Fields to return; empty returns none
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub highlights: Vec<HighlightOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchNode {
    pub id: String,
    pub score: f64,
    pub fields: BTreeMap<String, Vec<String>>,
    pub highlights: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub count: usize,
    pub skip: usize,
    pub limit: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub pagination: PageInfo,
    pub nodes: Vec<SearchNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateOptions {
    #[serde(default)]
    pub pagination: Pagination,
    /// Options for the hits returned inside each bucket
    #[serde(default)]
    pub hits: SearchOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateBucket {
    pub key: String,
    pub score: f64,
    pub count: usize,
    pub hits: SearchResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub pagination: PageInfo,
    pub buckets: Vec<AggregateBucket>,
}

fn highlight(value: &str, option: &HighlightOption, query: &Query) -> Option<String> {
    let terms = collect_terms(query, &option.field);
    let lower = value.to_lowercase();
    let term = terms.iter().find(|t| !t.is_empty() && lower.contains(t.as_str()))?;
    let start = lower.find(term.as_str())?;
    let end = start + term.len();
    // Lowercasing can shift byte offsets for some scripts.
    if !value.is_char_boundary(start) || !value.is_char_boundary(end) || end > value.len() {
        return None;
    }
    Some(format!(
        "{}{}{}{}{}",
        &value[..start],
        option.before,
        &value[start..end],
        option.end,
        &value[end..]
    ))
}

fn collect_terms(query: &Query, field: &str) -> Vec<String> {
    match query {
        Query::Contains { field: f, text } if f == field => vec![text.to_lowercase()],
        Query::Match { field: f, value } if f == field => vec![value.to_lowercase()],
        Query::Boolean { occur, queries } if *occur != Occur::MustNot => {
            queries.iter().flat_map(|q| collect_terms(q, field)).collect()
        }
        _ => Vec::new(),
    }
}

fn to_node(doc: &IndexDocument, score: f64, query: &Query, options: &SearchOptions) -> SearchNode {
    let fields = options
        .fields
        .iter()
        .filter_map(|f| doc.fields.get(f).map(|v| (f.clone(), v.clone())))
        .collect();
    let highlights = options
        .highlights
        .iter()
        .filter_map(|h| {
            let values: Vec<String> = doc
                .get(&h.field)?
                .iter()
                .filter_map(|v| highlight(v, h, query))
                .collect();
            (!values.is_empty()).then(|| (h.field.clone(), values))
        })
        .collect();
    SearchNode {
        id: doc.id.clone(),
        score,
        fields,
        highlights,
    }
}

fn ranked<'a>(
    docs: impl Iterator<Item = &'a IndexDocument>,
    query: &Query,
) -> Vec<(&'a IndexDocument, f64)> {
    let mut hits: Vec<_> = docs
        .filter_map(|doc| query.score(doc).map(|score| (doc, score)))
        .collect();
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    hits
}

fn page<T>(items: Vec<T>, pagination: &Pagination) -> (Vec<T>, PageInfo) {
    let count = items.len();
    let page: Vec<T> = items
        .into_iter()
        .skip(pagination.skip)
        .take(pagination.limit)
        .collect();
    let info = PageInfo {
        count,
        skip: pagination.skip,
        limit: pagination.limit,
        has_more: pagination.skip + page.len() < count,
    };
    (page, info)
}

/// Run `query` over a table.
pub fn search_table<'a>(
    docs: impl Iterator<Item = &'a IndexDocument>,
    query: &Query,
    options: &SearchOptions,
) -> SearchResult {
    let (hits, pagination) = page(ranked(docs, query), &options.pagination);
    SearchResult {
        pagination,
        nodes: hits
            .into_iter()
            .map(|(doc, score)| to_node(doc, score, query, options))
            .collect(),
    }
}

/// Group matches of `query` by the values of `field`.
pub fn aggregate_table<'a>(
    docs: impl Iterator<Item = &'a IndexDocument>,
    query: &Query,
    field: &str,
    options: &AggregateOptions,
) -> AggregateResult {
    let mut groups: BTreeMap<String, Vec<(&IndexDocument, f64)>> = BTreeMap::new();
    for (doc, score) in ranked(docs, query) {
        for key in doc.get(field).unwrap_or_default() {
            groups.entry(key.clone()).or_default().push((doc, score));
        }
    }

    let mut buckets: Vec<AggregateBucket> = groups
        .into_iter()
        .map(|(key, hits)| {
            let score = hits.iter().map(|(_, s)| *s).fold(0.0, f64::max);
            let count = hits.len();
            let (page_hits, pagination) = page(hits, &options.hits.pagination);
            AggregateBucket {
                key,
                score,
                count,
                hits: SearchResult {
                    pagination,
                    nodes: page_hits
                        .into_iter()
                        .map(|(doc, s)| to_node(doc, s, query, &options.hits))
                        .collect(),
                },
            }
        })
        .collect();
    buckets.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });

    let (buckets, pagination) = page(buckets, &options.pagination);
    AggregateResult {
        pagination,
        buckets,
    }
}

/// A doc waiting to be (re)indexed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexJob {
    pub doc_id: String,
}

/// Mutation waiting in a table queue until `refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexMutation {
    Insert(IndexDocument),
    Update(IndexDocument),
    Delete(String),
}

pub type TableUpdatedCallback = Box<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait IndexerStorage: Storage {
    async fn search(
        &self,
        table: &str,
        query: &Query,
        options: &SearchOptions,
    ) -> Result<SearchResult>;

    async fn aggregate(
        &self,
        table: &str,
        query: &Query,
        field: &str,
        options: &AggregateOptions,
    ) -> Result<AggregateResult>;

    /// Queue an insert (replaces any existing document with the same id).
    async fn insert(&self, table: &str, document: IndexDocument) -> Result<()>;

    /// Queue an update (replaces only the given fields).
    async fn update(&self, table: &str, document: IndexDocument) -> Result<()>;

    /// Queue a delete.
    async fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// Apply the queued mutations of `table` as one write.
    async fn refresh(&self, table: &str) -> Result<()>;

    /// Apply upserts and deletes in one batch, bypassing the queue.
    async fn write(&self, table: &str, upserts: Vec<IndexDocument>, deletes: Vec<String>)
    -> Result<()>;

    async fn delete_by_query(&self, table: &str, query: &Query) -> Result<()>;

    async fn all_ids(&self, table: &str) -> Result<Vec<String>>;

    /// Add a job unless one for the doc is already pending.
    async fn enqueue_index_job(&self, doc_id: &str) -> Result<()>;

    /// Wait for a pending job whose doc is not in flight and mark it in flight.
    async fn accept_index_job(&self, signal: &AbortSignal) -> Result<IndexJob>;

    /// Release the in-flight slot of `job`.
    async fn complete_index_job(&self, job: IndexJob) -> Result<()>;

    /// Pending plus in-flight jobs.
    async fn index_job_count(&self) -> Result<usize>;

    /// Signaled after every write to `table`, from any instance sharing the backend.
    fn subscribe_table_updated(&self, table: &str, callback: TableUpdatedCallback)
    -> Subscription;
}

#[async_trait]
pub trait IndexerSyncStorage: Storage {
    async fn get_doc_indexed_clock(&self, doc_id: &str) -> Result<Option<DocClock>>;
    async fn set_doc_indexed_clock(&self, doc_id: &str, timestamp: Timestamp) -> Result<()>;
    async fn clear_doc_indexed_clock(&self, doc_id: &str) -> Result<()>;
}

/// Apply mutations in order to a table.
pub fn apply_mutations(
    table: &mut HashMap<String, IndexDocument>,
    mutations: impl IntoIterator<Item = IndexMutation>,
) {
    for mutation in mutations {
        match mutation {
            IndexMutation::Insert(doc) => {
                table.insert(doc.id.clone(), doc);
            }
            IndexMutation::Update(doc) => {
                let entry = table
                    .entry(doc.id.clone())
                    .or_insert_with(|| IndexDocument::new(doc.id.clone()));
                entry.fields.extend(doc.fields);
            }
            IndexMutation::Delete(id) => {
                table.remove(&id);
            }
        }
    }
}
