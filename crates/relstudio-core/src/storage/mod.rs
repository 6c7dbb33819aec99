pub mod schema;
pub mod store;

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Workspaces,
    Scenarios,
    Strategies,
    Judgements,
    Benchmarks,
    Evaluations,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Workspaces => "workspaces",
            Collection::Scenarios => "scenarios",
            Collection::Strategies => "strategies",
            Collection::Judgements => "judgements",
            Collection::Benchmarks => "benchmarks",
            Collection::Evaluations => "evaluations",
        }
    }
}

/// A stored document together with its store-assigned version.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub version: i64,
    pub source: Value,
}

impl Document {
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.source.clone())
            .map_err(|e| anyhow::anyhow!("failed to decode document {}: {}", self.id, e))
    }
}

/// Field paths are dotted (`meta.status`). `_id` addresses the document id.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Equality; against an array field, matches when any element equals the value.
    Term { field: String, value: Value },
    /// Like `Term` but for any of the values.
    Terms { field: String, values: Vec<Value> },
    /// Present, non-null, and not an empty array.
    Exists { field: String },
    Range {
        field: String,
        gt: Option<Value>,
        lt: Option<Value>,
    },
}

impl Filter {
    pub fn term(field: &str, value: impl Into<Value>) -> Self {
        Filter::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn terms<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::Terms {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exists(field: &str) -> Self {
        Filter::Exists {
            field: field.to_string(),
        }
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Range {
            field: field.to_string(),
            gt: Some(value.into()),
            lt: None,
        }
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Range {
            field: field.to_string(),
            gt: None,
            lt: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

/// Conjunction of filters.
///
/// Without a `size` a search returns every match; stores page internally as needed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub sort: Option<Sort>,
    pub size: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, f: Filter) -> Self {
        self.filters.push(f);
        self
    }

    pub fn sort_asc(mut self, field: &str) -> Self {
        self.sort = Some(Sort {
            field: field.to_string(),
            descending: false,
        });
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

/// Guard for a conditional update: applies only if `field` currently equals `equals`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub equals: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field: String,
    pub value: Value,
}

impl FieldUpdate {
    pub fn new(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: Collection, id: &str) -> anyhow::Result<Option<Document>>;

    /// Create or replace. Returns the new version.
    async fn put(&self, collection: Collection, id: &str, source: &Value) -> anyhow::Result<i64>;

    async fn search(&self, collection: Collection, query: &Query) -> anyhow::Result<Vec<Document>>;

    /// Atomically applies `updates` if the condition holds at write time.
    /// Returns whether the update was applied; a missing document is `false`.
    async fn conditional_update(
        &self,
        collection: Collection,
        id: &str,
        condition: &Condition,
        updates: &[FieldUpdate],
    ) -> anyhow::Result<bool>;

    async fn delete_by_query(&self, collection: Collection, query: &Query) -> anyhow::Result<u64>;
}
