//! Persistence collaborator interface
//!
//! The engine never talks to a database directly: generated resolvers build a
//! [StoreQuery] (predicate, ordering and window in one request) and hand it to
//! a [DataStore]. Writes go through a [StoreTransaction], which rolls back when
//! dropped without [StoreTransaction::commit].

mod memory;
mod predicate;
#[cfg(feature = "sqlite")]
mod sqlite;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

pub use memory::MemoryStore;
pub use predicate::*;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, TableSyncResult};

use crate::error::StoreError;

/// One row, keyed by storage column.
pub type Record = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: String,
    pub descending: bool,
}

impl OrderTerm {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// A complete read: filter, order and window.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreQuery {
    pub table: String,
    pub predicate: Predicate,
    pub order: Vec<OrderTerm>,
    pub offset: usize,
    pub limit: Option<usize>,
    /// Also report the number of rows matching `predicate` before windowing
    pub count_total: bool,
    /// Keep only the last `n` rows of the window
    pub tail: Option<usize>,
}

impl StoreQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: Predicate::All,
            order: Vec::new(),
            offset: 0,
            limit: None,
            count_total: false,
            tail: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = self.predicate.and(predicate);
        self
    }

    pub fn order(mut self, order: Vec<OrderTerm>) -> Self {
        self.order = order;
        self
    }

    pub fn window(mut self, offset: usize, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn with_total(mut self) -> Self {
        self.count_total = true;
        self
    }

    pub fn tail(mut self, n: usize) -> Self {
        self.tail = Some(n);
        self
    }

    /// Concrete offset and limit once `total` matching rows are known.
    pub fn resolved_window(&self, total: usize) -> (usize, Option<usize>) {
        let Some(tail) = self.tail else {
            return (self.offset, self.limit);
        };
        let end = self
            .limit
            .map_or(total, |limit| self.offset.saturating_add(limit).min(total))
            .max(self.offset);
        let start = end.saturating_sub(tail).max(self.offset);
        (start, Some(end - start))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorePage {
    pub rows: Vec<Record>,
    pub total: Option<usize>,
}

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn select(&self, query: &StoreQuery) -> Result<StorePage, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// A scoped write transaction.
///
/// Implementations must discard all writes when dropped without a commit, so
/// a cancelled resolver future leaves nothing behind.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn select(&mut self, query: &StoreQuery) -> Result<StorePage, StoreError>;

    /// Insert `row`; when `key` is absent (or null) the store assigns it.
    /// Returns the stored row.
    async fn insert(&mut self, table: &str, key: &str, row: Record) -> Result<Record, StoreError>;

    /// Apply `changes` to the row whose `key` equals `id`.
    async fn update(
        &mut self,
        table: &str,
        key: &str,
        id: &JsonValue,
        changes: Record,
    ) -> Result<Option<Record>, StoreError>;

    async fn delete_where(&mut self, table: &str, predicate: &Predicate) -> Result<usize, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
