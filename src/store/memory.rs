//! In-process store used by tests, the CLI and as the reference semantics
//! for predicate evaluation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{DataStore, Predicate, Record, StorePage, StoreQuery, StoreTransaction, loosely_equal, sort_order};
use crate::error::StoreError;

#[derive(Debug, Default, Clone)]
struct Table {
    rows: Vec<Record>,
    next_id: i64,
}

type Tables = HashMap<String, Table>;

/// Tables of JSON rows behind a lock.
///
/// Transactions work on a private copy and swap it in on commit; writers are
/// serialized so a commit never loses a concurrent transaction's rows.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    writer: Arc<Mutex<()>>,
    accesses: Arc<AtomicU64>,
    pending_failures: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rows to `table`, keeping the id sequence ahead of any numeric `id`.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Record>) {
        let mut tables = self.tables.write();
        let entry = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(id) = row.get("id").and_then(JsonValue::as_i64) {
                entry.next_id = entry.next_id.max(id);
            }
            entry.rows.push(row);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of reads and transactions served so far.
    pub fn access_count(&self) -> u64 {
        self.accesses.load(Ordering::SeqCst)
    }

    /// Make the next `count` reads fail with [StoreError::Unavailable].
    pub fn fail_next_reads(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn select_rows(tables: &Tables, query: &StoreQuery) -> StorePage {
    let lookup = |name: &str| tables.get(name).map(|t| t.rows.clone()).unwrap_or_default();
    let mut rows: Vec<Record> = tables
        .get(&query.table)
        .map(|t| {
            t.rows
                .iter()
                .filter(|row| query.predicate.matches(row, &lookup))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    if !query.order.is_empty() {
        rows.sort_by(|a, b| {
            for term in &query.order {
                let left = a.get(&term.column).unwrap_or(&JsonValue::Null);
                let right = b.get(&term.column).unwrap_or(&JsonValue::Null);
                let mut ord = sort_order(left, right);
                if term.descending {
                    ord = ord.reverse();
                }
                if ord.is_ne() {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    let total = query.count_total.then_some(rows.len());
    let (offset, limit) = query.resolved_window(rows.len());
    let rows = rows
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    StorePage { rows, total }
}

#[async_trait]
impl DataStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn select(&self, query: &StoreQuery) -> Result<StorePage, StoreError> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        debug!(table = %query.table, predicate = ?query.predicate, "memory select");
        Ok(select_rows(&self.tables.read(), query))
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        let guard = self.writer.clone().lock_owned().await;
        let working = self.tables.read().clone();
        Ok(Box::new(MemoryTransaction {
            working,
            tables: self.tables.clone(),
            _guard: guard,
        }))
    }
}

struct MemoryTransaction {
    working: Tables,
    tables: Arc<RwLock<Tables>>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn select(&mut self, query: &StoreQuery) -> Result<StorePage, StoreError> {
        Ok(select_rows(&self.working, query))
    }

    async fn insert(&mut self, table: &str, key: &str, mut row: Record) -> Result<Record, StoreError> {
        let entry = self.working.entry(table.to_string()).or_default();
        match row.get(key) {
            None | Some(JsonValue::Null) => {
                entry.next_id += 1;
                row.insert(key.to_string(), JsonValue::from(entry.next_id));
            }
            Some(id) => {
                if entry.rows.iter().any(|r| r.get(key).is_some_and(|v| loosely_equal(v, id))) {
                    return Err(StoreError::Conflict(format!("{table}.{key} = {id}")));
                }
                if let Some(n) = id.as_i64() {
                    entry.next_id = entry.next_id.max(n);
                }
            }
        }
        entry.rows.push(row.clone());
        Ok(row)
    }

    async fn update(
        &mut self,
        table: &str,
        key: &str,
        id: &JsonValue,
        changes: Record,
    ) -> Result<Option<Record>, StoreError> {
        let Some(entry) = self.working.get_mut(table) else {
            return Ok(None);
        };
        let Some(row) = entry
            .rows
            .iter_mut()
            .find(|r| r.get(key).is_some_and(|v| loosely_equal(v, id)))
        else {
            return Ok(None);
        };
        for (column, value) in changes {
            row.insert(column, value);
        }
        Ok(Some(row.clone()))
    }

    async fn delete_where(&mut self, table: &str, predicate: &Predicate) -> Result<usize, StoreError> {
        let doomed: Vec<usize> = {
            let working = &self.working;
            let lookup = |name: &str| working.get(name).map(|t| t.rows.clone()).unwrap_or_default();
            match working.get(table) {
                Some(t) => t
                    .rows
                    .iter()
                    .enumerate()
                    .filter(|(_, row)| predicate.matches(row, &lookup))
                    .map(|(i, _)| i)
                    .collect(),
                None => return Ok(0),
            }
        };
        if let Some(entry) = self.working.get_mut(table) {
            for index in doomed.iter().rev() {
                entry.rows.remove(*index);
            }
        }
        Ok(doomed.len())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            working, tables, ..
        } = *self;
        *tables.write() = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OrderTerm;
    use serde_json::json;

    fn record(value: JsonValue) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert("items", "id", record(json!({"name": "a"}))).await.unwrap();
        }
        assert!(store.rows("items").is_empty());

        let mut tx = store.begin().await.unwrap();
        let row = tx.insert("items", "id", record(json!({"name": "b"}))).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(row.get("id"), Some(&json!(1)));
        assert_eq!(store.rows("items").len(), 1);
    }

    #[tokio::test]
    async fn test_select_orders_and_windows() {
        let store = MemoryStore::new();
        store.seed(
            "items",
            (1..=5).map(|i| record(json!({"id": i, "rank": 10 - i}))),
        );
        let page = store
            .select(
                &StoreQuery::new("items")
                    .order(vec![OrderTerm::asc("rank")])
                    .window(1, Some(2))
                    .with_total(),
            )
            .await
            .unwrap();
        let ids: Vec<_> = page.rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(4), json!(3)]);
        assert_eq!(page.total, Some(5));
        assert_eq!(store.access_count(), 1);
    }

    #[tokio::test]
    async fn test_tail_is_placed_in_one_read() {
        let store = MemoryStore::new();
        store.seed("items", (1..=6).map(|i| record(json!({"id": i}))));
        let page = store
            .select(&StoreQuery::new("items").window(1, Some(4)).tail(2).with_total())
            .await
            .unwrap();
        let ids: Vec<_> = page.rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(4), json!(5)]);
        assert_eq!(page.total, Some(6));

        let page = store.select(&StoreQuery::new("items").tail(10)).await.unwrap();
        assert_eq!(page.rows.len(), 6);
        assert_eq!(page.total, None);
        assert_eq!(store.access_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let store = MemoryStore::new();
        store.fail_next_reads(1);
        let query = StoreQuery::new("items");
        assert!(store.select(&query).await.unwrap_err().is_transient());
        assert!(store.select(&query).await.is_ok());
    }
}
