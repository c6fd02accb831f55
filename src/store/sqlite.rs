//! SQLite adapter
//!
//! Translates [StoreQuery] and [Predicate] trees into parameterized SQL.
//! Relationship filters become correlated `EXISTS` subqueries; every value is
//! bound, never interpolated. Identifiers come from model descriptors and are
//! quoted.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use tracing::{debug, info, warn};

use super::{
    CompareOp, Comparison, DataStore, Join, Predicate, Record, StorePage, StoreQuery, StoreTransaction,
    ValueClass,
};
use crate::error::StoreError;
use crate::introspect::{Direction, FieldKind, ModelDescriptor, RelationKind};

/// Value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    String(String),
    Int(i64),
    Float(f64),
    Null,
}

impl SqlValue {
    fn from_json(value: &JsonValue, class: ValueClass) -> Self {
        match (value, class) {
            (JsonValue::Null, _) => SqlValue::Null,
            (JsonValue::Bool(b), _) => SqlValue::Int(i64::from(*b)),
            (JsonValue::Number(n), ValueClass::Decimal | ValueClass::Text) => SqlValue::String(n.to_string()),
            (JsonValue::Number(n), _) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Float(n.as_f64().unwrap_or_default()),
            },
            (JsonValue::String(s), ValueClass::Number) => {
                if let Ok(i) = s.parse::<i64>() {
                    SqlValue::Int(i)
                } else if let Ok(f) = s.parse::<f64>() {
                    SqlValue::Float(f)
                } else {
                    SqlValue::String(s.clone())
                }
            }
            (JsonValue::String(s), ValueClass::Boolean) => match s.as_str() {
                "true" | "1" => SqlValue::Int(1),
                "false" | "0" => SqlValue::Int(0),
                _ => SqlValue::String(s.clone()),
            },
            (JsonValue::String(s), _) => SqlValue::String(s.clone()),
            (other, _) => SqlValue::String(other.to_string()),
        }
    }

    /// Column values written by inserts and updates.
    fn from_column(value: &JsonValue) -> Self {
        match value {
            JsonValue::Array(_) | JsonValue::Object(_) => SqlValue::String(value.to_string()),
            other => SqlValue::from_json(other, ValueClass::Json),
        }
    }

    fn bind_to_query<'q>(
        &'q self,
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            SqlValue::String(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Null => query.bind(None::<String>),
        }
    }
}

/// SQL text plus its bound values.
#[derive(Debug, Default)]
struct Statement {
    sql: String,
    values: Vec<SqlValue>,
    aliases: usize,
}

impl Statement {
    fn push(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    fn bind(&mut self, value: SqlValue) {
        self.sql.push('?');
        self.values.push(value);
    }

    fn next_alias(&mut self, prefix: char) -> String {
        self.aliases += 1;
        format!("{prefix}{}", self.aliases)
    }

    fn push_predicate(&mut self, predicate: &Predicate, alias: &str) {
        match predicate {
            Predicate::All => self.push("1"),
            Predicate::And(parts) => self.push_joined(parts, " AND ", "1", alias),
            Predicate::Or(parts) => self.push_joined(parts, " OR ", "0", alias),
            Predicate::Not(inner) => {
                // a comparison against NULL yields NULL; negating it must match
                self.push("NOT COALESCE((");
                self.push_predicate(inner, alias);
                self.push("), 0)");
            }
            Predicate::Compare(cmp) => self.push_comparison(cmp, alias),
            Predicate::Related { join, predicate } => self.push_exists(join, predicate, alias),
        }
    }

    fn push_joined(&mut self, parts: &[Predicate], separator: &str, empty: &str, alias: &str) {
        if parts.is_empty() {
            self.push(empty);
            return;
        }
        self.push("(");
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                self.push(separator);
            }
            self.push_predicate(part, alias);
        }
        self.push(")");
    }

    fn push_comparison(&mut self, cmp: &Comparison, alias: &str) {
        let column = qualified(alias, &cmp.column);
        // temporal columns compare as text, which orders correctly because
        // writes coerce them to fixed-width UTC ISO-8601
        let column = match cmp.class {
            ValueClass::Decimal if !matches!(cmp.op, CompareOp::IsNull) => {
                format!("CAST({column} AS REAL)")
            }
            _ => column,
        };
        let class = cmp.class;
        let operand = |value: &JsonValue| match class {
            ValueClass::Decimal => SqlValue::from_json(value, ValueClass::Number),
            _ => SqlValue::from_json(value, class),
        };
        let text = |value: &JsonValue| match value {
            JsonValue::String(s) => SqlValue::String(s.clone()),
            other => SqlValue::String(other.to_string()),
        };
        match cmp.op {
            CompareOp::Eq => self.binary(&column, "=", operand(&cmp.value)),
            CompareOp::Gt => self.binary(&column, ">", operand(&cmp.value)),
            CompareOp::Gte => self.binary(&column, ">=", operand(&cmp.value)),
            CompareOp::Lt => self.binary(&column, "<", operand(&cmp.value)),
            CompareOp::Lte => self.binary(&column, "<=", operand(&cmp.value)),
            CompareOp::IEq => {
                self.push(&format!("LOWER({column}) = LOWER("));
                self.bind(text(&cmp.value));
                self.push(")");
            }
            CompareOp::Contains => {
                self.push(&format!("instr({column}, "));
                self.bind(text(&cmp.value));
                self.push(") > 0");
            }
            CompareOp::IContains => {
                self.push(&format!("instr(LOWER({column}), LOWER("));
                self.bind(text(&cmp.value));
                self.push(")) > 0");
            }
            CompareOp::StartsWith | CompareOp::IStartsWith => {
                let fold = cmp.op == CompareOp::IStartsWith;
                let value = text(&cmp.value);
                self.push(&fold_case(fold, &format!("substr({column}, 1, length(")));
                self.bind(value.clone());
                self.push(if fold { "))) = LOWER(" } else { ")) = (" });
                self.bind(value);
                self.push(")");
            }
            CompareOp::EndsWith | CompareOp::IEndsWith => {
                let fold = cmp.op == CompareOp::IEndsWith;
                let value = text(&cmp.value);
                self.push("(length(");
                self.bind(value.clone());
                self.push(") = 0 OR ");
                self.push(&fold_case(fold, &format!("substr({column}, -length(")));
                self.bind(value.clone());
                self.push(if fold { "))) = LOWER(" } else { ")) = (" });
                self.bind(value);
                self.push("))");
            }
            CompareOp::In => match cmp.value.as_array() {
                Some(items) if !items.is_empty() => {
                    self.push(&format!("{column} IN ("));
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            self.push(", ");
                        }
                        self.bind(operand(item));
                    }
                    self.push(")");
                }
                _ => self.push("0"),
            },
            CompareOp::IsNull => {
                let wants_null = cmp.value.as_bool().unwrap_or(true);
                self.push(&format!(
                    "{column} {}",
                    if wants_null { "IS NULL" } else { "IS NOT NULL" }
                ));
            }
            CompareOp::Range => match cmp.value.as_array().map(Vec::as_slice) {
                Some([low, high]) => {
                    self.push(&format!("{column} BETWEEN "));
                    self.bind(operand(low));
                    self.push(" AND ");
                    self.bind(operand(high));
                }
                _ => self.push("0"),
            },
        }
    }

    fn binary(&mut self, column: &str, op: &str, value: SqlValue) {
        self.push(&format!("{column} {op} "));
        self.bind(value);
    }

    fn push_exists(&mut self, join: &Join, predicate: &Predicate, alias: &str) {
        let related = self.next_alias('t');
        match join {
            Join::Forward {
                column,
                table,
                related_key,
            } => {
                self.push(&format!(
                    "EXISTS (SELECT 1 FROM {} AS {related} WHERE {} = {} AND ",
                    quote(table),
                    qualified(&related, related_key),
                    qualified(alias, column),
                ));
            }
            Join::Reverse { table, column, key } => {
                self.push(&format!(
                    "EXISTS (SELECT 1 FROM {} AS {related} WHERE {} = {} AND ",
                    quote(table),
                    qualified(&related, column),
                    qualified(alias, key),
                ));
            }
            Join::Through {
                through,
                source_column,
                target_column,
                key,
                table,
                related_key,
            } => {
                let link = self.next_alias('l');
                self.push(&format!(
                    "EXISTS (SELECT 1 FROM {} AS {link} JOIN {} AS {related} ON {} = {} WHERE {} = {} AND ",
                    quote(through),
                    quote(table),
                    qualified(&related, related_key),
                    qualified(&link, target_column),
                    qualified(&link, source_column),
                    qualified(alias, key),
                ));
            }
        }
        self.push("(");
        self.push_predicate(predicate, &related);
        self.push("))");
    }
}

fn fold_case(fold: bool, expr: &str) -> String {
    if fold {
        format!("LOWER({expr}")
    } else {
        format!("({expr}")
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn qualified(alias: &str, column: &str) -> String {
    format!("{alias}.{}", quote(column))
}

fn select_statement(query: &StoreQuery) -> Statement {
    let mut stmt = Statement::default();
    stmt.push(&format!("SELECT t0.* FROM {} AS t0", quote(&query.table)));
    if !query.predicate.is_all() {
        stmt.push(" WHERE ");
        stmt.push_predicate(&query.predicate, "t0");
    }
    if !query.order.is_empty() {
        let terms: Vec<String> = query
            .order
            .iter()
            .map(|term| {
                format!(
                    "{} {}",
                    qualified("t0", &term.column),
                    if term.descending { "DESC" } else { "ASC" }
                )
            })
            .collect();
        stmt.push(" ORDER BY ");
        stmt.push(&terms.join(", "));
    }
    match (query.limit, query.offset) {
        (Some(limit), offset) => stmt.push(&format!(" LIMIT {limit} OFFSET {offset}")),
        (None, offset) if offset > 0 => stmt.push(&format!(" LIMIT -1 OFFSET {offset}")),
        _ => {}
    }
    stmt
}

fn count_statement(query: &StoreQuery) -> Statement {
    let mut stmt = Statement::default();
    stmt.push(&format!("SELECT COUNT(*) FROM {} AS t0", quote(&query.table)));
    if !query.predicate.is_all() {
        stmt.push(" WHERE ");
        stmt.push_predicate(&query.predicate, "t0");
    }
    stmt
}

fn build<'q>(stmt: &'q Statement) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(&stmt.sql);
    for value in &stmt.values {
        query = value.bind_to_query(query);
    }
    query
}

/// Decode a row by the storage class of each value.
fn decode_row(row: &SqliteRow) -> Result<Record, StoreError> {
    let mut record = Record::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            JsonValue::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => JsonValue::from(row.try_get::<i64, _>(idx)?),
                "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(idx)?)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null),
                "BLOB" => JsonValue::String(
                    base64::engine::general_purpose::STANDARD.encode(row.try_get::<Vec<u8>, _>(idx)?),
                ),
                _ => JsonValue::String(row.try_get::<String, _>(idx)?),
            }
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

async fn run_select(conn: &mut SqliteConnection, query: &StoreQuery) -> Result<StorePage, StoreError> {
    let counted = if query.count_total || query.tail.is_some() {
        let stmt = count_statement(query);
        let count: i64 = build(&stmt).fetch_one(&mut *conn).await?.try_get(0)?;
        Some(count.max(0) as usize)
    } else {
        None
    };
    let placed;
    let windowed = match (query.tail, counted) {
        (Some(_), Some(total)) => {
            let (offset, limit) = query.resolved_window(total);
            placed = StoreQuery {
                tail: None,
                ..query.clone()
            }
            .window(offset, limit);
            &placed
        }
        _ => query,
    };
    let stmt = select_statement(windowed);
    debug!(sql = %stmt.sql, binds = stmt.values.len(), "Executing store query");
    let rows = build(&stmt).fetch_all(&mut *conn).await?;
    let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
    Ok(StorePage {
        rows,
        total: counted.filter(|_| query.count_total),
    })
}

/// [DataStore] over a sqlx SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(if url.contains(":memory:") { 1 } else { 5 })
            .connect(url)
            .await?;
        info!(url = %url, "Connected to SQLite store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create missing tables and add missing columns for concrete models.
    ///
    /// Renames and type changes are not handled.
    pub async fn sync_tables(&self, descriptors: &[Arc<ModelDescriptor>]) -> Result<TableSyncResult, StoreError> {
        let mut result = TableSyncResult::default();
        for descriptor in descriptors.iter().filter(|d| !d.inheritance.is_abstract) {
            let columns = column_defs(descriptor);
            if !self.table_exists(&descriptor.table).await? {
                let sql = create_table_sql(&descriptor.table, &columns, &descriptor.unique_together);
                self.execute_ddl(&sql, &mut result, || descriptor.table.clone(), |r| {
                    r.tables_created.push(descriptor.table.clone())
                })
                .await;
            } else {
                let existing = self.table_columns(&descriptor.table).await?;
                for column in columns.iter().filter(|c| !existing.contains(&c.name)) {
                    let sql = add_column_sql(&descriptor.table, column);
                    self.execute_ddl(
                        &sql,
                        &mut result,
                        || format!("{}.{}", descriptor.table, column.name),
                        |r| r.columns_added.push((descriptor.table.clone(), column.name.clone())),
                    )
                    .await;
                }
            }

            for rel in descriptor
                .relationships()
                .filter(|r| r.kind == RelationKind::ManyToMany && r.direction == Direction::Forward)
            {
                let Some(through) = &rel.through else { continue };
                if self.table_exists(&through.table).await? {
                    continue;
                }
                let sql = format!(
                    "CREATE TABLE {} (id INTEGER PRIMARY KEY, {} INTEGER NOT NULL, {} INTEGER NOT NULL, UNIQUE ({}, {}))",
                    quote(&through.table),
                    quote(&through.source_column),
                    quote(&through.target_column),
                    quote(&through.source_column),
                    quote(&through.target_column),
                );
                self.execute_ddl(&sql, &mut result, || through.table.clone(), |r| {
                    r.tables_created.push(through.table.clone())
                })
                .await;
            }
        }
        Ok(result)
    }

    async fn execute_ddl(
        &self,
        sql: &str,
        result: &mut TableSyncResult,
        what: impl FnOnce() -> String,
        on_success: impl FnOnce(&mut TableSyncResult),
    ) {
        debug!(sql = %sql, "Applying DDL");
        match sqlx::query(sql).execute(&self.pool).await {
            Ok(_) => {
                info!(sql = %sql, "Schema synced");
                on_success(result);
            }
            Err(e) => {
                let msg = format!("Failed to sync {}: {}", what(), e);
                warn!("{}", msg);
                result.errors.push(msg);
            }
        }
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(i32, String, String, i32, Option<String>, i32)> =
            sqlx::query_as(&format!("PRAGMA table_info({})", quote(table)))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(_, name, _, _, _, _)| name).collect())
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn select(&self, query: &StoreQuery) -> Result<StorePage, StoreError> {
        let mut conn = self.pool.acquire().await?;
        run_select(&mut conn, query).await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx: Some(tx) }))
    }
}

/// Dropping the inner sqlx transaction without commit rolls it back.
struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl SqliteTransaction {
    fn conn(&mut self) -> Result<&mut SqliteConnection, StoreError> {
        self.tx.as_deref_mut().ok_or(StoreError::Finished)
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn select(&mut self, query: &StoreQuery) -> Result<StorePage, StoreError> {
        run_select(self.conn()?, query).await
    }

    async fn insert(&mut self, table: &str, key: &str, mut row: Record) -> Result<Record, StoreError> {
        if row.get(key).is_some_and(JsonValue::is_null) {
            row.remove(key);
        }
        let mut stmt = Statement::default();
        if row.is_empty() {
            stmt.push(&format!("INSERT INTO {} DEFAULT VALUES RETURNING *", quote(table)));
        } else {
            let columns: Vec<String> = row.keys().map(|c| quote(c)).collect();
            stmt.push(&format!("INSERT INTO {} ({}) VALUES (", quote(table), columns.join(", ")));
            for (i, value) in row.values().enumerate() {
                if i > 0 {
                    stmt.push(", ");
                }
                stmt.bind(SqlValue::from_column(value));
            }
            stmt.push(") RETURNING *");
        }
        debug!(sql = %stmt.sql, "Executing insert");
        let stored = build(&stmt).fetch_one(self.conn()?).await?;
        decode_row(&stored)
    }

    async fn update(
        &mut self,
        table: &str,
        key: &str,
        id: &JsonValue,
        changes: Record,
    ) -> Result<Option<Record>, StoreError> {
        let mut stmt = Statement::default();
        if changes.is_empty() {
            stmt.push(&format!("SELECT * FROM {} WHERE {} = ", quote(table), quote(key)));
        } else {
            stmt.push(&format!("UPDATE {} SET ", quote(table)));
            for (i, (column, value)) in changes.iter().enumerate() {
                if i > 0 {
                    stmt.push(", ");
                }
                stmt.push(&format!("{} = ", quote(column)));
                stmt.bind(SqlValue::from_column(value));
            }
            stmt.push(&format!(" WHERE {} = ", quote(key)));
        }
        stmt.bind(SqlValue::from_column(id));
        if !changes.is_empty() {
            stmt.push(" RETURNING *");
        }
        debug!(sql = %stmt.sql, "Executing update");
        let row = build(&stmt).fetch_optional(self.conn()?).await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn delete_where(&mut self, table: &str, predicate: &Predicate) -> Result<usize, StoreError> {
        let mut stmt = Statement::default();
        stmt.push(&format!("DELETE FROM {} AS t0 WHERE ", quote(table)));
        stmt.push_predicate(predicate, "t0");
        debug!(sql = %stmt.sql, "Executing delete");
        let done = build(&stmt).execute(self.conn()?).await?;
        Ok(done.rows_affected() as usize)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.rollback().await?;
        Ok(())
    }
}

/// Result of [SqliteStore::sync_tables].
#[derive(Debug, Default)]
pub struct TableSyncResult {
    pub tables_created: Vec<String>,
    /// (table, column)
    pub columns_added: Vec<(String, String)>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
struct ColumnDef {
    name: String,
    sql_type: &'static str,
    nullable: bool,
    primary_key: bool,
    unique: bool,
    default: Option<String>,
}

fn sql_type(kind: &FieldKind) -> &'static str {
    match kind {
        FieldKind::Integer => "INTEGER",
        FieldKind::Float => "REAL",
        FieldKind::Boolean => "INTEGER",
        _ => "TEXT",
    }
}

fn sql_literal(value: &JsonValue) -> String {
    match value {
        JsonValue::Bool(b) => i64::from(*b).to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => format!("'{}'", s.replace('\'', "''")),
        JsonValue::Null => "NULL".into(),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn column_defs(descriptor: &ModelDescriptor) -> Vec<ColumnDef> {
    let mut columns: Vec<ColumnDef> = descriptor
        .fields()
        .map(|f| ColumnDef {
            name: f.column.clone(),
            sql_type: sql_type(&f.kind),
            nullable: f.nullable,
            primary_key: f.primary_key,
            unique: f.unique && !f.primary_key,
            default: f.static_default().map(sql_literal),
        })
        .collect();
    for rel in descriptor.relationships() {
        if let (Direction::Forward, Some(column)) = (rel.direction, &rel.column) {
            columns.push(ColumnDef {
                name: column.clone(),
                sql_type: "INTEGER",
                nullable: rel.nullable,
                primary_key: false,
                unique: rel.unique,
                default: None,
            });
        }
    }
    columns
}

fn create_table_sql(table: &str, columns: &[ColumnDef], unique_together: &[Vec<String>]) -> String {
    let mut parts: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote(&c.name), c.sql_type);
            if c.primary_key {
                def.push_str(" PRIMARY KEY");
            } else {
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                if c.unique {
                    def.push_str(" UNIQUE");
                }
            }
            if let Some(default) = &c.default {
                def.push_str(&format!(" DEFAULT {default}"));
            }
            def
        })
        .collect();
    for set in unique_together {
        let cols: Vec<String> = set.iter().map(|c| quote(c)).collect();
        parts.push(format!("UNIQUE ({})", cols.join(", ")));
    }
    format!("CREATE TABLE {} ({})", quote(table), parts.join(", "))
}

/// SQLite cannot add primary key or unique columns, and a NOT NULL column
/// needs a default.
fn add_column_sql(table: &str, column: &ColumnDef) -> String {
    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote(table),
        quote(&column.name),
        column.sql_type
    );
    match &column.default {
        Some(default) => sql.push_str(&format!(" DEFAULT {default}")),
        None if !column.nullable => {
            let fallback = if column.sql_type == "TEXT" { "''" } else { "0" };
            sql.push_str(&format!(" NOT NULL DEFAULT {fallback}"));
        }
        None => {}
    }
    sql
}
