use super::{Collection, Condition, Document, DocumentStore, FieldUpdate, Filter, Query};
use anyhow::Context;
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Document store backed by a single SQLite table and the JSON1 functions.
///
/// All statements run under one connection mutex, so each conditional update is
/// evaluated and written atomically with respect to every other caller sharing the store.
#[derive(Clone)]
pub struct SqliteStore {
    pub conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        // Several worker processes may share one database file.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(crate::storage::schema::DDL)?;
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, collection: Collection, id: &str) -> anyhow::Result<Option<Document>> {
        let conn = self.lock()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        match row {
            Some((version, body)) => Ok(Some(Document {
                id: id.to_string(),
                version,
                source: serde_json::from_str(&body)
                    .with_context(|| format!("corrupt document {}/{}", collection.as_str(), id))?,
            })),
            None => Ok(None),
        }
    }

    async fn put(&self, collection: Collection, id: &str, source: &Value) -> anyhow::Result<i64> {
        let conn = self.lock()?;
        let version: i64 = conn
            .query_row(
                "INSERT INTO documents(collection, id, version, body, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?4)
                 ON CONFLICT(collection, id) DO UPDATE SET
                    body = excluded.body,
                    version = documents.version + 1,
                    updated_at = excluded.updated_at
                 RETURNING version",
                params![
                    collection.as_str(),
                    id,
                    serde_json::to_string(source)?,
                    now_rfc3339()
                ],
                |r| r.get(0),
            )
            .with_context(|| format!("put {}/{}", collection.as_str(), id))?;
        Ok(version)
    }

    async fn search(&self, collection: Collection, query: &Query) -> anyhow::Result<Vec<Document>> {
        let (where_sql, mut args) = compile_filters(collection, &query.filters);
        let mut sql = format!("SELECT id, version, body FROM documents WHERE {}", where_sql);
        if let Some(sort) = &query.sort {
            sql.push_str(&format!(
                " ORDER BY json_extract(body, ?) {}, id ASC",
                if sort.descending { "DESC" } else { "ASC" }
            ));
            args.push(SqlValue::Text(json_path(&sort.field)));
        } else {
            sql.push_str(" ORDER BY id ASC");
        }
        if let Some(size) = query.size {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(size as i64));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (id, version, body) = r?;
            let source = serde_json::from_str(&body)
                .with_context(|| format!("corrupt document {}/{}", collection.as_str(), id))?;
            out.push(Document {
                id,
                version,
                source,
            });
        }
        Ok(out)
    }

    async fn conditional_update(
        &self,
        collection: Collection,
        id: &str,
        condition: &Condition,
        updates: &[FieldUpdate],
    ) -> anyhow::Result<bool> {
        if updates.is_empty() {
            anyhow::bail!("conditional_update requires at least one field update");
        }

        let mut args: Vec<SqlValue> = Vec::new();
        let mut set_parts = Vec::with_capacity(updates.len());
        for u in updates {
            set_parts.push("?, json(?)");
            args.push(SqlValue::Text(json_path(&u.field)));
            args.push(SqlValue::Text(serde_json::to_string(&u.value)?));
        }

        let cond_sql = if condition.equals.is_null() {
            args_push_path(&mut args, &condition.field);
            "json_extract(body, ?) IS NULL".to_string()
        } else {
            args_push_path(&mut args, &condition.field);
            args.push(to_sql_value(&condition.equals));
            "json_extract(body, ?) = ?".to_string()
        };

        let sql = format!(
            "UPDATE documents
             SET body = json_set(body, {}), version = version + 1, updated_at = ?
             WHERE collection = ? AND id = ? AND {}",
            set_parts.join(", "),
            cond_sql
        );

        // Placeholders are positional: SET values, updated_at, collection, id, condition.
        let cond_args = args.split_off(updates.len() * 2);
        args.push(SqlValue::Text(now_rfc3339()));
        args.push(SqlValue::Text(collection.as_str().to_string()));
        args.push(SqlValue::Text(id.to_string()));
        args.extend(cond_args);

        let conn = self.lock()?;
        let changed = conn
            .execute(&sql, params_from_iter(args.iter()))
            .with_context(|| format!("conditional update {}/{}", collection.as_str(), id))?;
        Ok(changed == 1)
    }

    async fn delete_by_query(&self, collection: Collection, query: &Query) -> anyhow::Result<u64> {
        let (where_sql, args) = compile_filters(collection, &query.filters);
        let sql = format!("DELETE FROM documents WHERE {}", where_sql);
        let conn = self.lock()?;
        let n = conn.execute(&sql, params_from_iter(args.iter()))?;
        Ok(n as u64)
    }
}

fn args_push_path(args: &mut Vec<SqlValue>, field: &str) {
    args.push(SqlValue::Text(json_path(field)));
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

fn compile_filters(collection: Collection, filters: &[Filter]) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["collection = ?".to_string()];
    let mut args = vec![SqlValue::Text(collection.as_str().to_string())];

    for f in filters {
        match f {
            Filter::Term { field, value } => {
                let (sql, a) = membership_clause(field, std::slice::from_ref(value));
                clauses.push(sql);
                args.extend(a);
            }
            Filter::Terms { field, values } => {
                let (sql, a) = membership_clause(field, values);
                clauses.push(sql);
                args.extend(a);
            }
            Filter::Exists { field } => {
                clauses.push(
                    "(json_type(body, ?) IS NOT NULL AND json_type(body, ?) != 'null' \
                     AND NOT (json_type(body, ?) = 'array' AND json_array_length(body, ?) = 0))"
                        .to_string(),
                );
                for _ in 0..4 {
                    args.push(SqlValue::Text(json_path(field)));
                }
            }
            Filter::Range { field, gt, lt } => {
                if let Some(v) = gt {
                    clauses.push("json_extract(body, ?) > ?".to_string());
                    args.push(SqlValue::Text(json_path(field)));
                    args.push(to_sql_value(v));
                }
                if let Some(v) = lt {
                    clauses.push("json_extract(body, ?) < ?".to_string());
                    args.push(SqlValue::Text(json_path(field)));
                    args.push(to_sql_value(v));
                }
            }
        }
    }

    (clauses.join(" AND "), args)
}

fn membership_clause(field: &str, values: &[Value]) -> (String, Vec<SqlValue>) {
    if values.is_empty() {
        return ("0".to_string(), Vec::new());
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    let vals: Vec<SqlValue> = values.iter().map(to_sql_value).collect();

    if field == "_id" {
        return (format!("id IN ({})", placeholders), vals);
    }

    let path = json_path(field);
    let sql = format!(
        "(CASE WHEN json_type(body, ?) = 'array' \
         THEN EXISTS (SELECT 1 FROM json_each(body, ?) WHERE json_each.value IN ({p})) \
         ELSE json_extract(body, ?) IN ({p}) END)",
        p = placeholders
    );
    let mut args = vec![SqlValue::Text(path.clone()), SqlValue::Text(path.clone())];
    args.extend(vals.iter().cloned());
    args.push(SqlValue::Text(path));
    args.extend(vals);
    (sql, args)
}

fn to_sql_value(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
