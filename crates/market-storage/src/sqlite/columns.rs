use crate::error::{DecodeFailure, Result, ScanResult, StoreError};
use crate::key::Table;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;

/// A record stored as typed columns. The first `KEY_LEN` fields form the primary key.
pub(crate) trait SqlRecord: Sized {
    const TABLE: Table;
    const FIELDS: &'static [&'static str];
    const KEY_LEN: usize = 1;

    fn bind(&self) -> Result<Vec<Value>>;

    fn decode(cols: &Columns) -> Result<Self>;
}

/// Raw column values of one row, with decode helpers that name the failing column.
pub(crate) struct Columns {
    fields: &'static [&'static str],
    key_len: usize,
    values: Vec<Value>,
}

impl Columns {
    pub fn key(&self) -> String {
        self.values
            .iter()
            .take(self.key_len)
            .map(|v| match v {
                Value::Text(s) => s.clone(),
                Value::Integer(n) => n.to_string(),
                other => format!("{:?}", other),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    fn err(&self, i: usize, reason: impl Display) -> StoreError {
        StoreError::Decode {
            key: self.key(),
            reason: format!("column {}: {}", self.fields.get(i).unwrap_or(&"?"), reason),
        }
    }

    fn value(&self, i: usize) -> Result<&Value> {
        self.values.get(i).ok_or_else(|| self.err(i, "missing"))
    }

    pub fn opt_text(&self, i: usize) -> Result<Option<&str>> {
        match self.value(i)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.as_str())),
            other => Err(self.err(i, format!("expected text, got {:?}", other))),
        }
    }

    pub fn text(&self, i: usize) -> Result<&str> {
        self.opt_text(i)?.ok_or_else(|| self.err(i, "unexpected NULL"))
    }

    pub fn opt_int(&self, i: usize) -> Result<Option<i64>> {
        match self.value(i)? {
            Value::Null => Ok(None),
            Value::Integer(n) => Ok(Some(*n)),
            other => Err(self.err(i, format!("expected integer, got {:?}", other))),
        }
    }

    pub fn int(&self, i: usize) -> Result<i64> {
        self.opt_int(i)?.ok_or_else(|| self.err(i, "unexpected NULL"))
    }

    pub fn opt_u64(&self, i: usize) -> Result<Option<u64>> {
        self.opt_int(i)?
            .map(|n| u64::try_from(n).map_err(|e| self.err(i, e)))
            .transpose()
    }

    pub fn u64(&self, i: usize) -> Result<u64> {
        self.opt_u64(i)?.ok_or_else(|| self.err(i, "unexpected NULL"))
    }

    pub fn flag(&self, i: usize) -> Result<bool> {
        Ok(self.int(i)? != 0)
    }

    pub fn opt_parse<T>(&self, i: usize) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.opt_text(i)?
            .map(|s| s.parse::<T>().map_err(|e| self.err(i, e)))
            .transpose()
    }

    pub fn parse<T>(&self, i: usize) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.opt_parse(i)?.ok_or_else(|| self.err(i, "unexpected NULL"))
    }

    pub fn opt_json<T: DeserializeOwned>(&self, i: usize) -> Result<Option<T>> {
        self.opt_text(i)?
            .map(|s| serde_json::from_str(s).map_err(|e| self.err(i, e)))
            .transpose()
    }

    pub fn json<T: DeserializeOwned>(&self, i: usize) -> Result<T> {
        self.opt_json(i)?.ok_or_else(|| self.err(i, "unexpected NULL"))
    }
}

pub(crate) fn text(v: impl ToString) -> Value {
    Value::Text(v.to_string())
}

pub(crate) fn opt_text<T: ToString>(v: Option<T>) -> Value {
    v.map(text).unwrap_or(Value::Null)
}

pub(crate) fn int(v: i64) -> Value {
    Value::Integer(v)
}

pub(crate) fn uint(v: u64) -> Result<Value> {
    i64::try_from(v)
        .map(Value::Integer)
        .map_err(|_| StoreError::Encode(format!("{} does not fit a SQLite integer", v)))
}

pub(crate) fn opt_uint(v: Option<u64>) -> Result<Value> {
    v.map(uint).unwrap_or(Ok(Value::Null))
}

pub(crate) fn flag(v: bool) -> Value {
    Value::Integer(v as i64)
}

pub(crate) fn json<T: Serialize>(v: &T) -> Result<Value> {
    serde_json::to_string(v)
        .map(Value::Text)
        .map_err(|e| StoreError::Encode(e.to_string()))
}

pub(crate) fn opt_json<T: Serialize>(v: Option<&T>) -> Result<Value> {
    v.map(json).unwrap_or(Ok(Value::Null))
}

fn upsert_sql<T: SqlRecord>() -> String {
    let placeholders: Vec<String> = (1..=T::FIELDS.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = T::FIELDS[T::KEY_LEN..]
        .iter()
        .map(|f| format!("{f} = excluded.{f}"))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
        T::TABLE.name(),
        T::FIELDS.join(", "),
        placeholders.join(", "),
        T::FIELDS[..T::KEY_LEN].join(", "),
        updates.join(", ")
    )
}

/// Insert or replace by primary key.
pub(crate) fn upsert<T: SqlRecord>(conn: &Connection, record: &T) -> Result<()> {
    let values = record.bind()?;
    conn.execute(&upsert_sql::<T>(), params_from_iter(values.iter()))?;
    Ok(())
}

/// Run `SELECT <fields> FROM <table> <clause>` and decode every row.
pub(crate) fn select<T: SqlRecord>(
    conn: &Connection,
    clause: &str,
    args: &[Value],
) -> Result<ScanResult<T>> {
    let sql = format!("SELECT {} FROM {} {}", T::FIELDS.join(", "), T::TABLE.name(), clause);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(args.iter()))?;

    let mut result = ScanResult::new();
    while let Some(row) = rows.next()? {
        let values = (0..T::FIELDS.len())
            .map(|i| row.get::<_, Value>(i))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let cols = Columns {
            fields: T::FIELDS,
            key_len: T::KEY_LEN,
            values,
        };
        match T::decode(&cols) {
            Ok(record) => result.items.push(record),
            Err(e) => result.failures.push(DecodeFailure {
                key: cols.key(),
                reason: e.to_string(),
            }),
        }
    }
    Ok(result)
}

/// Exactly one record or a typed not-found.
pub(crate) fn select_one<T: SqlRecord>(
    conn: &Connection,
    clause: &str,
    args: &[Value],
    key: impl Display,
) -> Result<T> {
    let mut found = select::<T>(conn, clause, args)?;
    if let Some(failure) = found.failures.pop() {
        return Err(StoreError::Decode {
            key: failure.key,
            reason: failure.reason,
        });
    }
    found
        .items
        .pop()
        .ok_or_else(|| StoreError::not_found(T::TABLE.name(), key))
}

pub(crate) fn exists<T: SqlRecord>(conn: &Connection, clause: &str, args: &[Value]) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {} {} LIMIT 1", T::TABLE.name(), clause);
    let hit: Option<i64> = conn
        .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))
        .optional()?;
    Ok(hit.is_some())
}

/// `<column> IN (?n, ?n+1, ...)` for `count` values starting at placeholder `first`.
pub(crate) fn in_clause(column: &str, first: usize, count: usize) -> String {
    let placeholders: Vec<String> = (first..first + count).map(|i| format!("?{}", i)).collect();
    format!("{} IN ({})", column, placeholders.join(", "))
}
