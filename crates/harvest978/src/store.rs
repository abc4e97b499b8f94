use chrono::{DateTime, Utc};
use rs978::decode::time::to_iso8601;
use rs978::model::{Product, ProductType};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/**
 * The authoritative current-state store behind the curator. One document
 * per (type, unique name); the curator is the only writer.
 *
 * Two implementations: SQLite for durable runs, a BTreeMap for tests and
 * ephemeral pipelines. Transient SQLite contention surfaces as
 * [`StoreError::Transient`] so the curator can back off and retry;
 * anything else is permanent and fatal for the curator alone.
 */

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("store error: {0}")]
    Permanent(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        match &error {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                StoreError::Transient(error.to_string())
            }
            _ => StoreError::Permanent(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Permanent(error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProduct {
    pub insert_time: DateTime<Utc>,
    #[serde(flatten)]
    pub product: Product,
}

pub trait Store {
    fn upsert(&mut self, doc: &StoredProduct) -> Result<(), StoreError>;
    fn get(
        &self,
        product_type: ProductType,
        unique_name: &str,
    ) -> Result<Option<StoredProduct>, StoreError>;
    fn delete(
        &mut self,
        product_type: ProductType,
        unique_name: &str,
    ) -> Result<bool, StoreError>;
    fn by_type(
        &self,
        product_type: ProductType,
    ) -> Result<Vec<StoredProduct>, StoreError>;
    /// Keys of everything at or past its expiration
    fn expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(ProductType, String)>, StoreError>;
    fn types_present(&self) -> Result<Vec<ProductType>, StoreError>;
    fn put_legend(
        &mut self,
        product: &str,
        doc: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

fn type_string(product_type: ProductType) -> String {
    product_type.to_string()
}

fn type_from_string(text: &str) -> Result<ProductType, StoreError> {
    serde_json::from_value(serde_json::Value::String(text.to_owned()))
        .map_err(|_| StoreError::Permanent(format!("unknown type {text:?}")))
}

// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemStore {
    docs: BTreeMap<(String, String), StoredProduct>,
    legends: BTreeMap<String, serde_json::Value>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl Store for MemStore {
    fn upsert(&mut self, doc: &StoredProduct) -> Result<(), StoreError> {
        let key = (
            type_string(doc.product.product_type),
            doc.product.unique_name.clone(),
        );
        self.docs.insert(key, doc.clone());
        Ok(())
    }

    fn get(
        &self,
        product_type: ProductType,
        unique_name: &str,
    ) -> Result<Option<StoredProduct>, StoreError> {
        Ok(self
            .docs
            .get(&(type_string(product_type), unique_name.to_owned()))
            .cloned())
    }

    fn delete(
        &mut self,
        product_type: ProductType,
        unique_name: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .docs
            .remove(&(type_string(product_type), unique_name.to_owned()))
            .is_some())
    }

    fn by_type(
        &self,
        product_type: ProductType,
    ) -> Result<Vec<StoredProduct>, StoreError> {
        let type_key = type_string(product_type);
        Ok(self
            .docs
            .range((type_key.clone(), String::new())..)
            .take_while(|((t, _), _)| *t == type_key)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    fn expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(ProductType, String)>, StoreError> {
        let mut keys = Vec::new();
        for doc in self.docs.values() {
            if doc.product.expiration_time <= now {
                keys.push((
                    doc.product.product_type,
                    doc.product.unique_name.clone(),
                ));
            }
        }
        Ok(keys)
    }

    fn types_present(&self) -> Result<Vec<ProductType>, StoreError> {
        let mut types: Vec<ProductType> = self
            .docs
            .values()
            .map(|doc| doc.product.product_type)
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    fn put_legend(
        &mut self,
        product: &str,
        doc: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.legends.insert(product.to_owned(), doc.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS MSG (
                 type TEXT NOT NULL,
                 unique_name TEXT NOT NULL,
                 insert_time TEXT NOT NULL,
                 expiration_time TEXT NOT NULL,
                 doc TEXT NOT NULL,
                 PRIMARY KEY (type, unique_name)
             );
             CREATE INDEX IF NOT EXISTS idx_msg_type ON MSG (type);
             CREATE INDEX IF NOT EXISTS idx_msg_insert ON MSG (insert_time);
             CREATE INDEX IF NOT EXISTS idx_msg_expire
                 ON MSG (expiration_time);
             CREATE TABLE IF NOT EXISTS LEGEND (
                 product TEXT PRIMARY KEY,
                 doc TEXT NOT NULL
             );",
        )?;
        Ok(SqliteStore { conn })
    }

    fn doc_from_row(doc: String) -> Result<StoredProduct, StoreError> {
        Ok(serde_json::from_str(&doc)?)
    }
}

impl Store for SqliteStore {
    fn upsert(&mut self, doc: &StoredProduct) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO MSG (type, unique_name, insert_time,
                              expiration_time, doc)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (type, unique_name) DO UPDATE SET
                 insert_time = excluded.insert_time,
                 expiration_time = excluded.expiration_time,
                 doc = excluded.doc",
            rusqlite::params![
                type_string(doc.product.product_type),
                doc.product.unique_name,
                to_iso8601(&doc.insert_time),
                to_iso8601(&doc.product.expiration_time),
                serde_json::to_string(doc)?,
            ],
        )?;
        Ok(())
    }

    fn get(
        &self,
        product_type: ProductType,
        unique_name: &str,
    ) -> Result<Option<StoredProduct>, StoreError> {
        let mut statement = self.conn.prepare(
            "SELECT doc FROM MSG WHERE type = ?1 AND unique_name = ?2",
        )?;
        let mut rows = statement
            .query(rusqlite::params![type_string(product_type), unique_name])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::doc_from_row(row.get(0)?)?)),
            None => Ok(None),
        }
    }

    fn delete(
        &mut self,
        product_type: ProductType,
        unique_name: &str,
    ) -> Result<bool, StoreError> {
        let count = self.conn.execute(
            "DELETE FROM MSG WHERE type = ?1 AND unique_name = ?2",
            rusqlite::params![type_string(product_type), unique_name],
        )?;
        Ok(count > 0)
    }

    fn by_type(
        &self,
        product_type: ProductType,
    ) -> Result<Vec<StoredProduct>, StoreError> {
        let mut statement = self.conn.prepare(
            "SELECT doc FROM MSG WHERE type = ?1 ORDER BY unique_name",
        )?;
        let rows = statement
            .query_map(rusqlite::params![type_string(product_type)], |row| {
                row.get::<_, String>(0)
            })?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(Self::doc_from_row(row?)?);
        }
        Ok(docs)
    }

    fn expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(ProductType, String)>, StoreError> {
        let mut statement = self.conn.prepare(
            "SELECT type, unique_name FROM MSG WHERE expiration_time <= ?1",
        )?;
        let rows = statement
            .query_map(rusqlite::params![to_iso8601(&now)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
        let mut keys = Vec::new();
        for row in rows {
            let (type_text, unique_name) = row?;
            keys.push((type_from_string(&type_text)?, unique_name));
        }
        Ok(keys)
    }

    fn types_present(&self) -> Result<Vec<ProductType>, StoreError> {
        let mut statement = self
            .conn
            .prepare("SELECT DISTINCT type FROM MSG ORDER BY type")?;
        let rows =
            statement.query_map([], |row| row.get::<_, String>(0))?;
        let mut types = Vec::new();
        for row in rows {
            types.push(type_from_string(&row?)?);
        }
        Ok(types)
    }

    fn put_legend(
        &mut self,
        product: &str,
        doc: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO LEGEND (product, doc) VALUES (?1, ?2)
             ON CONFLICT (product) DO UPDATE SET doc = excluded.doc",
            rusqlite::params![product, doc.to_string()],
        )?;
        Ok(())
    }
}
