pub mod error;
pub mod models;

pub use error::StoreError;

use crate::models::{Key, Meta, Operator, SigningPubkey};
use alloy_primitives::Address;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction};
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

type Pool = r2d2::Pool<SqliteConnectionManager>;

/// A small pool: one writer plus a few concurrent readers under WAL.
pub const POOL_SIZE: u32 = 4;
#[cfg(not(test))]
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
#[cfg(test)]
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Bulk statements are split into at most this many rows so the bound
/// parameter count stays below sqlite's variable limit.
pub const BULK_ROW_CHUNK: usize = 499;

#[derive(Debug, Clone)]
pub struct RegistryDatabase {
    conn_pool: Pool,
}

impl RegistryDatabase {
    /// Open an existing database at the given `path`, or create one if none exists.
    pub fn open_or_create(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Open an existing `RegistryDatabase` from disk.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn_pool = Self::open_conn_pool(path)?;
        let db = Self { conn_pool };
        Ok(db)
    }

    /// Create a registry database at the given path.
    ///
    /// Error if a database (or any file) already exists at `path`.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let _file = File::options()
            .write(true)
            .read(true)
            .create_new(true)
            .open(path)?;

        let conn_pool = Self::open_conn_pool(path)?;
        let conn = conn_pool.get()?;

        conn.execute(
            "CREATE TABLE registry_meta (
                module_address CHARACTER(42) PRIMARY KEY NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash CHARACTER(66) NOT NULL,
                timestamp INTEGER NOT NULL,
                keys_op_index INTEGER NOT NULL
            )",
            params![],
        )?;

        conn.execute(
            "CREATE TABLE registry_operator (
                module_address CHARACTER(42) NOT NULL,
                operator_index INTEGER NOT NULL,
                active INTEGER NOT NULL,
                name VARCHAR(255) NOT NULL,
                reward_address CHARACTER(42) NOT NULL,
                staking_limit INTEGER NOT NULL,
                stopped_validators INTEGER NOT NULL,
                total_signing_keys INTEGER NOT NULL,
                used_signing_keys INTEGER NOT NULL,
                PRIMARY KEY (module_address, operator_index)
            )",
            params![],
        )?;

        conn.execute(
            "CREATE TABLE registry_key (
                module_address CHARACTER(42) NOT NULL,
                operator_index INTEGER NOT NULL,
                key_index INTEGER NOT NULL,
                key CHARACTER(98) NOT NULL,
                deposit_signature CHARACTER(194) NOT NULL,
                used INTEGER NOT NULL,
                PRIMARY KEY (module_address, operator_index, key_index)
            )",
            params![],
        )?;

        conn.execute(
            "CREATE INDEX registry_key_pubkey ON registry_key (key)",
            params![],
        )?;

        Ok(Self { conn_pool })
    }

    /// Execute a database transaction as a closure, committing if `f` returns `Ok`.
    pub fn with_transaction<T, U, F>(&self, f: F) -> Result<T, U>
    where
        F: FnOnce(&Transaction) -> Result<T, U>,
        U: From<StoreError>,
    {
        let mut conn = self.conn_pool.get().map_err(StoreError::from)?;
        let txn = conn.transaction().map_err(StoreError::from)?;
        let value = f(&txn)?;
        txn.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Open a new connection pool with all of the necessary settings and tweaks.
    fn open_conn_pool(path: &Path) -> Result<Pool, StoreError> {
        let manager = SqliteConnectionManager::file(path)
            .with_flags(rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE)
            .with_init(Self::apply_pragmas);
        let conn_pool = Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(manager)
            .map_err(|e| StoreError::SQLPoolError(format!("Unable to open database: {:?}", e)))?;
        Ok(conn_pool)
    }

    /// Apply the necessary settings to an SQLite connection.
    ///
    /// WAL mode lets the HTTP readers run concurrently with the single
    /// update-cycle writer while still observing only committed transactions.
    fn apply_pragmas(conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(())
    }

    pub fn get_meta(
        &self,
        txn: &Transaction,
        module_address: &Address,
    ) -> Result<Option<Meta>, StoreError> {
        let mut stmt = txn.prepare(
            "SELECT module_address, block_number, block_hash, timestamp, keys_op_index
             FROM registry_meta WHERE module_address = ?1",
        )?;
        Ok(stmt
            .query_row(params![module_address.to_string()], meta_from_row)
            .optional()?)
    }

    /// Replace the module's meta row. Delete-then-insert keeps at most one
    /// row per module without relying on upsert semantics.
    pub fn replace_meta(&self, txn: &Transaction, meta: &Meta) -> Result<(), StoreError> {
        txn.execute(
            "DELETE FROM registry_meta WHERE module_address = ?1",
            params![meta.module_address.to_string()],
        )?;
        txn.execute(
            "INSERT INTO registry_meta (module_address, block_number, block_hash, timestamp, keys_op_index)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                meta.module_address.to_string(),
                meta.block_number as i64,
                meta.block_hash.to_string(),
                meta.timestamp as i64,
                meta.keys_op_index as i64,
            ],
        )?;
        Ok(())
    }

    pub fn find_all_operators(
        &self,
        txn: &Transaction,
        module_address: &Address,
    ) -> Result<Vec<Operator>, StoreError> {
        txn.prepare(
            "SELECT module_address, operator_index, active, name, reward_address,
                    staking_limit, stopped_validators, total_signing_keys, used_signing_keys
             FROM registry_operator WHERE module_address = ?1 ORDER BY operator_index",
        )?
        .query_and_then(params![module_address.to_string()], |row| {
            operator_from_row(row).map_err(StoreError::from)
        })?
        .collect()
    }

    pub fn upsert_operator(&self, txn: &Transaction, op: &Operator) -> Result<(), StoreError> {
        txn.execute(
            "INSERT INTO registry_operator (module_address, operator_index, active, name,
                reward_address, staking_limit, stopped_validators, total_signing_keys, used_signing_keys)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (module_address, operator_index) DO UPDATE SET
                active = excluded.active,
                name = excluded.name,
                reward_address = excluded.reward_address,
                staking_limit = excluded.staking_limit,
                stopped_validators = excluded.stopped_validators,
                total_signing_keys = excluded.total_signing_keys,
                used_signing_keys = excluded.used_signing_keys",
            params![
                op.module_address.to_string(),
                op.index,
                op.active,
                op.name,
                op.reward_address.to_string(),
                op.staking_limit as i64,
                op.stopped_validators as i64,
                op.total_signing_keys as i64,
                op.used_signing_keys as i64,
            ],
        )?;
        Ok(())
    }

    /// Delete an operator's keys at indices `>= from_index`. Used keys are
    /// always below the operator's advertised total, so a tail delete never
    /// touches them.
    pub fn delete_keys_from(
        &self,
        txn: &Transaction,
        module_address: &Address,
        operator_index: u32,
        from_index: u64,
    ) -> Result<usize, StoreError> {
        Ok(txn.execute(
            "DELETE FROM registry_key
             WHERE module_address = ?1 AND operator_index = ?2 AND key_index >= ?3",
            params![module_address.to_string(), operator_index, from_index as i64],
        )?)
    }

    /// Upsert signing keys in bulk, `BULK_ROW_CHUNK` rows per statement.
    pub fn upsert_keys(&self, txn: &Transaction, keys: &[Key]) -> Result<(), StoreError> {
        for chunk in keys.chunks(BULK_ROW_CHUNK) {
            let rows = vec!["(?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO registry_key (module_address, operator_index, key_index, key, deposit_signature, used)
                 VALUES {}
                 ON CONFLICT (module_address, operator_index, key_index) DO UPDATE SET
                    key = excluded.key,
                    deposit_signature = excluded.deposit_signature,
                    used = excluded.used",
                rows
            );
            let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * 6);
            for key in chunk {
                values.push(Value::Text(key.module_address.to_string()));
                values.push(Value::Integer(key.operator_index as i64));
                values.push(Value::Integer(key.index as i64));
                values.push(Value::Text(key.key.to_string()));
                values.push(Value::Text(key.deposit_signature.to_string()));
                values.push(Value::Integer(key.used as i64));
            }
            txn.prepare(&sql)?.execute(params_from_iter(values))?;
        }
        Ok(())
    }

    /// Count an operator's stored keys at indices `< below`.
    pub fn count_keys_below(
        &self,
        txn: &Transaction,
        module_address: &Address,
        operator_index: u32,
        below: u64,
    ) -> Result<u64, StoreError> {
        let mut stmt = txn.prepare(
            "SELECT COUNT(*) FROM registry_key
             WHERE module_address = ?1 AND operator_index = ?2 AND key_index < ?3",
        )?;
        Ok(stmt.query_row(
            params![module_address.to_string(), operator_index, below as i64],
            |row| row.get::<_, i64>(0),
        )? as u64)
    }

    pub fn find_all_keys(
        &self,
        txn: &Transaction,
        module_address: &Address,
    ) -> Result<Vec<Key>, StoreError> {
        txn.prepare(
            "SELECT module_address, operator_index, key_index, key, deposit_signature, used
             FROM registry_key WHERE module_address = ?1 ORDER BY operator_index, key_index",
        )?
        .query_and_then(params![module_address.to_string()], |row| {
            key_from_row(row).map_err(StoreError::from)
        })?
        .collect()
    }

    pub fn find_used_keys(
        &self,
        txn: &Transaction,
        module_address: &Address,
    ) -> Result<Vec<Key>, StoreError> {
        txn.prepare(
            "SELECT module_address, operator_index, key_index, key, deposit_signature, used
             FROM registry_key WHERE module_address = ?1 AND used = 1
             ORDER BY operator_index, key_index",
        )?
        .query_and_then(params![module_address.to_string()], |row| {
            key_from_row(row).map_err(StoreError::from)
        })?
        .collect()
    }

    pub fn find_keys_by_operator(
        &self,
        txn: &Transaction,
        module_address: &Address,
        operator_index: u32,
    ) -> Result<Vec<Key>, StoreError> {
        txn.prepare(
            "SELECT module_address, operator_index, key_index, key, deposit_signature, used
             FROM registry_key WHERE module_address = ?1 AND operator_index = ?2
             ORDER BY key_index",
        )?
        .query_and_then(
            params![module_address.to_string(), operator_index],
            |row| key_from_row(row).map_err(StoreError::from),
        )?
        .collect()
    }

    pub fn find_keys_by_pubkey(
        &self,
        txn: &Transaction,
        pubkey: &SigningPubkey,
    ) -> Result<Vec<Key>, StoreError> {
        txn.prepare(
            "SELECT module_address, operator_index, key_index, key, deposit_signature, used
             FROM registry_key WHERE key = ?1 ORDER BY operator_index, key_index",
        )?
        .query_and_then(params![pubkey.to_string()], |row| {
            key_from_row(row).map_err(StoreError::from)
        })?
        .collect()
    }

    pub fn find_keys_by_pubkeys(
        &self,
        txn: &Transaction,
        pubkeys: &[SigningPubkey],
    ) -> Result<Vec<Key>, StoreError> {
        let mut found = vec![];
        for chunk in pubkeys.chunks(BULK_ROW_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT module_address, operator_index, key_index, key, deposit_signature, used
                 FROM registry_key WHERE key IN ({}) ORDER BY operator_index, key_index",
                placeholders
            );
            let values: Vec<Value> = chunk.iter().map(|p| Value::Text(p.to_string())).collect();
            let keys: Result<Vec<Key>, StoreError> = txn
                .prepare(&sql)?
                .query_and_then(params_from_iter(values), |row| {
                    key_from_row(row).map_err(StoreError::from)
                })?
                .collect();
            found.extend(keys?);
        }
        Ok(found)
    }
}

fn parse_column<T: FromStr>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// Counters are stored as sqlite's signed 64-bit integers; rusqlite has no
// u64 conversions, so the casts here mirror the `as i64` on the write side.
fn meta_from_row(row: &Row) -> rusqlite::Result<Meta> {
    Ok(Meta {
        module_address: parse_column(row, 0)?,
        block_number: row.get::<_, i64>(1)? as u64,
        block_hash: parse_column(row, 2)?,
        timestamp: row.get::<_, i64>(3)? as u64,
        keys_op_index: row.get::<_, i64>(4)? as u64,
    })
}

fn operator_from_row(row: &Row) -> rusqlite::Result<Operator> {
    Ok(Operator {
        module_address: parse_column(row, 0)?,
        index: row.get(1)?,
        active: row.get(2)?,
        name: row.get(3)?,
        reward_address: parse_column(row, 4)?,
        staking_limit: row.get::<_, i64>(5)? as u64,
        stopped_validators: row.get::<_, i64>(6)? as u64,
        total_signing_keys: row.get::<_, i64>(7)? as u64,
        used_signing_keys: row.get::<_, i64>(8)? as u64,
    })
}

fn key_from_row(row: &Row) -> rusqlite::Result<Key> {
    Ok(Key {
        module_address: parse_column(row, 0)?,
        operator_index: row.get(1)?,
        index: row.get(2)?,
        key: parse_column(row, 3)?,
        deposit_signature: parse_column(row, 4)?,
        used: row.get(5)?,
    })
}
