//! Durable state: accounts, scalar values and cached records.
//!
//! [`Storage`] is a small synchronous interface.  [`RedbStorage`] keeps everything in a
//! single redb database file, [`MemStorage`] keeps it in memory for tests and ephemeral
//! sessions.

use std::{collections::BTreeMap, fmt, path::Path};

use nested_enum_utils::common_fields;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition, backends::InMemoryBackend};
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use strudel_base::{Coordinate, PublicKey, Record};
use tracing::{info, warn};

use crate::account::Account;

/// Persists the state of a client.
pub trait Storage: fmt::Debug + Send + Sync + 'static {
    /// All accounts, in the order they were first added.
    fn accounts(&self) -> Result<Vec<Account>, StorageError>;

    /// Inserts or replaces the account with the same public key.
    fn put_account(&self, account: &Account) -> Result<(), StorageError>;

    /// Deletes an account, deleting an unknown account is not an error.
    fn delete_account(&self, pubkey: &PublicKey) -> Result<(), StorageError>;

    /// Reads a scalar value.
    fn get_value(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes a scalar value.
    fn set_value(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes a scalar value.
    fn remove_value(&self, key: &str) -> Result<(), StorageError>;

    /// Reads the stored record at `coordinate`.
    fn get_record(&self, coordinate: &Coordinate) -> Result<Option<Record>, StorageError>;

    /// Stores `record` at its coordinate unless a newer version is stored already.
    ///
    /// Returns whether the record was written.
    fn put_record(&self, record: &Record) -> Result<bool, StorageError>;
}

/// Storage errors.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("failed to create database directory"))]
    CreateDir { source: std::io::Error },
    #[snafu(display("failed to open database"))]
    Open { source: redb::DatabaseError },
    #[snafu(display("failed to begin transaction"))]
    Transaction { source: redb::TransactionError },
    #[snafu(display("failed to open table"))]
    Table { source: redb::TableError },
    #[snafu(display("database access failed"))]
    Access { source: redb::StorageError },
    #[snafu(display("failed to commit transaction"))]
    Commit { source: redb::CommitError },
    #[snafu(display("failed to encode {what}"))]
    Encode {
        what: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode {what}"))]
    Decode {
        what: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("record is not addressable"))]
    NotAddressable {},
    #[snafu(display("storage is read-only"))]
    ReadOnly {},
}

/// Accounts by public key, the value is the insertion sequence number and the JSON account.
const ACCOUNTS_TABLE: TableDefinition<&[u8; 32], (u64, &str)> = TableDefinition::new("accounts-1");
const VALUES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("values-1");
/// Records by coordinate string.
const RECORDS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("records-1");

/// [`Storage`] backed by a redb database.
#[derive(Debug)]
pub struct RedbStorage {
    db: Database,
}

impl RedbStorage {
    /// Opens or creates the database at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("loading database from {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu)?;
        }
        let db = Database::builder().create(path).context(OpenSnafu)?;
        Self::open(db)
    }

    /// Creates a database which lives in memory only.
    pub fn in_memory() -> Result<Self, StorageError> {
        info!("using in-memory database");
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .context(OpenSnafu)?;
        Self::open(db)
    }

    /// Wraps an opened database, creating the tables if needed.
    pub fn open(db: Database) -> Result<Self, StorageError> {
        let tx = db.begin_write().context(TransactionSnafu)?;
        {
            tx.open_table(ACCOUNTS_TABLE).context(TableSnafu)?;
            tx.open_table(VALUES_TABLE).context(TableSnafu)?;
            tx.open_table(RECORDS_TABLE).context(TableSnafu)?;
        }
        tx.commit().context(CommitSnafu)?;
        Ok(Self { db })
    }
}

impl Storage for RedbStorage {
    fn accounts(&self) -> Result<Vec<Account>, StorageError> {
        let tx = self.db.begin_read().context(TransactionSnafu)?;
        let table = tx.open_table(ACCOUNTS_TABLE).context(TableSnafu)?;
        let mut accounts = Vec::new();
        for row in table.iter().context(AccessSnafu)? {
            let (key, value) = row.context(AccessSnafu)?;
            let (seq, json) = value.value();
            match serde_json::from_str::<Account>(json) {
                Ok(account) => accounts.push((seq, account)),
                Err(err) => {
                    let key = data_encoding::HEXLOWER.encode(key.value());
                    warn!(%key, %err, "skipping undecodable account");
                }
            }
        }
        accounts.sort_by_key(|(seq, _)| *seq);
        Ok(accounts.into_iter().map(|(_, account)| account).collect())
    }

    fn put_account(&self, account: &Account) -> Result<(), StorageError> {
        let json = serde_json::to_string(account).context(EncodeSnafu { what: "account" })?;
        let key = account.pubkey.to_bytes();
        let tx = self.db.begin_write().context(TransactionSnafu)?;
        {
            let mut table = tx.open_table(ACCOUNTS_TABLE).context(TableSnafu)?;
            let existing = table
                .get(&key)
                .context(AccessSnafu)?
                .map(|row| row.value().0);
            let seq = match existing {
                Some(seq) => seq,
                None => {
                    let mut next = 0;
                    for row in table.iter().context(AccessSnafu)? {
                        let (_, value) = row.context(AccessSnafu)?;
                        next = next.max(value.value().0 + 1);
                    }
                    next
                }
            };
            table.insert(&key, (seq, json.as_str())).context(AccessSnafu)?;
        }
        tx.commit().context(CommitSnafu)?;
        Ok(())
    }

    fn delete_account(&self, pubkey: &PublicKey) -> Result<(), StorageError> {
        let tx = self.db.begin_write().context(TransactionSnafu)?;
        {
            let mut table = tx.open_table(ACCOUNTS_TABLE).context(TableSnafu)?;
            table.remove(&pubkey.to_bytes()).context(AccessSnafu)?;
        }
        tx.commit().context(CommitSnafu)?;
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        let tx = self.db.begin_read().context(TransactionSnafu)?;
        let table = tx.open_table(VALUES_TABLE).context(TableSnafu)?;
        let value = table.get(key).context(AccessSnafu)?;
        Ok(value.map(|v| v.value().to_string()))
    }

    fn set_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let tx = self.db.begin_write().context(TransactionSnafu)?;
        {
            let mut table = tx.open_table(VALUES_TABLE).context(TableSnafu)?;
            table.insert(key, value).context(AccessSnafu)?;
        }
        tx.commit().context(CommitSnafu)?;
        Ok(())
    }

    fn remove_value(&self, key: &str) -> Result<(), StorageError> {
        let tx = self.db.begin_write().context(TransactionSnafu)?;
        {
            let mut table = tx.open_table(VALUES_TABLE).context(TableSnafu)?;
            table.remove(key).context(AccessSnafu)?;
        }
        tx.commit().context(CommitSnafu)?;
        Ok(())
    }

    fn get_record(&self, coordinate: &Coordinate) -> Result<Option<Record>, StorageError> {
        let tx = self.db.begin_read().context(TransactionSnafu)?;
        let table = tx.open_table(RECORDS_TABLE).context(TableSnafu)?;
        get_record(&table, &coordinate.to_string())
    }

    fn put_record(&self, record: &Record) -> Result<bool, StorageError> {
        let coordinate = record.coordinate().ok_or_else(|| NotAddressableSnafu.build())?;
        let key = coordinate.to_string();
        let json = serde_json::to_string(record).context(EncodeSnafu { what: "record" })?;
        let tx = self.db.begin_write().context(TransactionSnafu)?;
        {
            let mut table = tx.open_table(RECORDS_TABLE).context(TableSnafu)?;
            if let Some(existing) = get_record(&table, &key)? {
                if !record.supersedes(&existing) {
                    return Ok(false);
                }
            }
            table.insert(key.as_str(), json.as_str()).context(AccessSnafu)?;
        }
        tx.commit().context(CommitSnafu)?;
        Ok(true)
    }
}

fn get_record(
    table: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
) -> Result<Option<Record>, StorageError> {
    let Some(row) = table.get(key).context(AccessSnafu)? else {
        return Ok(None);
    };
    let record = serde_json::from_str(row.value()).context(DecodeSnafu { what: "record" })?;
    Ok(Some(record))
}

/// [`Storage`] keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemStorage {
    inner: Mutex<MemInner>,
}

#[derive(Debug, Default)]
struct MemInner {
    read_only: bool,
    accounts: Vec<Account>,
    values: BTreeMap<String, String>,
    records: BTreeMap<Coordinate, Record>,
}

impl MemStorage {
    /// Makes every following write fail with [`StorageError::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.lock().read_only = read_only;
    }

    fn write<T>(&self, f: impl FnOnce(&mut MemInner) -> T) -> Result<T, StorageError> {
        let mut inner = self.inner.lock();
        ensure!(!inner.read_only, ReadOnlySnafu);
        Ok(f(&mut inner))
    }
}

impl Storage for MemStorage {
    fn accounts(&self) -> Result<Vec<Account>, StorageError> {
        Ok(self.inner.lock().accounts.clone())
    }

    fn put_account(&self, account: &Account) -> Result<(), StorageError> {
        self.write(|inner| {
            match inner.accounts.iter_mut().find(|a| a.pubkey == account.pubkey) {
                Some(existing) => *existing = account.clone(),
                None => inner.accounts.push(account.clone()),
            }
        })
    }

    fn delete_account(&self, pubkey: &PublicKey) -> Result<(), StorageError> {
        self.write(|inner| inner.accounts.retain(|a| a.pubkey != *pubkey))
    }

    fn get_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock().values.get(key).cloned())
    }

    fn set_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.write(|inner| {
            inner.values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove_value(&self, key: &str) -> Result<(), StorageError> {
        self.write(|inner| {
            inner.values.remove(key);
        })
    }

    fn get_record(&self, coordinate: &Coordinate) -> Result<Option<Record>, StorageError> {
        Ok(self.inner.lock().records.get(coordinate).cloned())
    }

    fn put_record(&self, record: &Record) -> Result<bool, StorageError> {
        let coordinate = record.coordinate().ok_or_else(|| NotAddressableSnafu.build())?;
        self.write(|inner| {
            let stale = inner
                .records
                .get(&coordinate)
                .is_some_and(|existing| !record.supersedes(existing));
            if !stale {
                inner.records.insert(coordinate, record.clone());
            }
            !stale
        })
    }
}
