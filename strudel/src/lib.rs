//! A client core for relay based social networks.
//!
//! Accounts, replaceable records and user settings are exposed as [`Subject`]s, values
//! which push every change to their subscribers.  The [`Client`] ties the services
//! together:
//!
//! - [`AccountManager`] keeps the persisted account list, the current account and ghost
//!   sessions.
//! - [`RecordCache`] keeps the newest version of every replaceable record and
//!   deduplicates relay requests for it.
//! - [`SettingsSync`] derives versioned [`AppSettings`] from settings records.
//!
//! Relays are reached through a [`RelayTransport`], state is kept in a [`Storage`].
#![cfg_attr(strudel_docsrs, feature(doc_auto_cfg))]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod account;
pub mod accounts;
pub mod cache;
pub mod client;
pub mod config;
pub mod lazy_map;
pub mod settings;
pub mod signer;
pub mod storage;
pub mod subject;
pub mod transport;

pub use strudel_base as base;

pub use self::{
    account::{Account, AccountKind},
    accounts::{AccountError, AccountManager, SessionMode},
    cache::{RecordCache, RecordRequest, RequestOptions},
    client::{Builder, Client, ClientError},
    config::{Config, ConfigError},
    lazy_map::KeyedLazyMap,
    settings::{AppSettings, SettingsError, SettingsRequest, SettingsSync},
    signer::{Signer, SignerBackend, SignerError, SignerRegistry},
    storage::{MemStorage, RedbStorage, Storage, StorageError},
    subject::{Subject, Subscription},
    transport::{MemRelays, RelayResponse, RelayTransport},
};
