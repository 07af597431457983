//! App settings synchronized through a replaceable record.
//!
//! Every user's settings live at the coordinate `(30078, pubkey, "nostrudel-settings")`.
//! [`SettingsSync`] keeps one [`Subject<AppSettings>`] per public key, derived from the
//! record cache: each accepted settings record is parsed and migrated to the latest
//! version.  Records which fail to parse or migrate are skipped, the subject keeps its
//! previous value, which is [`AppSettings::default`] until a record was accepted.

use std::{
    ops::Deref,
    time::{SystemTime, UNIX_EPOCH},
};

use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use strudel_base::{Coordinate, Kind, PublicKey, Record, RecordDraft, RelayUrl, Tag};

mod migrations;

pub use self::migrations::{AppSettings, ColorMode, LightningPayMode, migrate, parse_app_settings};
use crate::{
    cache::{RecordCache, RecordRequest, RequestOptions},
    lazy_map::KeyedLazyMap,
    subject::Subject,
};

/// The `d` tag of settings records.
pub const SETTINGS_IDENTIFIER: &str = "nostrudel-settings";

/// The kind of settings records.
pub const SETTINGS_KIND: Kind = Kind::APP_DATA;

/// Errors when reading or writing settings documents.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("settings are not valid JSON"))]
    Json { source: serde_json::Error },
    #[snafu(display("settings are not a JSON object"))]
    NotAnObject {},
    #[snafu(display("migrated settings have an invalid shape"))]
    InvalidShape { source: serde_json::Error },
    #[snafu(display("failed to encode settings"))]
    Encode { source: serde_json::Error },
}

/// The settings coordinate of `pubkey`.
pub fn settings_coordinate(pubkey: PublicKey) -> Coordinate {
    Coordinate::new(SETTINGS_KIND, pubkey, SETTINGS_IDENTIFIER)
}

/// Per-user settings derived from the record cache.
///
/// Cloning returns a handle to the same state.
#[derive(Debug, Clone)]
pub struct SettingsSync {
    cache: RecordCache,
    subjects: KeyedLazyMap<PublicKey, Subject<AppSettings>>,
}

impl SettingsSync {
    /// Creates settings sync on top of `cache`.
    pub fn new(cache: RecordCache) -> Self {
        let subjects = {
            let cache = cache.clone();
            KeyedLazyMap::new(move |pubkey: &PublicKey| {
                let subject = Subject::new(AppSettings::default());
                subject.connect(&cache.subject(&settings_coordinate(*pubkey)), parse_record);
                subject
            })
        };
        Self { cache, subjects }
    }

    /// Requests the settings of `pubkey` from `relays`.
    ///
    /// The returned handle dereferences to the settings subject of `pubkey`.  Requests are
    /// deduplicated by the record cache, see [`RecordCache::request_record`].
    pub fn request_app_settings(
        &self,
        pubkey: PublicKey,
        relays: &[RelayUrl],
        options: RequestOptions,
    ) -> SettingsRequest {
        let subject = self.subject(&pubkey);
        let request = self.cache.request_record(
            relays,
            SETTINGS_KIND,
            pubkey,
            SETTINGS_IDENTIFIER,
            options,
        );
        SettingsRequest { request, subject }
    }

    /// The settings subject of `pubkey`, without requesting anything.
    pub fn subject(&self, pubkey: &PublicKey) -> Subject<AppSettings> {
        self.subjects.get(pubkey)
    }

    /// Offers a settings record obtained elsewhere, for example one just published.
    ///
    /// Returns whether the cache accepted it.
    pub fn receive_record(&self, record: Record) -> bool {
        self.cache.handle_record(record)
    }

    /// Builds the unsigned record storing `settings`, timestamped now.
    pub fn build_settings_record(settings: &AppSettings) -> Result<RecordDraft, SettingsError> {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Ok(RecordDraft {
            kind: SETTINGS_KIND,
            tags: vec![Tag::identifier(SETTINGS_IDENTIFIER)],
            content: serde_json::to_string(settings).context(EncodeSnafu)?,
            created_at,
        })
    }
}

fn parse_record(record: &Option<Record>) -> Result<Option<AppSettings>, SettingsError> {
    match record {
        Some(record) => parse_app_settings(&record.content).map(Some),
        None => Ok(None),
    }
}

/// Interest in the settings of one user, returned by [`SettingsSync::request_app_settings`].
#[derive(Debug)]
pub struct SettingsRequest {
    request: RecordRequest,
    subject: Subject<AppSettings>,
}

impl SettingsRequest {
    /// The underlying record request.
    pub fn record(&self) -> &RecordRequest {
        &self.request
    }

    /// The settings subject.
    pub fn subject(&self) -> &Subject<AppSettings> {
        &self.subject
    }
}

impl Deref for SettingsRequest {
    type Target = Subject<AppSettings>;

    fn deref(&self) -> &Self::Target {
        &self.subject
    }
}
