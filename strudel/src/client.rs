//! The client context.
//!
//! A [`Client`] owns the long-lived services: storage, the [`AccountManager`], the
//! [`RecordCache`] and [`SettingsSync`].  It is created with [`Client::builder`] and
//! [`Builder::spawn`], and stopped with [`Client::shutdown`].
//!
//! The client follows the current account: whenever it changes, the settings of the new
//! account are requested from its relays and [`Client::app_settings`] switches over to
//! them.

use std::{convert::Infallible, sync::Arc};

use nested_enum_utils::common_fields;
use parking_lot::Mutex;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu, ensure};
use strudel_base::{Record, RecordDraft, RelayUrl, SecretKey};
use tracing::{debug, info, warn};

use crate::{
    account::Account,
    accounts::{AccountError, AccountManager},
    cache::{RecordCache, RequestOptions},
    config::{Config, ConfigError},
    settings::{AppSettings, SettingsError, SettingsRequest, SettingsSync},
    signer::{DeviceKey, Signer, SignerBackend, SignerError, SignerRegistry},
    storage::{MemStorage, RedbStorage, Storage, StorageError},
    subject::{Subject, Subscription},
    transport::RelayTransport,
};

/// Errors of the [`Client`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ClientError {
    #[snafu(display("invalid configuration"))]
    Config { source: ConfigError },
    #[snafu(display("failed to open storage"))]
    Storage { source: StorageError },
    #[snafu(transparent)]
    Accounts { source: AccountError },
    #[snafu(transparent)]
    Signer { source: SignerError },
    #[snafu(transparent)]
    Settings { source: SettingsError },
    #[snafu(display("no account is logged in"))]
    NoAccount {},
    #[snafu(display("no relays to publish to"))]
    NoRelays {},
    #[snafu(display("none of {relays} relays accepted the record"))]
    NotPublished { relays: usize },
}

/// Builds a [`Client`].
#[derive(Debug)]
pub struct Builder {
    config: Config,
    transport: Arc<dyn RelayTransport>,
    storage: Option<Arc<dyn Storage>>,
    signers: SignerRegistry,
}

impl Builder {
    /// Sets the configuration, [`Config::default`] otherwise.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Uses `storage` instead of the storage described by the configuration.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Registers the signer backend for accounts of type `kind`.
    pub fn signer_backend(mut self, kind: &'static str, backend: impl SignerBackend) -> Self {
        self.signers = self.signers.with_backend(kind, backend);
        self
    }

    /// Opens the storage, loads the accounts and starts following the current account.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn spawn(self) -> Result<Client, ClientError> {
        let Self {
            config,
            transport,
            storage,
            signers,
        } = self;
        let storage = match storage {
            Some(storage) => storage,
            None => open_storage(&config)?,
        };
        let device_key = DeviceKey::load_or_create(storage.as_ref())?;
        let signers = signers.with_device_key(device_key.clone());
        let accounts = AccountManager::spawn(storage.clone());
        accounts.loaded().await;
        let cache = RecordCache::new(
            transport.clone(),
            config.persist_records.then(|| storage.clone()),
        );
        let settings = SettingsSync::new(cache.clone());
        let app_settings = Subject::new(AppSettings::default());
        let settings_request = Arc::new(Mutex::new(None));
        let follow = follow_current_account(
            &accounts,
            settings.clone(),
            app_settings.clone(),
            settings_request.clone(),
            &config,
        );
        info!(
            accounts = accounts.accounts().value().len(),
            "client started"
        );
        Ok(Client {
            inner: Arc::new(Inner {
                config,
                storage,
                transport,
                device_key,
                signers,
                accounts,
                cache,
                settings,
                app_settings,
                settings_request,
                follow: Mutex::new(Some(follow)),
            }),
        })
    }
}

fn open_storage(config: &Config) -> Result<Arc<dyn Storage>, ClientError> {
    match config.database_path().context(ConfigSnafu)? {
        Some(path) => {
            debug!(path = %path.display(), "opening database");
            Ok(Arc::new(RedbStorage::persistent(path).context(StorageSnafu)?))
        }
        None => Ok(Arc::new(MemStorage::default())),
    }
}

/// Requests the settings of the current account whenever it changes.
fn follow_current_account(
    accounts: &AccountManager,
    settings: SettingsSync,
    app_settings: Subject<AppSettings>,
    settings_request: Arc<Mutex<Option<SettingsRequest>>>,
    config: &Config,
) -> Subscription {
    let default_relays = config.default_relays.clone();
    let options = RequestOptions {
        keep_alive: config.live_settings,
    };
    let runtime = tokio::runtime::Handle::current();
    accounts.current().subscribe(move |current: &Option<Account>| {
        let _runtime = runtime.enter();
        let request = current.as_ref().map(|account| {
            let relays = account
                .relays
                .clone()
                .unwrap_or_else(|| default_relays.clone());
            settings.request_app_settings(account.pubkey, &relays, options)
        });
        match &request {
            Some(request) => app_settings.connect(request.subject(), |settings: &AppSettings| {
                Ok::<_, Infallible>(Some(settings.clone()))
            }),
            None => {
                app_settings.disconnect();
                app_settings.next(AppSettings::default());
            }
        }
        // The previous request is released after the new one is made, so switching to
        // the same account does not query again.
        let previous = std::mem::replace(&mut *settings_request.lock(), request);
        drop(previous);
    })
}

/// A client of the relay network.
///
/// Cloning returns a handle to the same client.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    config: Config,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn RelayTransport>,
    device_key: DeviceKey,
    signers: SignerRegistry,
    accounts: AccountManager,
    cache: RecordCache,
    settings: SettingsSync,
    app_settings: Subject<AppSettings>,
    #[debug(skip)]
    settings_request: Arc<Mutex<Option<SettingsRequest>>>,
    #[debug(skip)]
    follow: Mutex<Option<Subscription>>,
}

impl Client {
    /// Returns a new builder querying relays through `transport`.
    pub fn builder(transport: impl RelayTransport) -> Builder {
        Builder {
            config: Config::default(),
            transport: Arc::new(transport),
            storage: None,
            signers: SignerRegistry::default(),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    /// The accounts.
    pub fn accounts(&self) -> &AccountManager {
        &self.inner.accounts
    }

    /// The replaceable record cache.
    pub fn cache(&self) -> &RecordCache {
        &self.inner.cache
    }

    /// Settings of any user.
    pub fn settings(&self) -> &SettingsSync {
        &self.inner.settings
    }

    /// The settings of the current account, the defaults when logged out.
    pub fn app_settings(&self) -> &Subject<AppSettings> {
        &self.inner.app_settings
    }

    /// Relays of the current account, or the default relays.
    pub fn relays(&self) -> Vec<RelayUrl> {
        self.inner
            .accounts
            .current()
            .value()
            .and_then(|account| account.relays)
            .unwrap_or_else(|| self.inner.config.default_relays.clone())
    }

    /// Adds a local account for `secret`, sealed with this device's key.
    pub fn add_local_account(&self, secret: &SecretKey) -> Result<Account, ClientError> {
        let account = Account::local(secret, &self.inner.device_key, &mut rand::rngs::OsRng)?;
        self.inner.accounts.add_account(account.clone())?;
        Ok(account)
    }

    /// The signer of the current account, `None` when logged out.
    pub fn signer(&self) -> Result<Option<Arc<dyn Signer>>, ClientError> {
        Ok(self.inner.accounts.signer(&self.inner.signers)?)
    }

    /// Signs `draft` as the current account and publishes it to `relays`.
    ///
    /// Succeeds if at least one relay accepted the record.  A published replaceable
    /// record is also offered to the cache.
    pub async fn publish(
        &self,
        draft: RecordDraft,
        relays: &[RelayUrl],
    ) -> Result<Record, ClientError> {
        ensure!(!relays.is_empty(), NoRelaysSnafu);
        let signer = self.signer()?.context(NoAccountSnafu)?;
        let record = signer.sign(draft).await?;
        let results = n0_future::join_all(relays.iter().map(|relay| {
            let publish = self.inner.transport.publish(relay, record.clone());
            async move { (relay, publish.await) }
        }))
        .await;
        let mut accepted = 0;
        for (relay, res) in results {
            match res {
                Ok(()) => {
                    debug!(%relay, id = %record.id.fmt_short(), "published");
                    accepted += 1;
                }
                Err(err) => warn!(%relay, "failed to publish: {err:#}"),
            }
        }
        ensure!(
            accepted > 0,
            NotPublishedSnafu {
                relays: relays.len()
            }
        );
        if record.kind.is_addressable() {
            self.inner.cache.handle_record(record.clone());
        }
        Ok(record)
    }

    /// Publishes `settings` as the settings of the current account.
    pub async fn save_settings(&self, settings: &AppSettings) -> Result<Record, ClientError> {
        let draft = SettingsSync::build_settings_record(settings)?;
        self.publish(draft, &self.relays()).await
    }

    /// Stops following the current account and closes all settings queries.
    pub fn shutdown(&self) {
        let follow = self.inner.follow.lock().take();
        drop(follow);
        let request = self.inner.settings_request.lock().take();
        drop(request);
        self.inner.app_settings.disconnect();
        info!("client shut down");
    }
}
