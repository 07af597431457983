//! The account list, the current account and ghost sessions.
//!
//! The [`AccountManager`] owns the persisted account list and the current account.  Every
//! mutation is written through to [`Storage`] before it is published, so a storage failure
//! leaves the published state untouched.
//!
//! A ghost session temporarily replaces the current account with a read-only account for
//! some public key, without adding it to the list.  The account that was current before is
//! remembered through the `lastAccount` pointer and restored by
//! [`AccountManager::stop_ghost`].

use std::{convert::Infallible, sync::Arc};

use nested_enum_utils::common_fields;
use parking_lot::ReentrantMutex;
use snafu::{Backtrace, ResultExt, Snafu};
use strudel_base::PublicKey;
use tracing::{debug, error, info, warn};

use crate::{
    account::Account,
    settings::AppSettings,
    signer::{Signer, SignerError, SignerRegistry},
    storage::{Storage, StorageError},
    subject::Subject,
};

/// Storage slot of the pointer to the last active account.
pub const LAST_ACCOUNT_SLOT: &str = "lastAccount";

/// Whether the current account is a persisted account or a ghost overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionMode {
    /// The current account, if any, comes from the account list.
    #[default]
    Normal,
    /// The current account is an ephemeral read-only account.
    Ghost,
}

/// Errors of [`AccountManager`] operations.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AccountError {
    #[snafu(display("failed to persist accounts"))]
    Persist { source: StorageError },
}

/// Manages accounts and the current session.
///
/// Cloning returns a handle to the same manager.
#[derive(Debug, Clone)]
pub struct AccountManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    storage: Arc<dyn Storage>,
    accounts: Subject<Vec<Account>>,
    current: Subject<Option<Account>>,
    mode: Subject<SessionMode>,
    is_ghost: Subject<bool>,
    loading: Subject<bool>,
    /// Serializes mutations, re-entrant so subscribers may mutate.
    ops: ReentrantMutex<()>,
}

impl AccountManager {
    /// Creates a manager and starts loading the persisted accounts.
    ///
    /// Until loading is done [`AccountManager::loading`] is `true`, see
    /// [`AccountManager::loaded`].  Must be called from within a tokio runtime.
    pub fn spawn(storage: Arc<dyn Storage>) -> Self {
        let this = Self::new(storage);
        let inner = this.inner.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = inner.load() {
                error!("failed to load accounts: {err:#}");
            }
            inner.loading.next(false);
        });
        this
    }

    /// Creates a manager and loads the persisted accounts before returning.
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self, AccountError> {
        let this = Self::new(storage);
        let res = this.inner.load();
        this.inner.loading.next(false);
        res.map(|_| this)
    }

    fn new(storage: Arc<dyn Storage>) -> Self {
        let mode = Subject::new(SessionMode::Normal);
        let is_ghost = Subject::new(false);
        is_ghost.connect(&mode, |mode| {
            Ok::<_, Infallible>(Some(*mode == SessionMode::Ghost))
        });
        Self {
            inner: Arc::new(Inner {
                storage,
                accounts: Subject::new(Vec::new()),
                current: Subject::new(None),
                mode,
                is_ghost,
                loading: Subject::new(true),
                ops: ReentrantMutex::new(()),
            }),
        }
    }

    /// The account list.
    pub fn accounts(&self) -> &Subject<Vec<Account>> {
        &self.inner.accounts
    }

    /// The current account.
    pub fn current(&self) -> &Subject<Option<Account>> {
        &self.inner.current
    }

    /// The session mode.
    pub fn mode(&self) -> &Subject<SessionMode> {
        &self.inner.mode
    }

    /// Whether a ghost session is active.
    pub fn is_ghost(&self) -> &Subject<bool> {
        &self.inner.is_ghost
    }

    /// `true` until the persisted state has been loaded.
    pub fn loading(&self) -> &Subject<bool> {
        &self.inner.loading
    }

    /// Waits until the persisted state has been loaded.
    pub async fn loaded(&self) {
        self.inner.loading.wait_for(|loading| !*loading).await;
    }

    /// Whether an account with `pubkey` is in the list.
    pub fn has_account(&self, pubkey: &PublicKey) -> bool {
        self.inner.find(pubkey).is_some()
    }

    /// Adds `account`, replacing the listed account with the same public key.
    ///
    /// If it is the current account, the current account is republished and a ghost
    /// session ends.
    pub fn add_account(&self, account: Account) -> Result<(), AccountError> {
        let _guard = self.inner.ops.lock();
        self.inner.storage.put_account(&account).context(PersistSnafu)?;
        let mut accounts = self.inner.accounts.value();
        match accounts.iter_mut().find(|a| a.pubkey == account.pubkey) {
            Some(existing) => *existing = account.clone(),
            None => accounts.push(account.clone()),
        }
        let is_current = self.inner.current_pubkey() == Some(account.pubkey);
        info!(pubkey = %account.pubkey.fmt_short(), kind = account.kind.name(), "added account");
        self.inner.accounts.next(accounts);
        if is_current {
            self.inner.current.next(Some(account));
            self.inner.set_mode(SessionMode::Normal);
        }
        Ok(())
    }

    /// Removes the account with `pubkey` from the list.
    ///
    /// The current account is not changed, even if it is the removed one.
    pub fn remove_account(&self, pubkey: &PublicKey) -> Result<(), AccountError> {
        let _guard = self.inner.ops.lock();
        self.inner.storage.delete_account(pubkey).context(PersistSnafu)?;
        let mut accounts = self.inner.accounts.value();
        let before = accounts.len();
        accounts.retain(|a| a.pubkey != *pubkey);
        if accounts.len() != before {
            info!(pubkey = %pubkey.fmt_short(), "removed account");
            self.inner.accounts.next(accounts);
        }
        Ok(())
    }

    /// Makes the listed account with `pubkey` current.
    ///
    /// Unknown public keys are ignored.
    pub fn switch_account(&self, pubkey: &PublicKey) -> Result<(), AccountError> {
        let _guard = self.inner.ops.lock();
        self.inner.switch_account(pubkey)
    }

    /// Starts a ghost session as `pubkey`.
    ///
    /// A current listed account is remembered, so [`AccountManager::stop_ghost`] can
    /// return to it.
    pub fn start_ghost(&self, pubkey: PublicKey) -> Result<(), AccountError> {
        let _guard = self.inner.ops.lock();
        if self.inner.mode.value() == SessionMode::Normal {
            if let Some(current) = self.inner.current_pubkey().filter(|pk| self.has_account(pk)) {
                self.inner
                    .storage
                    .set_value(LAST_ACCOUNT_SLOT, &current.to_string())
                    .context(PersistSnafu)?;
            }
        }
        info!(pubkey = %pubkey.fmt_short(), "starting ghost session");
        self.inner.current.next(Some(Account::read_only(pubkey)));
        self.inner.set_mode(SessionMode::Ghost);
        Ok(())
    }

    /// Ends a ghost session.
    ///
    /// Returns to the last active account if it is still listed, otherwise logs out.
    /// Logging out here never removes the ghost public key from the account list.
    pub fn stop_ghost(&self) -> Result<(), AccountError> {
        let _guard = self.inner.ops.lock();
        match self.inner.last_account()? {
            Some(pubkey) if self.has_account(&pubkey) => self.inner.switch_account(&pubkey),
            _ => self.inner.logout(false),
        }
    }

    /// Clears the current account.
    ///
    /// With `clear`, the current account is also removed from the list.
    pub fn logout(&self, clear: bool) -> Result<(), AccountError> {
        let _guard = self.inner.ops.lock();
        if clear {
            if let Some(pubkey) = self.inner.current_pubkey() {
                self.remove_account(&pubkey)?;
            }
        }
        self.inner.logout(clear)
    }

    /// Replaces the device local settings of the listed account with `pubkey`.
    ///
    /// Unknown public keys are ignored.
    pub fn update_account_local_settings(
        &self,
        pubkey: &PublicKey,
        settings: AppSettings,
    ) -> Result<(), AccountError> {
        let _guard = self.inner.ops.lock();
        match self.inner.find(pubkey) {
            Some(account) => self.add_account(account.with_local_settings(settings)),
            None => {
                debug!(pubkey = %pubkey.fmt_short(), "not updating settings of unknown account");
                Ok(())
            }
        }
    }

    /// The signer of the current account, `None` when logged out.
    pub fn signer(&self, registry: &SignerRegistry) -> Result<Option<Arc<dyn Signer>>, SignerError> {
        match self.inner.current.value() {
            Some(account) => registry.signer(&account).map(Some),
            None => Ok(None),
        }
    }
}

impl Inner {
    fn load(&self) -> Result<(), AccountError> {
        let _guard = self.ops.lock();
        let accounts = self.storage.accounts().context(PersistSnafu)?;
        debug!(count = accounts.len(), "loaded accounts");
        self.accounts.next(accounts);
        if let Some(pubkey) = self.last_account()? {
            self.switch_account(&pubkey)?;
        }
        Ok(())
    }

    fn find(&self, pubkey: &PublicKey) -> Option<Account> {
        self.accounts
            .value()
            .into_iter()
            .find(|a| a.pubkey == *pubkey)
    }

    fn current_pubkey(&self) -> Option<PublicKey> {
        self.current.value().map(|a| a.pubkey)
    }

    fn set_mode(&self, mode: SessionMode) {
        if self.mode.value() != mode {
            self.mode.next(mode);
        }
    }

    fn last_account(&self) -> Result<Option<PublicKey>, AccountError> {
        let Some(value) = self
            .storage
            .get_value(LAST_ACCOUNT_SLOT)
            .context(PersistSnafu)?
        else {
            return Ok(None);
        };
        match value.parse() {
            Ok(pubkey) => Ok(Some(pubkey)),
            Err(err) => {
                warn!("ignoring invalid last account pointer: {err}");
                Ok(None)
            }
        }
    }

    fn switch_account(&self, pubkey: &PublicKey) -> Result<(), AccountError> {
        let Some(account) = self.find(pubkey) else {
            debug!(pubkey = %pubkey.fmt_short(), "not switching to unknown account");
            return Ok(());
        };
        self.storage
            .set_value(LAST_ACCOUNT_SLOT, &pubkey.to_string())
            .context(PersistSnafu)?;
        info!(pubkey = %pubkey.fmt_short(), "switched account");
        self.current.next(Some(account));
        self.set_mode(SessionMode::Normal);
        Ok(())
    }

    fn logout(&self, cleared: bool) -> Result<(), AccountError> {
        self.storage
            .remove_value(LAST_ACCOUNT_SLOT)
            .context(PersistSnafu)?;
        info!(cleared, "logged out");
        self.current.next(None);
        self.set_mode(SessionMode::Normal);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use strudel_base::SecretKey;

    use super::*;
    use crate::{account::AccountKind, storage::MemStorage};

    fn keys(n: usize) -> Vec<PublicKey> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(n as u64);
        (0..n).map(|_| SecretKey::generate(&mut rng).public()).collect()
    }

    fn manager() -> (Arc<MemStorage>, AccountManager) {
        let storage = Arc::new(MemStorage::default());
        let manager = AccountManager::load(storage.clone()).unwrap();
        (storage, manager)
    }

    fn current(manager: &AccountManager) -> Option<PublicKey> {
        manager.current().value().map(|a| a.pubkey)
    }

    #[test]
    fn test_upsert_keeps_list_unique() {
        let (storage, manager) = manager();
        let pks = keys(2);
        manager.add_account(Account::read_only(pks[0])).unwrap();
        manager.add_account(Account::read_only(pks[1])).unwrap();
        manager
            .add_account(Account::new(pks[0], AccountKind::Extension))
            .unwrap();

        let accounts = manager.accounts().value();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].kind, AccountKind::Extension);
        assert_eq!(storage.accounts().unwrap(), accounts);
        assert!(manager.has_account(&pks[1]));
    }

    #[test]
    fn test_upsert_current_republishes_and_ends_ghost() {
        let (_storage, manager) = manager();
        let pks = keys(2);
        manager.add_account(Account::read_only(pks[0])).unwrap();
        manager.start_ghost(pks[0]).unwrap();
        assert!(manager.is_ghost().value());

        let updated = Account::new(pks[0], AccountKind::Amber);
        manager.add_account(updated.clone()).unwrap();
        assert_eq!(manager.current().value(), Some(updated));
        assert!(!manager.is_ghost().value());
        assert_eq!(manager.mode().value(), SessionMode::Normal);
    }

    #[test]
    fn test_remove_current_leaves_it_orphaned() {
        let (storage, manager) = manager();
        let pk = keys(1)[0];
        manager.add_account(Account::read_only(pk)).unwrap();
        manager.switch_account(&pk).unwrap();
        manager.remove_account(&pk).unwrap();
        assert!(!manager.has_account(&pk));
        assert!(storage.accounts().unwrap().is_empty());
        assert_eq!(current(&manager), Some(pk));
    }

    #[test]
    fn test_switch() {
        let (storage, manager) = manager();
        let pks = keys(3);
        manager.add_account(Account::read_only(pks[0])).unwrap();
        manager.add_account(Account::read_only(pks[1])).unwrap();

        manager.switch_account(&pks[1]).unwrap();
        assert_eq!(current(&manager), Some(pks[1]));
        assert_eq!(
            storage.get_value(LAST_ACCOUNT_SLOT).unwrap(),
            Some(pks[1].to_string())
        );

        // unknown keys are ignored
        manager.switch_account(&pks[2]).unwrap();
        assert_eq!(current(&manager), Some(pks[1]));
    }

    #[test]
    fn test_ghost_roundtrip() {
        let (storage, manager) = manager();
        let pks = keys(3);
        manager.add_account(Account::read_only(pks[0])).unwrap();
        manager.add_account(Account::read_only(pks[1])).unwrap();
        manager.switch_account(&pks[0]).unwrap();
        let before = manager.current().value();

        manager.start_ghost(pks[2]).unwrap();
        assert_eq!(current(&manager), Some(pks[2]));
        assert!(manager.is_ghost().value());
        assert!(!manager.has_account(&pks[2]));
        assert_eq!(storage.accounts().unwrap().len(), 2);

        // a second ghost session keeps the pointer to the real account
        manager.start_ghost(pks[1]).unwrap();

        manager.stop_ghost().unwrap();
        assert_eq!(manager.current().value(), before);
        assert!(!manager.is_ghost().value());
    }

    #[test]
    fn test_ghost_without_account_logs_out() {
        let (storage, manager) = manager();
        let pk = keys(1)[0];
        manager.start_ghost(pk).unwrap();
        manager.stop_ghost().unwrap();
        assert_eq!(manager.current().value(), None);
        assert!(!manager.is_ghost().value());
        assert_eq!(storage.get_value(LAST_ACCOUNT_SLOT).unwrap(), None);
    }

    #[test]
    fn test_stop_ghost_keeps_listed_ghost_account() {
        let (storage, manager) = manager();
        let pk = keys(1)[0];
        manager.add_account(Account::read_only(pk)).unwrap();
        manager.start_ghost(pk).unwrap();
        manager.stop_ghost().unwrap();
        assert_eq!(manager.current().value(), None);
        assert!(manager.has_account(&pk));
        assert_eq!(storage.accounts().unwrap(), vec![Account::read_only(pk)]);
    }

    #[test]
    fn test_logout() {
        let (storage, manager) = manager();
        let pks = keys(2);
        manager.add_account(Account::read_only(pks[0])).unwrap();
        manager.add_account(Account::read_only(pks[1])).unwrap();

        manager.switch_account(&pks[0]).unwrap();
        manager.logout(false).unwrap();
        assert_eq!(manager.current().value(), None);
        assert!(manager.has_account(&pks[0]));
        assert_eq!(storage.get_value(LAST_ACCOUNT_SLOT).unwrap(), None);

        manager.switch_account(&pks[1]).unwrap();
        manager.logout(true).unwrap();
        assert_eq!(manager.current().value(), None);
        assert!(!manager.has_account(&pks[1]));
        assert_eq!(storage.accounts().unwrap().len(), 1);
    }

    #[test]
    fn test_storage_failures_propagate() {
        let (storage, manager) = manager();
        let pks = keys(2);
        manager.add_account(Account::read_only(pks[0])).unwrap();
        storage.set_read_only(true);

        assert!(manager.add_account(Account::read_only(pks[1])).is_err());
        assert!(!manager.has_account(&pks[1]));
        assert!(manager.remove_account(&pks[0]).is_err());
        assert!(manager.has_account(&pks[0]));
        assert!(manager.switch_account(&pks[0]).is_err());
        assert_eq!(manager.current().value(), None);
        assert!(manager.logout(false).is_err());
    }

    #[test]
    fn test_update_local_settings() {
        let (storage, manager) = manager();
        let pk = keys(1)[0];
        manager.add_account(Account::read_only(pk)).unwrap();
        let mut settings = AppSettings::default();
        settings.blur_images = false;
        manager
            .update_account_local_settings(&pk, settings.clone())
            .unwrap();
        assert_eq!(
            storage.accounts().unwrap()[0].local_settings,
            Some(settings.clone())
        );
        let other = keys(2)[1];
        manager.update_account_local_settings(&other, settings).unwrap();
        assert_eq!(manager.accounts().value().len(), 1);
    }

    #[tokio::test]
    async fn test_startup_restores_last_account() {
        let storage = Arc::new(MemStorage::default());
        let pks = keys(2);
        storage.put_account(&Account::read_only(pks[0])).unwrap();
        storage.put_account(&Account::read_only(pks[1])).unwrap();
        storage
            .set_value(LAST_ACCOUNT_SLOT, &pks[1].to_string())
            .unwrap();

        let manager = AccountManager::spawn(storage);
        manager.loaded().await;
        assert!(!manager.loading().value());
        assert_eq!(manager.accounts().value().len(), 2);
        assert_eq!(current(&manager), Some(pks[1]));
    }

    #[tokio::test]
    async fn test_startup_with_stale_pointer() {
        let storage = Arc::new(MemStorage::default());
        let pks = keys(2);
        storage.put_account(&Account::read_only(pks[0])).unwrap();
        storage
            .set_value(LAST_ACCOUNT_SLOT, &pks[1].to_string())
            .unwrap();

        let manager = AccountManager::spawn(storage);
        manager.loaded().await;
        assert_eq!(manager.current().value(), None);
        assert_eq!(manager.accounts().value().len(), 1);
    }

    #[test]
    fn test_signer_of_current() {
        let (_storage, manager) = manager();
        let registry = SignerRegistry::default();
        assert!(manager.signer(&registry).unwrap().is_none());
        let pk = keys(1)[0];
        manager.start_ghost(pk).unwrap();
        let signer = manager.signer(&registry).unwrap().unwrap();
        assert_eq!(signer.public_key(), pk);
    }
}
