//! Signing capabilities of accounts.
//!
//! Every [`AccountKind`] maps to a [`Signer`].  Read-only and local accounts are handled
//! here.  The delegated kinds (browser extension, serial device, Amber, remote signer) need
//! an outside channel, which is plugged in as a [`SignerBackend`] on the [`SignerRegistry`].

use std::{collections::BTreeMap, fmt, sync::Arc};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use strudel_base::{KeyParsingError, PublicKey, Record, RecordDraft, SecretKey};
use tracing::debug;

use crate::{
    account::{Account, AccountKind},
    storage::{Storage, StorageError},
};

pub mod nip04;

/// Storage slot holding the hex encoded [`DeviceKey`].
const DEVICE_KEY_SLOT: &str = "device-key";

/// The signing interface of an account.
pub trait Signer: fmt::Debug + Send + Sync + 'static {
    /// The public key records are signed with.
    fn public_key(&self) -> PublicKey;

    /// Signs a draft.
    fn sign(&self, draft: RecordDraft) -> BoxFuture<Result<Record, SignerError>>;

    /// Encrypts a direct message to `peer`.
    fn encrypt(&self, peer: PublicKey, plaintext: String) -> BoxFuture<Result<String, SignerError>>;

    /// Decrypts a direct message from `peer`.
    fn decrypt(&self, peer: PublicKey, payload: String) -> BoxFuture<Result<String, SignerError>>;
}

/// Creates signers for a delegated [`AccountKind`].
pub trait SignerBackend: fmt::Debug + Send + Sync + 'static {
    /// Returns a signer for `account`.
    fn signer(&self, account: &Account) -> Result<Arc<dyn Signer>, SignerError>;
}

/// Signing errors.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum SignerError {
    #[snafu(display("account {pubkey} is read-only"))]
    ReadOnly { pubkey: PublicKey },
    #[snafu(display("no signer backend for {kind} accounts"))]
    Unsupported { kind: &'static str },
    #[snafu(display("local accounts need a device key"))]
    NoDeviceKey {},
    #[snafu(display("failed to seal secret key"))]
    Seal {},
    #[snafu(display("failed to unseal secret key"))]
    Unseal {},
    #[snafu(display("invalid secret key"))]
    InvalidSecret { source: KeyParsingError },
    #[snafu(display("invalid encrypted payload: {reason}"))]
    InvalidPayload { reason: &'static str },
    #[snafu(display("failed to decrypt payload"))]
    Decrypt {},
    #[snafu(display("signer backend failed: {message}"))]
    Backend { message: String },
    #[snafu(display("failed to access the device key"))]
    Storage { source: StorageError },
}

/// Symmetric key sealing the secrets of local accounts at rest.
///
/// The key itself lives in [`Storage`], see [`DeviceKey::load_or_create`].
#[derive(Clone)]
pub struct DeviceKey([u8; 32]);

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceKey(..)")
    }
}

impl DeviceKey {
    /// Generates a new random key.
    pub fn generate(rng: &mut (impl rand::RngCore + rand::CryptoRng)) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Loads the key from `storage`, creating and storing a new one on first use.
    pub fn load_or_create(storage: &dyn Storage) -> Result<Self, SignerError> {
        if let Some(hex) = storage.get_value(DEVICE_KEY_SLOT).context(StorageSnafu)? {
            let bytes = data_encoding::HEXLOWER_PERMISSIVE
                .decode(hex.as_bytes())
                .ok()
                .and_then(|b| <[u8; 32]>::try_from(b).ok());
            if let Some(bytes) = bytes {
                return Ok(Self(bytes));
            }
            return InvalidPayloadSnafu {
                reason: "stored device key is malformed",
            }
            .fail();
        }
        debug!("creating device key");
        let key = Self::generate(&mut rand::rngs::OsRng);
        storage
            .set_value(DEVICE_KEY_SLOT, &data_encoding::HEXLOWER.encode(&key.0))
            .context(StorageSnafu)?;
        Ok(key)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.0.into())
    }

    /// Seals `secret`, returns the ciphertext and the nonce.
    pub fn seal(
        &self,
        secret: &SecretKey,
        rng: &mut (impl rand::RngCore + rand::CryptoRng),
    ) -> Result<(Vec<u8>, Vec<u8>), SignerError> {
        let mut iv = [0u8; 12];
        rng.fill_bytes(&mut iv);
        let sealed = self
            .cipher()
            .encrypt(Nonce::from_slice(&iv), secret.to_bytes().as_slice())
            .map_err(|_| SealSnafu.build())?;
        Ok((sealed, iv.to_vec()))
    }

    /// Opens a secret sealed with [`DeviceKey::seal`].
    pub fn unseal(&self, sealed: &[u8], iv: &[u8]) -> Result<SecretKey, SignerError> {
        ensure!(
            iv.len() == 12,
            InvalidPayloadSnafu {
                reason: "nonce must be 12 bytes"
            }
        );
        let bytes = self
            .cipher()
            .decrypt(Nonce::from_slice(iv), sealed)
            .map_err(|_| UnsealSnafu.build())?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| UnsealSnafu.build())?;
        SecretKey::from_bytes(&bytes).context(InvalidSecretSnafu)
    }
}

/// Signer of accounts which cannot sign.
#[derive(Debug, Clone)]
pub struct ReadOnlySigner(PublicKey);

impl ReadOnlySigner {
    /// Creates a read-only signer for `pubkey`.
    pub fn new(pubkey: PublicKey) -> Self {
        Self(pubkey)
    }

    fn fail<T: Send + 'static>(&self) -> BoxFuture<Result<T, SignerError>> {
        let err = ReadOnlySnafu { pubkey: self.0 }.build();
        Box::pin(std::future::ready(Err(err)))
    }
}

impl Signer for ReadOnlySigner {
    fn public_key(&self) -> PublicKey {
        self.0
    }

    fn sign(&self, _draft: RecordDraft) -> BoxFuture<Result<Record, SignerError>> {
        self.fail()
    }

    fn encrypt(&self, _peer: PublicKey, _plaintext: String) -> BoxFuture<Result<String, SignerError>> {
        self.fail()
    }

    fn decrypt(&self, _peer: PublicKey, _payload: String) -> BoxFuture<Result<String, SignerError>> {
        self.fail()
    }
}

/// Signs with a secret key held in memory.
#[derive(Debug, Clone)]
pub struct LocalSigner {
    secret: SecretKey,
}

impl LocalSigner {
    /// Creates a signer for `secret`.
    pub fn new(secret: SecretKey) -> Self {
        Self { secret }
    }
}

impl Signer for LocalSigner {
    fn public_key(&self) -> PublicKey {
        self.secret.public()
    }

    fn sign(&self, draft: RecordDraft) -> BoxFuture<Result<Record, SignerError>> {
        let record = draft.sign(&self.secret);
        Box::pin(std::future::ready(Ok(record)))
    }

    fn encrypt(&self, peer: PublicKey, plaintext: String) -> BoxFuture<Result<String, SignerError>> {
        let payload = nip04::encrypt(&self.secret, &peer, &plaintext, &mut rand::rngs::OsRng);
        Box::pin(std::future::ready(Ok(payload)))
    }

    fn decrypt(&self, peer: PublicKey, payload: String) -> BoxFuture<Result<String, SignerError>> {
        let plaintext = nip04::decrypt(&self.secret, &peer, &payload);
        Box::pin(std::future::ready(plaintext))
    }
}

/// Resolves the [`Signer`] of an account.
#[derive(Debug, Clone, Default)]
pub struct SignerRegistry {
    device_key: Option<DeviceKey>,
    backends: BTreeMap<&'static str, Arc<dyn SignerBackend>>,
}

impl SignerRegistry {
    /// Creates a registry unsealing local accounts with `device_key`.
    pub fn new(device_key: DeviceKey) -> Self {
        Self {
            device_key: Some(device_key),
            backends: Default::default(),
        }
    }

    /// Sets the key unsealing local accounts.
    pub fn with_device_key(mut self, device_key: DeviceKey) -> Self {
        self.device_key = Some(device_key);
        self
    }

    /// Registers the backend for accounts of type `kind`, e.g. `"extension"`.
    pub fn with_backend(mut self, kind: &'static str, backend: impl SignerBackend) -> Self {
        self.backends.insert(kind, Arc::new(backend));
        self
    }

    /// Returns the signer for `account`.
    pub fn signer(&self, account: &Account) -> Result<Arc<dyn Signer>, SignerError> {
        match &account.kind {
            AccountKind::Pubkey => Ok(Arc::new(ReadOnlySigner::new(account.pubkey))),
            AccountKind::Local { secret_key, iv } => {
                let device_key = self.device_key.as_ref().ok_or_else(|| NoDeviceKeySnafu.build())?;
                let secret = device_key.unseal(secret_key, iv)?;
                ensure!(secret.public() == account.pubkey, UnsealSnafu);
                Ok(Arc::new(LocalSigner::new(secret)))
            }
            kind => match self.backends.get(kind.name()) {
                Some(backend) => backend.signer(account),
                None => UnsupportedSnafu { kind: kind.name() }.fail(),
            },
        }
    }
}
