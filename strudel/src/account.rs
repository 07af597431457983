//! Accounts: the identities a user can act as.

use serde::{Deserialize, Serialize};
use strudel_base::{PublicKey, RelayUrl, SecretKey};

use crate::{
    settings::AppSettings,
    signer::{DeviceKey, SignerError},
};

/// An identity known to the client.
///
/// The public key identifies the account, the [`AccountKind`] says how records are signed
/// for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// The public key, unique among persisted accounts.
    pub pubkey: PublicKey,
    /// Relays the user picked for this account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relays: Option<Vec<RelayUrl>>,
    /// Settings kept on this device only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_settings: Option<AppSettings>,
    /// The signing backend.
    #[serde(flatten)]
    pub kind: AccountKind,
}

/// How records are signed for an [`Account`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AccountKind {
    /// No signing at all, the account can only read.
    Pubkey,
    /// A secret key stored on this device, sealed with the [`DeviceKey`].
    Local {
        /// The sealed secret key.
        #[serde(rename = "secretKey", with = "base64_bytes")]
        secret_key: Vec<u8>,
        /// The AES-GCM nonce used when sealing.
        #[serde(with = "base64_bytes")]
        iv: Vec<u8>,
    },
    /// Signing is delegated to a browser extension.
    Extension,
    /// Signing is delegated to a device on a serial port.
    Serial,
    /// Signing is delegated to the Amber signer app.
    Amber,
    /// Signing is delegated to a remote signer reached through relays.
    #[serde(rename_all = "camelCase")]
    NostrConnect {
        /// Hex secret of the session key used to talk to the remote signer.
        client_secret_key: String,
        /// Relays the remote signer listens on.
        signer_relays: Vec<RelayUrl>,
    },
}

impl AccountKind {
    /// The serialized `type` tag of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pubkey => "pubkey",
            Self::Local { .. } => "local",
            Self::Extension => "extension",
            Self::Serial => "serial",
            Self::Amber => "amber",
            Self::NostrConnect { .. } => "nostr-connect",
        }
    }
}

impl Account {
    /// Creates an account without relays or local settings.
    pub fn new(pubkey: PublicKey, kind: AccountKind) -> Self {
        Self {
            pubkey,
            relays: None,
            local_settings: None,
            kind,
        }
    }

    /// A read-only account, as used for ghost sessions.
    pub fn read_only(pubkey: PublicKey) -> Self {
        Self::new(pubkey, AccountKind::Pubkey)
    }

    /// A local account whose secret is sealed with `device_key`.
    pub fn local(
        secret: &SecretKey,
        device_key: &DeviceKey,
        rng: &mut (impl rand::RngCore + rand::CryptoRng),
    ) -> Result<Self, SignerError> {
        let (secret_key, iv) = device_key.seal(secret, rng)?;
        Ok(Self::new(secret.public(), AccountKind::Local { secret_key, iv }))
    }

    /// Sets the relay list.
    pub fn with_relays(mut self, relays: impl IntoIterator<Item = RelayUrl>) -> Self {
        self.relays = Some(relays.into_iter().collect());
        self
    }

    /// Sets the device local settings.
    pub fn with_local_settings(mut self, settings: AppSettings) -> Self {
        self.local_settings = Some(settings);
        self
    }

    /// Whether this account cannot sign.
    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, AccountKind::Pubkey)
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use serde_json::json;

    use super::*;

    const PK: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    #[test]
    fn test_serde_tags() {
        let pubkey: PublicKey = PK.parse().unwrap();
        let account = Account::read_only(pubkey);
        assert_eq!(
            serde_json::to_value(&account).unwrap(),
            json!({ "type": "pubkey", "pubkey": PK })
        );

        let relay: RelayUrl = "wss://bunker.example.com".parse().unwrap();
        let account = Account::new(
            pubkey,
            AccountKind::NostrConnect {
                client_secret_key: "00".repeat(32),
                signer_relays: vec![relay.clone()],
            },
        )
        .with_relays([relay]);
        let value = serde_json::to_value(&account).unwrap();
        assert_eq!(value["type"], "nostr-connect");
        assert_eq!(value["signerRelays"], json!(["wss://bunker.example.com/"]));
        assert_eq!(value["relays"], json!(["wss://bunker.example.com/"]));
        assert_eq!(serde_json::from_value::<Account>(value).unwrap(), account);

        for kind in [AccountKind::Extension, AccountKind::Serial, AccountKind::Amber] {
            let name = kind.name();
            let value = serde_json::to_value(Account::new(pubkey, kind)).unwrap();
            assert_eq!(value["type"], name);
        }
    }

    #[test]
    fn test_local_account() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let device_key = DeviceKey::generate(&mut rng);
        let secret = SecretKey::generate(&mut rng);
        let account = Account::local(&secret, &device_key, &mut rng)
            .unwrap()
            .with_local_settings(AppSettings::default());
        assert!(!account.is_read_only());

        let json = serde_json::to_string(&account).unwrap();
        assert!(json.contains(r#""type":"local""#));
        assert!(json.contains(r#""secretKey":"#));
        assert!(json.contains(r#""localSettings":"#));
        let back: Account = serde_json::from_str(&json).unwrap();
        assert_eq!(back, account);

        let AccountKind::Local { secret_key, iv } = &back.kind else {
            panic!("expected a local account");
        };
        let unsealed = device_key.unseal(secret_key, iv).unwrap();
        assert_eq!(unsealed.public(), secret.public());
    }
}
