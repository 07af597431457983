//! Cryptographic key handling for relay identities.
//!
//! Identities on the network are BIP-340 x-only secp256k1 public keys, encoded as 64
//! lowercase hex characters on the wire.

use std::{
    fmt::{self, Debug, Display},
    hash::Hash,
    str::FromStr,
};

use nested_enum_utils::common_fields;
use rand_core::CryptoRngCore;
use secp256k1::{Keypair, SECP256K1, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize, de};
use snafu::{Backtrace, ResultExt, Snafu};

/// A public key, the identity handle of an account.
///
/// The key is stored as its x-only serialization and verified to be a valid curve point
/// when created.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(XOnlyPublicKey);

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PublicKey {
    /// The length of a serialized `PublicKey`, in bytes.
    pub const LENGTH: usize = 32;

    /// Returns the serialized x-only key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.serialize()
    }

    /// Constructs a `PublicKey` from its 32 byte x-only serialization.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyParsingError> {
        let key = XOnlyPublicKey::from_slice(bytes).context(KeySnafu)?;
        Ok(Self(key))
    }

    /// Verifies a schnorr signature over a 32 byte message digest.
    pub fn verify(&self, message: &[u8; 32], signature: &Signature) -> Result<(), SignatureError> {
        SECP256K1
            .verify_schnorr(&signature.0, message, &self.0)
            .map_err(|_| SignatureSnafu.build())
    }

    /// Hex encoding limited to the first 5 bytes, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.to_bytes()[..5])
    }

    /// Needed for ECDH, not part of the stable API.
    #[doc(hidden)]
    pub fn as_x_only(&self) -> &XOnlyPublicKey {
        &self.0
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&data_encoding::HEXLOWER.encode(&self.to_bytes()))
    }
}

impl FromStr for PublicKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex_32(s)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

/// A secret key.
///
/// Holds the full keypair so signing does not recompute the public half.
#[derive(Clone)]
pub struct SecretKey(Keypair);

impl Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

impl SecretKey {
    /// Generates a new key with the given RNG.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            // out of range scalars are astronomically rare, draw again
            if let Ok(key) = Self::from_bytes(&bytes) {
                return key;
            }
        }
    }

    /// Constructs a key from its 32 byte scalar.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyParsingError> {
        let secret = secp256k1::SecretKey::from_slice(bytes).context(KeySnafu)?;
        Ok(Self(Keypair::from_secret_key(SECP256K1, &secret)))
    }

    /// Returns the 32 byte scalar.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.secret_bytes()
    }

    /// The public key of this secret key.
    pub fn public(&self) -> PublicKey {
        let (key, _parity) = self.0.x_only_public_key();
        PublicKey(key)
    }

    /// Signs a 32 byte message digest.
    pub fn sign(&self, message: &[u8; 32]) -> Signature {
        Signature(SECP256K1.sign_schnorr_no_aux_rand(message, &self.0))
    }

    /// Needed for ECDH, not part of the stable API.
    #[doc(hidden)]
    pub fn as_secp(&self) -> secp256k1::SecretKey {
        secp256k1::SecretKey::from_keypair(&self.0)
    }
}

impl FromStr for SecretKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex_32(s)?;
        Self::from_bytes(&bytes)
    }
}

/// A BIP-340 schnorr signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(schnorr::Signature);

impl Signature {
    /// The length of a serialized signature, in bytes.
    pub const LENGTH: usize = 64;

    /// Returns the 64 byte serialization.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.serialize()
    }

    /// Parses a signature from its 64 byte serialization.
    pub fn from_bytes(bytes: &[u8; 64]) -> Result<Self, KeyParsingError> {
        let sig = schnorr::Signature::from_slice(bytes).context(KeySnafu)?;
        Ok(Self(sig))
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&data_encoding::HEXLOWER.encode(&self.to_bytes()))
    }
}

impl FromStr for Signature {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .context(DecodeSnafu)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| InvalidLengthSnafu { len: b.len() }.build())?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

/// Error when parsing a [`PublicKey`], [`SecretKey`] or [`Signature`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum KeyParsingError {
    #[snafu(display("invalid hex encoding"))]
    Decode { source: data_encoding::DecodeError },
    #[snafu(display("invalid length, got {len} byte(s)"))]
    InvalidLength { len: usize },
    #[snafu(display("not a valid secp256k1 key or signature"))]
    Key { source: secp256k1::Error },
}

/// Verification of a signature failed.
#[derive(Debug, Snafu)]
#[snafu(display("invalid signature"))]
pub struct SignatureError {
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
}

pub(crate) fn decode_hex_32(s: &str) -> Result<[u8; 32], KeyParsingError> {
    let bytes = data_encoding::HEXLOWER_PERMISSIVE
        .decode(s.as_bytes())
        .context(DecodeSnafu)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| InvalidLengthSnafu { len: b.len() }.build())
}
