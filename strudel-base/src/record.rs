//! Signed records, the unit of data exchanged with relays.

use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display},
    str::FromStr,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize, de};
use sha2::{Digest, Sha256};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::{
    coordinate::Coordinate,
    key::{KeyParsingError, PublicKey, SecretKey, Signature, SignatureError, decode_hex_32},
};

/// The numeric kind of a record.
///
/// The kind decides how relays and clients treat records: regular records are kept,
/// replaceable records are superseded by newer records at the same [`Coordinate`], and
/// ephemeral records are not stored at all.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[serde(transparent)]
pub struct Kind(pub u16);

impl Kind {
    /// Profile metadata.
    pub const METADATA: Kind = Kind(0);
    /// Short text note.
    pub const TEXT_NOTE: Kind = Kind(1);
    /// Follow list.
    pub const CONTACTS: Kind = Kind(3);
    /// Relay list metadata.
    pub const RELAY_LIST: Kind = Kind(10002);
    /// Remote signer requests and responses.
    pub const NOSTR_CONNECT: Kind = Kind(24133);
    /// Arbitrary application data, keyed by the `d` tag.
    pub const APP_DATA: Kind = Kind(30078);

    /// Only the latest record per `(kind, owner)` is kept.
    pub fn is_replaceable(&self) -> bool {
        matches!(self.0, 0 | 3 | 10000..20000)
    }

    /// Relays do not store these.
    pub fn is_ephemeral(&self) -> bool {
        (20000..30000).contains(&self.0)
    }

    /// Only the latest record per `(kind, owner, d-tag)` is kept.
    pub fn is_parameterized_replaceable(&self) -> bool {
        (30000..40000).contains(&self.0)
    }

    /// Whether records of this kind are addressed by a [`Coordinate`].
    pub fn is_addressable(&self) -> bool {
        self.is_replaceable() || self.is_parameterized_replaceable()
    }
}

/// A single tag: a name followed by its values, e.g. `["d", "nostrudel-settings"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Creates a tag from a name and values.
    pub fn new<I, S>(name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = vec![name.to_string()];
        parts.extend(values.into_iter().map(Into::into));
        Self(parts)
    }

    /// Creates a `d` tag, the identifier of a parameterized replaceable record.
    pub fn identifier(tag: impl Into<String>) -> Self {
        Self(vec!["d".to_string(), tag.into()])
    }

    /// The tag name.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The first value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// The id of a record, the sha256 digest of its canonical serialization.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId([u8; 32]);

impl RecordId {
    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Computes the id for the given record fields.
    pub fn compute(
        pubkey: &PublicKey,
        created_at: u64,
        kind: Kind,
        tags: &[Tag],
        content: &str,
    ) -> Self {
        let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Self(digest.into())
    }

    /// Hex encoding limited to the first 5 bytes, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({self})")
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl FromStr for RecordId {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_hex_32(s)?))
    }
}

impl Serialize for RecordId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

/// An unsigned record, ready to be handed to a signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDraft {
    /// Record kind.
    pub kind: Kind,
    /// Record tags.
    pub tags: Vec<Tag>,
    /// Record content.
    pub content: String,
    /// Creation time in seconds since the unix epoch.
    pub created_at: u64,
}

impl RecordDraft {
    /// The id this draft will have once signed by `pubkey`.
    pub fn id_for(&self, pubkey: &PublicKey) -> RecordId {
        RecordId::compute(pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Signs the draft with a local secret key.
    pub fn sign(self, secret: &SecretKey) -> Record {
        let pubkey = secret.public();
        let id = self.id_for(&pubkey);
        let sig = secret.sign(id.as_bytes());
        Record {
            id,
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// A signed record as exchanged with relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// The record id.
    pub id: RecordId,
    /// The author.
    pub pubkey: PublicKey,
    /// Creation time in seconds since the unix epoch.
    pub created_at: u64,
    /// Record kind.
    pub kind: Kind,
    /// Record tags.
    pub tags: Vec<Tag>,
    /// Record content.
    pub content: String,
    /// Signature of the author over the id.
    pub sig: Signature,
}

impl Record {
    /// Checks that the id matches the content and the signature matches the id.
    pub fn verify(&self) -> Result<(), RecordError> {
        let expected = RecordId::compute(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        snafu::ensure!(expected == self.id, IdMismatchSnafu { id: self.id });
        self.pubkey
            .verify(self.id.as_bytes(), &self.sig)
            .context(InvalidSignatureSnafu)?;
        Ok(())
    }

    /// The value of the first `d` tag, or `""` if there is none.
    pub fn identifier(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.name() == Some("d"))
            .and_then(Tag::value)
            .unwrap_or("")
    }

    /// The coordinate of this record, if its kind is addressable.
    pub fn coordinate(&self) -> Option<Coordinate> {
        if self.kind.is_parameterized_replaceable() {
            Some(Coordinate::new(self.kind, self.pubkey, self.identifier()))
        } else if self.kind.is_replaceable() {
            Some(Coordinate::new(self.kind, self.pubkey, ""))
        } else {
            None
        }
    }

    /// Orders two versions of the same coordinate.
    ///
    /// The greater record wins: a later `created_at` is greater, and on equal timestamps
    /// the lexicographically smaller id is greater.
    pub fn cmp_version(&self, other: &Record) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }

    /// Whether this record replaces `other` at their shared coordinate.
    pub fn supersedes(&self, other: &Record) -> bool {
        self.cmp_version(other) == Ordering::Greater
    }
}

/// Record validation errors.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RecordError {
    #[snafu(display("record id {id} does not match its content"))]
    IdMismatch { id: RecordId },
    #[snafu(display("invalid record signature"))]
    InvalidSignature { source: SignatureError },
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn draft(created_at: u64) -> RecordDraft {
        RecordDraft {
            kind: Kind::APP_DATA,
            tags: vec![Tag::identifier("nostrudel-settings")],
            content: "{}".to_string(),
            created_at,
        }
    }

    #[test]
    fn test_kind_classes() {
        assert!(Kind::METADATA.is_replaceable());
        assert!(Kind::CONTACTS.is_replaceable());
        assert!(Kind::RELAY_LIST.is_replaceable());
        assert!(!Kind::TEXT_NOTE.is_addressable());
        assert!(Kind::NOSTR_CONNECT.is_ephemeral());
        assert!(Kind::APP_DATA.is_parameterized_replaceable());
        assert!(!Kind(40000).is_addressable());
    }

    #[test]
    fn test_sign_and_verify() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let secret = SecretKey::generate(&mut rng);
        let record = draft(1000).sign(&secret);
        record.verify().unwrap();
        assert_eq!(record.identifier(), "nostrudel-settings");

        let mut tampered = record.clone();
        tampered.content = "{\"version\":1}".to_string();
        assert!(matches!(
            tampered.verify(),
            Err(RecordError::IdMismatch { .. })
        ));

        let other = SecretKey::generate(&mut rng);
        let mut forged = record.clone();
        forged.sig = draft(1000).sign(&other).sig;
        assert!(matches!(
            forged.verify(),
            Err(RecordError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_known_id() {
        // id of a well known record, checked against other implementations
        let pubkey: PublicKey = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
            .parse()
            .unwrap();
        let id = RecordId::compute(&pubkey, 0, Kind::TEXT_NOTE, &[], "");
        let canonical = format!("[0,\"{pubkey}\",0,1,[],\"\"]");
        let expected: [u8; 32] = Sha256::digest(canonical.as_bytes()).into();
        assert_eq!(id.as_bytes(), &expected);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let secret = SecretKey::generate(&mut rng);
        let record = draft(5).sign(&secret);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"kind\":30078"));
        assert!(json.contains("[\"d\",\"nostrudel-settings\"]"));
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        back.verify().unwrap();
    }

    #[test]
    fn test_coordinate_of_record() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(4);
        let secret = SecretKey::generate(&mut rng);
        let record = draft(5).sign(&secret);
        let coord = record.coordinate().unwrap();
        assert_eq!(coord.kind, Kind::APP_DATA);
        assert_eq!(coord.owner, secret.public());
        assert_eq!(coord.tag, "nostrudel-settings");

        let note = RecordDraft {
            kind: Kind::TEXT_NOTE,
            tags: vec![Tag::identifier("ignored")],
            content: "hi".into(),
            created_at: 1,
        }
        .sign(&secret);
        assert!(note.coordinate().is_none());

        let profile = RecordDraft {
            kind: Kind::METADATA,
            tags: vec![Tag::identifier("ignored")],
            content: "{}".into(),
            created_at: 1,
        }
        .sign(&secret);
        assert_eq!(profile.coordinate().unwrap().tag, "");
    }

    proptest::proptest! {
        #[test]
        fn version_order_is_total(
            a in (0u64..3, proptest::prelude::any::<[u8; 32]>()),
            b in (0u64..3, proptest::prelude::any::<[u8; 32]>()),
        ) {
            let secret = SecretKey::generate(&mut rand::rngs::StdRng::seed_from_u64(0));
            let base = draft(0).sign(&secret);
            let version = |(created_at, id): (u64, [u8; 32])| Record {
                created_at,
                id: RecordId::from_bytes(id),
                ..base.clone()
            };
            let (a, b) = (version(a), version(b));
            proptest::prop_assert_eq!(a.cmp_version(&b), b.cmp_version(&a).reverse());
            proptest::prop_assert!(!(a.supersedes(&b) && b.supersedes(&a)));
            if a.id != b.id {
                proptest::prop_assert!(a.supersedes(&b) || b.supersedes(&a));
            }
        }
    }
}
