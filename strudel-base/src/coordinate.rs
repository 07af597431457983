//! Coordinates address replaceable records by `(kind, owner, tag)` instead of by id.

use std::{fmt, str::FromStr};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize, de};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::{
    filter::Filter,
    key::{KeyParsingError, PublicKey},
    record::Kind,
};

/// The address of a replaceable record.
///
/// Encoded as `"{kind}:{owner}:{tag}"`, which is also the value used in `a` tags. The tag
/// may itself contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coordinate {
    /// Record kind.
    pub kind: Kind,
    /// Author of the record.
    pub owner: PublicKey,
    /// The `d` tag value, empty for plain replaceable kinds.
    pub tag: String,
}

impl Coordinate {
    /// Creates a new coordinate.
    pub fn new(kind: Kind, owner: PublicKey, tag: impl Into<String>) -> Self {
        Self {
            kind,
            owner,
            tag: tag.into(),
        }
    }

    /// A relay filter selecting the records stored at this coordinate.
    pub fn filter(&self) -> Filter {
        let filter = Filter::new().kind(self.kind).author(self.owner);
        if self.kind.is_parameterized_replaceable() {
            filter.identifier(self.tag.clone())
        } else {
            filter
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.owner, self.tag)
    }
}

impl FromStr for Coordinate {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let kind = parts.next().context(MissingPartSnafu { part: "kind" })?;
        let owner = parts.next().context(MissingPartSnafu { part: "owner" })?;
        let tag = parts.next().context(MissingPartSnafu { part: "tag" })?;
        let kind: u16 = kind.parse().ok().context(InvalidKindSnafu {
            kind: kind.to_string(),
        })?;
        let owner: PublicKey = owner.parse().context(InvalidOwnerSnafu)?;
        Ok(Self::new(Kind(kind), owner, tag))
    }
}

impl Serialize for Coordinate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Coordinate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

/// Error when parsing a [`Coordinate`] from its string form.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CoordinateError {
    #[snafu(display("coordinate is missing its {part}"))]
    MissingPart { part: &'static str },
    #[snafu(display("invalid kind {kind:?}"))]
    InvalidKind { kind: String },
    #[snafu(display("invalid owner"))]
    InvalidOwner { source: KeyParsingError },
}
