use std::{fmt, ops::Deref, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize, de};
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use url::Url;

/// A URL identifying a relay.
///
/// It is cheaply clonable, as the underlying type is wrapped into an `Arc`.  The main type
/// under the hood though is [`Url`].
///
/// Only `ws` and `wss` URLs are accepted.  Parsing normalizes the URL the way [`Url`] does,
/// so `wss://Relay.Example.com` and `wss://relay.example.com/` compare equal.
#[derive(Clone, derive_more::Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayUrl(Arc<Url>);

impl RelayUrl {
    fn from_url(url: Url) -> Result<Self, RelayUrlParseError> {
        ensure!(
            matches!(url.scheme(), "ws" | "wss"),
            UnsupportedSchemeSnafu {
                scheme: url.scheme().to_string()
            }
        );
        Ok(Self(Arc::new(url)))
    }
}

impl TryFrom<Url> for RelayUrl {
    type Error = RelayUrlParseError;

    fn try_from(url: Url) -> Result<Self, Self::Error> {
        Self::from_url(url)
    }
}

/// Can occur when parsing a string into a [`RelayUrl`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RelayUrlParseError {
    #[snafu(display("Failed to parse relay URL"))]
    Invalid {
        source: url::ParseError,
        backtrace: Option<Backtrace>,
        #[snafu(implicit)]
        span_trace: n0_snafu::SpanTrace,
    },
    #[snafu(display("Relay URLs must use ws or wss, got {scheme}"))]
    UnsupportedScheme {
        scheme: String,
        backtrace: Option<Backtrace>,
        #[snafu(implicit)]
        span_trace: n0_snafu::SpanTrace,
    },
}

impl FromStr for RelayUrl {
    type Err = RelayUrlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = Url::from_str(s.trim()).context(InvalidSnafu)?;
        Self::from_url(inner)
    }
}

impl From<RelayUrl> for Url {
    fn from(value: RelayUrl) -> Self {
        Arc::unwrap_or_clone(value.0)
    }
}

/// Dereferences to the wrapped [`Url`].
impl Deref for RelayUrl {
    type Target = Url;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"RelayUrl("{}")"#, self.0.as_str())
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}
