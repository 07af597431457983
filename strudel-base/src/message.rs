//! The JSON wire protocol spoken with relays.
//!
//! Protocol flow:
//!
//!  * client sends `["REQ", <subscription id>, <filter>...]`
//!  * relay sends `["EVENT", <subscription id>, <record>]` for each stored match
//!  * relay sends `["EOSE", <subscription id>]` once stored records are exhausted
//!  * relay keeps sending `EVENT`s for new matches until
//!  * client sends `["CLOSE", <subscription id>]`, or the relay sends `["CLOSED", ...]`
//!
//! Publishing is `["EVENT", <record>]`, acknowledged with `["OK", <id>, <bool>, <msg>]`.

use std::fmt;

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize, ser::SerializeSeq};
use serde_json::Value;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::{
    filter::Filter,
    record::{Record, RecordId},
};

/// Identifies a subscription on a single relay connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Wraps an id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages sent from the client to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Publish a record.
    Event(Record),
    /// Open a subscription.
    Req {
        /// The subscription.
        subscription_id: SubscriptionId,
        /// The filters, combined with OR.
        filters: Vec<Filter>,
    },
    /// Close a subscription.
    Close(SubscriptionId),
}

impl Serialize for ClientMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Event(record) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(record)?;
                seq.end()
            }
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut seq = serializer.serialize_seq(Some(2 + filters.len()))?;
                seq.serialize_element("REQ")?;
                seq.serialize_element(subscription_id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
                seq.end()
            }
            Self::Close(subscription_id) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("CLOSE")?;
                seq.serialize_element(subscription_id)?;
                seq.end()
            }
        }
    }
}

impl ClientMessage {
    /// Encodes the message as a JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("client messages always serialize")
    }

    /// Decodes a JSON text frame.
    pub fn from_json(s: &str) -> Result<Self, MessageError> {
        let mut parts = split_frame(s)?.into_iter();
        let label = parts.next().and_then(as_label).context(MissingLabelSnafu)?;
        let msg = match label.as_str() {
            "EVENT" => Self::Event(parse_field(parts.next(), "record")?),
            "REQ" => Self::Req {
                subscription_id: parse_field(parts.next(), "subscription id")?,
                filters: parts
                    .map(|f| serde_json::from_value(f).context(InvalidFieldSnafu { field: "filter" }))
                    .collect::<Result<_, _>>()?,
            },
            "CLOSE" => Self::Close(parse_field(parts.next(), "subscription id")?),
            _ => return UnknownLabelSnafu { label }.fail(),
        };
        Ok(msg)
    }
}

/// Messages sent from a relay to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// A record matching a subscription.
    Event {
        /// The subscription.
        subscription_id: SubscriptionId,
        /// The record.
        record: Box<Record>,
    },
    /// End of stored records for a subscription.
    Eose(SubscriptionId),
    /// The relay closed a subscription.
    Closed {
        /// The subscription.
        subscription_id: SubscriptionId,
        /// Human readable reason.
        message: String,
    },
    /// Result of publishing a record.
    Ok {
        /// The published record.
        id: RecordId,
        /// Whether the relay accepted it.
        accepted: bool,
        /// Human readable reason.
        message: String,
    },
    /// Human readable notice.
    Notice(String),
}

impl Serialize for RelayMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match self {
            Self::Event {
                subscription_id,
                record,
            } => serde_json::json!(["EVENT", subscription_id, record]),
            Self::Eose(subscription_id) => serde_json::json!(["EOSE", subscription_id]),
            Self::Closed {
                subscription_id,
                message,
            } => serde_json::json!(["CLOSED", subscription_id, message]),
            Self::Ok {
                id,
                accepted,
                message,
            } => serde_json::json!(["OK", id, accepted, message]),
            Self::Notice(message) => serde_json::json!(["NOTICE", message]),
        };
        value.serialize(serializer)
    }
}

impl RelayMessage {
    /// Encodes the message as a JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("relay messages always serialize")
    }

    /// Decodes a JSON text frame.
    pub fn from_json(s: &str) -> Result<Self, MessageError> {
        let mut parts = split_frame(s)?.into_iter();
        let label = parts.next().and_then(as_label).context(MissingLabelSnafu)?;
        let msg = match label.as_str() {
            "EVENT" => Self::Event {
                subscription_id: parse_field(parts.next(), "subscription id")?,
                record: Box::new(parse_field(parts.next(), "record")?),
            },
            "EOSE" => Self::Eose(parse_field(parts.next(), "subscription id")?),
            "CLOSED" => Self::Closed {
                subscription_id: parse_field(parts.next(), "subscription id")?,
                message: parse_optional_message(parts.next())?,
            },
            "OK" => Self::Ok {
                id: parse_field(parts.next(), "record id")?,
                accepted: parse_field(parts.next(), "accepted")?,
                message: parse_optional_message(parts.next())?,
            },
            "NOTICE" => Self::Notice(parse_field(parts.next(), "message")?),
            _ => return UnknownLabelSnafu { label }.fail(),
        };
        Ok(msg)
    }
}

/// Errors when decoding wire messages.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MessageError {
    #[snafu(display("frame is not valid JSON"))]
    Json { source: serde_json::Error },
    #[snafu(display("frame is not a JSON array"))]
    NotAnArray {},
    #[snafu(display("frame has no message label"))]
    MissingLabel {},
    #[snafu(display("unknown message label {label:?}"))]
    UnknownLabel { label: String },
    #[snafu(display("missing {field}"))]
    MissingField { field: &'static str },
    #[snafu(display("invalid {field}"))]
    InvalidField {
        field: &'static str,
        source: serde_json::Error,
    },
}

fn split_frame(s: &str) -> Result<Vec<Value>, MessageError> {
    match serde_json::from_str(s).context(JsonSnafu)? {
        Value::Array(parts) => Ok(parts),
        _ => NotAnArraySnafu.fail(),
    }
}

fn as_label(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}

fn parse_field<T: serde::de::DeserializeOwned>(
    value: Option<Value>,
    field: &'static str,
) -> Result<T, MessageError> {
    let value = value.context(MissingFieldSnafu { field })?;
    serde_json::from_value(value).context(InvalidFieldSnafu { field })
}

fn parse_optional_message(value: Option<Value>) -> Result<String, MessageError> {
    match value {
        None => Ok(String::new()),
        Some(value) => serde_json::from_value(value).context(InvalidFieldSnafu { field: "message" }),
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::{
        key::SecretKey,
        record::{Kind, RecordDraft},
    };

    fn record() -> Record {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        RecordDraft {
            kind: Kind::TEXT_NOTE,
            tags: vec![],
            content: "hello".into(),
            created_at: 1,
        }
        .sign(&SecretKey::generate(&mut rng))
    }

    #[test]
    fn test_client_req_frame() {
        let msg = ClientMessage::Req {
            subscription_id: SubscriptionId::new("sub1"),
            filters: vec![Filter::new().kind(Kind::METADATA), Filter::new().limit(1)],
        };
        let json = msg.to_json();
        assert_eq!(json, r#"["REQ","sub1",{"kinds":[0]},{"limit":1}]"#);
        assert_eq!(ClientMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_client_event_and_close() {
        let msg = ClientMessage::Event(record());
        assert_eq!(ClientMessage::from_json(&msg.to_json()).unwrap(), msg);

        let close = ClientMessage::Close(SubscriptionId::new("x"));
        assert_eq!(close.to_json(), r#"["CLOSE","x"]"#);
    }

    #[test]
    fn test_relay_messages() {
        let record = record();
        let event = format!(r#"["EVENT","sub1",{}]"#, serde_json::to_string(&record).unwrap());
        assert_eq!(
            RelayMessage::from_json(&event).unwrap(),
            RelayMessage::Event {
                subscription_id: SubscriptionId::new("sub1"),
                record: Box::new(record.clone()),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap(),
            RelayMessage::Eose(SubscriptionId::new("sub1"))
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","sub1"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: SubscriptionId::new("sub1"),
                message: String::new(),
            }
        );
        let ok = RelayMessage::Ok {
            id: record.id,
            accepted: false,
            message: "blocked: spam".into(),
        };
        assert_eq!(RelayMessage::from_json(&ok.to_json()).unwrap(), ok);
        assert_eq!(
            RelayMessage::Notice("hi".into()).to_json(),
            r#"["NOTICE","hi"]"#
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            RelayMessage::from_json("{}"),
            Err(MessageError::NotAnArray { .. })
        ));
        assert!(matches!(
            RelayMessage::from_json("[]"),
            Err(MessageError::MissingLabel { .. })
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["AUTH","challenge"]"#),
            Err(MessageError::UnknownLabel { .. })
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["EOSE"]"#),
            Err(MessageError::MissingField { .. })
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["EVENT","s",{"id":1}]"#),
            Err(MessageError::InvalidField { .. })
        ));
        assert!(matches!(
            ClientMessage::from_json("not json"),
            Err(MessageError::Json { .. })
        ));
    }
}
