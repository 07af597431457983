//! Base types and utilities for strudel
#![cfg_attr(strudel_docsrs, feature(doc_auto_cfg))]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod coordinate;
pub mod filter;
pub mod key;
pub mod message;
pub mod record;
mod relay_url;

pub use self::{
    coordinate::{Coordinate, CoordinateError},
    filter::{Filter, TagKey},
    key::{KeyParsingError, PublicKey, SecretKey, Signature, SignatureError},
    message::{ClientMessage, MessageError, RelayMessage, SubscriptionId},
    record::{Kind, Record, RecordDraft, RecordError, RecordId, Tag},
    relay_url::{RelayUrl, RelayUrlParseError},
};
