//! Relay query filters.
//!
//! A [`Filter`] selects records on a relay. All set fields must match; within a field any
//! listed value may match. Tag filters are keyed by a single letter and serialized as
//! `"#e"`, `"#p"`, `"#d"`, ... on the wire.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{Deserialize, Serialize, de};

use crate::{
    key::PublicKey,
    record::{Kind, Record, RecordId},
};

/// The key of a tag filter, a single ascii letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagKey(char);

impl TagKey {
    /// Event references.
    pub const E: TagKey = TagKey('e');
    /// Coordinate references.
    pub const A: TagKey = TagKey('a');
    /// Pubkey references.
    pub const P: TagKey = TagKey('p');
    /// Identifiers of parameterized replaceable records.
    pub const D: TagKey = TagKey('d');
    /// Hashtags.
    pub const T: TagKey = TagKey('t');
    /// Geohashes.
    pub const G: TagKey = TagKey('g');

    /// Creates a key, returns `None` unless `c` is an ascii letter.
    pub fn new(c: char) -> Option<Self> {
        c.is_ascii_alphabetic().then_some(Self(c))
    }

    /// The tag name this key matches.
    pub fn as_char(&self) -> char {
        self.0
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Serialize for TagKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TagKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some('#'), Some(c), None) => {
                TagKey::new(c).ok_or_else(|| de::Error::custom(format!("invalid tag filter {s}")))
            }
            _ => Err(de::Error::custom(format!("unknown filter field {s}"))),
        }
    }
}

/// A relay query filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Record ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<RecordId>>,
    /// Record authors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<PublicKey>>,
    /// Record kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<Kind>>,
    /// Tag filters.
    #[serde(flatten)]
    pub tags: BTreeMap<TagKey, BTreeSet<String>>,
    /// Only records created at or after this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Only records created at or before this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    /// Maximum number of stored records to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Full text search, for relays that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Filter {
    /// An empty filter, matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record id.
    pub fn id(mut self, id: RecordId) -> Self {
        self.ids.get_or_insert_with(Default::default).insert(id);
        self
    }

    /// Adds an author.
    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors
            .get_or_insert_with(Default::default)
            .insert(author);
        self
    }

    /// Adds a kind.
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.get_or_insert_with(Default::default).insert(kind);
        self
    }

    /// Adds a tag filter value.
    pub fn tag(mut self, key: TagKey, value: impl Into<String>) -> Self {
        self.tags.entry(key).or_default().insert(value.into());
        self
    }

    /// Adds a `#d` value.
    pub fn identifier(self, tag: impl Into<String>) -> Self {
        self.tag(TagKey::D, tag)
    }

    /// Sets the lower time bound.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the upper time bound.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Sets the limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the search string.
    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Whether `record` matches this filter.
    ///
    /// `limit` and `search` are relay side concerns and are ignored here.
    pub fn matches(&self, record: &Record) -> bool {
        fn contains<T: Ord>(set: &Option<BTreeSet<T>>, value: &T) -> bool {
            set.as_ref().is_none_or(|set| set.contains(value))
        }

        contains(&self.ids, &record.id)
            && contains(&self.authors, &record.pubkey)
            && contains(&self.kinds, &record.kind)
            && self.since.is_none_or(|since| record.created_at >= since)
            && self.until.is_none_or(|until| record.created_at <= until)
            && self.tags.iter().all(|(key, values)| {
                record.tags.iter().any(|tag| {
                    let mut name = tag.name().unwrap_or_default().chars();
                    name.next() == Some(key.as_char())
                        && name.next().is_none()
                        && tag.value().is_some_and(|v| values.contains(v))
                })
            })
    }
}
