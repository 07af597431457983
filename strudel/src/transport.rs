//! Talking to relays.
//!
//! The [`RelayTransport`] trait is how the client reaches relays.  Socket handling,
//! reconnects and timeouts are the business of the implementation; the client only sees a
//! stream of [`RelayResponse`]s per subscription.  [`MemRelays`] is an in-process relay set.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use n0_future::{
    StreamExt,
    boxed::{BoxFuture, BoxStream},
    stream,
};
use nested_enum_utils::common_fields;
use parking_lot::Mutex;
use snafu::{Backtrace, Snafu};
use strudel_base::{Filter, Record, RelayMessage, RelayUrl, SubscriptionId};
use tokio::sync::broadcast;
use tracing::trace;

/// A relay's answer within one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayResponse {
    /// A matching record.
    Record(Box<Record>),
    /// All stored matches have been sent, following records are new.
    EndOfStored,
    /// The relay ended the subscription.
    Closed(String),
}

impl RelayResponse {
    /// Extracts the response for `subscription_id` from a decoded relay message.
    ///
    /// Messages for other subscriptions, `OK` and `NOTICE` return `None`.
    pub fn from_message(message: RelayMessage, subscription_id: &SubscriptionId) -> Option<Self> {
        match message {
            RelayMessage::Event {
                subscription_id: id,
                record,
            } if id == *subscription_id => Some(Self::Record(record)),
            RelayMessage::Eose(id) if id == *subscription_id => Some(Self::EndOfStored),
            RelayMessage::Closed {
                subscription_id: id,
                message,
            } if id == *subscription_id => Some(Self::Closed(message)),
            _ => None,
        }
    }
}

/// Errors when publishing a record.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum PublishError {
    #[snafu(display("unknown relay {relay}"))]
    UnknownRelay { relay: RelayUrl },
    #[snafu(display("{relay} rejected the record: {message}"))]
    Rejected { relay: RelayUrl, message: String },
}

/// Access to relays.
pub trait RelayTransport: fmt::Debug + Send + Sync + 'static {
    /// Opens a subscription on `relay`.
    ///
    /// This sends `REQ` with the filters.  Dropping the returned stream sends `CLOSE`.  The
    /// stream ends when the relay closes the subscription or the connection is lost.
    fn request(
        &self,
        relay: &RelayUrl,
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    ) -> BoxStream<RelayResponse>;

    /// Sends a record to `relay` and waits for its `OK`.
    fn publish(&self, relay: &RelayUrl, record: Record) -> BoxFuture<Result<(), PublishError>>;
}

impl<T: RelayTransport> RelayTransport for Arc<T> {
    fn request(
        &self,
        relay: &RelayUrl,
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    ) -> BoxStream<RelayResponse> {
        self.as_ref().request(relay, subscription_id, filters)
    }

    fn publish(&self, relay: &RelayUrl, record: Record) -> BoxFuture<Result<(), PublishError>> {
        self.as_ref().publish(relay, record)
    }
}

/// A set of relays living in this process.
///
/// Relays store records like real relays do: only the latest version of a replaceable
/// record is kept.  Unknown relays close every subscription immediately.  A relay marked
/// silent accepts subscriptions but never answers, like an unreachable relay.
#[derive(Debug, Clone, Default)]
pub struct MemRelays {
    relays: Arc<Mutex<BTreeMap<RelayUrl, MemRelay>>>,
}

#[derive(Debug)]
struct MemRelay {
    records: Vec<Record>,
    live: broadcast::Sender<Record>,
    silent: bool,
    requests: usize,
    open: Arc<AtomicUsize>,
}

impl MemRelay {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            live: broadcast::channel(64).0,
            silent: false,
            requests: 0,
            open: Default::default(),
        }
    }

    fn insert(&mut self, record: Record) {
        if self.records.iter().any(|r| r.id == record.id) {
            return;
        }
        if let Some(coordinate) = record.coordinate() {
            if self
                .records
                .iter()
                .any(|r| r.coordinate().as_ref() == Some(&coordinate) && !record.supersedes(r))
            {
                return;
            }
            self.records
                .retain(|r| r.coordinate().as_ref() != Some(&coordinate));
        }
        self.records.push(record.clone());
        self.live.send(record).ok();
    }

    fn stored(&self, filters: &[Filter]) -> Vec<Record> {
        let mut ids = BTreeSet::new();
        let mut out = Vec::new();
        for filter in filters {
            let mut matches: Vec<_> = self.records.iter().filter(|r| filter.matches(r)).collect();
            matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let limit = filter.limit.unwrap_or(usize::MAX);
            for record in matches.into_iter().take(limit) {
                if ids.insert(record.id) {
                    out.push(record.clone());
                }
            }
        }
        out
    }
}

/// Counts a subscription as open while alive.
#[derive(Debug)]
struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemRelays {
    /// Creates an empty relay set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a relay set with the given relays.
    pub fn with_relays(relays: impl IntoIterator<Item = RelayUrl>) -> Self {
        let this = Self::new();
        for relay in relays {
            this.add_relay(relay);
        }
        this
    }

    /// Adds an empty relay, existing relays are kept as they are.
    pub fn add_relay(&self, relay: RelayUrl) {
        self.relays.lock().entry(relay).or_insert_with(MemRelay::new);
    }

    /// Makes `relay` ignore all subscriptions.
    pub fn set_silent(&self, relay: &RelayUrl, silent: bool) {
        if let Some(relay) = self.relays.lock().get_mut(relay) {
            relay.silent = silent;
        }
    }

    /// Stores `record` on `relay` and sends it to matching live subscriptions.
    ///
    /// Unlike [`RelayTransport::publish`] the record is not verified.
    pub fn insert(&self, relay: &RelayUrl, record: Record) {
        let mut relays = self.relays.lock();
        let relay = relays.entry(relay.clone()).or_insert_with(MemRelay::new);
        relay.insert(record);
    }

    /// Records stored on `relay`.
    pub fn records(&self, relay: &RelayUrl) -> Vec<Record> {
        self.relays
            .lock()
            .get(relay)
            .map(|r| r.records.clone())
            .unwrap_or_default()
    }

    /// Number of subscriptions ever opened on `relay`.
    pub fn request_count(&self, relay: &RelayUrl) -> usize {
        self.relays.lock().get(relay).map_or(0, |r| r.requests)
    }

    /// Number of subscriptions currently open on `relay`.
    pub fn open_subscriptions(&self, relay: &RelayUrl) -> usize {
        self.relays
            .lock()
            .get(relay)
            .map_or(0, |r| r.open.load(Ordering::SeqCst))
    }
}

impl RelayTransport for MemRelays {
    fn request(
        &self,
        url: &RelayUrl,
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    ) -> BoxStream<RelayResponse> {
        let mut relays = self.relays.lock();
        let Some(relay) = relays.get_mut(url) else {
            return stream::once(RelayResponse::Closed("unknown relay".to_string())).boxed();
        };
        relay.requests += 1;
        trace!(relay = %url, %subscription_id, "subscription opened");
        let guard = OpenGuard::new(&relay.open);
        if relay.silent {
            return stream::unfold(guard, |guard| async move {
                let _guard = guard;
                std::future::pending::<Option<(RelayResponse, OpenGuard)>>().await
            })
            .boxed();
        }
        let stored = relay.stored(&filters);
        let rx = relay.live.subscribe();
        let live = stream::unfold((rx, filters, guard), |(mut rx, filters, guard)| async move {
            loop {
                match rx.recv().await {
                    Ok(record) if filters.iter().any(|f| f.matches(&record)) => {
                        let response = RelayResponse::Record(Box::new(record));
                        return Some((response, (rx, filters, guard)));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        stream::iter(
            stored
                .into_iter()
                .map(|record| RelayResponse::Record(Box::new(record))),
        )
        .chain(stream::once(RelayResponse::EndOfStored))
        .chain(live)
        .boxed()
    }

    fn publish(&self, url: &RelayUrl, record: Record) -> BoxFuture<Result<(), PublishError>> {
        let res = match record.verify() {
            Err(err) => RejectedSnafu {
                relay: url.clone(),
                message: format!("invalid: {err}"),
            }
            .fail(),
            Ok(()) => match self.relays.lock().get_mut(url) {
                Some(relay) => {
                    relay.insert(record);
                    Ok(())
                }
                None => UnknownRelaySnafu { relay: url.clone() }.fail(),
            },
        };
        Box::pin(std::future::ready(res))
    }
}
