//! Coordinate addressed cache of replaceable records.
//!
//! The [`RecordCache`] keeps the newest known version of every replaceable record it has
//! seen, keyed by [`Coordinate`], and a [`Subject`] per coordinate which emits every
//! accepted version.  Requests for the same coordinate are deduplicated: each relay is
//! queried at most once while a query for the coordinate is in flight there.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    ops::Deref,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use n0_future::{
    StreamExt,
    boxed::BoxStream,
    task::{self, AbortOnDropHandle},
};
use parking_lot::Mutex;
use strudel_base::{Coordinate, Kind, PublicKey, Record, RelayUrl, SubscriptionId};
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    lazy_map::KeyedLazyMap,
    storage::Storage,
    subject::Subject,
    transport::{RelayResponse, RelayTransport},
};

type Slot = Arc<Mutex<Option<Record>>>;

/// Options for [`RecordCache::request_record`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Keep the relay queries open after the first accepted record.
    ///
    /// Without this a query is closed once the relay sent all stored records, or once any
    /// relay delivered an accepted version.
    pub keep_alive: bool,
}

impl RequestOptions {
    /// Options for a query which stays open.
    pub fn keep_alive() -> Self {
        Self { keep_alive: true }
    }
}

/// Cache of replaceable records with deduplicated relay requests.
///
/// Must be used from within a tokio runtime, relay queries run as tasks.
///
/// Cloning returns a handle to the same cache.
#[derive(Debug, Clone)]
pub struct RecordCache {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn RelayTransport>,
    storage: Option<Arc<dyn Storage>>,
    records: KeyedLazyMap<Coordinate, Slot>,
    subjects: KeyedLazyMap<Coordinate, Subject<Option<Record>>>,
    requests: Mutex<HashMap<Coordinate, Pending>>,
    next_query: AtomicU64,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("transport", &self.transport)
            .field("storage", &self.storage)
            .field("records", &self.records)
            .field("requests", &self.requests.lock().len())
            .finish_non_exhaustive()
    }
}

/// Bookkeeping of the requests for one coordinate.
#[derive(Debug, Default)]
struct Pending {
    /// Number of live [`RecordRequest`]s.
    interest: usize,
    queries: BTreeMap<RelayUrl, Query>,
}

struct Query {
    id: u64,
    keep_alive: bool,
    _task: AbortOnDropHandle<()>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl RecordCache {
    /// Creates a cache querying relays through `transport`.
    ///
    /// With `storage`, accepted records are written through to it and a coordinate's
    /// stored record is loaded the first time the coordinate is accessed.
    pub fn new(transport: Arc<dyn RelayTransport>, storage: Option<Arc<dyn Storage>>) -> Self {
        let records = {
            let storage = storage.clone();
            KeyedLazyMap::new(move |coordinate: &Coordinate| {
                let stored = storage.as_ref().and_then(|storage| {
                    storage.get_record(coordinate).unwrap_or_else(|err| {
                        warn!(%coordinate, "failed to load stored record: {err:#}");
                        None
                    })
                });
                Arc::new(Mutex::new(stored))
            })
        };
        let subjects = {
            let records = records.clone();
            KeyedLazyMap::new(move |coordinate: &Coordinate| {
                let slot: Slot = records.get(coordinate);
                let initial = slot.lock().clone();
                Subject::new(initial)
            })
        };
        Self {
            inner: Arc::new(Inner {
                transport,
                storage,
                records,
                subjects,
                requests: Default::default(),
                next_query: AtomicU64::new(0),
            }),
        }
    }

    /// Requests the record at `(kind, owner, tag)` from `relays`.
    ///
    /// Relays which already run a query for this coordinate are not queried again.  A
    /// keep-alive request upgrades a running one-shot query on the same relay.  The
    /// returned handle holds interest in the coordinate; once every handle is dropped the
    /// queries are closed.  The cached record and the subject survive.
    ///
    /// For kinds which are not parameterized replaceable `tag` is ignored.
    pub fn request_record(
        &self,
        relays: &[RelayUrl],
        kind: Kind,
        owner: PublicKey,
        tag: &str,
        options: RequestOptions,
    ) -> RecordRequest {
        let tag = if kind.is_parameterized_replaceable() {
            tag
        } else {
            ""
        };
        let coordinate = Coordinate::new(kind, owner, tag);
        let subject = self.subject(&coordinate);
        let mut requests = self.inner.requests.lock();
        let pending = requests.entry(coordinate.clone()).or_default();
        pending.interest += 1;
        for relay in relays {
            if let Some(query) = pending.queries.get(relay) {
                if query.keep_alive || !options.keep_alive {
                    trace!(%coordinate, %relay, "query already in flight");
                    continue;
                }
            }
            // Replacing a one-shot query aborts its task.
            let query = self.inner.start_query(&coordinate, relay, options.keep_alive);
            pending.queries.insert(relay.clone(), query);
        }
        drop(requests);
        RecordRequest {
            inner: self.inner.clone(),
            coordinate,
            subject,
        }
    }

    /// Offers a record to the cache.
    ///
    /// The record is accepted if its kind is addressable and it is newer than the cached
    /// version of its coordinate, see [`Record::supersedes`].  An accepted record replaces
    /// the cached one and is emitted on the coordinate's subject.  Returns whether the
    /// record was accepted.
    ///
    /// The record is not verified.
    pub fn handle_record(&self, record: Record) -> bool {
        self.inner.handle_record(record)
    }

    /// The cached record at `coordinate`.
    pub fn cached(&self, coordinate: &Coordinate) -> Option<Record> {
        self.inner.records.get(coordinate).lock().clone()
    }

    /// The subject emitting the versions of the record at `coordinate`.
    pub fn subject(&self, coordinate: &Coordinate) -> Subject<Option<Record>> {
        self.inner.subjects.get(coordinate)
    }

    /// Relays with a running query for `coordinate`.
    pub fn in_flight(&self, coordinate: &Coordinate) -> Vec<RelayUrl> {
        self.inner
            .requests
            .lock()
            .get(coordinate)
            .map(|pending| pending.queries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live [`RecordRequest`]s for `coordinate`.
    pub fn interest(&self, coordinate: &Coordinate) -> usize {
        self.inner
            .requests
            .lock()
            .get(coordinate)
            .map_or(0, |pending| pending.interest)
    }
}

impl Inner {
    fn handle_record(&self, record: Record) -> bool {
        let Some(coordinate) = record.coordinate() else {
            debug!(kind = %record.kind, "dropping record which is not replaceable");
            return false;
        };
        let subject = self.subjects.get(&coordinate);
        let slot = self.records.get(&coordinate);
        let accepted = subject.update(|_| {
            let mut slot = slot.lock();
            if slot.as_ref().is_some_and(|cached| !record.supersedes(cached)) {
                return None;
            }
            *slot = Some(record.clone());
            Some(Some(record.clone()))
        });
        if !accepted {
            trace!(%coordinate, id = %record.id.fmt_short(), "record is not newer than the cached one");
            return false;
        }
        debug!(
            %coordinate,
            id = %record.id.fmt_short(),
            created_at = record.created_at,
            "accepted record"
        );
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.put_record(&record) {
                warn!(%coordinate, "failed to persist record: {err:#}");
            }
        }
        true
    }

    fn start_query(self: &Arc<Self>, coordinate: &Coordinate, relay: &RelayUrl, keep_alive: bool) -> Query {
        let id = self.next_query.fetch_add(1, Ordering::Relaxed);
        let subscription_id = SubscriptionId::new(format!("replaceable-{id}"));
        let filter = coordinate.filter().limit(1);
        let span = error_span!("query", %relay, sub = %subscription_id);
        span.in_scope(|| debug!(%coordinate, keep_alive, "opening query"));
        let stream = self
            .transport
            .request(relay, subscription_id, vec![filter]);
        let task = task::spawn(
            run_query(
                Arc::downgrade(self),
                coordinate.clone(),
                relay.clone(),
                id,
                keep_alive,
                stream,
            )
            .instrument(span),
        );
        Query {
            id,
            keep_alive,
            _task: AbortOnDropHandle::new(task),
        }
    }

    /// Closes all one-shot queries for `coordinate`.
    fn close_one_shot(&self, coordinate: &Coordinate) {
        if let Some(pending) = self.requests.lock().get_mut(coordinate) {
            pending.queries.retain(|_, query| query.keep_alive);
        }
    }

    /// Forgets the query `id` on `relay` once it ended by itself.
    fn finish_query(&self, coordinate: &Coordinate, relay: &RelayUrl, id: u64) {
        let mut requests = self.requests.lock();
        let Some(pending) = requests.get_mut(coordinate) else {
            return;
        };
        if pending.queries.get(relay).is_some_and(|query| query.id == id) {
            pending.queries.remove(relay);
        }
    }

    fn release(&self, coordinate: &Coordinate) {
        let mut requests = self.requests.lock();
        let Some(pending) = requests.get_mut(coordinate) else {
            return;
        };
        pending.interest = pending.interest.saturating_sub(1);
        if pending.interest == 0 {
            if let Some(pending) = requests.remove(coordinate) {
                debug!(%coordinate, queries = pending.queries.len(), "no interest left, closing queries");
            }
        }
    }
}

async fn run_query(
    inner: Weak<Inner>,
    coordinate: Coordinate,
    relay: RelayUrl,
    id: u64,
    keep_alive: bool,
    mut stream: BoxStream<RelayResponse>,
) {
    while let Some(response) = stream.next().await {
        let Some(cache) = inner.upgrade() else {
            return;
        };
        match response {
            RelayResponse::Record(record) => {
                if let Err(err) = record.verify() {
                    warn!("dropping invalid record: {err:#}");
                    continue;
                }
                if record.coordinate().as_ref() != Some(&coordinate) {
                    warn!(id = %record.id.fmt_short(), "dropping record for another coordinate");
                    continue;
                }
                if cache.handle_record(*record) && !keep_alive {
                    debug!("record accepted, closing one-shot queries");
                    // This drops our own task handle as well.
                    cache.close_one_shot(&coordinate);
                    return;
                }
            }
            RelayResponse::EndOfStored => {
                if !keep_alive {
                    debug!("end of stored records");
                    break;
                }
                trace!("end of stored records");
            }
            RelayResponse::Closed(message) => {
                debug!(%message, "closed by relay");
                break;
            }
        }
    }
    if let Some(cache) = inner.upgrade() {
        cache.finish_query(&coordinate, &relay, id);
    }
}

/// Interest in one coordinate, returned by [`RecordCache::request_record`].
///
/// Dereferences to the coordinate's subject.  Dropping the last request for a coordinate
/// closes its relay queries.
#[derive(Debug)]
pub struct RecordRequest {
    inner: Arc<Inner>,
    coordinate: Coordinate,
    subject: Subject<Option<Record>>,
}

impl RecordRequest {
    /// The requested coordinate.
    pub fn coordinate(&self) -> &Coordinate {
        &self.coordinate
    }

    /// The subject emitting the versions of the requested record.
    pub fn subject(&self) -> &Subject<Option<Record>> {
        &self.subject
    }
}

impl Deref for RecordRequest {
    type Target = Subject<Option<Record>>;

    fn deref(&self) -> &Self::Target {
        &self.subject
    }
}

impl Drop for RecordRequest {
    fn drop(&mut self) {
        self.inner.release(&self.coordinate);
    }
}
