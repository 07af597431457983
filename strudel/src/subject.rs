//! Reactive subjects.
//!
//! A [`Subject`] holds a value which changes over time and pushes every change to its
//! subscribers.  Unlike a watch channel, subscribers see **every** value passed to
//! [`Subject::next`], in order, and every subscriber synchronously receives the current
//! value when it subscribes.
//!
//! Dispatch is synchronous: [`Subject::next`] returns once every subscriber has been called.
//! Dispatches on the same subject never interleave.  A subscriber may itself call
//! [`Subject::next`] on the subject it observes; the value is queued and dispatched once
//! the current dispatch has reached every subscriber, so all subscribers see values in
//! the order they were passed to [`Subject::next`].

use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use n0_future::Stream;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::mpsc;
use tracing::warn;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Shared<T> {
    /// Serializes dispatch, re-entrant so subscribers can emit.
    dispatch: ReentrantMutex<()>,
    state: Mutex<State<T>>,
    /// The upstream this subject is connected to, see [`Subject::connect`].
    upstream: Mutex<Option<Subscription>>,
}

struct State<T> {
    value: T,
    next_id: u64,
    subscribers: Vec<(u64, Callback<T>)>,
    /// Set while a dispatch loop runs.
    dispatching: bool,
    /// Values emitted by subscribers during a dispatch, in emission order.
    queued: VecDeque<T>,
}

/// Ends a dispatch loop, also when a subscriber panics.
struct DispatchGuard<'a, T> {
    state: &'a Mutex<State<T>>,
}

impl<T> Drop for DispatchGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.dispatching = false;
        state.queued.clear();
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: Send + 'static> Detach for Shared<T> {
    fn detach(&self, id: u64) {
        self.state.lock().subscribers.retain(|(i, _)| *i != id);
    }
}

/// A value which pushes its changes to subscribers.
///
/// Cloning a [`Subject`] returns a handle to the same value.
pub struct Subject<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Default + Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.shared.state.lock().subscribers.len();
        f.debug_struct("Subject")
            .field("subscribers", &subscribers)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Subject<T> {
    /// Creates a subject holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                dispatch: ReentrantMutex::new(()),
                state: Mutex::new(State {
                    value,
                    next_id: 0,
                    subscribers: Vec::new(),
                    dispatching: false,
                    queued: VecDeque::new(),
                }),
                upstream: Mutex::new(None),
            }),
        }
    }

    /// Returns the current value.
    pub fn value(&self) -> T {
        self.shared.state.lock().value.clone()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    /// Registers `callback` for all future values.
    ///
    /// The callback is called with the current value before this returns.  Dropping the
    /// returned [`Subscription`] unregisters it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let _dispatch = self.shared.dispatch.lock();
        let current = self.value();
        callback(&current);
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.push((id, Arc::new(callback)));
            id
        };
        let shared: Arc<dyn Detach> = self.shared.clone();
        Subscription {
            shared: Arc::downgrade(&shared),
            id,
        }
    }

    /// Sets a new value and calls every subscriber with it.
    ///
    /// Subscribers are called in subscription order.  The set of subscribers is fixed when
    /// the dispatch of a value starts: subscribers added or removed by a callback take
    /// effect with the next value.
    ///
    /// Called from a subscriber of this subject, the value is queued and dispatched after
    /// the current value reached every subscriber.
    pub fn next(&self, value: T) {
        let _dispatch = self.shared.dispatch.lock();
        {
            let mut state = self.shared.state.lock();
            if state.dispatching {
                state.queued.push_back(value);
                return;
            }
            state.dispatching = true;
        }
        let _guard = DispatchGuard {
            state: &self.shared.state,
        };
        let mut value = value;
        loop {
            let subscribers = {
                let mut state = self.shared.state.lock();
                state.value = value.clone();
                state
                    .subscribers
                    .iter()
                    .map(|(_, cb)| cb.clone())
                    .collect::<Vec<_>>()
            };
            for callback in subscribers {
                callback(&value);
            }
            match self.shared.state.lock().queued.pop_front() {
                Some(queued) => value = queued,
                None => break,
            }
        }
    }

    /// Computes the next value from the current one and dispatches it.
    ///
    /// `f` returns `None` to keep the current value, in which case nothing is dispatched.
    /// No other dispatch on this subject runs between reading the current value and
    /// dispatching the new one.  Returns whether a value was dispatched.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let _dispatch = self.shared.dispatch.lock();
        let current = self.value();
        match f(&current) {
            Some(value) => {
                self.next(value);
                true
            }
            None => false,
        }
    }

    /// Derives this subject's values from `source`.
    ///
    /// For every value of `source`, including its current one, `transform` decides what to
    /// emit: `Ok(Some(value))` emits, `Ok(None)` skips, and `Err(_)` is logged and skipped.
    /// Skipping leaves the current value untouched.
    ///
    /// A subject has at most one upstream; connecting releases the previous one first.
    pub fn connect<U, F, E>(&self, source: &Subject<U>, transform: F)
    where
        U: Clone + Send + 'static,
        F: Fn(&U) -> Result<Option<T>, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        self.disconnect();
        let this = Arc::downgrade(&self.shared);
        let subscription = source.subscribe(move |value| {
            let Some(shared) = this.upgrade() else {
                return;
            };
            match transform(value) {
                Ok(Some(derived)) => Subject { shared }.next(derived),
                Ok(None) => {}
                Err(err) => warn!(%err, "upstream value rejected"),
            }
        });
        let previous = self.shared.upstream.lock().replace(subscription);
        drop(previous);
    }

    /// Releases the upstream set by [`Subject::connect`], if any.
    pub fn disconnect(&self) {
        let previous = self.shared.upstream.lock().take();
        drop(previous);
    }

    /// Whether this subject is connected to an upstream.
    pub fn is_connected(&self) -> bool {
        self.shared.upstream.lock().is_some()
    }

    /// Returns a stream of values, starting with the current one.
    ///
    /// Values are buffered, a slow reader sees every value in order.
    pub fn updates(&self) -> Updates<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |value| {
            tx.send(value.clone()).ok();
        });
        Updates {
            rx,
            _subscription: subscription,
        }
    }

    /// Waits until the value satisfies `predicate` and returns it.
    ///
    /// Completes immediately if the current value already does.
    pub async fn wait_for<P>(&self, predicate: P) -> T
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = self.subscribe(move |value| {
            if predicate(value) {
                tx.send(value.clone()).ok();
            }
        });
        rx.recv()
            .await
            .expect("subscription keeps the sender alive")
    }
}

/// Keeps a callback registered with a [`Subject`].
///
/// The callback is removed when this is dropped.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    shared: Weak<dyn Detach>,
    id: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.detach(self.id);
        }
    }
}

/// Stream of a [`Subject`]'s values, see [`Subject::updates`].
#[derive(Debug)]
pub struct Updates<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
}

impl<T> Stream for Updates<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use n0_future::StreamExt;

    use super::*;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb = {
            let seen = seen.clone();
            move |v: &T| seen.lock().push(v.clone())
        };
        (seen, cb)
    }

    #[test]
    fn test_subscribe_receives_current() {
        let subject = Subject::new(0);
        subject.next(1);
        subject.next(2);
        let (seen, cb) = recorder();
        let _sub = subject.subscribe(cb);
        assert_eq!(*seen.lock(), vec![2]);
        subject.next(3);
        subject.next(4);
        assert_eq!(*seen.lock(), vec![2, 3, 4]);
        assert_eq!(subject.value(), 4);
    }

    #[test]
    fn test_subscription_order() {
        let subject = Subject::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                subject.subscribe(move |v: &i32| order.lock().push((i, *v)))
            })
            .collect();
        order.lock().clear();
        subject.next(7);
        assert_eq!(*order.lock(), vec![(0, 7), (1, 7), (2, 7)]);
        drop(subs);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let subject = Subject::new("a".to_string());
        let (seen, cb) = recorder();
        let sub = subject.subscribe(cb);
        assert_eq!(subject.subscriber_count(), 1);
        drop(sub);
        assert_eq!(subject.subscriber_count(), 0);
        subject.next("b".to_string());
        assert_eq!(*seen.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_snapshot_during_dispatch() {
        let subject = Subject::new(0);
        let late_calls = Arc::new(AtomicUsize::new(0));
        let late: Arc<Mutex<Vec<Subscription>>> = Default::default();
        let _sub = {
            let subject2 = subject.clone();
            let late_calls = late_calls.clone();
            let late = late.clone();
            subject.subscribe(move |v: &i32| {
                if *v == 1 {
                    let late_calls = late_calls.clone();
                    let sub = subject2.subscribe(move |_| {
                        late_calls.fetch_add(1, Ordering::SeqCst);
                    });
                    late.lock().push(sub);
                }
            })
        };
        subject.next(1);
        // called once on subscribe, not by the in-flight dispatch
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
        subject.next(2);
        assert_eq!(late_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_nested_next() {
        let subject = Subject::new(0);
        let (seen, cb) = recorder();
        let _a = {
            let subject2 = subject.clone();
            subject.subscribe(move |v: &i32| {
                if *v == 1 {
                    subject2.next(2);
                }
            })
        };
        let _b = subject.subscribe(cb);
        subject.next(1);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(subject.value(), 2);
    }

    #[test]
    fn test_nested_next_chain_keeps_order() {
        let subject = Subject::new(0);
        let _emitter = {
            let subject2 = subject.clone();
            subject.subscribe(move |v: &i32| {
                if (1..4).contains(v) {
                    subject2.next(v + 1);
                    subject2.next(v * 10);
                }
            })
        };
        let (seen, cb) = recorder();
        let _b = subject.subscribe(cb);
        let (last, last_cb) = recorder();
        let _c = subject.subscribe(last_cb);
        subject.next(1);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 10, 3, 20, 4, 30]);
        assert_eq!(*last.lock(), *seen.lock());
        assert_eq!(subject.value(), 30);
    }

    #[test]
    fn test_dispatch_recovers_from_panicking_subscriber() {
        let subject = Subject::new(0);
        let sub = subject.subscribe(|v: &i32| {
            if *v == 1 {
                panic!("boom");
            }
        });
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| subject.next(1)));
        assert!(res.is_err());
        drop(sub);
        let (seen, cb) = recorder();
        let _sub = subject.subscribe(cb);
        subject.next(2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_connect_transform() {
        let source = Subject::new(1u32);
        let derived: Subject<String> = Subject::new("none".to_string());
        derived.connect(&source, |v: &u32| -> Result<Option<String>, String> {
            match v {
                0 => Err("zero".to_string()),
                v if v % 2 == 0 => Ok(None),
                v => Ok(Some(format!("odd {v}"))),
            }
        });
        assert_eq!(derived.value(), "odd 1");
        source.next(2);
        assert_eq!(derived.value(), "odd 1");
        source.next(0);
        assert_eq!(derived.value(), "odd 1");
        source.next(3);
        assert_eq!(derived.value(), "odd 3");
    }

    #[test]
    fn test_connect_replaces_upstream() {
        let a = Subject::new(1);
        let b = Subject::new(100);
        let derived = Subject::new(0);
        derived.connect(&a, |v: &i32| Ok::<_, String>(Some(*v)));
        assert_eq!(a.subscriber_count(), 1);
        derived.connect(&b, |v: &i32| Ok::<_, String>(Some(*v)));
        assert_eq!(a.subscriber_count(), 0);
        assert_eq!(b.subscriber_count(), 1);
        assert_eq!(derived.value(), 100);
        a.next(2);
        assert_eq!(derived.value(), 100);
        derived.disconnect();
        assert!(!derived.is_connected());
        assert_eq!(b.subscriber_count(), 0);
    }

    #[test]
    fn test_dropping_downstream_releases_upstream() {
        let source = Subject::new(1);
        let derived = Subject::new(0);
        derived.connect(&source, |v: &i32| Ok::<_, String>(Some(v * 10)));
        assert_eq!(derived.value(), 10);
        drop(derived);
        assert_eq!(source.subscriber_count(), 0);
        source.next(2);
    }

    #[tokio::test]
    async fn test_updates_and_wait_for() {
        let subject = Subject::new(0);
        let mut updates = subject.updates();
        assert_eq!(updates.next().await, Some(0));

        let waiter = {
            let subject = subject.clone();
            tokio::spawn(async move { subject.wait_for(|v| *v >= 2).await })
        };
        tokio::task::yield_now().await;
        subject.next(1);
        subject.next(2);
        assert_eq!(waiter.await.unwrap(), 2);
        assert_eq!(updates.next().await, Some(1));
        assert_eq!(updates.next().await, Some(2));
    }
}
