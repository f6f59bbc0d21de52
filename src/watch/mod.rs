//! Fan-out of a single change feed to many subscribers.
//!
//! Every watcher in the process shares one upstream source (the poll loop over the revision
//! log). The [`Broadcaster`] starts that source lazily when the first subscriber arrives and
//! stops it when the last one leaves:
//!
//! ```text
//!   idle --subscribe--> streaming --last unsubscribe / source ends--> idle
//! ```
//!
//! Publishing never blocks on a subscriber. Each subscriber has a bounded queue; one that falls
//! a full queue behind is dropped and its stream ends, so it can re-list and re-watch instead of
//! stalling everyone else.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

struct Feed {
    generation: u64,
    cancel: CancellationToken,
}

struct State<T> {
    subscribers: HashMap<u64, mpsc::Sender<T>>,
    next_id: u64,
    next_generation: u64,
    feed: Option<Feed>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Serializes source start-up so two first subscribers cannot both start a feed.
    start_lock: tokio::sync::Mutex<()>,
    capacity: usize,
}

impl<T> Shared<T> {
    fn register(&self, state: &mut State<T>) -> (u64, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, tx);
        (id, rx)
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock();
        if state.subscribers.remove(&id).is_some() {
            debug!("Subscriber {} removed", id);
        }
        stop_if_idle(&mut state);
    }

    fn publish(&self, item: T)
    where
        T: Clone,
    {
        let mut state = self.state.lock();
        let mut gone = Vec::new();
        for (id, tx) in state.subscribers.iter() {
            match tx.try_send(item.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Dropping slow subscriber {}: queue full", id);
                    gone.push(*id);
                }
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            state.subscribers.remove(&id);
        }
        stop_if_idle(&mut state);
    }

    /// Called when the source of feed `generation` ends on its own.
    fn source_ended(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.feed.as_ref().map(|f| f.generation) == Some(generation) {
            info!("Change feed source ended; closing {} subscriber(s)", state.subscribers.len());
            state.subscribers.clear();
            if let Some(feed) = state.feed.take() {
                feed.cancel.cancel();
            }
        }
    }
}

fn stop_if_idle<T>(state: &mut State<T>) {
    if state.subscribers.is_empty() {
        if let Some(feed) = state.feed.take() {
            debug!("No subscribers left; stopping change feed {}", feed.generation);
            feed.cancel.cancel();
        }
    }
}

/// A lazily started, shared change feed.
pub struct Broadcaster<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    subscribers: HashMap::new(),
                    next_id: 1,
                    next_generation: 1,
                    feed: None,
                }),
                start_lock: tokio::sync::Mutex::new(()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Registers a subscriber, starting the source with `start` if the feed is idle.
    ///
    /// `start` receives a token that is cancelled when the feed stops; the source should stop
    /// producing once it fires. If `start` fails, no subscriber is registered and the feed stays
    /// idle.
    pub async fn subscribe<F, Fut, E>(&self, start: F) -> Result<Subscription<T>, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<mpsc::Receiver<T>, E>>,
    {
        let _starting = self.shared.start_lock.lock().await;

        {
            let mut state = self.shared.state.lock();
            if state.feed.is_some() {
                let (id, rx) = self.shared.register(&mut state);
                return Ok(self.subscription(id, rx));
            }
        }

        let cancel = CancellationToken::new();
        let source = start(cancel.clone()).await?;

        let (generation, id, rx) = {
            let mut state = self.shared.state.lock();
            let generation = state.next_generation;
            state.next_generation += 1;
            state.feed = Some(Feed {
                generation,
                cancel: cancel.clone(),
            });
            let (id, rx) = self.shared.register(&mut state);
            (generation, id, rx)
        };

        info!("Change feed {} started", generation);
        tokio::spawn(pump(Arc::clone(&self.shared), source, cancel, generation));
        Ok(self.subscription(id, rx))
    }

    fn subscription(&self, id: u64, rx: mpsc::Receiver<T>) -> Subscription<T> {
        Subscription {
            id,
            rx,
            shared: Arc::clone(&self.shared),
            active: true,
        }
    }

    /// Whether `id` is still registered; false once unsubscribed or dropped as slow.
    pub fn is_subscribed(&self, id: u64) -> bool {
        self.shared.state.lock().subscribers.contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    /// Whether an upstream source is currently running.
    pub fn is_streaming(&self) -> bool {
        self.shared.state.lock().feed.is_some()
    }
}

async fn pump<T: Clone>(
    shared: Arc<Shared<T>>,
    mut source: mpsc::Receiver<T>,
    cancel: CancellationToken,
    generation: u64,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = source.recv() => match item {
                Some(item) => shared.publish(item),
                None => {
                    shared.source_ended(generation);
                    break;
                }
            },
        }
    }
    debug!("Change feed {} stopped", generation);
}

/// One subscriber's view of the feed. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared<T>>,
    active: bool,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next item, or `None` once this subscriber was dropped, unsubscribed or the feed ended.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Leaves the feed. Calling it more than once is a no-op.
    pub fn unsubscribe(&mut self) {
        if std::mem::take(&mut self.active) {
            self.shared.unsubscribe(self.id);
            self.rx.close();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
