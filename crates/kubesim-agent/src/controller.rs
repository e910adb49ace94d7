//! Watch-backed event controllers for nodes and pods
//!
//! A controller turns a kube watch stream into typed `Added`/`Updated`/
//! `Deleted` events on a bounded channel. The watch only reports applied
//! objects, so the controller caches the last object per key to tell adds
//! from updates, drop no-op resyncs and reconcile relists.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubesim_common::{Error, Result};

/// What happened to an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOp {
    /// First sighting of the object
    Added,
    /// The object changed
    Updated,
    /// The object is gone or going away
    Deleted,
}

/// A classified change to a watched object
#[derive(Clone, Debug)]
pub struct WatchEvent<K> {
    /// Latest known state of the object
    pub object: K,
    /// Classification of the change
    pub op: EventOp,
}

/// Node change event
pub type NodeEvent = WatchEvent<Node>;
/// Pod change event
pub type PodEvent = WatchEvent<Pod>;

/// Per-kind filtering rules
pub trait WatchedResource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
    /// Kind name used in logs and errors
    const KIND: &'static str;

    /// Objects that are not relevant produce no events at all
    fn is_relevant(&self) -> bool {
        true
    }

    /// Terminating objects are reported as deleted
    fn is_terminating(&self) -> bool {
        false
    }
}

impl WatchedResource for Node {
    const KIND: &'static str = "Node";
}

impl WatchedResource for Pod {
    const KIND: &'static str = "Pod";

    // Unscheduled pods belong to no node
    fn is_relevant(&self) -> bool {
        self.spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .is_some_and(|n| !n.is_empty())
    }

    fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

fn object_key<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

struct CachedObject<K> {
    object: K,
    // A Deleted event was already emitted for this key
    terminating: bool,
}

/// Classifies raw watch events against a cache of known objects
pub(crate) struct EventFilter<K> {
    known: HashMap<String, CachedObject<K>>,
    relisted: Option<HashSet<String>>,
}

impl<K: WatchedResource> EventFilter<K> {
    pub(crate) fn new() -> Self {
        Self {
            known: HashMap::new(),
            relisted: None,
        }
    }

    /// Fold one watch event into the cache, returning what to emit
    pub(crate) fn apply(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent<K>> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                self.applied(obj).into_iter().collect()
            }
            watcher::Event::InitDone => self.finish_relist(),
            watcher::Event::Delete(obj) => self.deleted(obj).into_iter().collect(),
        }
    }

    fn applied(&mut self, obj: K) -> Option<WatchEvent<K>> {
        if !obj.is_relevant() {
            return None;
        }
        let key = object_key(&obj);
        if let Some(seen) = self.relisted.as_mut() {
            seen.insert(key.clone());
        }

        let already_reported = self.known.get(&key).is_some_and(|c| c.terminating);
        let previous_version = self
            .known
            .get(&key)
            .map(|c| c.object.resource_version());
        let terminating = obj.is_terminating();
        self.known.insert(
            key,
            CachedObject {
                object: obj.clone(),
                terminating: terminating || already_reported,
            },
        );

        // Deletion was already reported; status churn until the final delete is noise
        if already_reported {
            return None;
        }
        let op = match previous_version {
            _ if terminating => EventOp::Deleted,
            Some(rv) if rv == obj.resource_version() => return None,
            Some(_) => EventOp::Updated,
            None => EventOp::Added,
        };
        Some(WatchEvent { object: obj, op })
    }

    fn deleted(&mut self, obj: K) -> Option<WatchEvent<K>> {
        match self.known.remove(&object_key(&obj)) {
            Some(prev) if prev.terminating => None,
            Some(_) => Some(WatchEvent {
                object: obj,
                op: EventOp::Deleted,
            }),
            None if obj.is_relevant() => Some(WatchEvent {
                object: obj,
                op: EventOp::Deleted,
            }),
            None => None,
        }
    }

    // Objects cached before the relist but missing from it were deleted while
    // the watch was down
    fn finish_relist(&mut self) -> Vec<WatchEvent<K>> {
        let Some(seen) = self.relisted.take() else {
            return Vec::new();
        };
        let vanished: Vec<String> = self
            .known
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();

        vanished
            .into_iter()
            .filter_map(|key| self.known.remove(&key))
            .filter(|cached| !cached.terminating)
            .map(|cached| WatchEvent {
                object: cached.object,
                op: EventOp::Deleted,
            })
            .collect()
    }
}

/// Streams classified events for one resource kind
pub struct EventController<K: WatchedResource> {
    tx: mpsc::Sender<WatchEvent<K>>,
    filter: EventFilter<K>,
}

impl<K: WatchedResource> EventController<K> {
    /// Create a controller and the receiving end of its event channel
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<WatchEvent<K>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                filter: EventFilter::new(),
            },
            rx,
        )
    }

    /// Watch `api` until cancelled or the watch stream fails
    ///
    /// Always returns an error: `Cancelled` on shutdown, `Watch` when the
    /// stream ends or the receiver is dropped.
    pub async fn run(self, api: Api<K>, cancel: CancellationToken) -> Result<()> {
        info!(kind = K::KIND, "starting watch");
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        self.run_stream(stream, cancel).await
    }

    pub(crate) async fn run_stream<S>(mut self, stream: S, cancel: CancellationToken) -> Result<()>
    where
        S: Stream<Item = std::result::Result<watcher::Event<K>, watcher::Error>>,
    {
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(kind = K::KIND, "watch cancelled");
                    return Err(Error::cancelled(K::KIND));
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        for ev in self.filter.apply(event) {
                            self.send(ev, &cancel).await?;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(kind = K::KIND, error = %e, "watch error, backing off");
                    }
                    None => return Err(Error::watch(K::KIND, "watch stream ended")),
                },
            }
        }
    }

    async fn send(&self, event: WatchEvent<K>, cancel: &CancellationToken) -> Result<()> {
        debug!(
            kind = K::KIND,
            object = %object_key(&event.object),
            op = ?event.op,
            "emitting event"
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::cancelled(K::KIND)),
            sent = self.tx.send(event) => {
                sent.map_err(|_| Error::watch(K::KIND, "event receiver dropped"))
            }
        }
    }
}
