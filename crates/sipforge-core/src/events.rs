//! Notifications emitted by rules and export batches.
//!
//! Every rule and every export batch owns a [`Subscribers`] list. Callbacks run
//! synchronously on the emitting worker thread; async consumers can take a
//! channel instead with [`Subscribers::subscribe_channel`].

use crate::walker::WalkProgress;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Handle returned by [`Subscribers::subscribe`], used to unsubscribe.
pub type SubscriptionId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Sink<E> {
    Callback(Callback<E>),
    Channel(mpsc::UnboundedSender<E>),
}

impl<E> Clone for Sink<E> {
    fn clone(&self) -> Self {
        match self {
            Sink::Callback(cb) => Sink::Callback(Arc::clone(cb)),
            Sink::Channel(tx) => Sink::Channel(tx.clone()),
        }
    }
}

/// Subscriber list for one event source.
pub struct Subscribers<E> {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(SubscriptionId, Sink<E>)>>,
}

impl<E> std::fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sinks: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, sink: Sink<E>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut sinks = self.sinks.lock().expect("subscribers lock poisoned");
        sinks.push((id, sink));
        id
    }

    /// Register a callback invoked for every event.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(Sink::Callback(Arc::new(callback)))
    }

    /// Receive events on an unbounded channel. Dropping the receiver unsubscribes.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(Sink::Channel(tx));
        rx
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut sinks = self.sinks.lock().expect("subscribers lock poisoned");
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        sinks.len() != before
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().expect("subscribers lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone> Subscribers<E> {
    /// Deliver `event` to every subscriber.
    ///
    /// The list is snapshotted first, so callbacks may subscribe or unsubscribe.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<(SubscriptionId, Sink<E>)> = {
            let sinks = self.sinks.lock().expect("subscribers lock poisoned");
            sinks.clone()
        };

        let mut closed = Vec::new();
        for (id, sink) in snapshot {
            match sink {
                Sink::Callback(cb) => cb(event),
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut sinks = self.sinks.lock().expect("subscribers lock poisoned");
            sinks.retain(|(id, _)| !closed.contains(id));
        }
    }
}

/// What happened to a rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleEventKind {
    /// The walk was spawned.
    Started,
    Progress(WalkProgress),
    /// The walk finished; previews are now visible.
    Applied {
        sip_count: usize,
        /// Traversal and metadata resolution errors, one line each.
        errors: Vec<String>,
    },
    /// The walk was cancelled; no previews survive.
    Cancelled,
    /// The worker failed as a whole.
    Error { message: String },
    Removing,
    /// Previews flagged removed, either by rule removal or one at a time.
    SipsRemoved { sip_ids: Vec<String> },
    Removed,
}

impl RuleEventKind {
    /// Terminal outcome of an apply.
    pub fn is_walk_terminal(&self) -> bool {
        matches!(
            self,
            RuleEventKind::Applied { .. } | RuleEventKind::Cancelled | RuleEventKind::Error { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleEvent {
    pub rule_id: String,
    #[serde(flatten)]
    pub kind: RuleEventKind,
}

/// A SIP that could not be packaged, with its error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSip {
    pub sip_id: String,
    pub error: String,
}

/// What happened during an export batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportEventKind {
    SipStarted {
        sip_id: String,
        index: usize,
        total: usize,
    },
    /// Payload files added so far for the current SIP.
    RepresentationProgress {
        sip_id: String,
        processed: usize,
        total: usize,
    },
    /// Archive entries written so far for the current SIP.
    PackagingProgress {
        sip_id: String,
        current: usize,
        total: usize,
    },
    SipDone { sip_id: String, output: PathBuf },
    SipFailed(FailedSip),
    BatchDone {
        created: usize,
        failed: Vec<FailedSip>,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportEvent {
    pub batch_id: String,
    #[serde(flatten)]
    pub kind: ExportEventKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let subs: Subscribers<u32> = Subscribers::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        let id = subs.subscribe(move |v| {
            seen_cb.fetch_add(*v as usize, Ordering::SeqCst);
        });

        subs.emit(&2);
        assert!(subs.unsubscribe(id));
        subs.emit(&5);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(!subs.unsubscribe(id));
        assert!(subs.is_empty());
    }

    #[test]
    fn test_channel_receives_in_order() {
        let subs: Subscribers<u32> = Subscribers::new();
        let mut rx = subs.subscribe_channel();
        subs.emit(&1);
        subs.emit(&2);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_dropped_channel_is_pruned() {
        let subs: Subscribers<u32> = Subscribers::new();
        let rx = subs.subscribe_channel();
        drop(rx);
        subs.emit(&1);
        assert_eq!(subs.len(), 0);
    }

    #[test]
    fn test_rule_event_serializes_flat() {
        let event = RuleEvent {
            rule_id: "rule_1".to_string(),
            kind: RuleEventKind::Applied {
                sip_count: 3,
                errors: vec![],
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["rule_id"], "rule_1");
        assert_eq!(json["type"], "applied");
        assert_eq!(json["sip_count"], 3);
    }
}
