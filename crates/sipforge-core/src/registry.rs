//! Table of in-flight walks.
//!
//! A rule registers its walk when it starts applying and deregisters it when the
//! walk terminates. All access goes through one lock.

use crate::cancel::CancellationToken;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct RegisteredWalk {
    rule_id: String,
    token: CancellationToken,
}

/// Process-wide table from walk id to cancellation handle and owning rule.
#[derive(Debug, Default)]
pub struct WalkerRegistry {
    walks: Mutex<HashMap<String, RegisteredWalk>>,
    id_counter: AtomicU64,
}

impl WalkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a walk and return its id.
    pub fn register(&self, rule_id: &str, token: CancellationToken) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let walk_id = format!("walk_{}", n);
        let mut walks = self.walks.lock().expect("walker registry lock poisoned");
        walks.insert(
            walk_id.clone(),
            RegisteredWalk {
                rule_id: rule_id.to_string(),
                token,
            },
        );
        debug!(rule_id, walk_id = %walk_id, "Registered walk");
        walk_id
    }

    /// Remove a terminated walk. Returns `false` if it was already gone.
    pub fn deregister(&self, walk_id: &str) -> bool {
        let mut walks = self.walks.lock().expect("walker registry lock poisoned");
        walks.remove(walk_id).is_some()
    }

    /// Request cancellation of one walk. It stays registered until it terminates.
    pub fn cancel(&self, walk_id: &str) -> bool {
        let walks = self.walks.lock().expect("walker registry lock poisoned");
        match walks.get(walk_id) {
            Some(walk) => {
                walk.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every walk owned by `rule_id`; returns how many were signalled.
    pub fn cancel_rule(&self, rule_id: &str) -> usize {
        let walks = self.walks.lock().expect("walker registry lock poisoned");
        let mut count = 0;
        for walk in walks.values().filter(|w| w.rule_id == rule_id) {
            walk.token.cancel();
            count += 1;
        }
        count
    }

    /// Cancel every registered walk.
    pub fn cancel_all(&self) -> usize {
        let walks = self.walks.lock().expect("walker registry lock poisoned");
        for walk in walks.values() {
            walk.token.cancel();
        }
        if !walks.is_empty() {
            debug!(count = walks.len(), "Cancelled all walks");
        }
        walks.len()
    }

    /// Owning rule of a registered walk.
    pub fn rule_of(&self, walk_id: &str) -> Option<String> {
        let walks = self.walks.lock().expect("walker registry lock poisoned");
        walks.get(walk_id).map(|w| w.rule_id.clone())
    }

    /// `(walk id, rule id)` of every registered walk, sorted by walk id.
    pub fn active(&self) -> Vec<(String, String)> {
        let walks = self.walks.lock().expect("walker registry lock poisoned");
        let mut active: Vec<(String, String)> = walks
            .iter()
            .map(|(id, w)| (id.clone(), w.rule_id.clone()))
            .collect();
        active.sort();
        active
    }

    pub fn len(&self) -> usize {
        self.walks.lock().expect("walker registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
