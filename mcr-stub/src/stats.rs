//! # Stub Counters
//!
//! Atomic counters the tests read to observe client behavior from the
//! server side: how many sockets were accepted and how many requests of each
//! verb arrived.
//!
//! `Ordering::Relaxed` is enough; tests read counters after the client call
//! that produced them has returned.

use std::sync::atomic::{AtomicU64, Ordering};

use mcr_common::Verb;

const VERBS: usize = Verb::ALL.len();

/// Snapshot of the stub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubStats {
    /// TCP connections accepted since start.
    pub connections_accepted: u64,
    /// Connections currently open.
    pub connections_open: u64,
    per_verb: [u64; VERBS],
}

impl StubStats {
    /// Requests received for `verb`.
    pub fn requests(&self, verb: Verb) -> u64 {
        self.per_verb[verb_index(verb)]
    }

    /// Requests received across all verbs.
    pub fn requests_total(&self) -> u64 {
        self.per_verb.iter().sum()
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    accepted: AtomicU64,
    open: AtomicU64,
    per_verb: [AtomicU64; VERBS],
}

impl Counters {
    pub(crate) fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, verb: Verb) {
        self.per_verb[verb_index(verb)].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StubStats {
        let mut per_verb = [0u64; VERBS];
        for (slot, counter) in per_verb.iter_mut().zip(&self.per_verb) {
            *slot = counter.load(Ordering::Relaxed);
        }
        StubStats {
            connections_accepted: self.accepted.load(Ordering::Relaxed),
            connections_open: self.open.load(Ordering::Relaxed),
            per_verb,
        }
    }
}

fn verb_index(verb: Verb) -> usize {
    Verb::ALL
        .iter()
        .position(|candidate| *candidate == verb)
        .unwrap_or(0)
}
