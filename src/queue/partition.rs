// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One partition of a write-behind queue.
//!
//! Plain data structure, no locking or I/O: the queue wraps each partition
//! in a mutex and keeps every critical section free of awaits.
//!
//! A key has at most one slot. The slot holds the latest pending entry and,
//! while a worker is persisting it, the sequence that was handed out. A key
//! that is in flight is never handed out again until it is acknowledged,
//! released or dead-lettered.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::change_event::{ChangeEvent, PendingEntry};

#[derive(Debug)]
struct Slot {
    entry: PendingEntry,
    /// Enqueue order of the key's first pending event (for drop-oldest)
    order: u64,
    /// Sequence handed to a worker and not yet settled
    in_flight: Option<u64>,
    /// Present in the ready deque
    queued: bool,
    /// Earliest time the entry may be handed out again
    retry_at: Option<Instant>,
}

/// Result of looking at an event before it is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Prepared {
    /// Sequence not newer than what is pending
    Stale,
    /// First pending event for the key
    New(PendingEntry),
    /// Replaces the pending entry (last-write-wins)
    Replace(PendingEntry),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Applied {
    Inserted,
    Coalesced,
    Stale,
    /// The slot was settled after `prepare` and the caller holds no room
    /// for a new key; the entry is handed back uncommitted.
    Vacated(PendingEntry),
}

/// What settling an in-flight sequence did to the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    /// Slot removed; the key is clean
    Removed,
    /// A newer event arrived meanwhile and is ready again
    Requeued,
    /// No slot for the key
    Unknown,
}

#[derive(Debug, Default)]
pub(crate) struct Partition {
    slots: HashMap<String, Slot>,
    ready: VecDeque<String>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.values().filter(|s| s.in_flight.is_some()).count()
    }

    pub fn contains(&self, cache_key: &str) -> bool {
        self.slots.contains_key(cache_key)
    }

    pub fn prepare(&self, event: ChangeEvent) -> Prepared {
        match self.slots.get(&event.cache_key) {
            Some(slot) if event.sequence <= slot.entry.sequence() => Prepared::Stale,
            Some(slot) => Prepared::Replace(PendingEntry {
                cache_key: slot.entry.cache_key.clone(),
                latest: event,
                enqueued_at: slot.entry.enqueued_at,
                attempt_count: 0,
            }),
            None => Prepared::New(PendingEntry::new(event)),
        }
    }

    /// Make `entry` visible. `order` is used only when the key is new, and a
    /// new key is only inserted when the caller `reserved` room for it.
    pub fn commit(&mut self, entry: PendingEntry, order: u64, reserved: bool) -> Applied {
        if let Some(slot) = self.slots.get_mut(&entry.cache_key) {
            if entry.sequence() <= slot.entry.sequence() {
                return Applied::Stale;
            }
            slot.entry.latest = entry.latest;
            slot.entry.attempt_count = 0;
            slot.retry_at = None;
            if slot.in_flight.is_none() && !slot.queued {
                slot.queued = true;
                self.ready.push_back(entry.cache_key);
            }
            return Applied::Coalesced;
        }

        if !reserved {
            return Applied::Vacated(entry);
        }
        self.insert(entry, order);
        Applied::Inserted
    }

    /// Insert a recovered entry. Newer pending state wins.
    pub fn restore(&mut self, entry: PendingEntry, order: u64) -> bool {
        let existing = self.slots.get(&entry.cache_key).map(|s| s.entry.sequence());
        match existing {
            Some(seq) if seq >= entry.sequence() => false,
            Some(_) => {
                self.commit(entry, order, true);
                true
            }
            None => {
                self.insert(entry, order);
                true
            }
        }
    }

    fn insert(&mut self, entry: PendingEntry, order: u64) {
        let key = entry.cache_key.clone();
        self.slots.insert(
            key.clone(),
            Slot {
                entry,
                order,
                in_flight: None,
                queued: true,
                retry_at: None,
            },
        );
        self.ready.push_back(key);
    }

    /// Hand out up to `max` ready entries, marking them in flight. Entries
    /// still backing off are skipped.
    pub fn take_ready(&mut self, max: usize, now: Instant) -> Vec<PendingEntry> {
        let mut out = Vec::new();
        let mut deferred = Vec::new();

        while out.len() < max {
            let Some(key) = self.ready.pop_front() else { break };
            let Some(slot) = self.slots.get_mut(&key) else { continue };
            slot.queued = false;
            if slot.in_flight.is_some() {
                continue;
            }
            if slot.retry_at.is_some_and(|at| at > now) {
                slot.queued = true;
                deferred.push(key);
                continue;
            }
            slot.retry_at = None;
            slot.in_flight = Some(slot.entry.sequence());
            out.push(slot.entry.clone());
        }

        self.ready.extend(deferred);
        out
    }

    /// Settle `sequence` for `cache_key` as done (persisted or dead-lettered).
    pub fn settle(&mut self, cache_key: &str, sequence: u64) -> Settled {
        let Some(slot) = self.slots.get_mut(cache_key) else {
            return Settled::Unknown;
        };
        if slot.entry.sequence() <= sequence {
            self.slots.remove(cache_key);
            return Settled::Removed;
        }
        if slot.in_flight == Some(sequence) {
            slot.in_flight = None;
        }
        if slot.in_flight.is_none() && !slot.queued {
            slot.queued = true;
            self.ready.push_back(cache_key.to_string());
        }
        Settled::Requeued
    }

    /// Count a failed attempt. `None` if a newer event superseded `sequence`.
    pub fn record_failure(&mut self, cache_key: &str, sequence: u64) -> Option<u32> {
        let slot = self.slots.get_mut(cache_key)?;
        if slot.entry.sequence() != sequence {
            return None;
        }
        slot.entry.attempt_count = slot.entry.attempt_count.saturating_add(1);
        Some(slot.entry.attempt_count)
    }

    /// Return an in-flight key to the ready deque, optionally not before `retry_at`.
    pub fn release(&mut self, cache_key: &str, sequence: u64, retry_at: Option<Instant>) -> bool {
        let Some(slot) = self.slots.get_mut(cache_key) else { return false };
        if slot.in_flight != Some(sequence) {
            return false;
        }
        slot.in_flight = None;
        // A superseding event is persisted right away
        slot.retry_at = if slot.entry.sequence() == sequence { retry_at } else { None };
        if !slot.queued {
            slot.queued = true;
            self.ready.push_back(cache_key.to_string());
        }
        true
    }

    /// Oldest slot that is not in flight, by enqueue order.
    pub fn oldest_evictable(&self) -> Option<(u64, &str)> {
        self.slots
            .iter()
            .filter(|(_, s)| s.in_flight.is_none())
            .map(|(k, s)| (s.order, k.as_str()))
            .min()
    }

    pub fn evict(&mut self, cache_key: &str) -> Option<PendingEntry> {
        let evictable = self
            .slots
            .get(cache_key)
            .is_some_and(|s| s.in_flight.is_none());
        if !evictable {
            return None;
        }
        self.slots.remove(cache_key).map(|s| s.entry)
    }
}
