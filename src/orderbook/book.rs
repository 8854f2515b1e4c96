//! Mirrored order book for a single symbol
//!
//! Level maps allow lock-free point reads; compound operations (diff
//! application, snapshot reconciliation, expiry, statistics reset) serialize
//! on a per-book gate. Side version counters increase on every mutation of
//! that side so sorted views can detect concurrent writers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use super::{BookEntry, PriceRoundKey, Side, SortedView};
use crate::parser::{DiffEnvelope, PriceLevel, SnapshotResponse};

/// Mirrored book for a single symbol
#[derive(Debug)]
pub struct InMemoryOrderbook {
    symbol: String,
    bids: DashMap<PriceRoundKey, BookEntry>,
    asks: DashMap<PriceRoundKey, BookEntry>,
    bids_version: AtomicU64,
    asks_version: AtomicU64,
    last_update_id: AtomicU64,
    /// Gate for compound operations; point reads bypass it
    gate: Mutex<()>,
}

impl InMemoryOrderbook {
    /// Create an empty book
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: DashMap::new(),
            asks: DashMap::new(),
            bids_version: AtomicU64::new(0),
            asks_version: AtomicU64::new(0),
            last_update_id: AtomicU64::new(0),
            gate: Mutex::new(()),
        }
    }

    /// Symbol this book mirrors
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Highest sequence id ever applied
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id.load(Ordering::Acquire)
    }

    /// Current version counter of one side
    pub fn side_version(&self, side: Side) -> u64 {
        match side {
            Side::Bid => self.bids_version.load(Ordering::Acquire),
            Side::Ask => self.asks_version.load(Ordering::Acquire),
        }
    }

    /// Check whether both sides are empty
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Number of levels per side (bids, asks)
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    pub(crate) fn levels(&self, side: Side) -> &DashMap<PriceRoundKey, BookEntry> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    pub(crate) fn lock_gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    /// Apply an incremental diff
    ///
    /// Returns `true` when the diff was gapped, i.e. `first_id` does not
    /// continue the applied sequence or the book was empty. A gapped diff is
    /// still applied; the caller decides whether to schedule a repair.
    pub fn apply_diff(&self, diff: &DiffEnvelope) -> bool {
        let _guard = self.gate.lock();

        let last = self.last_update_id.load(Ordering::Acquire);
        let gapped = diff.first_id > last + 1 || self.is_empty();

        let mut bids_touched = false;
        for level in &diff.bid_changes {
            bids_touched |= Self::apply_level(&self.bids, level, diff.event_time, diff.final_id);
        }
        let mut asks_touched = false;
        for level in &diff.ask_changes {
            asks_touched |= Self::apply_level(&self.asks, level, diff.event_time, diff.final_id);
        }

        if bids_touched {
            self.bids_version.fetch_add(1, Ordering::AcqRel);
        }
        if asks_touched {
            self.asks_version.fetch_add(1, Ordering::AcqRel);
        }
        self.last_update_id
            .store(last.max(diff.final_id), Ordering::Release);

        gapped
    }

    /// Apply a single level replacement; returns whether the side mutated
    fn apply_level(
        map: &DashMap<PriceRoundKey, BookEntry>,
        level: &PriceLevel,
        event_time: u64,
        update_id: u64,
    ) -> bool {
        let key = PriceRoundKey::from_price(level.price);
        if level.quantity.is_zero() {
            return map.remove(&key).is_some();
        }
        match map.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.quantity = level.quantity;
                entry.time = event_time;
                entry.update_count += 1;
                entry.last_update_id = update_id;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(BookEntry {
                    price: level.price,
                    quantity: level.quantity,
                    time: event_time,
                    update_count: 1,
                    last_update_id: update_id,
                });
            }
        }
        true
    }

    /// Reconcile against an authoritative snapshot
    ///
    /// Levels older than the snapshot and absent from it are dropped, then
    /// snapshot levels are written over the remainder. The snapshot's
    /// `last_update_id` becomes the book's, even when lower than the current
    /// one: the snapshot is authoritative at fetch time.
    pub fn apply_snapshot(&self, snapshot: &SnapshotResponse, now: u64) {
        let _guard = self.gate.lock();

        let snap_id = snapshot.last_update_id;
        Self::reconcile_side(&self.bids, &snapshot.bids, snap_id, now);
        Self::reconcile_side(&self.asks, &snapshot.asks, snap_id, now);

        self.last_update_id.store(snap_id, Ordering::Release);
        self.bids_version.fetch_add(1, Ordering::AcqRel);
        self.asks_version.fetch_add(1, Ordering::AcqRel);
    }

    fn reconcile_side(
        map: &DashMap<PriceRoundKey, BookEntry>,
        levels: &[PriceLevel],
        snap_id: u64,
        now: u64,
    ) {
        let snapshot_keys: HashSet<PriceRoundKey> = levels
            .iter()
            .filter(|l| !l.quantity.is_zero())
            .map(|l| PriceRoundKey::from_price(l.price))
            .collect();

        map.retain(|key, entry| entry.last_update_id >= snap_id || snapshot_keys.contains(key));

        for level in levels {
            let key = PriceRoundKey::from_price(level.price);
            if level.quantity.is_zero() {
                map.remove(&key);
                continue;
            }
            match map.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.quantity = level.quantity;
                    entry.time = now;
                    entry.update_count += 1;
                    entry.last_update_id = snap_id;
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(BookEntry {
                        price: level.price,
                        quantity: level.quantity,
                        time: now,
                        update_count: 1,
                        last_update_id: snap_id,
                    });
                }
            }
        }
    }

    /// Remove entries last touched before `cutoff` (milliseconds)
    pub fn drop_older_than(&self, cutoff: u64) {
        let _guard = self.gate.lock();

        let before = self.bids.len();
        self.bids.retain(|_, entry| entry.time >= cutoff);
        if self.bids.len() != before {
            self.bids_version.fetch_add(1, Ordering::AcqRel);
        }

        let before = self.asks.len();
        self.asks.retain(|_, entry| entry.time >= cutoff);
        if self.asks.len() != before {
            self.asks_version.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Zero per-level update counters without touching quantities or versions
    pub fn reset_statistics(&self) {
        let _guard = self.gate.lock();
        for mut entry in self.bids.iter_mut() {
            entry.update_count = 0;
        }
        for mut entry in self.asks.iter_mut() {
            entry.update_count = 0;
        }
    }

    /// Sorted views over both sides (bids descending, asks ascending)
    pub fn views(&self) -> (SortedView<'_>, SortedView<'_>) {
        (
            SortedView::new(self, Side::Bid),
            SortedView::new(self, Side::Ask),
        )
    }
}
