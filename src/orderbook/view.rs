//! Snapshot-consistent sorted views
//!
//! A view captures one side's version counter together with a sorted key
//! list, so iteration stays cheap and the sort never runs under the book's
//! write gate.

use rust_decimal::Decimal;

use super::{BookEntry, InMemoryOrderbook, PriceRoundKey, Side};
use crate::error::{MirrorError, Result};

/// Materialization retries before falling back to a locked copy
const MAX_ENFORCE_RETRIES: usize = 8;

/// Lazy sorted projection over one side of a book
///
/// Created by [`InMemoryOrderbook::views`]; materialized on demand. The view
/// borrows the book and must not outlive the dispatch that produced it.
#[derive(Debug)]
pub struct SortedView<'a> {
    book: &'a InMemoryOrderbook,
    side: Side,
    captured_version: Option<u64>,
    keys: Option<Vec<PriceRoundKey>>,
}

impl<'a> SortedView<'a> {
    pub(crate) fn new(book: &'a InMemoryOrderbook, side: Side) -> Self {
        Self {
            book,
            side,
            captured_version: None,
            keys: None,
        }
    }

    /// Side this view projects
    pub fn side(&self) -> Side {
        self.side
    }

    /// Version captured at the last materialization
    pub fn captured_version(&self) -> Option<u64> {
        self.captured_version
    }

    fn collect_keys(&self) -> Vec<PriceRoundKey> {
        let mut keys: Vec<PriceRoundKey> = self
            .book
            .levels(self.side)
            .iter()
            .filter(|entry| entry.quantity > Decimal::ZERO)
            .map(|entry| *entry.key())
            .collect();
        match self.side {
            Side::Ask => keys.sort_unstable(),
            Side::Bid => keys.sort_unstable_by(|a, b| b.cmp(a)),
        }
        keys
    }

    /// Copy and sort the side's keys under the book gate
    pub fn materialize(&mut self) {
        let _guard = self.book.lock_gate();
        let keys = self.collect_keys();
        self.captured_version = Some(self.book.side_version(self.side));
        self.keys = Some(keys);
    }

    /// Materialize until the captured version is stable against writers
    ///
    /// Retries a bounded number of times without taking the write gate, then
    /// falls back to a locked materialization.
    pub fn enforce(&mut self) {
        for _ in 0..MAX_ENFORCE_RETRIES {
            let before = self.book.side_version(self.side);
            let keys = self.collect_keys();
            if self.book.side_version(self.side) == before {
                self.captured_version = Some(before);
                self.keys = Some(keys);
                return;
            }
        }
        self.materialize();
    }

    /// Fail if the side has mutated since this view was materialized
    pub fn check_concurrent_modification(&self) -> Result<()> {
        match self.captured_version {
            Some(version) if version == self.book.side_version(self.side) => Ok(()),
            _ => Err(MirrorError::ConcurrentModification {
                symbol: self.book.symbol().to_string(),
                side: self.side.as_str(),
            }),
        }
    }

    /// Number of levels in the materialized view
    pub fn len(&self) -> usize {
        self.keys.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate entries in view order
    ///
    /// A key removed since materialization yields a zero-quantity placeholder
    /// so consumers see "level vanished mid-view" rather than a hole.
    pub fn iter(&self) -> impl Iterator<Item = BookEntry> + '_ {
        let levels = self.book.levels(self.side);
        self.keys.iter().flatten().map(move |key| {
            levels
                .get(key)
                .map(|entry| entry.clone())
                .unwrap_or_else(|| BookEntry {
                    price: key.to_price(),
                    quantity: Decimal::ZERO,
                    time: crate::now_ms(),
                    update_count: 0,
                    last_update_id: 0,
                })
        })
    }

    /// Collect entries in view order
    pub fn entries(&self) -> Vec<BookEntry> {
        self.iter().collect()
    }

    /// Best level of this side, if any
    pub fn best(&self) -> Option<BookEntry> {
        self.iter().next()
    }
}
