//! Benchmarks for order book operations

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal::Decimal;
use std::str::FromStr;

use bookmirror::parser::{DiffEnvelope, PriceLevel, SnapshotResponse};
use bookmirror::InMemoryOrderbook;

fn create_snapshot(levels: usize) -> SnapshotResponse {
    let bids: Vec<PriceLevel> = (0..levels)
        .map(|i| PriceLevel {
            price: Decimal::from(50_000 - i as i64),
            quantity: Decimal::from_str("1.5").unwrap(),
        })
        .collect();

    let asks: Vec<PriceLevel> = (0..levels)
        .map(|i| PriceLevel {
            price: Decimal::from(50_001 + i as i64),
            quantity: Decimal::from_str("1.5").unwrap(),
        })
        .collect();

    SnapshotResponse {
        last_update_id: 1_000,
        bids,
        asks,
        timestamp: 1_672_531_200_000,
    }
}

fn create_diff(base_id: u64) -> DiffEnvelope {
    DiffEnvelope {
        event_time: 1_672_531_200_000,
        symbol: "BTCUSDT".to_string(),
        first_id: base_id,
        final_id: base_id + 1,
        bid_changes: vec![PriceLevel {
            price: Decimal::from(49_999),
            quantity: Decimal::from_str("2.0").unwrap(),
        }],
        ask_changes: vec![PriceLevel {
            price: Decimal::from(50_001),
            quantity: Decimal::from_str("2.5").unwrap(),
        }],
    }
}

fn benchmark_apply_snapshot(c: &mut Criterion) {
    let snapshot = create_snapshot(100);

    c.bench_function("apply_snapshot_100_levels", |b| {
        b.iter(|| {
            let book = InMemoryOrderbook::new("BTCUSDT");
            book.apply_snapshot(black_box(&snapshot), 1_672_531_200_000);
        })
    });
}

fn benchmark_apply_diff(c: &mut Criterion) {
    let book = InMemoryOrderbook::new("BTCUSDT");
    book.apply_snapshot(&create_snapshot(100), 1_672_531_200_000);

    let diff = create_diff(1_001);

    c.bench_function("apply_diff", |b| {
        b.iter(|| {
            book.apply_diff(black_box(&diff));
        })
    });
}

fn benchmark_sorted_views(c: &mut Criterion) {
    let book = InMemoryOrderbook::new("BTCUSDT");
    book.apply_snapshot(&create_snapshot(100), 1_672_531_200_000);

    c.bench_function("materialize_views", |b| {
        b.iter(|| {
            let (mut bids, mut asks) = book.views();
            bids.enforce();
            asks.enforce();
            black_box((bids.len(), asks.len()));
        })
    });

    let (mut bids, _) = book.views();
    bids.enforce();
    c.bench_function("iterate_view", |b| {
        b.iter(|| {
            black_box(bids.entries().len());
        })
    });
}

criterion_group!(
    benches,
    benchmark_apply_snapshot,
    benchmark_apply_diff,
    benchmark_sorted_views
);
criterion_main!(benches);
