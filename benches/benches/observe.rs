// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::cell::Cell;
use std::rc::Rc;

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use understory_observe::{ObserveConfig, Observatory, PropagationMode, PropertyKey};

const SUBJECT: u32 = 0;

#[derive(Clone)]
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u32(&mut self) -> u32 {
        // Numerical Recipes LCG parameters.
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        (self.0 >> 32) as u32
    }

    fn gen_range_usize(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive == 0 {
            return 0;
        }
        (self.next_u32() as usize) % upper_exclusive
    }
}

fn key(index: usize) -> PropertyKey {
    PropertyKey::from(format!("k{index}"))
}

/// Builds `n` keys on one subject where key `i` depends on up to
/// `edges_per_key` lower keys, with every key observed by a counter.
fn build_observed_dag(
    n: usize,
    edges_per_key: usize,
    seed: u64,
    mode: PropagationMode,
) -> (Observatory<u32>, Rc<Cell<u64>>) {
    let mut obs = Observatory::with_config(ObserveConfig::new().mode(mode));
    let mut rng = Lcg::new(seed);

    for dependent in 1..n {
        for _ in 0..edges_per_key.min(dependent) {
            let source = rng.gen_range_usize(dependent);
            obs.add_dependency(SUBJECT, key(dependent), key(source));
        }
    }

    let hits = Rc::new(Cell::new(0_u64));
    for index in 0..n {
        let hits = hits.clone();
        obs.observe(SUBJECT, key(index), move |_, _| hits.set(hits.get() + 1));
    }
    (obs, hits)
}

fn bench_observe(c: &mut Criterion) {
    let mut group = c.benchmark_group("understory_observe");
    group.sample_size(50);

    for &(n, edges_per_key) in &[(256_usize, 1_usize), (256, 4), (2_048, 1), (2_048, 4)] {
        group.bench_function(format!("sync_notify_root(n={n},e={edges_per_key})"), |b| {
            b.iter_batched(
                || {
                    build_observed_dag(
                        n,
                        edges_per_key,
                        0x0B5E_0000_0000_0001,
                        PropagationMode::Legacy,
                    )
                },
                |(mut obs, hits)| {
                    obs.notify_property_change(SUBJECT, key(0));
                    black_box(hits.get());
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_function(
            format!("transaction_notify_all(n={n},e={edges_per_key})"),
            |b| {
                b.iter_batched(
                    || {
                        build_observed_dag(
                            n,
                            edges_per_key,
                            0x0B5E_0000_0000_0002,
                            PropagationMode::Legacy,
                        )
                    },
                    |(mut obs, hits)| {
                        obs.change_properties(|obs| {
                            for index in 0..n {
                                obs.notify_property_change(SUBJECT, key(index));
                            }
                        });
                        black_box(hits.get());
                    },
                    BatchSize::LargeInput,
                );
            },
        );

        group.bench_function(
            format!("tracked_flush_root(n={n},e={edges_per_key})"),
            |b| {
                b.iter_batched(
                    || {
                        build_observed_dag(
                            n,
                            edges_per_key,
                            0x0B5E_0000_0000_0003,
                            PropagationMode::Tracked,
                        )
                    },
                    |(mut obs, hits)| {
                        obs.notify_property_change(SUBJECT, key(0));
                        black_box(hits.get());
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }

    // A path chain of `depth` hops; subject `i` holds subject `i + 1` under `next`.
    for &depth in &[2_u32, 8, 32] {
        group.bench_function(format!("chain_leaf_change(depth={depth})"), |b| {
            b.iter_batched(
                || {
                    let mut obs = Observatory::<u32>::new();
                    obs.set_path_resolver(move |subject: u32, key: &PropertyKey| {
                        (key == "next" && subject < depth).then_some(subject + 1)
                    });
                    let mut path = "next.".repeat(depth as usize);
                    path.push_str("value");
                    let hits = Rc::new(Cell::new(0_u64));
                    let h = hits.clone();
                    obs.observe(0, path, move |_, _| h.set(h.get() + 1));
                    (obs, hits)
                },
                |(mut obs, hits)| {
                    obs.notify_property_change(depth, "value");
                    black_box(hits.get());
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_observe);
criterion_main!(benches);
