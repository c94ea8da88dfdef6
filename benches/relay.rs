use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use weakrelay::{EventSet, EventSource, Handler, Multicast, Relay, RelayRegistry};

struct Ticker {
    ticked: Multicast<u64>,
}

impl EventSource for Ticker {
    fn describe_events(events: &mut EventSet<Self>) {
        events.field("ticked", |t| &t.ticked);
    }
}

#[derive(Default)]
struct Counter {
    total: AtomicU64,
}

impl Counter {
    fn on_tick(&self, n: &u64) {
        self.total.fetch_add(*n, Ordering::Relaxed);
    }
}

fn relay_with_subscribers(registry: &RelayRegistry, n: usize) -> (Arc<Ticker>, Relay, Vec<Arc<Counter>>) {
    let ticker = Arc::new(Ticker {
        ticked: Multicast::new(),
    });
    let relay = registry.register_weak_event(&ticker, "ticked").unwrap();
    relay.use_trampoline().unwrap();
    let counters: Vec<Arc<Counter>> = (0..n).map(|_| Arc::new(Counter::default())).collect();
    for counter in &counters {
        relay.add(&Handler::method(counter, Counter::on_tick)).unwrap();
    }
    (ticker, relay, counters)
}

fn bench_raise_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("raise_fanout");
    for n in [1_usize, 16, 256] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let registry = RelayRegistry::default();
            let (ticker, _relay, _counters) = relay_with_subscribers(&registry, n);
            b.iter(|| ticker.ticked.emit(black_box(&1)).unwrap());
        });
    }
    group.finish();
}

fn bench_add_remove(c: &mut Criterion) {
    c.bench_function("relay/add_remove", |b| {
        b.iter_custom(|iters| {
            // Fresh relay per sample so the table does not grow across samples.
            let registry = RelayRegistry::default();
            let (_ticker, relay, _counters) = relay_with_subscribers(&registry, 64);
            let extra = Arc::new(Counter::default());
            let handler = Handler::method(&extra, Counter::on_tick);

            let start = Instant::now();
            for _ in 0..iters {
                relay.add(black_box(&handler)).unwrap();
                relay.remove(black_box(&handler)).unwrap();
            }
            start.elapsed()
        });
    });
}

fn bench_prune_dropped(c: &mut Criterion) {
    c.bench_function("relay/prune_dropped_subscribers", |b| {
        b.iter_custom(|iters| {
            let registry = RelayRegistry::default();
            let mut elapsed = std::time::Duration::ZERO;
            for _ in 0..iters {
                let (ticker, _relay, counters) = relay_with_subscribers(&registry, 32);
                drop(counters);
                let start = Instant::now();
                ticker.ticked.emit(&1).unwrap();
                elapsed += start.elapsed();
            }
            elapsed
        });
    });
}

criterion_group!(relay, bench_raise_fanout, bench_add_remove, bench_prune_dropped);
criterion_main!(relay);
