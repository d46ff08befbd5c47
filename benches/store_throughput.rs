use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use eventcore::{Event, EventStore, EventStoreConfig, EventType, MemoryEventStore};
use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};
use serde_json::{json, Value};

const AGGREGATE_ID: &str = "bench-aggregate";
const APPEND_PAYLOAD_SIZES: &[usize] = &[256, 1024, 4096];
const SEED_EVENT_COUNT: u64 = 512;

fn build_payload(rng: &mut StdRng, size: usize) -> Value {
    let description: String = rng
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect();
    json!({ "description": description, "status": "created" })
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    for &size in APPEND_PAYLOAD_SIZES {
        let mut rng = StdRng::seed_from_u64(42);
        let payload = build_payload(&mut rng, size);
        let store = MemoryEventStore::new(EventStoreConfig::default());
        let mut version = 0u64;
        group.bench_with_input(BenchmarkId::new("memory", size), &payload, |b, payload| {
            b.iter(|| {
                version += 1;
                let event = Event::builder(AGGREGATE_ID, "order", EventType::Update)
                    .version(version)
                    .data(payload.clone())
                    .build(store.id_generator());
                store.save_event(event).expect("append failed");
                black_box(version);
            });
        });
    }
    group.finish();
}

fn bench_range_read(c: &mut Criterion) {
    let store = MemoryEventStore::new(EventStoreConfig::default());
    let mut rng = StdRng::seed_from_u64(7);
    for version in 1..=SEED_EVENT_COUNT {
        let event = Event::builder(AGGREGATE_ID, "order", EventType::Update)
            .version(version)
            .data(build_payload(&mut rng, 256))
            .build(store.id_generator());
        store.save_event(event).expect("seeding failed");
    }

    let mut group = c.benchmark_group("read");
    group.bench_function("range_128", |b| {
        b.iter(|| {
            let events = store.get_events(AGGREGATE_ID, 200, 327).expect("read failed");
            black_box(events.len());
        });
    });
    group.bench_function("by_type_capped", |b| {
        b.iter(|| {
            let events = store
                .get_events_by_type(&EventType::Update, 128)
                .expect("read failed");
            black_box(events.len());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_append, bench_range_read);
criterion_main!(benches);
