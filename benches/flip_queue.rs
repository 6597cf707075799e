use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use scanout::flip::FlipQueue;

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("FlipQueue::enqueue", |b| {
        let queue = FlipQueue::new("bench-flip").unwrap();
        b.iter(|| queue.enqueue(|| {}))
    });
    c.bench_function("FlipQueue::enqueue backlog 4", |b| {
        let queue = FlipQueue::with_backlog("bench-flip-4", 4).unwrap();
        let payload = Arc::new([0u8; 64]);
        b.iter(|| {
            let payload = payload.clone();
            queue.enqueue(move || drop(payload))
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
