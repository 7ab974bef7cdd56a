use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use retrojsvice::png;
use retrojsvice::task_queue::TaskQueue;
use std::sync::Arc;
use std::time::Duration;

fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(1));
    group.sample_size(20);
}

fn synthetic_frame(width: usize, height: usize) -> Vec<u8> {
    let mut data = vec![0u8; width * height * 4];
    for (i, px) in data.chunks_mut(4).enumerate() {
        px[0] = (i % 251) as u8;
        px[1] = ((i / 7) % 251) as u8;
        px[2] = ((i / 13) % 251) as u8;
        px[3] = 0xff;
    }
    data
}

fn benchmark_png_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("png_compress");
    configure_fast_group(&mut group);

    for &(width, height) in &[(320usize, 240usize), (1024, 768)] {
        let frame = synthetic_frame(width, height);
        group.bench_with_input(BenchmarkId::new("single_thread", format!("{}x{}", width, height)), &frame, |b, frame| {
            b.iter(|| {
                let bands = png::compress(black_box(frame), width, height, width, 1);
                black_box(bands);
            });
        });
        group.bench_with_input(BenchmarkId::new("multi_thread", format!("{}x{}", width, height)), &frame, |b, frame| {
            b.iter(|| {
                let bands = png::compress(black_box(frame), width, height, width, num_cpus::get());
                black_box(bands);
            });
        });
    }

    group.finish();
}

fn benchmark_task_queue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue");
    configure_fast_group(&mut group);

    group.bench_function("post_and_drain_1000", |b| {
        b.iter(|| {
            let queue = TaskQueue::new();
            for _ in 0..1000 {
                let q: Arc<TaskQueue> = Arc::clone(&queue);
                queue.post(move || {
                    black_box(&q);
                });
            }
            queue.run_tasks();
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_png_compress, benchmark_task_queue_throughput);
criterion_main!(benches);
