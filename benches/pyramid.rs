use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array3;
use tessmap::pyramid::{Resampling, mean_pool_2x2, resize_u8};

fn bench_resize(c: &mut Criterion) {
    let mut group = c.benchmark_group("resize_u8");
    group.sample_size(10);

    let image = Array3::from_shape_fn((1024, 1024, 3), |(y, x, b)| ((x * 7 + y * 3 + b * 50) % 256) as u8);
    for resampling in [Resampling::Nearest, Resampling::Lanczos] {
        group.bench_function(resampling.as_str(), |b| {
            b.iter(|| resize_u8(black_box(image.view()), 512, 512, resampling).unwrap())
        });
    }
    group.finish();
}

fn bench_mean_pool(c: &mut Criterion) {
    let data = Array3::from_shape_fn((512, 512, 64), |(y, x, b)| (y + x + b) as f32 * 0.01);
    c.bench_function("mean_pool_2x2_512x512x64", |b| b.iter(|| mean_pool_2x2(black_box(data.view()))));
}

criterion_group!(benches, bench_resize, bench_mean_pool);
criterion_main!(benches);
