use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessmap::geo::GeoTransform;
use tessmap::search::{ExactIndex, IvfPqIndex, SearchQuery, SimilaritySearch, kmeans};

const DIM: usize = 128;

// 有聚类结构的嵌入：每个像素在某个中心附近加少量噪声
fn generate_embeddings(n: usize, num_clusters: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(42);
    let centers = (0..num_clusters * DIM).map(|_| rng.random_range(-1.0..1.0)).collect::<Vec<f32>>();
    let mut data = vec![0f32; n * DIM];
    for i in 0..n {
        let c = &centers[(i % num_clusters) * DIM..(i % num_clusters + 1) * DIM];
        for j in 0..DIM {
            data[i * DIM + j] = c[j] + rng.random_range(-0.05..0.05);
        }
    }
    data
}

fn transform() -> GeoTransform {
    GeoTransform::north_up(77.5, 13.0, 0.0001, 0.0001)
}

fn bench_exact(c: &mut Criterion) {
    let mut group = c.benchmark_group("exact_search");
    group.sample_size(20);

    for n in [10_000, 100_000] {
        let data = generate_embeddings(n, 64);
        let query = data[..DIM].to_vec();
        let embeddings = Array2::from_shape_vec((n, DIM), data).unwrap();
        let coords = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { (i % 1000) as i32 } else { (i / 1000) as i32 });
        let index = ExactIndex::new(embeddings, coords, transform()).unwrap();
        let q = SearchQuery::new(0.5);

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| index.search(black_box(&query), &q).unwrap())
        });
    }
    group.finish();
}

fn bench_ivfpq(c: &mut Criterion) {
    let mut group = c.benchmark_group("ivfpq_search");
    group.sample_size(20);

    let n = 20_000;
    let data = generate_embeddings(n, 64);
    let coords = (0..n).map(|i| ((i % 200) as i32, (i / 200) as i32)).collect::<Vec<_>>();
    let index = IvfPqIndex::train(&data, DIM, coords, transform(), 10, 42).unwrap();
    let query = data[..DIM].to_vec();

    for nprobe in [1, 8, 32] {
        let q = SearchQuery::new(0.5).nprobe(nprobe);
        group.bench_with_input(BenchmarkId::from_parameter(nprobe), &nprobe, |b, _| {
            b.iter(|| index.search(black_box(&query), &q).unwrap())
        });
    }
    group.finish();
}

fn bench_kmeans(c: &mut Criterion) {
    let data = generate_embeddings(10_000, 100);
    c.bench_function("kmeans_10000x128_k100", |b| {
        b.iter(|| {
            let mut rng = StdRng::seed_from_u64(0);
            kmeans(black_box(&data), DIM, 100, 10, &mut rng)
        })
    });
}

criterion_group!(benches, bench_exact, bench_ivfpq, bench_kmeans);
criterion_main!(benches);
