use log::debug;
use rand::prelude::*;
use rand::seq::index;
use rayon::prelude::*;

use super::l2_sqr;

#[derive(Debug, Clone, Default)]
pub struct KMeansState {
    /// 所有向量到其聚类中心的距离平方和
    pub distsum: f64,
    /// 聚类中心，按行优先展开
    pub centroids: Vec<f32>,
    /// 每个聚类中心包含的向量数量
    pub centroid_frequency: Vec<usize>,
}

impl KMeansState {
    pub fn k(&self) -> usize {
        self.centroid_frequency.len()
    }
}

/// Lloyd K-means 聚类
///
/// `data` 为按行优先展开的 `n x d` 矩阵。聚类中心随机初始化，总距离不再下降时停止。
/// 没有分配到向量的聚类中心保持不变。
pub fn kmeans<R: Rng>(data: &[f32], d: usize, k: usize, max_iter: usize, rng: &mut R) -> KMeansState {
    let n = if d == 0 { 0 } else { data.len() / d };
    let k = k.min(n);
    if k == 0 {
        return KMeansState::default();
    }

    // 随机初始化聚类中心
    let mut centroids = Vec::with_capacity(k * d);
    for i in index::sample(rng, n, k) {
        centroids.extend_from_slice(&data[i * d..(i + 1) * d]);
    }

    let mut distance = f64::MAX;
    let mut centroid_frequency = vec![0; k];

    for iter in 0..max_iter {
        // 分配每个数据点到最近的聚类中心
        let (assignments, new_distance) = update_assignments(data, d, &centroids);

        // 如果距离没有变小，则算法收敛
        if new_distance >= distance {
            debug!("k-means 在第 {iter} 轮收敛");
            break;
        }
        distance = new_distance;

        let (new_centroids, frequency) = update_centroids(data, d, k, &assignments, &centroids);
        centroids = new_centroids;
        centroid_frequency = frequency;
    }

    KMeansState { distsum: distance, centroids, centroid_frequency }
}

/// 将每个点分配给最近的聚类中心，并返回聚类中心的序号和总距离
pub fn update_assignments(data: &[f32], d: usize, centroids: &[f32]) -> (Vec<usize>, f64) {
    let (assignments, distances): (Vec<_>, Vec<_>) =
        data.par_chunks_exact(d).map(|point| nearest(point, centroids, d)).unzip();
    let distance = distances.iter().map(|&d| d as f64).sum();
    (assignments, distance)
}

/// 距离 `point` 最近的聚类中心序号和距离平方
#[inline]
pub fn nearest(point: &[f32], centroids: &[f32], d: usize) -> (usize, f32) {
    let mut min_distance = f32::MAX;
    let mut best_cluster = 0;
    for (j, centroid) in centroids.chunks_exact(d).enumerate() {
        let distance = l2_sqr(point, centroid);
        if distance < min_distance {
            min_distance = distance;
            best_cluster = j;
        }
    }
    (best_cluster, min_distance)
}

fn update_centroids(
    data: &[f32],
    d: usize,
    k: usize,
    assignments: &[usize],
    old: &[f32],
) -> (Vec<f32>, Vec<usize>) {
    let (sums, counts) = data
        .par_chunks_exact(d)
        .zip(assignments.par_iter())
        .fold(
            || (vec![0f64; k * d], vec![0usize; k]),
            |(mut sums, mut counts), (point, &c)| {
                for (s, &v) in sums[c * d..(c + 1) * d].iter_mut().zip(point) {
                    *s += v as f64;
                }
                counts[c] += 1;
                (sums, counts)
            },
        )
        .reduce(
            || (vec![0f64; k * d], vec![0usize; k]),
            |(mut s1, mut c1), (s2, c2)| {
                s1.iter_mut().zip(s2).for_each(|(a, b)| *a += b);
                c1.iter_mut().zip(c2).for_each(|(a, b)| *a += b);
                (s1, c1)
            },
        );

    let mut centroids = old.to_vec();
    for c in 0..k {
        if counts[c] == 0 {
            continue;
        }
        for (dst, s) in centroids[c * d..(c + 1) * d].iter_mut().zip(&sums[c * d..(c + 1) * d]) {
            *dst = (s / counts[c] as f64) as f32;
        }
    }
    (centroids, counts)
}

/// 计算不平衡度，1 表示完全平衡
pub fn imbalance_factor(frequency: &[usize]) -> f64 {
    let total = frequency.iter().sum::<usize>() as f64;
    if total == 0.0 {
        return 1.0;
    }
    let uf = frequency.iter().map(|&x| (x * x) as f64).sum::<f64>();
    uf * frequency.len() as f64 / (total * total)
}

/// 训练样本最多取 `max` 个，超出时随机采样
pub fn training_sample<R: Rng>(data: &[f32], d: usize, max: usize, rng: &mut R) -> Vec<f32> {
    let n = data.len() / d;
    if n <= max {
        return data.to_vec();
    }
    let mut sample = Vec::with_capacity(max * d);
    for i in index::sample(rng, n, max) {
        sample.extend_from_slice(&data[i * d..(i + 1) * d]);
    }
    sample
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;

    use super::*;

    fn blobs() -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut data = vec![];
        for center in [[0.0f32, 0.0], [10.0, 10.0], [-10.0, 10.0]] {
            for _ in 0..50 {
                data.push(center[0] + rng.random_range(-1.0..1.0));
                data.push(center[1] + rng.random_range(-1.0..1.0));
            }
        }
        data
    }

    #[test]
    fn test_kmeans_separates_blobs() {
        let data = blobs();
        let mut best = KMeansState { distsum: f64::MAX, ..Default::default() };
        for seed in 0..40 {
            let ks = kmeans(&data, 2, 3, 50, &mut StdRng::seed_from_u64(seed));
            if ks.distsum < best.distsum {
                best = ks;
            }
        }
        assert_eq!(best.k(), 3);
        assert_eq!(best.centroid_frequency.iter().sum::<usize>(), 150);
        assert_eq!(best.centroid_frequency, vec![50, 50, 50]);
        assert!((imbalance_factor(&best.centroid_frequency) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_kmeans_more_clusters_than_points() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let ks = kmeans(&data, 2, 10, 10, &mut StdRng::seed_from_u64(0));
        assert_eq!(ks.k(), 2);
        assert_eq!(ks.distsum, 0.0);
    }

    #[test]
    fn test_training_sample() {
        let data = (0..20).map(|v| v as f32).collect::<Vec<_>>();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(training_sample(&data, 2, 100, &mut rng).len(), 20);
        let sample = training_sample(&data, 2, 3, &mut rng);
        assert_eq!(sample.len(), 6);
        assert!(sample.chunks_exact(2).all(|p| p[1] == p[0] + 1.0));
    }
}
