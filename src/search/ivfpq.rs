//! 倒排文件 + 乘积量化（IVF-PQ）近似索引
//!
//! 粗量化器把向量划分到 `nlist` 个倒排列表，列表内保存残差的 PQ 编码，
//! 搜索时对 `nprobe` 个最近的列表做查表距离（ADC）计算。

use std::time::Instant;

use indicatif::{ParallelProgressIterator, ProgressBar};
use log::info;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::kmeans::{imbalance_factor, kmeans, nearest, training_sample, update_assignments};
use super::{SearchQuery, SearchResult, SimilaritySearch, collect_result, l2_sqr};
use crate::error::{Error, Result};
use crate::geo::GeoTransform;
use crate::utils::pb_style;

/// 每个聚类中心最多使用的训练向量数量
const MAX_POINTS_PER_CENTROID: usize = 256;

/// 单个倒排列表
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvertedList {
    pub ids: Vec<u32>,
    /// 按 `ids` 顺序排列的 PQ 编码，每个向量 `m` 字节
    pub codes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfPqIndex {
    dim: usize,
    nlist: usize,
    /// 子量化器数量
    m: usize,
    /// 每个子量化器的码本大小
    ksub: usize,
    /// `nlist x dim` 粗聚类中心
    coarse: Vec<f32>,
    /// `m x ksub x dsub` 子码本
    codebooks: Vec<f32>,
    lists: Vec<InvertedList>,
    /// 每个向量对应的像素坐标 `(x, y)`
    coords: Vec<(i32, i32)>,
    transform: GeoTransform,
}

/// 倒排列表数量随样本数增长：`clamp(n / 100, 100, 1024)`，且不超过 `n`
pub fn nlist_for(n: usize) -> usize {
    (n / 100).clamp(100, 1024).min(n)
}

/// 维度为偶数时每个子量化器负责 2 维，否则 1 维
pub fn subquantizers_for(dim: usize) -> usize {
    if dim % 2 == 0 { dim / 2 } else { dim }
}

impl IvfPqIndex {
    /// 训练索引并添加全部向量
    ///
    /// `data` 为按行优先展开的 `n x dim` 矩阵，`coords` 为对应的像素坐标。
    pub fn train(
        data: &[f32],
        dim: usize,
        coords: Vec<(i32, i32)>,
        transform: GeoTransform,
        max_iter: usize,
        seed: u64,
    ) -> Result<Self> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(Error::config(format!("数据长度 {} 不是维度 {dim} 的整数倍", data.len())));
        }
        let n = data.len() / dim;
        if n == 0 || n != coords.len() {
            return Err(Error::config(format!("向量数量 {n} 与坐标数量 {} 不一致", coords.len())));
        }
        if n > u32::MAX as usize {
            return Err(Error::config(format!("向量数量 {n} 过多")));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let nlist = nlist_for(n);
        let m = subquantizers_for(dim);
        let dsub = dim / m;
        let ksub = n.min(256);

        info!("训练粗量化器：{n} 个向量，{nlist} 个倒排列表");
        let sample = training_sample(data, dim, nlist * MAX_POINTS_PER_CENTROID, &mut rng);
        let coarse = kmeans(&sample, dim, nlist, max_iter, &mut rng);
        let nlist = coarse.k();
        let (assignments, _) = update_assignments(data, dim, &coarse.centroids);

        let residuals = residuals(data, dim, &coarse.centroids, &assignments);

        info!("训练乘积量化器：{m} 个子量化器，每个 {ksub} 个码字");
        let sample = training_sample(&residuals, dim, ksub * MAX_POINTS_PER_CENTROID, &mut rng);
        let seeds = (0..m).map(|_| rng.random::<u64>()).collect::<Vec<_>>();
        let pb = ProgressBar::new(m as u64).with_style(pb_style());
        let codebooks = (0..m)
            .into_par_iter()
            .progress_with(pb.clone())
            .map(|j| {
                let sub = sample
                    .chunks_exact(dim)
                    .flat_map(|v| &v[j * dsub..(j + 1) * dsub])
                    .copied()
                    .collect::<Vec<_>>();
                let mut rng = StdRng::seed_from_u64(seeds[j]);
                kmeans(&sub, dsub, ksub, max_iter, &mut rng).centroids
            })
            .collect::<Vec<_>>()
            .concat();
        pb.finish_with_message("乘积量化器训练完成");

        let mut index = Self {
            dim,
            nlist,
            m,
            ksub,
            coarse: coarse.centroids,
            codebooks,
            lists: vec![InvertedList::default(); nlist],
            coords,
            transform,
        };

        let codes = residuals.par_chunks_exact(dim).map(|r| index.encode(r)).collect::<Vec<_>>();
        for (id, (list, code)) in assignments.iter().zip(codes).enumerate() {
            index.lists[*list].ids.push(id as u32);
            index.lists[*list].codes.extend(code);
        }
        let sizes = index.lists.iter().map(|l| l.ids.len()).collect::<Vec<_>>();
        info!("IVF-PQ 构建完成，不平衡度：{:.2}", imbalance_factor(&sizes));

        Ok(index)
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    pub fn m(&self) -> usize {
        self.m
    }

    fn dsub(&self) -> usize {
        self.dim / self.m
    }

    fn codeword(&self, j: usize, c: usize) -> &[f32] {
        let dsub = self.dsub();
        let offset = (j * self.ksub + c) * dsub;
        &self.codebooks[offset..offset + dsub]
    }

    /// 残差的 PQ 编码
    fn encode(&self, residual: &[f32]) -> Vec<u8> {
        let dsub = self.dsub();
        let table = self.ksub * dsub;
        (0..self.m)
            .map(|j| {
                let sub = &residual[j * dsub..(j + 1) * dsub];
                let (c, _) = nearest(sub, &self.codebooks[j * table..(j + 1) * table], dsub);
                c as u8
            })
            .collect()
    }

    /// 查询残差到每个码字的距离平方表，`m x ksub`
    fn lookup_table(&self, residual: &[f32]) -> Vec<f32> {
        let dsub = self.dsub();
        let mut table = Vec::with_capacity(self.m * self.ksub);
        for j in 0..self.m {
            let sub = &residual[j * dsub..(j + 1) * dsub];
            table.extend((0..self.ksub).map(|c| l2_sqr(sub, self.codeword(j, c))));
        }
        table
    }

    /// 距离查询向量最近的 `nprobe` 个倒排列表
    fn probe(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let mut lists = self
            .coarse
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(i, c)| (i, l2_sqr(query, c)))
            .collect::<Vec<_>>();
        lists.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));
        lists.into_iter().take(nprobe.max(1)).map(|(i, _)| i).collect()
    }
}

fn residuals(data: &[f32], dim: usize, centroids: &[f32], assignments: &[usize]) -> Vec<f32> {
    data.par_chunks_exact(dim)
        .zip(assignments.par_iter())
        .flat_map_iter(|(v, &c)| {
            let centroid = &centroids[c * dim..(c + 1) * dim];
            v.iter().zip(centroid).map(|(x, y)| x - y).collect::<Vec<_>>()
        })
        .collect()
}

impl SimilaritySearch for IvfPqIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.coords.len()
    }

    fn search(&self, query: &[f32], q: &SearchQuery) -> Result<SearchResult> {
        q.validate(query, self.dim)?;
        let start = Instant::now();

        let candidates = self
            .probe(query, q.nprobe)
            .into_par_iter()
            .flat_map_iter(|list| {
                let centroid = &self.coarse[list * self.dim..(list + 1) * self.dim];
                let residual = query.iter().zip(centroid).map(|(x, y)| x - y).collect::<Vec<_>>();
                let table = self.lookup_table(&residual);
                let inv = &self.lists[list];
                inv.ids
                    .iter()
                    .zip(inv.codes.chunks_exact(self.m))
                    .map(|(&id, code)| {
                        let d = code
                            .iter()
                            .enumerate()
                            .map(|(j, &c)| table[j * self.ksub + c as usize])
                            .sum::<f32>();
                        (id as usize, d.max(0.0).sqrt())
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        Ok(collect_result(candidates, |i| self.coords[i], &self.transform, q, start))
    }
}
