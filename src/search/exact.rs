use std::time::Instant;

use ndarray::prelude::*;
use rayon::prelude::*;

use super::{SearchQuery, SearchResult, SimilaritySearch, collect_result};
use crate::error::{Error, Result};
use crate::geo::GeoTransform;

/// 完整的嵌入矩阵，对每个向量计算精确的 L2 距离
#[derive(Debug, Clone)]
pub struct ExactIndex {
    /// `n x dim`
    embeddings: Array2<f32>,
    /// `n x 2`，每行为 `(x, y)`
    coords: Array2<i32>,
    transform: GeoTransform,
}

impl ExactIndex {
    pub fn new(embeddings: Array2<f32>, coords: Array2<i32>, transform: GeoTransform) -> Result<Self> {
        if coords.ncols() != 2 || coords.nrows() != embeddings.nrows() {
            return Err(Error::integrity(format!(
                "坐标表 {:?} 与嵌入矩阵 {:?} 不匹配",
                coords.dim(),
                embeddings.dim()
            )));
        }
        Ok(Self { embeddings, coords, transform })
    }

    pub fn embeddings(&self) -> ArrayView2<f32> {
        self.embeddings.view()
    }

    pub fn coords(&self) -> ArrayView2<i32> {
        self.coords.view()
    }
}

impl SimilaritySearch for ExactIndex {
    fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    fn len(&self) -> usize {
        self.embeddings.nrows()
    }

    fn search(&self, query: &[f32], q: &SearchQuery) -> Result<SearchResult> {
        q.validate(query, self.dim())?;
        let start = Instant::now();

        let candidates = (0..self.len())
            .into_par_iter()
            .map(|i| {
                let row = self.embeddings.row(i);
                let d = row.iter().zip(query).map(|(a, b)| (a - b) * (a - b)).sum::<f32>();
                (i, d.sqrt())
            })
            .collect::<Vec<_>>();

        let coord = |i: usize| (self.coords[[i, 0]], self.coords[[i, 1]]);
        Ok(collect_result(candidates, coord, &self.transform, q, start))
    }
}
