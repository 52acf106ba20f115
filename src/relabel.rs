//! 根据标签均值重新标注像素
//!
//! 每次调用都是纯函数：计算每个标签的平均嵌入，找出离另一个标签均值更近的已标注像素。
//! 距离相等时保留当前标签，否则取名称字典序最小的标签。

use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::search::l2;

/// 一个已标注的像素
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LabeledPixel {
    pub label: String,
    pub embedding: Vec<f32>,
    pub lat: f64,
    pub lon: f64,
}

/// 重新标注的输入，标签嵌入和已标注像素均由调用方持有
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RelabelRequest {
    pub label_embeddings: BTreeMap<String, Vec<Vec<f32>>>,
    /// 键通常为 `"x,y"`
    pub labeled_pixels: BTreeMap<String, LabeledPixel>,
}

impl RelabelRequest {
    pub fn run(&self) -> Result<RelabelResult> {
        relabel(&self.label_embeddings, &self.labeled_pixels)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Relabel {
    pub key: String,
    pub old_label: String,
    pub new_label: String,
    /// 当前标签没有任何嵌入时为空
    pub old_distance: Option<f32>,
    pub new_distance: f32,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RelabelStats {
    pub total_pixels: usize,
    pub relabeled_pixels: usize,
    pub unchanged_pixels: usize,
    /// 参与比较的标签数量
    pub labels_used: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RelabelResult {
    pub relabeled: Vec<Relabel>,
    pub relabel_count: usize,
    pub stats: RelabelStats,
}

/// 每个标签的平均嵌入，跳过没有嵌入的标签
pub fn label_means(label_embeddings: &BTreeMap<String, Vec<Vec<f32>>>) -> Result<BTreeMap<String, Vec<f32>>> {
    let mut dim = None;
    let mut means = BTreeMap::new();
    for (label, vectors) in label_embeddings {
        if vectors.is_empty() {
            warn!("标签 {label} 没有任何嵌入，跳过");
            continue;
        }
        let d = *dim.get_or_insert(vectors[0].len());
        if vectors.iter().any(|v| v.len() != d) {
            return Err(Error::config(format!("标签 {label} 的嵌入维度与 {d} 不一致")));
        }
        if vectors.iter().flatten().any(|x| !x.is_finite()) {
            return Err(Error::config(format!("标签 {label} 的嵌入包含 NaN 或无穷大")));
        }
        let mut sum = vec![0f64; d];
        for v in vectors {
            sum.iter_mut().zip(v).for_each(|(s, &x)| *s += x as f64);
        }
        let n = vectors.len() as f64;
        means.insert(label.clone(), sum.into_iter().map(|s| (s / n) as f32).collect());
        debug!("标签 {label}：{} 个嵌入", vectors.len());
    }
    Ok(means)
}

/// 找出离其他标签均值更近的像素
pub fn relabel(
    label_embeddings: &BTreeMap<String, Vec<Vec<f32>>>,
    labeled_pixels: &BTreeMap<String, LabeledPixel>,
) -> Result<RelabelResult> {
    if label_embeddings.is_empty() {
        return Err(Error::config("没有提供任何标签嵌入"));
    }
    if labeled_pixels.is_empty() {
        return Ok(RelabelResult::default());
    }

    let means = label_means(label_embeddings)?;
    let Some(dim) = means.values().next().map(Vec::len) else {
        return Err(Error::config("没有任何带嵌入的标签"));
    };
    info!("重新标注 {} 个像素，{} 个标签", labeled_pixels.len(), means.len());

    let mut relabeled = vec![];
    for (key, pixel) in labeled_pixels {
        if pixel.embedding.len() != dim {
            return Err(Error::config(format!(
                "像素 {key} 的嵌入维度为 {}，标签维度为 {dim}",
                pixel.embedding.len()
            )));
        }
        if pixel.embedding.iter().any(|x| !x.is_finite()) {
            return Err(Error::config(format!("像素 {key} 的嵌入包含 NaN 或无穷大")));
        }
        let distances = means
            .iter()
            .map(|(label, mean)| (label.as_str(), l2(&pixel.embedding, mean)))
            .collect::<Vec<_>>();
        let old_distance = distances.iter().find(|(l, _)| *l == pixel.label).map(|(_, d)| *d);

        // `means` 有序，严格小于才替换即可得到字典序最小的标签
        let (mut best, mut best_distance) = distances[0];
        for &(label, d) in &distances[1..] {
            if d < best_distance {
                (best, best_distance) = (label, d);
            }
        }
        if old_distance == Some(best_distance) {
            continue;
        }

        debug!("{key}: {} ({old_distance:?}) -> {best} ({best_distance:.4})", pixel.label);
        relabeled.push(Relabel {
            key: key.clone(),
            old_label: pixel.label.clone(),
            new_label: best.to_string(),
            old_distance,
            new_distance: best_distance,
            lat: pixel.lat,
            lon: pixel.lon,
        });
    }

    let total = labeled_pixels.len();
    info!("重新标注完成：{} 个变更，{} 个不变", relabeled.len(), total - relabeled.len());
    Ok(RelabelResult {
        relabel_count: relabeled.len(),
        stats: RelabelStats {
            total_pixels: total,
            relabeled_pixels: relabeled.len(),
            unchanged_pixels: total - relabeled.len(),
            labels_used: means.len(),
        },
        relabeled,
    })
}
