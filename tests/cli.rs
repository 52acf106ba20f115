use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use ndarray::Array3;
use predicates::prelude::*;
use serde_json::json;
use tessmap::config::DataDir;
use tessmap::geo::GeoTransform;
use tessmap::raster::{Raster, RasterData};

macro_rules! cargo_run {
    ($cmd:expr, $($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin($cmd)?;
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

/// 32x32 的 4 维嵌入栅格，每个像素的嵌入互不相同
fn write_mosaic(data_dir: &Path) -> Result<()> {
    let dir = DataDir::new(data_dir);
    let path = dir.mosaic("bangalore", 2024);
    fs::create_dir_all(path.parent().unwrap())?;
    let data = Array3::from_shape_fn((32, 32, 4), |(y, x, b)| (y * 32 + x) as f32 + b as f32 * 0.5);
    let transform = GeoTransform::north_up(77.5, 13.0, 0.001, 0.001);
    Raster::new(RasterData::F32(data), transform, 10.0).write(path)?;
    Ok(())
}

#[test]
fn pyramid_is_cached() -> Result<()> {
    let data_dir = assert_fs::TempDir::new()?;
    write_mosaic(data_dir.path())?;

    cargo_run!(
        "tessmap", "-d", data_dir.path(), "pyramid", "bangalore", "2024", "-l", "3", "--output-size", "64",
        "--output-format", "json"
    )
    .success()
    .stdout(predicate::str::contains("\"cached\": false").and(predicate::str::contains("level_2.npy")));

    let level = data_dir.path().join("pyramids/bangalore/2024/level_1.npy");
    assert!(level.exists());

    cargo_run!(
        "tessmap", "-d", data_dir.path(), "pyramid", "bangalore", "2024", "-l", "3", "--output-size", "64",
        "--output-format", "json"
    )
    .success()
    .stdout(predicate::str::contains("\"cached\": true"));

    Ok(())
}

#[test]
fn pyramid_needs_source() -> Result<()> {
    let data_dir = assert_fs::TempDir::new()?;
    cargo_run!("tessmap", "-d", data_dir.path(), "pyramid", "bangalore", "satellite")
        .failure()
        .stderr(predicate::str::contains("--source"));
    Ok(())
}

#[test]
fn coarsen_embeddings() -> Result<()> {
    let data_dir = assert_fs::TempDir::new()?;
    write_mosaic(data_dir.path())?;

    cargo_run!("tessmap", "-d", data_dir.path(), "coarsen", "bangalore", "2024", "-l", "3")
        .success()
        .stdout(predicate::str::contains("8x8x4"));
    assert!(data_dir.path().join("coarsened/bangalore/2024/level_2.npy").exists());
    Ok(())
}

#[test]
fn index_then_search() -> Result<()> {
    let data_dir = assert_fs::TempDir::new()?;
    write_mosaic(data_dir.path())?;

    cargo_run!("tessmap", "-d", data_dir.path(), "index", "bangalore", "2024", "--step", "2")
        .success()
        .stdout(predicate::str::contains("total_pixels\t1024"));

    // 像素 (5, 5) 的中心
    cargo_run!("tessmap", "-d", data_dir.path(), "search", "bangalore", "2024", "12.9945", "77.5055", "0")
        .success()
        .stdout(predicate::str::contains("0.0000").and(predicate::str::contains("\t5,5")));

    cargo_run!(
        "tessmap", "-d", data_dir.path(), "search", "bangalore", "2024", "12.9945", "77.5055", "2",
        "--mode", "approximate", "--output-format", "json"
    )
    .success()
    .stdout(predicate::str::contains("\"query_stats\""));

    Ok(())
}

#[test]
fn search_rejects_bad_input() -> Result<()> {
    let data_dir = assert_fs::TempDir::new()?;
    write_mosaic(data_dir.path())?;

    cargo_run!("tessmap", "-d", data_dir.path(), "search", "../etc", "2024", "12.99", "77.50", "1")
        .failure()
        .stderr(predicate::str::contains("非法的视口名"));

    cargo_run!("tessmap", "-d", data_dir.path(), "search", "bangalore", "2024", "12.99", "77.50", "1")
        .failure()
        .stderr(predicate::str::contains("未找到"));

    Ok(())
}

#[test]
fn relabel_from_file() -> Result<()> {
    let dir = assert_fs::TempDir::new()?;
    let input = dir.path().join("relabel.json");
    let request = json!({
        "label_embeddings": {
            "water": [[0.0, 0.0], [2.0, 0.0]],
            "urban": [[10.0, 0.0]],
        },
        "labeled_pixels": {
            "5,5": {"label": "water", "embedding": [9.0, 0.0], "lat": 12.99, "lon": 77.5},
            "6,6": {"label": "water", "embedding": [1.0, 1.0], "lat": 12.98, "lon": 77.5},
        },
    });
    fs::write(&input, serde_json::to_vec(&request)?)?;

    cargo_run!("tessmap", "relabel", &input)
        .success()
        .stdout(predicate::str::contains("5,5\twater -> urban").and(predicate::str::contains("1 / 2")));
    Ok(())
}
