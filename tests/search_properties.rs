mod common;

use common::{encode, resized, scene, setup, write_png};
use image::ImageFormat;
use imagetwin::{AppConfig, ImageTwin, SearchParams};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn params(threshold: f64) -> SearchParams {
    SearchParams {
        threshold: Some(threshold),
        ..SearchParams::default()
    }
}

fn paths(response: &imagetwin::SearchResponse) -> Vec<PathBuf> {
    response.results.iter().map(|r| r.path.clone()).collect()
}

/// A (800x600), B (A at 400x300), C (A rotated half a turn).
fn scenario_dir() -> (TempDir, Vec<u8>) {
    let temp_dir = TempDir::new().unwrap();
    let a = scene(800, 600);
    let a_bytes = write_png(&temp_dir.path().join("a.png"), &a);
    write_png(&temp_dir.path().join("b.png"), &resized(&a, 400, 300));
    write_png(&temp_dir.path().join("c.png"), &a.rotate180());
    (temp_dir, a_bytes)
}

#[tokio::test]
async fn test_resized_copy_found_only_when_resolution_ignored() {
    let (temp_dir, a_bytes) = scenario_dir();
    let twin = setup();
    let summary = twin.index(vec![temp_dir.path().to_path_buf()]).await.unwrap();
    assert_eq!(summary.new_count, 3);
    assert_eq!(summary.total_indexed, 3);

    let lenient = twin
        .search(
            a_bytes.clone(),
            SearchParams {
                ignore_resolution: true,
                ..params(0.8)
            },
        )
        .await
        .unwrap();
    let found = paths(&lenient);
    assert_eq!(found.len(), 2);
    assert!(found[0].ends_with("a.png"));
    assert!(found[1].ends_with("b.png"));
    assert_eq!(lenient.results[0].similarity, 1.0);

    let strict = twin.search(a_bytes, params(0.8)).await.unwrap();
    let found = paths(&strict);
    assert_eq!(found.len(), 1);
    assert!(found[0].ends_with("a.png"));
}

#[tokio::test]
async fn test_reindex_is_idempotent() {
    let (temp_dir, _) = scenario_dir();
    let twin = setup();
    let root = vec![temp_dir.path().to_path_buf()];

    twin.index(root.clone()).await.unwrap();
    let second = twin.index(root).await.unwrap();

    assert_eq!(second.new_count, 0);
    assert_eq!(second.updated_count, 0);
    assert_eq!(second.removed_count, 0);
    assert_eq!(second.unchanged_count, 3);
    assert_eq!(second.total_indexed, 3);
}

#[tokio::test]
async fn test_deleted_file_disappears_from_results() {
    let (temp_dir, _) = scenario_dir();
    let twin = setup();
    let root = vec![temp_dir.path().to_path_buf()];
    twin.index(root.clone()).await.unwrap();

    let b_bytes = fs::read(temp_dir.path().join("b.png")).unwrap();
    fs::remove_file(temp_dir.path().join("b.png")).unwrap();
    let summary = twin.index(root).await.unwrap();
    assert_eq!(summary.removed_count, 1);

    let response = twin
        .search(
            b_bytes,
            SearchParams {
                ignore_resolution: true,
                ..params(0.1)
            },
        )
        .await
        .unwrap();
    assert!(paths(&response).iter().all(|p| !p.ends_with("b.png")));
}

#[tokio::test]
async fn test_every_indexed_image_matches_itself() {
    let (temp_dir, _) = scenario_dir();
    let twin = setup();
    twin.index(vec![temp_dir.path().to_path_buf()]).await.unwrap();

    for name in ["a.png", "b.png", "c.png"] {
        let bytes = fs::read(temp_dir.path().join(name)).unwrap();
        let response = twin.search(bytes, params(1.0)).await.unwrap();
        assert!(
            response
                .results
                .iter()
                .any(|r| r.path.ends_with(name) && r.similarity == 1.0),
            "{} did not match itself",
            name
        );
    }
}

#[tokio::test]
async fn test_search_is_deterministic() {
    let (temp_dir, a_bytes) = scenario_dir();
    let twin = setup();
    twin.index(vec![temp_dir.path().to_path_buf()]).await.unwrap();

    let first = twin.search(a_bytes.clone(), params(0.05)).await.unwrap();
    let second = twin.search(a_bytes, params(0.05)).await.unwrap();
    assert_eq!(first.results, second.results);
    assert_eq!(first.query_fingerprint, second.query_fingerprint);
}

#[tokio::test]
async fn test_threshold_and_resolution_flag_monotonic() {
    let (temp_dir, a_bytes) = scenario_dir();
    let twin = setup();
    twin.index(vec![temp_dir.path().to_path_buf()]).await.unwrap();

    let mut previous: Option<Vec<PathBuf>> = None;
    for threshold in [0.05, 0.3, 0.6, 0.8, 0.95, 1.0] {
        let strict = paths(&twin.search(a_bytes.clone(), params(threshold)).await.unwrap());
        let lenient = paths(
            &twin
                .search(
                    a_bytes.clone(),
                    SearchParams {
                        ignore_resolution: true,
                        ..params(threshold)
                    },
                )
                .await
                .unwrap(),
        );
        assert!(strict.iter().all(|p| lenient.contains(p)));
        if let Some(lower) = &previous {
            assert!(strict.iter().all(|p| lower.contains(p)));
        }
        previous = Some(strict);
    }
}

#[tokio::test]
async fn test_jpeg_query_matches_png_entry() {
    let (temp_dir, _) = scenario_dir();
    let twin = setup();
    twin.index(vec![temp_dir.path().to_path_buf()]).await.unwrap();

    let jpeg = encode(&scene(800, 600), ImageFormat::Jpeg);
    let response = twin.search(jpeg, params(0.8)).await.unwrap();
    assert!(response.results[0].path.ends_with("a.png"));
}

#[tokio::test]
async fn test_scope_limits_results_to_directories() {
    let temp_dir = TempDir::new().unwrap();
    let trips = temp_dir.path().join("trips");
    let work = temp_dir.path().join("work");
    fs::create_dir_all(&trips).unwrap();
    fs::create_dir_all(&work).unwrap();
    let img = scene(160, 120);
    let bytes = write_png(&trips.join("beach.png"), &img);
    write_png(&work.join("beach_copy.png"), &img);

    let twin = setup();
    twin.index(vec![temp_dir.path().to_path_buf()]).await.unwrap();

    let everywhere = twin.search(bytes.clone(), params(0.9)).await.unwrap();
    assert_eq!(everywhere.total, 2);

    let scoped = twin
        .search(
            bytes,
            SearchParams {
                directories: vec![work.clone()],
                ..params(0.9)
            },
        )
        .await
        .unwrap();
    assert_eq!(scoped.total, 1);
    assert!(scoped.results[0].path.ends_with("work/beach_copy.png"));
}

#[tokio::test]
async fn test_index_survives_reopen() {
    let (temp_dir, a_bytes) = scenario_dir();
    let store_dir = TempDir::new().unwrap();
    let config = AppConfig {
        store_path: store_dir.path().join("store"),
        parallel_workers: 2,
        ..AppConfig::default()
    };

    {
        let twin = ImageTwin::open(config.clone()).unwrap();
        twin.index(vec![temp_dir.path().to_path_buf()]).await.unwrap();
    }

    let twin = ImageTwin::open(config).unwrap();
    let status = twin.status().await.unwrap();
    assert_eq!(status.total_indexed_images, 3);
    let response = twin.search(a_bytes, params(0.99)).await.unwrap();
    assert!(response.results[0].path.ends_with("a.png"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_search_during_index_sees_consistent_entries() {
    let temp_dir = TempDir::new().unwrap();
    let base = scene(320, 240);
    let mut written = Vec::new();
    for i in 0..40 {
        let path = temp_dir.path().join(format!("shot_{:02}.png", i));
        let variant = if i % 2 == 0 { base.clone() } else { base.rotate180() };
        write_png(&path, &resized(&variant, 320 - i, 240));
        written.push(fs::canonicalize(&path).unwrap());
    }
    let query = encode(&base, ImageFormat::Png);

    let twin = Arc::new(setup());
    let indexing = {
        let twin = twin.clone();
        let root = temp_dir.path().to_path_buf();
        tokio::spawn(async move { twin.index(vec![root]).await })
    };

    let mut searches = 0;
    loop {
        let finished = indexing.is_finished();
        let response = twin.search(query.clone(), params(0.5)).await.unwrap();
        assert_eq!(response.total, response.results.len());
        for pair in response.results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        for result in &response.results {
            assert!(written.contains(&result.path));
            assert!(result.similarity >= 0.5 && result.similarity <= 1.0);
        }
        searches += 1;
        if finished {
            break;
        }
    }

    let summary = indexing.await.unwrap().unwrap();
    assert_eq!(summary.new_count, 40);
    assert!(searches >= 1);
    let after = twin.search(query, params(0.5)).await.unwrap();
    assert!(after.total >= 20);
}
