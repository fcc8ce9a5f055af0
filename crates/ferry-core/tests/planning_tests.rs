mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use eyre::Result;

use common::sample_backend;
use ferry_core::backend::MemoryBackend;
use ferry_core::enumeration::{EnumeratorOptions, StreamingEnumerator};
use ferry_core::planner::BatchPlanner;

fn single_worker() -> EnumeratorOptions {
    EnumeratorOptions {
        workers: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn sample_tree_plans_two_batches() -> Result<()> {
    let backend = Arc::new(sample_backend());
    let enumerator = StreamingEnumerator::new(backend.clone(), "src", "/src", single_worker());
    let mut planner = BatchPlanner::new(enumerator, "/src", "/dst", 2);

    let first = planner.next_batch().await?.expect("first batch");
    let second = planner.next_batch().await?.expect("second batch");
    assert!(planner.next_batch().await?.is_none());

    let names = |batch: &ferry_core::planner::Batch| {
        batch
            .items
            .iter()
            .map(|item| item.source_path.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&first), vec!["/src/a.txt", "/src/b.txt"]);
    assert_eq!(names(&second), vec!["/src/sub/c.txt"]);
    assert_eq!(second.items[0].destination_path, "/dst/sub/c.txt");

    let totals = planner.totals();
    assert_eq!(totals.entries_seen, 4);
    assert_eq!(totals.files, 3);
    assert_eq!(totals.bytes, 60);
    assert_eq!(totals.batches, 2);
    assert_eq!(backend.calls().list, 2);
    Ok(())
}

#[tokio::test]
async fn batch_count_is_ceiling_of_files_over_batch_size() -> Result<()> {
    let backend = MemoryBackend::new().with_page_size(4);
    for dir in 0..5 {
        for file in 0..9 {
            backend.add_file("ep", &format!("/root/d{dir}/nested/f{file}"), 1);
        }
    }
    let backend = Arc::new(backend);

    for batch_size in [1usize, 4, 7, 45, 100] {
        let enumerator = StreamingEnumerator::new(
            backend.clone(),
            "ep",
            "/root",
            EnumeratorOptions {
                workers: 4,
                ..Default::default()
            },
        );
        let mut planner = BatchPlanner::new(enumerator, "/root", "/copy", batch_size);
        let mut seen = BTreeSet::new();
        let mut batches = 0;
        while let Some(batch) = planner.next_batch().await? {
            assert!(!batch.is_empty() && batch.len() <= batch_size);
            for item in batch.items {
                assert!(seen.insert(item.source_path), "file planned twice");
            }
            batches += 1;
        }
        assert_eq!(seen.len(), 45);
        assert_eq!(batches, 45usize.div_ceil(batch_size));
    }
    Ok(())
}

#[tokio::test]
async fn empty_tree_yields_no_batches() -> Result<()> {
    let backend = MemoryBackend::new();
    backend.add_dir("ep", "/empty");
    let enumerator =
        StreamingEnumerator::new(Arc::new(backend), "ep", "/empty", EnumeratorOptions::default());
    let mut planner = BatchPlanner::new(enumerator, "/empty", "/dst", 10);
    assert!(planner.next_batch().await?.is_none());
    assert_eq!(planner.totals().batches, 0);
    Ok(())
}
