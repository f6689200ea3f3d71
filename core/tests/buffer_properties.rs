//! Properties of the bounded buffer under concurrent writers and readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pipeline_core::buffer::BoundedBuffer;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

/// Writers push `(writer, seq)` pairs while one reader drains; returns what
/// the reader saw and the largest size observed.
async fn exchange(
    capacity: usize,
    batch_size: usize,
    per_writer: Vec<usize>,
) -> (Vec<(usize, usize)>, usize) {
    let buffer = Arc::new(BoundedBuffer::new("prop", capacity, batch_size).unwrap());
    let total: usize = per_writer.iter().sum();

    let writers: Vec<_> = per_writer
        .into_iter()
        .enumerate()
        .map(|(writer, count)| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for seq in 0..count {
                    buffer
                        .write((writer, seq), Duration::from_secs(10))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    let mut seen = Vec::with_capacity(total);
    let mut max_size = 0;
    while seen.len() < total {
        max_size = max_size.max(buffer.size());
        let batch = buffer.read(Duration::from_millis(50)).await;
        assert!(batch.len() <= batch_size);
        seen.extend(batch);
    }
    for writer in writers {
        writer.await.unwrap();
    }
    max_size = max_size.max(buffer.size());
    assert!(buffer.is_empty());
    (seen, max_size)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_no_loss_no_duplication_within_capacity(
        capacity in 1usize..8,
        batch_size in 1usize..6,
        per_writer in prop::collection::vec(0usize..25, 1..5),
    ) {
        let expected: usize = per_writer.iter().sum();
        let (seen, max_size) = runtime().block_on(exchange(capacity, batch_size, per_writer.clone()));

        prop_assert!(max_size <= capacity);
        prop_assert_eq!(seen.len(), expected);

        // every writer's records arrive once each, in the order written
        let mut by_writer: HashMap<usize, Vec<usize>> = HashMap::new();
        for (writer, seq) in seen {
            by_writer.entry(writer).or_default().push(seq);
        }
        for (writer, count) in per_writer.iter().enumerate() {
            let seqs = by_writer.remove(&writer).unwrap_or_default();
            prop_assert_eq!(seqs, (0..*count).collect::<Vec<_>>());
        }
    }

    #[test]
    fn prop_group_writes_are_all_or_nothing(
        capacity in 1usize..10,
        preload in 0usize..10,
        group in 1usize..12,
    ) {
        let preload = preload.min(capacity);
        runtime().block_on(async move {
            let buffer = BoundedBuffer::new("prop", capacity, capacity).unwrap();
            for i in 0..preload {
                buffer.write(i, Duration::ZERO).await.unwrap();
            }

            let result = buffer
                .write_all((100..100 + group).collect(), Duration::from_millis(5))
                .await;

            if preload + group <= capacity {
                assert!(result.is_ok());
                assert_eq!(buffer.size(), preload + group);
            } else {
                let rejected = result.unwrap_err().into_rejected();
                assert_eq!(rejected.len(), group);
                assert_eq!(buffer.size(), preload);
            }
        });
    }
}
