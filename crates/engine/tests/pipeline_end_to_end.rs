// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline tests: full topologies driven through start,
//! iteration and stop, covering the batching stages, multi-worker maps,
//! the sub-pool stage, failure propagation and shutdown behavior.

use conveyor_engine::{
    Batchable, BoxedError, Error, MapStage, PackStage, Payload, Pipeline, PipelineConfig,
    PoolStage, RepackStage, Stage, UnpackStage,
};
use std::time::{Duration, Instant};

type Item = Payload<i64>;

/// Short timeouts so the tests run quickly; the ratios between them match
/// the defaults.
fn fast_config() -> PipelineConfig {
    PipelineConfig {
        get_timeout: Duration::from_millis(10),
        error_poll_timeout: Duration::from_millis(20),
        monitor_interval: Duration::from_millis(200),
        join_timeout: Duration::from_secs(2),
        stop_grace: Duration::from_millis(50),
        ..PipelineConfig::default()
    }
}

fn pipeline(stages: Vec<Box<dyn Stage<Item>>>) -> Pipeline<Item> {
    Pipeline::with_config(fast_config(), stages)
}

fn singles(values: impl IntoIterator<Item = i64>) -> Vec<Item> {
    values.into_iter().map(Payload::Single).collect()
}

fn batch_of(values: &[i64]) -> Item {
    Payload::Batch(values.iter().copied().map(Payload::Single).collect())
}

/// Applies `f` to every scalar inside the payload, preserving its shape.
fn map_values(payload: Item, f: &(dyn Fn(i64) -> i64 + Sync)) -> Item {
    match payload {
        Payload::Single(v) => Payload::Single(f(v)),
        Payload::Batch(vs) => Payload::Batch(vs.into_iter().map(|e| map_values(e, f)).collect()),
    }
}

fn collect_stream(pipeline: &mut Pipeline<Item>) -> Vec<Item> {
    pipeline
        .by_ref()
        .map(|r| r.expect("stream should not fail"))
        .collect()
}

fn flatten_singles(items: Vec<Item>) -> Vec<i64> {
    items
        .into_iter()
        .map(|p| p.single().expect("expected a scalar payload"))
        .collect()
}

#[test]
fn test_pack_map_unpack_map_multiset() {
    // Pack(8) → double (5 workers, operating on whole batches) → Unpack →
    // minus-one (5 workers). Parallel map stages reorder freely, so only
    // the multiset of outputs is asserted.
    let input = vec![3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8, 9, 7, 9, 3, 2, 3, 8];
    let mut expected: Vec<i64> = input.iter().map(|x| 2 * x - 1).collect();
    expected.sort_unstable();

    let mut pipe = pipeline(vec![
        Box::new(PackStage::new(8)),
        Box::new(MapStage::new("double", 5, |p: Item| {
            Ok(map_values(p, &|v| v * 2))
        })),
        Box::new(UnpackStage::new()),
        Box::new(MapStage::new("minus-one", 5, |p: Item| {
            Ok(map_values(p, &|v| v - 1))
        })),
    ]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(singles(input)).expect("queue");

    let mut output = flatten_singles(collect_stream(&mut pipe));
    output.sort_unstable();
    assert_eq!(output, expected);
    pipe.stop();
}

#[test]
fn test_pack_unpack_round_trip_preserves_order() {
    // Both stages are single-worker, so the exact sequence comes back.
    let mut pipe = pipeline(vec![
        Box::new(PackStage::new(4)),
        Box::new(UnpackStage::new()),
    ]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(singles(1..=10)).expect("queue");

    let output = flatten_singles(collect_stream(&mut pipe));
    assert_eq!(output, (1..=10).collect::<Vec<_>>());
    pipe.stop();
}

#[test]
fn test_empty_stream_completes_immediately() {
    let mut pipe = pipeline(vec![
        Box::new(PackStage::new(4)),
        Box::new(UnpackStage::new()),
    ]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(Vec::<Item>::new()).expect("queue");
    assert!(collect_stream(&mut pipe).is_empty());

    // The marker went through cleanly, so the pipeline is reusable.
    let _ = pipe.queue_iterable(singles(1..=3)).expect("queue again");
    assert_eq!(flatten_singles(collect_stream(&mut pipe)), vec![1, 2, 3]);
    pipe.stop();
}

#[test]
fn test_pack_cardinality_and_partial_last_batch() {
    let mut pipe = pipeline(vec![Box::new(PackStage::new(8))]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(singles(0..19)).expect("queue");

    let batches: Vec<Vec<i64>> = collect_stream(&mut pipe)
        .into_iter()
        .map(|p| flatten_singles(p.unpack().expect("pack emits batches")))
        .collect();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].len(), 8);
    assert_eq!(batches[1].len(), 8);
    assert_eq!(batches[2].len(), 3);
    // Single-worker stage: order is preserved within and across batches.
    let flattened: Vec<i64> = batches.into_iter().flatten().collect();
    assert_eq!(flattened, (0..19).collect::<Vec<_>>());
    pipe.stop();
}

#[test]
fn test_repack_crosses_batch_boundaries_and_conserves_elements() {
    // Pack(3) produces [3,3,3,1]; Repack(4) re-groups into [4,4,2].
    let mut pipe = pipeline(vec![
        Box::new(PackStage::new(3)),
        Box::new(RepackStage::new(4)),
    ]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(singles(1..=10)).expect("queue");

    let batches: Vec<Vec<i64>> = collect_stream(&mut pipe)
        .into_iter()
        .map(|p| flatten_singles(p.unpack().expect("repack emits batches")))
        .collect();
    assert_eq!(
        batches,
        vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10]]
    );
    pipe.stop();
}

#[test]
fn test_parallel_identity_map_bag_equality() {
    let mut pipe = pipeline(vec![Box::new(MapStage::new("identity", 3, Ok))]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(singles(0..1000)).expect("queue");

    let mut output = flatten_singles(collect_stream(&mut pipe));
    assert_eq!(output.len(), 1000);
    output.sort_unstable();
    assert_eq!(output, (0..1000).collect::<Vec<_>>());
    pipe.stop();
}

#[test]
fn test_pipeline_serves_several_streams() {
    // The end-of-stream protocol re-arms the barriers, so one pipeline can
    // process any number of iterables without reconstruction.
    let mut pipe = pipeline(vec![
        Box::new(PackStage::new(4)),
        Box::new(MapStage::new("identity", 3, Ok)),
        Box::new(UnpackStage::new()),
    ]);
    pipe.start().expect("start");

    for round in 0..3 {
        let base = round * 100;
        let _ = pipe.queue_iterable(singles(base..base + 10)).expect("queue");
        let mut output = flatten_singles(collect_stream(&mut pipe));
        output.sort_unstable();
        assert_eq!(output, (base..base + 10).collect::<Vec<_>>());
    }
    pipe.stop();
}

#[test]
fn test_worker_failure_is_fatal_and_mentions_the_item() {
    let mut pipe = pipeline(vec![Box::new(MapStage::new("fragile", 2, |p: Item| {
        if p == Payload::Single(42) {
            return Err(BoxedError::from("refusing to process the answer"));
        }
        Ok(p)
    }))]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(singles(1..=100)).expect("queue");

    let mut fatal = None;
    for result in pipe.by_ref() {
        if let Err(error) = result {
            fatal = Some(error);
            break;
        }
    }
    let fatal = fatal.expect("the failure must surface to the caller");
    match &fatal {
        Error::WorkerFailed { report } => {
            assert!(report.worker.starts_with("fragile-"));
            assert!(report.item_summary.contains("42"));
            assert!(report.error.contains("refusing to process"));
        }
        other => panic!("expected WorkerFailed, got {other}"),
    }

    // The pipeline is dead: no new iterable may be queued.
    assert!(matches!(
        pipe.queue_iterable(singles(0..1)),
        Err(Error::ShutDown)
    ));
    pipe.stop();
}

#[test]
fn test_unpack_rejects_scalar_input() {
    let mut pipe = pipeline(vec![Box::new(UnpackStage::new())]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(singles(0..5)).expect("queue");

    let fatal = pipe
        .by_ref()
        .find_map(Result::err)
        .expect("a scalar cannot be unpacked");
    match fatal {
        Error::WorkerFailed { report } => {
            assert!(report.error.contains("not a batch"));
        }
        other => panic!("expected WorkerFailed, got {other}"),
    }
    pipe.stop();
}

#[test]
fn test_pool_maps_batches_in_order() {
    let mut pipe = pipeline(vec![Box::new(PoolStage::new("square", 4, |p: Item| {
        Ok(map_values(p, &|v| v * v))
    }))]);
    pipe.start().expect("start");
    let input = vec![batch_of(&[1, 2, 3]), batch_of(&[4, 5]), batch_of(&[6])];
    let _ = pipe.queue_iterable(input).expect("queue");

    let output: Vec<Vec<i64>> = collect_stream(&mut pipe)
        .into_iter()
        .map(|p| flatten_singles(p.unpack().expect("pool emits batches")))
        .collect();
    // Single owner worker: batch order is preserved, and so is the element
    // order within each batch.
    assert_eq!(output, vec![vec![1, 4, 9], vec![16, 25], vec![36]]);
    pipe.stop();
}

#[test]
fn test_backpressure_keeps_internal_queues_at_capacity() {
    let mut pipe = pipeline(vec![
        Box::new(MapStage::new("fast", 1, Ok)),
        Box::new(MapStage::new("slow", 1, |p: Item| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(p)
        })),
    ]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(singles(0..50)).expect("queue");

    let mut consumed = Vec::new();
    while consumed.len() < 50 {
        // Sample the flow while the stream is in flight: internal queues
        // never hold more than their capacity.
        let status = pipe.flowstatus();
        for queue in &status.queues[1..] {
            assert_eq!(queue.capacity, Some(1));
            assert!(queue.depth <= 1);
        }
        match pipe.next() {
            Some(result) => consumed.push(result.expect("no failure")),
            None => break,
        }
    }
    assert_eq!(consumed.len(), 50);
    pipe.stop();
}

#[test]
fn test_stop_mid_stream_exits_all_workers_promptly() {
    let mut pipe = pipeline(vec![
        Box::new(PackStage::new(4)),
        Box::new(MapStage::new("slow", 3, |p: Item| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(p)
        })),
        Box::new(UnpackStage::new()),
    ]);
    pipe.start().expect("start");
    let _ = pipe.queue_iterable(singles(0..10_000)).expect("queue");

    // Consume a couple of items, then shut down mid-stream the way a
    // signal handler would.
    let _first = pipe.next().expect("one item").expect("no failure");
    let started = Instant::now();
    pipe.stop();
    assert!(started.elapsed() < Duration::from_secs(10));

    let status = pipe.flowstatus();
    for stage in &status.stages {
        assert_eq!(stage.alive_workers, 0, "stage {} still alive", stage.name);
    }
}

#[test]
fn test_flowstatus_reports_the_whole_topology() {
    let mut pipe = pipeline(vec![
        Box::new(PackStage::new(2)),
        Box::new(MapStage::new("noop", 2, Ok)),
    ]);
    let status = pipe.flowstatus();
    assert_eq!(status.queues.len(), 3);
    assert_eq!(status.stages.len(), 2);
    assert_eq!(status.stages[0].name, "Pack(2)");
    assert_eq!(status.stages[1].worker_names, vec!["noop-0", "noop-1"]);
    // Nothing started yet.
    assert!(status.stages.iter().all(|s| s.alive_workers == 0));

    pipe.start().expect("start");
    // Workers come up within a polling interval.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let status = pipe.flowstatus();
        if status.stages.iter().all(|s| s.alive_workers == s.configured_workers) {
            break;
        }
        assert!(Instant::now() < deadline, "workers did not come up");
        std::thread::sleep(Duration::from_millis(10));
    }
    let rendered = pipe.flowstatus().to_string();
    assert!(rendered.contains("Pack(2)"));
    assert!(rendered.contains("noop"));
    pipe.stop();
}
