//! Window tasks driven by tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use gateway_analysis::{Analysis, TaskRunner};

const SECOND: Duration = Duration::from_secs(1);

/// Sleep until just past the `n`th tick of a one-second window registered at t=0.
async fn advance_past_tick(start: tokio::time::Instant, n: u32) {
    tokio::time::sleep_until(start + SECOND * n + Duration::from_millis(10)).await;
}

fn upstream_batch(analysis: &Analysis, key: &str) {
    for _ in 0..10 {
        analysis.request(key);
    }
    for _ in 0..8 {
        analysis.response(key, Duration::from_millis(50));
    }
    for _ in 0..2 {
        analysis.failure(key);
    }
}

#[tokio::test(start_paused = true)]
async fn upstream_scenario_warms_up_over_two_ticks() {
    let analysis = Analysis::new(TaskRunner::new());
    let start = tokio::time::Instant::now();
    analysis.register_window("upstream-1", SECOND).unwrap();

    upstream_batch(&analysis, "upstream-1");
    advance_past_tick(start, 1).await;

    // First tick only fills the prev buffer.
    assert_eq!(analysis.request_count("upstream-1", SECOND), 0);
    assert_eq!(analysis.recalculation_count("upstream-1", SECOND), 0);
    assert_eq!(analysis.continuous_failure_count("upstream-1"), 2);

    upstream_batch(&analysis, "upstream-1");
    advance_past_tick(start, 2).await;

    assert_eq!(analysis.request_count("upstream-1", SECOND), 10);
    assert_eq!(analysis.success_count("upstream-1", SECOND), 8);
    assert_eq!(analysis.failure_count("upstream-1", SECOND), 2);
    assert_eq!(analysis.reject_count("upstream-1", SECOND), 0);
    assert_eq!(analysis.avg_latency_ms("upstream-1", SECOND), 50);
    assert_eq!(analysis.max_latency_ms("upstream-1", SECOND), 50);
    assert_eq!(analysis.min_latency_ms("upstream-1", SECOND), 50);
    assert_eq!(analysis.qps("upstream-1", SECOND), 10);
    assert_eq!(analysis.continuous_failure_count("upstream-1"), 2);

    analysis.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_registration_runs_one_task() {
    let analysis = Analysis::default();
    let start = tokio::time::Instant::now();
    analysis.register_window("upstream-1", SECOND).unwrap();
    analysis.register_window("upstream-1", SECOND).unwrap();
    assert_eq!(analysis.task_count(), 1);

    advance_past_tick(start, 4).await;

    // Two tasks would have recomputed four times.
    assert_eq!(analysis.recalculation_count("upstream-1", SECOND), 2);
    analysis.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn windows_of_one_key_tick_independently() {
    let analysis = Analysis::default();
    let start = tokio::time::Instant::now();
    let long = Duration::from_secs(4);
    analysis.register_window("edge", SECOND).unwrap();
    analysis.register_window("edge", long).unwrap();

    // Traffic lands mid-tick: t = 0.5s, 1.5s, ... 7.5s.
    tokio::time::sleep(Duration::from_millis(500)).await;
    for _ in 0..8 {
        analysis.request("edge");
        analysis.response("edge", Duration::from_millis(5));
        tokio::time::sleep(SECOND).await;
    }
    // 8 ticks of the 1s window, 2 ticks of the 4s window.
    advance_past_tick(start, 8).await;

    assert_eq!(analysis.recalculation_count("edge", SECOND), 4);
    assert_eq!(analysis.recalculation_count("edge", long), 1);
    assert_eq!(analysis.request_count("edge", SECOND), 1);
    assert_eq!(analysis.request_count("edge", long), 4);
    assert_eq!(analysis.qps("edge", long), 1);

    analysis.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn skipped_traffic_never_goes_negative() {
    let analysis = Analysis::default();
    let start = tokio::time::Instant::now();
    analysis.register_window("quiet", SECOND).unwrap();

    for _ in 0..25 {
        analysis.request("quiet");
    }
    for tick in 1..=6 {
        advance_past_tick(start, tick).await;
        let snapshot = analysis.window_snapshot("quiet", SECOND).unwrap();
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.qps, 0);
    }

    analysis.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_freezes_windows() {
    let analysis = Analysis::default();
    let start = tokio::time::Instant::now();
    analysis.register_window("upstream-1", SECOND).unwrap();
    advance_past_tick(start, 2).await;
    assert_eq!(analysis.recalculation_count("upstream-1", SECOND), 1);

    analysis.shutdown().await;
    assert_eq!(analysis.task_count(), 0);

    upstream_batch(&analysis, "upstream-1");
    advance_past_tick(start, 10).await;
    assert_eq!(analysis.recalculation_count("upstream-1", SECOND), 1);
    assert_eq!(analysis.request_count("upstream-1", SECOND), 0);
    // Live counters keep working after shutdown.
    assert_eq!(analysis.continuous_failure_count("upstream-1"), 2);
}

#[test]
fn concurrent_writers_lose_no_events() {
    let analysis = Arc::new(Analysis::default());
    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let analysis = analysis.clone();
            std::thread::spawn(move || {
                let key = format!("upstream-{}", worker % 2);
                for _ in 0..500 {
                    analysis.request(&key);
                    analysis.response(&key, Duration::from_millis(1));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(analysis.keys(), vec!["upstream-0", "upstream-1"]);
    assert_eq!(analysis.point("upstream-0").requests(), 2000);
    assert_eq!(analysis.point("upstream-1").successes(), 2000);
}
