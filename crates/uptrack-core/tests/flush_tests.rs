use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uptrack_core::{DeliveryError, FlushScheduler, FlushSettings, Outbox};
use uptrack_test_utils::{open_records, ScriptedTransport};

fn settings(batch_size: usize) -> FlushSettings {
    FlushSettings {
        batch_size,
        period: Duration::from_millis(10),
        drain_backoff: Duration::from_millis(1),
        drain_max_rounds: 16,
    }
}

fn loaded_outbox(seconds: impl IntoIterator<Item = u64>) -> Arc<Outbox> {
    let outbox = Arc::new(Outbox::in_memory());
    for record in open_records(seconds) {
        outbox.enqueue(record).unwrap();
    }
    outbox
}

fn pending_seconds(outbox: &Outbox) -> Vec<u64> {
    outbox.pending().iter().map(|r| r.run_seconds).collect()
}

#[tokio::test]
async fn kth_failure_acks_exactly_the_prefix_before_it() {
    for k in 1..=5 {
        let outbox = loaded_outbox([60, 120, 180, 240, 300]);
        let transport = Arc::new(ScriptedTransport::fail_at(k, DeliveryError::Status(503)));
        let scheduler = FlushScheduler::new(Arc::clone(&outbox), transport.clone(), settings(8));

        let outcome = scheduler.flush_once().await;

        assert_eq!(outcome.delivered, k - 1, "k = {k}");
        assert_eq!(outcome.attempted, k);
        assert_eq!(outcome.failure, Some(DeliveryError::Status(503)));
        assert_eq!(transport.attempts(), k, "nothing attempted past the failure");
        let expected: Vec<u64> = [60, 120, 180, 240, 300].into_iter().skip(k - 1).collect();
        assert_eq!(pending_seconds(&outbox), expected);
    }
}

#[tokio::test]
async fn batch_size_bounds_one_cycle() {
    let outbox = loaded_outbox((1..=10).map(|i| i * 60));
    let transport = Arc::new(ScriptedTransport::always_ok());
    let scheduler = FlushScheduler::new(Arc::clone(&outbox), transport.clone(), settings(4));

    let outcome = scheduler.flush_once().await;

    assert_eq!(outcome.delivered, 4);
    assert_eq!(outcome.remaining, 6);
    assert_eq!(transport.delivered_seconds(), vec![60, 120, 180, 240]);
}

#[tokio::test]
async fn empty_outbox_is_an_idle_cycle() {
    let outbox = Arc::new(Outbox::in_memory());
    let transport = Arc::new(ScriptedTransport::always_ok());
    let scheduler = FlushScheduler::new(outbox, transport.clone(), settings(8));

    assert!(scheduler.flush_once().await.is_idle());
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn first_attempt_rejected_then_delivered_next_cycle() {
    let outbox = loaded_outbox([60]);
    let transport = Arc::new(ScriptedTransport::new([Err(DeliveryError::Status(500))]));
    let scheduler = FlushScheduler::new(Arc::clone(&outbox), transport.clone(), settings(8));

    let first = scheduler.flush_once().await;
    assert_eq!(first.delivered, 0);
    assert_eq!(outbox.delivered(), 0);
    assert_eq!(outbox.len(), 1);

    let second = scheduler.flush_once().await;
    assert_eq!(second.delivered, 1);
    assert_eq!(outbox.delivered(), 1);
    assert!(outbox.is_empty());
}

#[tokio::test]
async fn drain_stops_when_a_round_makes_no_progress() {
    let outbox = loaded_outbox([60, 120, 180]);
    let transport = Arc::new(ScriptedTransport::always_failing(DeliveryError::Offline));
    let scheduler = FlushScheduler::new(Arc::clone(&outbox), transport.clone(), settings(8));

    let report = scheduler.drain().await;

    assert_eq!(report.rounds, 1);
    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, 3);
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn drain_empties_across_rounds_with_intermittent_failures() {
    let outbox = loaded_outbox((1..=6).map(|i| i * 60));
    let transport = Arc::new(ScriptedTransport::new([
        Ok(()),
        Err(DeliveryError::Timeout(8000)),
        Ok(()),
        Ok(()),
        Err(DeliveryError::SimulatedServerFailure),
    ]));
    let scheduler = FlushScheduler::new(Arc::clone(&outbox), transport.clone(), settings(8));

    let report = scheduler.drain().await;

    assert!(outbox.is_empty());
    assert_eq!(report.delivered, 6);
    assert_eq!(transport.delivered_seconds(), (1..=6).map(|i| i * 60).collect::<Vec<_>>());
}

#[tokio::test]
async fn drain_respects_round_limit() {
    let outbox = loaded_outbox((1..=10).map(|i| i * 60));
    let transport = Arc::new(ScriptedTransport::always_ok());
    let scheduler = FlushScheduler::new(
        Arc::clone(&outbox),
        transport,
        FlushSettings {
            drain_max_rounds: 2,
            ..settings(3)
        },
    );

    let report = scheduler.drain().await;

    assert_eq!(report.rounds, 2);
    assert_eq!(report.delivered, 6);
    assert_eq!(report.remaining, 4);
}

#[tokio::test]
async fn run_loop_keeps_up_when_period_is_shorter_than_cadence() {
    let outbox = Arc::new(Outbox::in_memory());
    let transport = Arc::new(ScriptedTransport::always_ok());
    let scheduler = Arc::new(FlushScheduler::new(
        Arc::clone(&outbox),
        transport.clone(),
        settings(8),
    ));
    let (stop, rx) = watch::channel(false);
    let task = Arc::clone(&scheduler).spawn(rx);

    for record in open_records((1..=5).map(|i| i * 60)) {
        outbox.enqueue(record).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outbox.is_empty(), "flushed before the next emission");
    }

    stop.send(true).unwrap();
    let report = task.await.unwrap();
    assert_eq!(report.delivered, 5);
    assert_eq!(report.drain.rounds, 0);
    assert_eq!(transport.delivered_seconds(), vec![60, 120, 180, 240, 300]);
}

#[tokio::test]
async fn shutdown_drains_what_the_loop_left_behind() {
    let outbox = loaded_outbox([60, 120, 180]);
    let transport = Arc::new(ScriptedTransport::always_ok());
    let scheduler = Arc::new(FlushScheduler::new(
        Arc::clone(&outbox),
        transport,
        FlushSettings {
            period: Duration::from_secs(3600),
            ..settings(2)
        },
    ));
    let (stop, rx) = watch::channel(false);
    let task = Arc::clone(&scheduler).spawn(rx);

    stop.send(true).unwrap();
    let report = task.await.unwrap();

    assert_eq!(report.cycles, 0);
    assert_eq!(report.drain.delivered, 3);
    assert!(outbox.is_empty());
}

#[tokio::test]
async fn dropped_shutdown_sender_also_stops_the_loop() {
    let outbox = loaded_outbox([60]);
    let scheduler = Arc::new(FlushScheduler::new(
        Arc::clone(&outbox),
        Arc::new(ScriptedTransport::always_ok()),
        FlushSettings {
            period: Duration::from_secs(3600),
            ..settings(8)
        },
    ));
    let (stop, rx) = watch::channel(false);
    let task = Arc::clone(&scheduler).spawn(rx);

    drop(stop);
    let report = task.await.unwrap();
    assert_eq!(report.drain.delivered, 1);
}
