use std::{sync::Arc, time::Duration};

use tps_core::{
    AuditRecord, AuditSettings, AuditTrail, BackgroundTasks, FlushScheduler, LogExpiry,
    MemoryAuditSink, Outcome, events,
};

fn trail(sink: &MemoryAuditSink, flush_interval: Duration) -> Arc<AuditTrail> {
    let settings = AuditSettings {
        buffer_capacity: 4096,
        flush_interval,
        max_file_size: 0,
        rotation_interval: Duration::ZERO,
        ..AuditSettings::default()
    };
    let trail = AuditTrail::new(Box::new(sink.clone()), &settings, None).expect("trail");
    trail.open().unwrap();
    Arc::new(trail)
}

fn record(detail: &str) -> AuditRecord {
    AuditRecord::new(events::TOKEN_AUTH, "operator", Outcome::Success, detail)
}

#[tokio::test]
async fn timer_flushes_pending_records() {
    let sink = MemoryAuditSink::new();
    let trail = trail(&sink, Duration::from_secs(1));
    let handle = FlushScheduler::new(Arc::clone(&trail)).spawn();

    trail.append(&record("queued")).unwrap();
    assert!(sink.chunks().is_empty());
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(sink.chunks().len(), 1);
    assert_eq!(trail.unflushed_bytes(), 0);

    trail.set_flush_interval(0);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("timer exits")
        .unwrap();
}

#[tokio::test]
async fn zero_interval_interrupts_a_long_sleep() {
    let sink = MemoryAuditSink::new();
    let trail = trail(&sink, Duration::from_secs(3600));
    let handle = FlushScheduler::new(Arc::clone(&trail)).spawn();
    tokio::time::sleep(Duration::from_millis(50)).await;

    trail.append(&record("never timed")).unwrap();
    trail.set_flush_interval(0);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("timer exits without another cycle")
        .unwrap();
    assert!(sink.chunks().is_empty());
}

#[tokio::test]
async fn zero_interval_never_starts() {
    let sink = MemoryAuditSink::new();
    let trail = trail(&sink, Duration::ZERO);
    tokio::time::timeout(
        Duration::from_secs(1),
        FlushScheduler::new(Arc::clone(&trail)).run(),
    )
    .await
    .expect("returns immediately");
}

#[tokio::test]
async fn shutdown_stops_timers_then_closes_trail() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let sink = MemoryAuditSink::new();
    let trail = trail(&sink, Duration::from_secs(3600));
    let expiry = Arc::new(LogExpiry::new(
        dir.path().join("audit.log"),
        Duration::from_secs(86_400),
    ));
    let tasks = BackgroundTasks::spawn(Arc::clone(&trail), Some(Arc::clone(&expiry)));

    trail.append(&record("flushed on close")).unwrap();
    tokio::time::timeout(Duration::from_secs(5), tasks.shutdown())
        .await
        .expect("shutdown completes")
        .unwrap();

    assert!(!trail.is_open());
    assert!(!sink.is_open());
    assert!(sink.contents().contains("flushed on close"));
    assert!(trail.flush_interval().is_zero());
    assert!(expiry.expiration().is_zero());
}
