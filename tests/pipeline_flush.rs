use pixelgw::clock::now_millis;
use pixelgw::config::DataOutputFilter;
use pixelgw::packet::ScanEvent;
use pixelgw::pipeline::{start_pipeline, Dispatch, PipelineConfig, TrafficPolicy};
use std::time::Duration;
use tokio::sync::mpsc;

const DIRECT: &str = "AFFD0200005EF94AA9F15878AA1A776C7E906AE707158B06966AB6F5B9";
const RELAYED: &str = "C6FC0200005EF94AA9F15878AA1A776C7E906AE707158B06966AB6F5B9";
const HB: &str = "AFFD0000EE02015DDEEDCD9D8A76AEEF895320C1001E04460008000000";
const ACK: &str = "C6FC0000EE070000000000000000000000000000000000000000000000";

fn base_cfg() -> PipelineConfig {
    PipelineConfig {
        filter_window_ms: 20,
        management_window_ms: 50,
        tick_ms: 30,
    }
}

fn scan(payload: &str) -> ScanEvent {
    ScanEvent::new(payload, "AA:BB:CC:DD:EE:FF", -55, now_millis())
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Dispatch>) -> Dispatch {
    tokio::time::timeout(Duration::from_millis(500), async { rx.recv().await })
        .await
        .expect("timeout waiting for dispatch")
        .expect("chan closed")
}

/// Collect everything dispatched within `window`.
async fn drain(rx: &mut mpsc::UnboundedReceiver<Dispatch>, window: Duration) -> Vec<Dispatch> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(d)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        out.push(d);
    }
    out
}

#[tokio::test]
async fn duplicate_receptions_forward_once() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = start_pipeline(base_cfg(), TrafficPolicy::default(), tx);
    for _ in 0..5 {
        handle.ingest(scan(DIRECT));
    }

    let first = next(&mut rx).await;
    match first {
        Dispatch::DirectPixels(v) => assert_eq!(v.len(), 1),
        other => panic!("expected direct pixels, got {:?}", other),
    }
    let rest = drain(&mut rx, Duration::from_millis(150)).await;
    assert!(rest.is_empty(), "unexpected extra dispatch: {:?}", rest);

    let stats = handle.snapshot().await.expect("stats");
    assert_eq!(stats.received, 5);
    assert_eq!(stats.dropped, 4);
    assert_eq!(stats.pending, 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn management_traffic_waits_longer_than_data() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = start_pipeline(base_cfg(), TrafficPolicy::default(), tx);
    handle.ingest(scan(HB));
    handle.ingest(scan(RELAYED));

    let first = next(&mut rx).await;
    assert!(matches!(first, Dispatch::Upload(ref v) if v.len() == 1), "got {:?}", first);

    let later = drain(&mut rx, Duration::from_millis(200)).await;
    assert!(later.iter().any(|d| matches!(d, Dispatch::Heartbeats(v) if v.len() == 1)));
    assert!(later
        .iter()
        .any(|d| matches!(d, Dispatch::Bridges(s) if s.len() == 1 && s[0].id == "AEEF895320C1")));
    handle.shutdown().await;
}

#[tokio::test]
async fn disabled_edge_traffic_never_reaches_sets() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let policy = TrafficPolicy {
        enable_edge: false,
        ..TrafficPolicy::default()
    };
    let handle = start_pipeline(base_cfg(), policy, tx);
    handle.ingest(scan(HB));
    let out = drain(&mut rx, Duration::from_millis(200)).await;
    assert!(out.is_empty());
    let stats = handle.snapshot().await.expect("stats");
    assert_eq!(stats.dropped, 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn bridges_only_filter_skips_direct_pixels() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let policy = TrafficPolicy {
        filter: DataOutputFilter::BridgesOnly,
        ..TrafficPolicy::default()
    };
    let handle = start_pipeline(base_cfg(), policy, tx);
    handle.ingest(scan(DIRECT));
    handle.ingest(scan(RELAYED));
    let out = drain(&mut rx, Duration::from_millis(200)).await;
    assert!(!out.iter().any(|d| matches!(d, Dispatch::DirectPixels(_))));
    assert!(out.iter().any(|d| matches!(d, Dispatch::Upload(v) if v[0].payload == RELAYED)));
    handle.shutdown().await;
}

#[tokio::test]
async fn acks_become_log_lines() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = start_pipeline(base_cfg(), TrafficPolicy::default(), tx);
    handle.ingest(scan(ACK));
    match next(&mut rx).await {
        Dispatch::Acks(lines) => {
            assert_eq!(lines, vec![format!("WLT_INFO: ReceivedAction={}", ACK)]);
        }
        other => panic!("expected acks, got {:?}", other),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn garbage_is_counted_not_forwarded() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = start_pipeline(base_cfg(), TrafficPolicy::default(), tx);
    handle.ingest(scan("AFFD00"));
    handle.ingest(scan("not hex at all"));
    let out = drain(&mut rx, Duration::from_millis(100)).await;
    assert!(out.is_empty());
    let stats = handle.snapshot().await.expect("stats");
    assert_eq!(stats.unrecognized, 2);
    handle.shutdown().await;
}
