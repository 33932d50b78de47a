//! End-to-end tests wiring two `Tunnel`s over an in-process duplex pair,
//! standing in for a real TCP/TLS transport.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tunnel_core::{BoxedTransport, Channel, Tunnel};

fn paired_transports() -> (BoxedTransport, BoxedTransport) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Box::new(a), Box::new(b))
}

#[tokio::test]
async fn data_sent_on_one_side_arrives_in_order_on_the_other() {
    let (transport_a, transport_b) = paired_transports();

    let (opened_tx, opened_rx) = oneshot::channel();
    let opened_tx = Arc::new(std::sync::Mutex::new(Some(opened_tx)));
    let on_open: tunnel_core::OpenChannelCallback = Arc::new(move |channel: Channel| {
        if let Some(tx) = opened_tx.lock().unwrap().take() {
            let _ = tx.send(channel);
        }
    });

    let tunnel_a = Tunnel::new(transport_a, None, None);
    let tunnel_b = Tunnel::new(transport_b, Some(on_open), None);

    let channel_a = tunnel_a.open_channel(7, true, true).await.unwrap();
    let channel_b = opened_rx.await.unwrap();
    assert_eq!(channel_b.id(), 7);

    channel_a.send(b"ABC").await.unwrap();

    let received = channel_b.recv(16).await.unwrap();
    assert_eq!(&received[..], b"ABC");
}

#[tokio::test]
async fn remote_close_is_observed_after_all_preceding_data() {
    let (transport_a, transport_b) = paired_transports();

    let (opened_tx, opened_rx) = oneshot::channel();
    let opened_tx = Arc::new(std::sync::Mutex::new(Some(opened_tx)));
    let on_open: tunnel_core::OpenChannelCallback = Arc::new(move |channel: Channel| {
        if let Some(tx) = opened_tx.lock().unwrap().take() {
            let _ = tx.send(channel);
        }
    });

    let tunnel_a = Tunnel::new(transport_a, None, None);
    let tunnel_b = Tunnel::new(transport_b, Some(on_open), None);

    let channel_a = tunnel_a.open_channel(3, true, true).await.unwrap();
    let channel_b = opened_rx.await.unwrap();

    for _ in 0..100 {
        channel_a.send(b"x").await.unwrap();
    }
    tunnel_a.close_channel(3, true, true).await.unwrap();

    let mut total = 0usize;
    loop {
        let chunk = channel_b.recv(16).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        total += chunk.len();
    }
    assert_eq!(total, 100);

    // give tunnel_b's monitor a moment to process the CloseChannel frame
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = tunnel_b.stats().await;
    assert_eq!(stats.open_channels, 0);
    assert_eq!(stats.closed_channels, 1);

    // id reuse: a fresh open_channel(3) on the originating side succeeds
    let reopened = tunnel_a.open_channel(3, true, true).await;
    assert!(reopened.is_ok());
}

#[tokio::test]
async fn duplicate_open_is_rejected_under_strict_and_idempotent_otherwise() {
    let (transport_a, _transport_b) = paired_transports();
    let tunnel = Tunnel::new(transport_a, None, None);

    let first = tunnel.open_channel(1, false, true).await.unwrap();
    let err = tunnel.open_channel(1, false, true).await.unwrap_err();
    assert!(matches!(err, tunnel_core::TunnelError::DuplicateChannel(1)));

    let same = tunnel.open_channel(1, false, false).await.unwrap();
    assert_eq!(first.id(), same.id());
}

#[tokio::test]
async fn unknown_close_is_rejected_under_strict_and_a_noop_otherwise() {
    let (transport_a, _transport_b) = paired_transports();
    let tunnel = Tunnel::new(transport_a, None, None);

    let err = tunnel.close_channel(42, false, true).await.unwrap_err();
    assert!(matches!(err, tunnel_core::TunnelError::UnknownChannel(42)));

    assert!(tunnel.close_channel(42, false, false).await.is_ok());
}

#[tokio::test]
async fn allocates_channel_ids_like_a_server_would() {
    // Sanity check that nothing in Tunnel itself prevents a caller from
    // layering a monotonic id allocator on top, as the Server role does.
    let (transport_a, _transport_b) = paired_transports();
    let tunnel = Tunnel::new(transport_a, None, None);
    let next_id = AtomicU16::new(0);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        tunnel.open_channel(id, false, true).await.unwrap();
        ids.push(id);
    }
    assert_eq!(ids, vec![0, 1, 2]);
}
