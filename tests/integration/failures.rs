use crate::*;

use bytes::Bytes;
use burrow_session::{
    CloseCause, EndpointError, ProtocolViolation, SubchannelEvent,
};
use tokio::sync::{mpsc, oneshot};

/// A peer that advertises `can-dilate: 0` makes every endpoint fail,
/// without disturbing the rest of the wormhole.
#[tokio::test]
async fn old_peer_fails_all_endpoints() {
    init_tracing();
    let (outgoing_tx, _outgoing_rx) = mpsc::unbounded_channel();
    let (_incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (versions_tx, versions_rx) = oneshot::channel();
    let channel = WormholeChannel {
        outgoing: outgoing_tx,
        incoming: incoming_rx,
        versions: versions_rx,
        master_key: MASTER_KEY,
    };
    versions_tx
        .send(VersionInfo {
            our_side: "bbbb".to_string(),
            their_side: "aaaa".to_string(),
            peer_versions: serde_json::json!({ "can-dilate": 0 }),
        })
        .unwrap();

    let (dilator, endpoints) = Dilator::start(channel, fast_config());
    dilator.dilate();

    for error in [
        expect("control", endpoints.control.connect()).await.err(),
        expect("outbound", endpoints.outbound.connect()).await.err(),
        expect("inbound", endpoints.inbound.listen()).await.err(),
    ] {
        assert_eq!(error, Some(EndpointError::OldPeerCannotDilate));
    }
}

/// Misusing one subchannel surfaces a violation to its owner only;
/// traffic on a sibling subchannel is unaffected.
#[tokio::test]
async fn violations_are_isolated_to_their_subchannel() -> anyhow::Result<()> {
    let (alice, bob) = dilated_pair(fast_config());
    let mut incoming = expect("listener", bob.endpoints.inbound.listen()).await?;

    let mut misused = expect("misused", alice.endpoints.outbound.connect()).await?;
    let healthy = expect("healthy", alice.endpoints.outbound.connect()).await?;

    // Close twice: the second close is illegal while closing.
    misused.lose_connection();
    misused.lose_connection();
    match expect("violation event", misused.next_event()).await {
        Some(SubchannelEvent::Violation(ProtocolViolation::LateInput { .. })) => {}
        other => panic!("expected a late-input violation, got {other:?}"),
    }

    // The sibling still works end to end.
    healthy.write(&b"still alive"[..]);
    let mut first = expect("first subchannel", incoming.accept()).await.unwrap();
    let mut second = expect("second subchannel", incoming.accept()).await.unwrap();
    // The misused stream closes cleanly on Bob's side.
    assert_eq!(
        expect("bob close", first.next_event()).await,
        Some(SubchannelEvent::Closed(CloseCause::Clean))
    );
    assert_eq!(
        expect("sibling data", second.next_event()).await,
        Some(SubchannelEvent::Data(Bytes::from_static(b"still alive")))
    );
    Ok(())
}

/// Writing after a local close is a protocol error reported to the
/// application, not a session failure.
#[tokio::test]
async fn write_after_close_reports_violation() -> anyhow::Result<()> {
    let (alice, bob) = dilated_pair(fast_config());
    let _listener = expect("listener", bob.endpoints.inbound.listen()).await?;

    let mut subchannel = expect("connect", alice.endpoints.outbound.connect()).await?;
    subchannel.lose_connection();
    subchannel.write(&b"too late"[..]);

    match expect("violation", subchannel.next_event()).await {
        Some(SubchannelEvent::Violation(ProtocolViolation::LateInput { id: 1, .. })) => {}
        other => panic!("expected late-input violation, got {other:?}"),
    }
    Ok(())
}

/// Shutting the controller down closes every subchannel with a
/// connection-lost cause and fails parked endpoint waiters.
#[tokio::test]
async fn shutdown_tears_everything_down() -> anyhow::Result<()> {
    let (alice, _bob) = dilated_pair(fast_config());

    let mut subchannel = expect("connect", alice.endpoints.outbound.connect()).await?;
    alice.dilator.shutdown();

    assert_eq!(
        expect("connection-lost close", subchannel.next_event()).await,
        Some(SubchannelEvent::Closed(CloseCause::ConnectionLost))
    );

    match expect("post-shutdown connect", alice.endpoints.outbound.connect()).await {
        Err(EndpointError::Session(_)) => {}
        other => panic!("expected a session error after shutdown, got {other:?}"),
    }
    Ok(())
}
