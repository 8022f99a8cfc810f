use crate::*;

use bytes::Bytes;
use burrow_session::{CloseCause, EndpointError, SubchannelEvent};

/// The full path: two controllers elect roles, race candidates over
/// loopback TCP, and a subchannel carries open, data, close in order.
#[tokio::test]
async fn open_data_close_in_order() {
    let (alice, bob) = dilated_pair(fast_config());

    let mut incoming = expect("inbound listener", bob.endpoints.inbound.listen())
        .await
        .unwrap();

    let mut sender = expect("outbound connect", alice.endpoints.outbound.connect())
        .await
        .unwrap();
    sender.write(&b"hello"[..]);
    sender.lose_connection();

    let mut receiver = expect("peer-initiated subchannel", incoming.accept())
        .await
        .unwrap();
    // Alice has the greater side, leads, and allocates odd ids.
    assert_eq!(receiver.id(), 1);

    assert_eq!(
        expect("data event", receiver.next_event()).await,
        Some(SubchannelEvent::Data(Bytes::from_static(b"hello")))
    );
    assert_eq!(
        expect("close event", receiver.next_event()).await,
        Some(SubchannelEvent::Closed(CloseCause::Clean))
    );

    // Bob answered the close, so Alice's side finishes too.
    assert_eq!(
        expect("sender close event", sender.next_event()).await,
        Some(SubchannelEvent::Closed(CloseCause::Clean))
    );
}

#[tokio::test]
async fn subchannel_ids_follow_role_parity() {
    let (alice, bob) = dilated_pair(fast_config());

    let a1 = expect("a1", alice.endpoints.outbound.connect()).await.unwrap();
    let a2 = expect("a2", alice.endpoints.outbound.connect()).await.unwrap();
    let b1 = expect("b1", bob.endpoints.outbound.connect()).await.unwrap();
    let b2 = expect("b2", bob.endpoints.outbound.connect()).await.unwrap();

    assert_eq!((a1.id(), a2.id()), (1, 3));
    assert_eq!((b1.id(), b2.id()), (2, 4));
}

#[tokio::test]
async fn control_channel_carries_traffic_both_ways() -> anyhow::Result<()> {
    let (alice, bob) = dilated_pair(fast_config());

    let mut a_control = expect("alice control", alice.endpoints.control.connect()).await?;
    let mut b_control = expect("bob control", bob.endpoints.control.connect()).await?;
    assert_eq!(a_control.id(), 0);
    assert_eq!(b_control.id(), 0);

    a_control.write(&b"ping"[..]);
    assert_eq!(
        expect("control data at bob", b_control.next_event()).await,
        Some(SubchannelEvent::Data(Bytes::from_static(b"ping")))
    );

    b_control.write(&b"pong"[..]);
    assert_eq!(
        expect("control data at alice", a_control.next_event()).await,
        Some(SubchannelEvent::Data(Bytes::from_static(b"pong")))
    );

    // Second take of the control endpoint fails.
    match alice.endpoints.control.connect().await {
        Err(EndpointError::SingleUse) => {}
        other => panic!("expected single-use failure, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn write_sequence_arrives_as_one_write() {
    let (alice, bob) = dilated_pair(fast_config());
    let mut incoming = expect("listener", bob.endpoints.inbound.listen())
        .await
        .unwrap();
    let sender = expect("connect", alice.endpoints.outbound.connect())
        .await
        .unwrap();

    sender.write_sequence([&b"he"[..], &b"l"[..], &b"lo"[..]]);

    let mut receiver = expect("subchannel", incoming.accept()).await.unwrap();
    assert_eq!(
        expect("joined data", receiver.next_event()).await,
        Some(SubchannelEvent::Data(Bytes::from_static(b"hello")))
    );
}

/// Independent subchannels do not share ordering, but each preserves its
/// own; interleaved traffic on two streams arrives intact per stream.
#[tokio::test]
async fn two_subchannels_carry_independent_streams() -> anyhow::Result<()> {
    let (alice, bob) = dilated_pair(fast_config());
    let mut incoming = expect("listener", bob.endpoints.inbound.listen()).await?;

    let first = expect("first", alice.endpoints.outbound.connect()).await?;
    let second = expect("second", alice.endpoints.outbound.connect()).await?;

    for index in 0..5u8 {
        first.write(vec![b'a', index]);
        second.write(vec![b'b', index]);
    }

    let mut first_rx = expect("first subchannel", incoming.accept()).await.unwrap();
    let mut second_rx = expect("second subchannel", incoming.accept()).await.unwrap();
    assert_eq!(first_rx.id(), 1);
    assert_eq!(second_rx.id(), 3);

    for index in 0..5u8 {
        assert_eq!(
            expect("first stream data", first_rx.next_event()).await,
            Some(SubchannelEvent::Data(Bytes::from(vec![b'a', index])))
        );
        assert_eq!(
            expect("second stream data", second_rx.next_event()).await,
            Some(SubchannelEvent::Data(Bytes::from(vec![b'b', index])))
        );
    }
    Ok(())
}
