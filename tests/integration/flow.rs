use crate::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use burrow_session::{L3Session, Producer};

/// Records the pause/resume traffic a session sends it.
#[derive(Default)]
struct RecordingProducer {
    paused: AtomicBool,
    resumes: AtomicUsize,
}

impl Producer for RecordingProducer {
    fn pause_producing(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume_producing(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    expect(what, async {
        while !condition() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
}

/// Filling the unacknowledged backlog pauses a streaming producer;
/// draining it through ACKs resumes it.
#[tokio::test]
async fn producers_pause_at_the_high_watermark_and_resume_after_acks() {
    init_tracing();
    let config = DilationConfig {
        outbound_high_watermark: 4 * 1024,
        outbound_low_watermark: 1024,
        ..DilationConfig::default()
    };
    let (leader, _notices) = L3Session::spawn(
        Role::Leader,
        &SessionKeys::derive(&MASTER_KEY, Role::Leader),
        config,
    );

    let subchannel = expect("open", leader.open_subchannel()).await.unwrap();
    let producer = Arc::new(RecordingProducer::default());
    subchannel.register_producer(producer.clone(), true);

    // No connection is attached, so every write stays queued.
    subchannel.write(vec![0u8; 8 * 1024]);
    wait_until("producer paused", || producer.paused.load(Ordering::SeqCst)).await;

    // Attach a peer that acknowledges everything; the backlog drains
    // below the low watermark and the producer resumes.
    let (near, far) = tokio::io::duplex(64 * 1024);
    leader.l2_connected(near);
    let mut raw = RawPeer::new(far, Role::Follower);
    loop {
        let (seqnum, record) = raw.recv_record().await;
        raw.send_record(Record::Ack {
            acked_seqnum: seqnum,
        })
        .await;
        if matches!(record, Record::Data { .. }) {
            break;
        }
    }

    wait_until("producer resumed", || {
        !producer.paused.load(Ordering::SeqCst) && producer.resumes.load(Ordering::SeqCst) > 0
    })
    .await;
}

/// A pull (non-streaming) producer never hears pause, only resume.
#[tokio::test]
async fn pull_producers_are_never_paused() {
    init_tracing();
    let config = DilationConfig {
        outbound_high_watermark: 1024,
        outbound_low_watermark: 256,
        ..DilationConfig::default()
    };
    let (leader, _notices) = L3Session::spawn(
        Role::Leader,
        &SessionKeys::derive(&MASTER_KEY, Role::Leader),
        config,
    );

    let subchannel = expect("open", leader.open_subchannel()).await.unwrap();
    let producer = Arc::new(RecordingProducer::default());
    subchannel.register_producer(producer.clone(), false);

    subchannel.write(vec![0u8; 4 * 1024]);

    // Barrier: a second open proves the session processed the write
    // (and would have paused the producer if it were streaming).
    let _other = expect("barrier", leader.open_subchannel()).await.unwrap();
    assert!(!producer.paused.load(Ordering::SeqCst));
}
