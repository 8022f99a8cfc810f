//! burrow integration test harness.
//!
//! Two in-process peers, cross-wired through an in-memory rendezvous
//! channel; candidate connections run over real loopback TCP. Session-
//! level scenarios that need a broken link use duplex pipes attached
//! directly to the durable session.

mod failures;
mod flow;
mod recovery;
mod sessions;

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

pub use burrow_core::frame::{FrameBuffer, FrameCipher};
pub use burrow_core::record::Record;
pub use burrow_session::{
    DilationConfig, DilationEndpoints, Dilator, Role, SessionKeys, VersionInfo, WormholeChannel,
};

pub const MASTER_KEY: [u8; 32] = [7u8; 32];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Short timers so connector-driven tests finish quickly.
pub fn fast_config() -> DilationConfig {
    DilationConfig {
        selection_delay: Duration::from_millis(50),
        connector_giveup: Duration::from_secs(10),
        ..DilationConfig::default()
    }
}

pub async fn expect<T>(what: &str, operation: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(10), operation)
        .await
        .unwrap_or_else(|_| panic!("timed out: {what}"))
}

pub struct Peer {
    pub dilator: Dilator,
    pub endpoints: DilationEndpoints,
}

/// Build two controllers whose rendezvous channels are cross-connected
/// and whose version exchange already completed. The first peer has the
/// greater side and therefore leads.
pub fn dilated_pair(config: DilationConfig) -> (Peer, Peer) {
    init_tracing();

    let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
    let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
    let (a_versions_tx, a_versions_rx) = oneshot::channel();
    let (b_versions_tx, b_versions_rx) = oneshot::channel();

    // A's outgoing mailbox traffic is B's incoming and vice versa.
    let a_channel = WormholeChannel {
        outgoing: a_out_tx,
        incoming: b_out_rx,
        versions: a_versions_rx,
        master_key: MASTER_KEY,
    };
    let b_channel = WormholeChannel {
        outgoing: b_out_tx,
        incoming: a_out_rx,
        versions: b_versions_rx,
        master_key: MASTER_KEY,
    };

    let versions = serde_json::json!({ "can-dilate": 1 });
    a_versions_tx
        .send(VersionInfo {
            our_side: "bbbb".to_string(),
            their_side: "aaaa".to_string(),
            peer_versions: versions.clone(),
        })
        .expect("controller dropped its version receiver");
    b_versions_tx
        .send(VersionInfo {
            our_side: "aaaa".to_string(),
            their_side: "bbbb".to_string(),
            peer_versions: versions,
        })
        .expect("controller dropped its version receiver");

    let (a_dilator, a_endpoints) = Dilator::start(a_channel, config.clone());
    let (b_dilator, b_endpoints) = Dilator::start(b_channel, config);
    a_dilator.dilate();
    b_dilator.dilate();

    (
        Peer {
            dilator: a_dilator,
            endpoints: a_endpoints,
        },
        Peer {
            dilator: b_dilator,
            endpoints: b_endpoints,
        },
    )
}

/// The raw end of a pipe attached to a session: speaks frames directly
/// with the opposite role's keys.
pub struct RawPeer {
    pub pipe: DuplexStream,
    pub cipher: FrameCipher,
    pub parser: FrameBuffer,
    pub next_seqnum: u32,
}

impl RawPeer {
    pub fn new(pipe: DuplexStream, role: Role) -> RawPeer {
        RawPeer {
            pipe,
            cipher: FrameCipher::new(&SessionKeys::derive(&MASTER_KEY, role)),
            parser: FrameBuffer::new(),
            next_seqnum: 0,
        }
    }

    pub async fn recv_record(&mut self) -> (u32, Record) {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(raw) = self.parser.next_frame() {
                let record = self
                    .cipher
                    .open_record(raw.seqnum, &raw.ciphertext)
                    .expect("failed to open a frame from the session");
                return (raw.seqnum, record);
            }
            let n = expect("frame from the session", self.pipe.read(&mut chunk))
                .await
                .expect("pipe read failed");
            assert_ne!(n, 0, "pipe closed while expecting a frame");
            self.parser.extend(&chunk[..n]);
        }
    }

    pub async fn send_record(&mut self, record: Record) -> u32 {
        let seqnum = self.next_seqnum;
        self.next_seqnum += 1;
        self.send_record_with_seqnum(seqnum, record).await;
        seqnum
    }

    pub async fn send_record_with_seqnum(&mut self, seqnum: u32, record: Record) {
        let frame = self.cipher.seal_record(seqnum, &record).unwrap();
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.pipe.write_all(bytes).await.unwrap();
        self.pipe.flush().await.unwrap();
    }
}
