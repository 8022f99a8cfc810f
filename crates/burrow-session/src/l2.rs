//! L2 — a single encrypted framed connection.
//!
//! A fresh pipe proves knowledge of the session keys before it may carry
//! records: each side seals a fixed magic string (plus the generation)
//! under its outbound key on the reserved handshake seqnum. A peer that
//! opens and verifies it advances to negotiated. The leader later marks
//! exactly one negotiated candidate with a selection frame; only then do
//! records flow. Decrypted records never reach the session from an
//! unnegotiated pipe: the record loop is only ever started on the
//! selected candidate.
//!
//! Bad frames on an active connection are logged and dropped. An attacker
//! flooding noise must not kill the session.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use burrow_core::frame::{FrameBuffer, FrameCipher, HANDSHAKE_SEQNUM, SELECT_SEQNUM};

use crate::l3::SessionCommand;
use crate::transport::BoxPipe;

const HANDSHAKE_MAGIC: &[u8] = b"burrow handshake v1\n";
const SELECT_MAGIC: &[u8] = b"burrow selected v1\n";

#[derive(Debug, thiserror::Error)]
pub(crate) enum NegotiationError {
    #[error("transport error during negotiation: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport closed during negotiation")]
    Closed,
    #[error("peer handshake failed verification")]
    BadHandshake,
    #[error("unexpected frame before negotiation completed")]
    UnexpectedFrame,
}

fn negotiation_body(magic: &[u8], generation: u64) -> Vec<u8> {
    let mut body = Vec::with_capacity(magic.len() + 8);
    body.extend_from_slice(magic);
    body.extend_from_slice(&generation.to_le_bytes());
    body
}

pub(crate) fn handshake_frame(cipher: &FrameCipher, generation: u64) -> Bytes {
    cipher
        .seal_raw(HANDSHAKE_SEQNUM, &negotiation_body(HANDSHAKE_MAGIC, generation))
        .expect("handshake frame sealing failed")
}

pub(crate) fn select_frame(cipher: &FrameCipher, generation: u64) -> Bytes {
    cipher
        .seal_raw(SELECT_SEQNUM, &negotiation_body(SELECT_MAGIC, generation))
        .expect("selection frame sealing failed")
}

/// A candidate that has passed negotiation but not yet been selected.
///
/// The parser may already hold bytes read past the handshake; they are
/// carried into the active connection so nothing is lost.
pub(crate) struct NegotiatedPipe {
    pub pipe: BoxPipe,
    pub parser: FrameBuffer,
    pub rtt: Duration,
}

impl std::fmt::Debug for NegotiatedPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedPipe").field("rtt", &self.rtt).finish()
    }
}

/// Run the handshake exchange on a fresh pipe.
///
/// The elapsed time between sending our handshake and verifying the
/// peer's doubles as the RTT estimate used for selection.
pub(crate) async fn negotiate(
    mut pipe: BoxPipe,
    cipher: &FrameCipher,
    generation: u64,
) -> Result<NegotiatedPipe, NegotiationError> {
    let ours = handshake_frame(cipher, generation);
    pipe.write_all(&ours).await?;
    pipe.flush().await?;
    let started = Instant::now();

    let mut parser = FrameBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(raw) = parser.next_frame() {
            if raw.seqnum != HANDSHAKE_SEQNUM {
                return Err(NegotiationError::UnexpectedFrame);
            }
            let body = cipher
                .open_raw(raw.seqnum, &raw.ciphertext)
                .map_err(|_| NegotiationError::BadHandshake)?;
            if body != negotiation_body(HANDSHAKE_MAGIC, generation) {
                return Err(NegotiationError::BadHandshake);
            }
            return Ok(NegotiatedPipe {
                pipe,
                parser,
                rtt: started.elapsed(),
            });
        }
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Err(NegotiationError::Closed);
        }
        parser.extend(&chunk[..n]);
    }
}

/// Follower side: block until the leader's selection marker arrives on
/// this candidate. Record frames cannot legally precede the marker.
pub(crate) async fn await_selection(
    candidate: &mut NegotiatedPipe,
    cipher: &FrameCipher,
    generation: u64,
) -> Result<(), NegotiationError> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(raw) = candidate.parser.next_frame() {
            match raw.seqnum {
                SELECT_SEQNUM => {
                    let body = cipher
                        .open_raw(raw.seqnum, &raw.ciphertext)
                        .map_err(|_| NegotiationError::BadHandshake)?;
                    if body != negotiation_body(SELECT_MAGIC, generation) {
                        return Err(NegotiationError::BadHandshake);
                    }
                    return Ok(());
                }
                HANDSHAKE_SEQNUM => continue,
                _ => return Err(NegotiationError::UnexpectedFrame),
            }
        }
        let n = candidate.pipe.read(&mut chunk).await?;
        if n == 0 {
            return Err(NegotiationError::Closed);
        }
        candidate.parser.extend(&chunk[..n]);
    }
}

/// The selected connection while attached to a session.
///
/// Two tasks per connection: a reader that parses, decrypts, and forwards
/// records, and a writer that drains a queue of pre-sealed frames. Both
/// report loss to the session with this connection's id so a stale report
/// cannot detach a replacement.
pub(crate) struct ActiveL2 {
    pub id: u64,
    frames: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ActiveL2 {
    pub fn spawn(
        id: u64,
        pipe: BoxPipe,
        parser: FrameBuffer,
        cipher: FrameCipher,
        liveness_timeout: Duration,
        session: mpsc::UnboundedSender<SessionCommand>,
    ) -> ActiveL2 {
        let (read, write) = tokio::io::split(pipe);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            read,
            parser,
            cipher,
            liveness_timeout,
            id,
            session.clone(),
        ));
        let writer = tokio::spawn(write_loop(write, frames_rx, id, session));
        ActiveL2 {
            id,
            frames: frames_tx,
            reader,
            writer,
        }
    }

    /// Queue a sealed frame for transmission.
    pub fn send_frame(&self, frame: Bytes) {
        let _ = self.frames.send(frame);
    }

    /// Stop both halves and drop the transport.
    pub fn detach(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop(
    mut read: ReadHalf<BoxPipe>,
    mut parser: FrameBuffer,
    cipher: FrameCipher,
    liveness_timeout: Duration,
    id: u64,
    session: mpsc::UnboundedSender<SessionCommand>,
) {
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        while let Some(raw) = parser.next_frame() {
            match raw.seqnum {
                HANDSHAKE_SEQNUM | SELECT_SEQNUM => continue,
                seqnum => match cipher.open_record(seqnum, &raw.ciphertext) {
                    Ok(record) => {
                        let delivered = session.send(SessionCommand::Inbound {
                            l2_id: id,
                            seqnum,
                            record,
                        });
                        if delivered.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let prefix = raw.ciphertext.len().min(8);
                        tracing::warn!(
                            seqnum,
                            error = %e,
                            prefix = hex::encode(&raw.ciphertext[..prefix]),
                            "dropping undecipherable inbound frame"
                        );
                    }
                },
            }
        }
        let lost = match tokio::time::timeout(liveness_timeout, read.read(&mut chunk)).await {
            Err(_) => Some("liveness timeout"),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "connection read failed");
                Some("read error")
            }
            Ok(Ok(0)) => Some("closed by peer"),
            Ok(Ok(n)) => {
                parser.extend(&chunk[..n]);
                None
            }
        };
        if let Some(reason) = lost {
            tracing::info!(l2_id = id, reason, "connection lost");
            let _ = session.send(SessionCommand::L2Lost { l2_id: id });
            return;
        }
    }
}

async fn write_loop(
    mut write: WriteHalf<BoxPipe>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    id: u64,
    session: mpsc::UnboundedSender<SessionCommand>,
) {
    while let Some(frame) = frames.recv().await {
        let result = async {
            write.write_all(&frame).await?;
            write.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(error = %e, l2_id = id, "connection write failed");
            let _ = session.send(SessionCommand::L2Lost { l2_id: id });
            return;
        }
    }
}
