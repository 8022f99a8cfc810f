//! Per-stream lifecycle — the subchannel state machine and the
//! application-facing handle.
//!
//! The state machine is a pure transition function over plain data;
//! actions come back as values and are executed by the session driver.
//! A protocol violation is surfaced to the application that owns the
//! subchannel and logged; it never disturbs the session or its siblings.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use burrow_core::record::SubchannelId;

use crate::l3::SessionCommand;

/// A source of outbound writes that honours backpressure.
///
/// `streaming` producers (push) are paused and resumed; pull producers
/// only ever hear `resume_producing`.
pub trait Producer: Send + Sync {
    fn pause_producing(&self);
    fn resume_producing(&self);
    fn stop_producing(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubchannelState {
    Idle,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) enum SubchannelInput {
    RemoteOpen,
    RemoteData(Bytes),
    LocalData(Bytes),
    LocalClose,
    RemoteClose,
}

impl SubchannelInput {
    fn name(&self) -> &'static str {
        match self {
            SubchannelInput::RemoteOpen => "remote open",
            SubchannelInput::RemoteData(_) => "remote data",
            SubchannelInput::LocalData(_) => "local write",
            SubchannelInput::LocalClose => "local close",
            SubchannelInput::RemoteClose => "remote close",
        }
    }
}

/// What the driver must do after a transition. Actions are data; the
/// session executes them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SubchannelAction {
    /// Hand received bytes to the owning application.
    DeliverData(Bytes),
    /// Emit a DATA record for this subchannel.
    SendData(Bytes),
    /// Emit a CLOSE record for this subchannel.
    SendClose,
    /// Deregister; the application sees EOF.
    Finalize,
    /// Report an illegal input to the owner and the log.
    Violation(ProtocolViolation),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("subchannel {id}: {input} before open")]
    EarlyInput { id: SubchannelId, input: &'static str },
    #[error("subchannel {id}: duplicate remote open")]
    DuplicateOpen { id: SubchannelId },
    #[error("subchannel {id}: {input} while closing")]
    LateInput { id: SubchannelId, input: &'static str },
    #[error("subchannel {id}: {input} after close")]
    AfterClose { id: SubchannelId, input: &'static str },
}

/// The transition table. Initial state is `Idle`; `RemoteOpen` is the
/// sole legal way out of it.
pub(crate) fn transition(
    id: SubchannelId,
    state: SubchannelState,
    input: SubchannelInput,
) -> (SubchannelState, Vec<SubchannelAction>) {
    use SubchannelAction as A;
    use SubchannelInput as I;
    use SubchannelState as S;

    match (state, input) {
        (S::Idle, I::RemoteOpen) => (S::Open, vec![]),
        (S::Idle, input) => (
            S::Idle,
            vec![A::Violation(ProtocolViolation::EarlyInput {
                id,
                input: input.name(),
            })],
        ),

        (S::Open, I::RemoteOpen) => (
            S::Open,
            vec![A::Violation(ProtocolViolation::DuplicateOpen { id })],
        ),
        (S::Open, I::RemoteData(data)) => (S::Open, vec![A::DeliverData(data)]),
        (S::Open, I::LocalData(data)) => (S::Open, vec![A::SendData(data)]),
        (S::Open, I::LocalClose) => (S::Closing, vec![A::SendClose]),
        // Half-close: answer with our own CLOSE and finish immediately,
        // no lingering state.
        (S::Open, I::RemoteClose) => (S::Closed, vec![A::SendClose, A::Finalize]),

        (S::Closing, I::RemoteClose) => (S::Closed, vec![A::Finalize]),
        // Data in flight when we closed; the peer had not seen our CLOSE
        // yet. Dropped without comment.
        (S::Closing, I::RemoteData(_)) => (S::Closing, vec![]),
        (S::Closing, I::RemoteOpen) => (
            S::Closing,
            vec![A::Violation(ProtocolViolation::DuplicateOpen { id })],
        ),
        (S::Closing, input) => (
            S::Closing,
            vec![A::Violation(ProtocolViolation::LateInput {
                id,
                input: input.name(),
            })],
        ),

        (S::Closed, input) => (
            S::Closed,
            vec![A::Violation(ProtocolViolation::AfterClose {
                id,
                input: input.name(),
            })],
        ),
    }
}

/// Why a subchannel's event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Orderly CLOSE exchange with the peer.
    Clean,
    /// The session was torn down underneath the subchannel.
    ConnectionLost,
}

/// Delivered to the application owning a subchannel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubchannelEvent {
    Data(Bytes),
    Closed(CloseCause),
    Violation(ProtocolViolation),
}

/// Application handle to one subchannel.
///
/// Writes are accepted unconditionally and ride the session's ordered
/// record stream; backpressure reaches the application through its
/// registered [`Producer`], not through failed writes.
pub struct Subchannel {
    id: SubchannelId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: mpsc::UnboundedReceiver<SubchannelEvent>,
}

impl Subchannel {
    pub(crate) fn new(
        id: SubchannelId,
        commands: mpsc::UnboundedSender<SessionCommand>,
        events: mpsc::UnboundedReceiver<SubchannelEvent>,
    ) -> Subchannel {
        Subchannel {
            id,
            commands,
            events,
        }
    }

    pub fn id(&self) -> SubchannelId {
        self.id
    }

    /// Queue bytes for delivery to the peer.
    pub fn write(&self, data: impl Into<Bytes>) {
        let _ = self.commands.send(SessionCommand::LocalData {
            id: self.id,
            data: data.into(),
        });
    }

    /// Concatenate the pieces and send them as one write.
    pub fn write_sequence<I>(&self, pieces: I)
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut joined = BytesMut::new();
        for piece in pieces {
            joined.extend_from_slice(piece.as_ref());
        }
        self.write(joined.freeze());
    }

    /// Begin a graceful close: send CLOSE, then wait for the peer's.
    pub fn lose_connection(&self) {
        let _ = self
            .commands
            .send(SessionCommand::LocalClose { id: self.id });
    }

    /// Next data/closed/violation event. `None` after the session is
    /// gone and all buffered events have been drained.
    pub async fn next_event(&mut self) -> Option<SubchannelEvent> {
        self.events.recv().await
    }

    pub fn register_producer(&self, producer: Arc<dyn Producer>, streaming: bool) {
        let _ = self.commands.send(SessionCommand::RegisterProducer {
            id: self.id,
            producer,
            streaming,
        });
    }

    pub fn unregister_producer(&self) {
        let _ = self
            .commands
            .send(SessionCommand::UnregisterProducer { id: self.id });
    }
}

impl std::fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subchannel").field("id", &self.id).finish()
    }
}
