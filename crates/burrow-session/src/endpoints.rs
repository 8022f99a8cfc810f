//! Client endpoints — usable immediately, backed by a "session ready"
//! latch.
//!
//! All three are created synchronously when dilation starts; operations
//! on them park until the controller resolves the latch with a session
//! handle (or with the reason there will never be one).

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};

use crate::l3::{L3Handle, SessionError};
use crate::subchannel::Subchannel;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("peer does not advertise dilation support")]
    OldPeerCannotDilate,
    #[error("this endpoint may only be used once")]
    SingleUse,
    #[error("wormhole was closed")]
    WormholeClosed,
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub(crate) type LatchState = Option<Result<L3Handle, EndpointError>>;

/// One-shot broadcast with queued waiters: the session handle appears at
/// most once, and every waiter before or after sees the same result.
#[derive(Clone)]
pub(crate) struct L3Latch {
    state: watch::Receiver<LatchState>,
}

pub(crate) fn latch() -> (watch::Sender<LatchState>, L3Latch) {
    let (tx, rx) = watch::channel(None);
    (tx, L3Latch { state: rx })
}

impl L3Latch {
    pub async fn wait(&self) -> Result<L3Handle, EndpointError> {
        let mut state = self.state.clone();
        loop {
            {
                let value = state.borrow_and_update();
                if let Some(result) = value.as_ref() {
                    return result.clone();
                }
            }
            if state.changed().await.is_err() {
                return Err(EndpointError::WormholeClosed);
            }
        }
    }
}

/// Single-use endpoint for subchannel id 0.
pub struct ControlEndpoint {
    latch: L3Latch,
    used: AtomicBool,
}

impl ControlEndpoint {
    pub(crate) fn new(latch: L3Latch) -> ControlEndpoint {
        ControlEndpoint {
            latch,
            used: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self) -> Result<Subchannel, EndpointError> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(EndpointError::SingleUse);
        }
        let l3 = self.latch.wait().await?;
        Ok(l3.open_control_channel().await?)
    }
}

/// Each `connect` opens a fresh outbound subchannel.
pub struct SubchannelConnector {
    latch: L3Latch,
}

impl SubchannelConnector {
    pub(crate) fn new(latch: L3Latch) -> SubchannelConnector {
        SubchannelConnector { latch }
    }

    pub async fn connect(&self) -> Result<Subchannel, EndpointError> {
        let l3 = self.latch.wait().await?;
        Ok(l3.open_subchannel().await?)
    }
}

/// Single-use endpoint yielding each peer-initiated subchannel.
pub struct SubchannelListener {
    latch: L3Latch,
    used: AtomicBool,
}

impl SubchannelListener {
    pub(crate) fn new(latch: L3Latch) -> SubchannelListener {
        SubchannelListener {
            latch,
            used: AtomicBool::new(false),
        }
    }

    pub async fn listen(&self) -> Result<IncomingSubchannels, EndpointError> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(EndpointError::SingleUse);
        }
        let l3 = self.latch.wait().await?;
        Ok(IncomingSubchannels {
            incoming: l3.inbound_subchannels().await?,
        })
    }
}

#[derive(Debug)]
pub struct IncomingSubchannels {
    incoming: mpsc::UnboundedReceiver<Subchannel>,
}

impl IncomingSubchannels {
    /// The next subchannel the peer opened, in arrival order. `None`
    /// once the session is gone.
    pub async fn accept(&mut self) -> Option<Subchannel> {
        self.incoming.recv().await
    }
}
