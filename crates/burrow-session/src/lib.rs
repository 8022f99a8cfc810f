//! burrow-session — the durable session machinery of the burrow
//! transport core.
//!
//! Layering, bottom up: a raw [`transport::Pipe`] carries one L2's
//! encrypted frames; the [`l3`] session survives L2 replacement and
//! multiplexes [`subchannel`]s over it; the connector races candidate
//! pipes per generation; the [`dilator`] controller resolves roles and
//! wires everything to the three client [`endpoints`].

pub mod dilator;
pub mod endpoints;
pub mod l3;
pub mod subchannel;
pub mod transport;

mod connector;
mod l2;
mod seen;

pub use dilator::{DilationEndpoints, Dilator, VersionInfo, WormholeChannel};
pub use endpoints::{
    ControlEndpoint, EndpointError, IncomingSubchannels, SubchannelConnector, SubchannelListener,
};
pub use l3::{L3Handle, L3Notice, L3Session, SessionError};
pub use subchannel::{
    CloseCause, Producer, ProtocolViolation, Subchannel, SubchannelEvent, SubchannelState,
};
pub use transport::{BoxPipe, Pipe};

pub use burrow_core::{DilationConfig, Record, Role, SessionKeys, SubchannelId};
