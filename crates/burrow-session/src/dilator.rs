//! Dilation controller — promotes a completed rendezvous handshake into
//! a durable session.
//!
//! Watches the version exchange to resolve leader/follower, derives the
//! directional keys, starts the session, and drives one connector per
//! generation. The generation counter belongs to the leader and advances
//! on every decision to (re)establish a connection; rendezvous traffic
//! for older generations is ignored.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use burrow_core::config::DilationConfig;
use burrow_core::frame::FrameCipher;
use burrow_core::keys::{Role, SessionKeys, KEY_SIZE};
use burrow_core::mailbox::{
    peer_can_dilate, ConnectionHints, LetsDilate, MailboxMessage, PleaseDilate,
};

use crate::connector::{Connector, ConnectorEvent, ConnectorHandle};
use crate::endpoints::{
    latch, ControlEndpoint, EndpointError, LatchState, SubchannelConnector, SubchannelListener,
};
use crate::l2::NegotiatedPipe;
use crate::l3::{L3Handle, L3Notice, L3Session};

/// What the outer wormhole supplies. The wormhole itself (short codes,
/// PAKE, the rendezvous server) is an external collaborator; this is the
/// whole interface the dilation core needs from it.
pub struct WormholeChannel {
    /// Outbound application-channel messages: (phase, body).
    pub outgoing: mpsc::UnboundedSender<(String, Vec<u8>)>,
    /// Inbound application-channel messages.
    pub incoming: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    /// Resolves once the version exchange completes.
    pub versions: oneshot::Receiver<VersionInfo>,
    /// The shared wormhole master key.
    pub master_key: [u8; KEY_SIZE],
}

#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub our_side: String,
    pub their_side: String,
    pub peer_versions: Value,
}

/// The three client endpoints, available synchronously.
pub struct DilationEndpoints {
    /// Single-use, bound to subchannel id 0.
    pub control: ControlEndpoint,
    /// Opens a fresh subchannel per connect.
    pub outbound: SubchannelConnector,
    /// Single-use, yields peer-initiated subchannels.
    pub inbound: SubchannelListener,
}

enum DilatorCommand {
    Dilate,
    Shutdown,
}

/// Handle to the running controller.
pub struct Dilator {
    commands: mpsc::UnboundedSender<DilatorCommand>,
}

impl Dilator {
    /// Start the controller. Endpoints are returned immediately; they
    /// resolve once dilation is engaged (or fail if it never can be).
    pub fn start(wormhole: WormholeChannel, config: DilationConfig) -> (Dilator, DilationEndpoints) {
        let (latch_tx, latch_rx) = latch();
        let endpoints = DilationEndpoints {
            control: ControlEndpoint::new(latch_rx.clone()),
            outbound: SubchannelConnector::new(latch_rx.clone()),
            inbound: SubchannelListener::new(latch_rx),
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (connector_events_tx, connector_events_rx) = mpsc::unbounded_channel();
        let controller = Controller {
            config,
            outgoing: wormhole.outgoing,
            incoming: wormhole.incoming,
            versions: Some(wormhole.versions),
            master_key: wormhole.master_key,
            commands: commands_rx,
            latch: latch_tx,
            state: ControllerState::Undecided,
            wanted: false,
            version_info: None,
            role: None,
            cipher: None,
            generation: 0,
            l3: None,
            l3_notices: None,
            connector: None,
            connector_events_tx,
            connector_events: connector_events_rx,
            pending_lets_dilate: None,
        };
        tokio::spawn(controller.run());
        (
            Dilator {
                commands: commands_tx,
            },
            endpoints,
        )
    }

    /// The local application wants dilation.
    pub fn dilate(&self) {
        let _ = self.commands.send(DilatorCommand::Dilate);
    }

    /// Hard teardown of the whole dilated session.
    pub fn shutdown(&self) {
        let _ = self.commands.send(DilatorCommand::Shutdown);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Undecided,
    LeaderConnecting,
    LeaderConnected,
    FollowerWanted,
    FollowerConnecting,
    FollowerConnected,
    /// Peer advertised `can-dilate` below 1. Terminal.
    Impossible,
}

struct Controller {
    config: DilationConfig,
    outgoing: mpsc::UnboundedSender<(String, Vec<u8>)>,
    incoming: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    versions: Option<oneshot::Receiver<VersionInfo>>,
    master_key: [u8; KEY_SIZE],
    commands: mpsc::UnboundedReceiver<DilatorCommand>,
    latch: watch::Sender<LatchState>,
    state: ControllerState,
    wanted: bool,
    version_info: Option<VersionInfo>,
    role: Option<Role>,
    cipher: Option<FrameCipher>,
    generation: u64,
    l3: Option<L3Handle>,
    l3_notices: Option<mpsc::UnboundedReceiver<L3Notice>>,
    connector: Option<ConnectorHandle>,
    connector_events_tx: mpsc::UnboundedSender<ConnectorEvent>,
    connector_events: mpsc::UnboundedReceiver<ConnectorEvent>,
    pending_lets_dilate: Option<LetsDilate>,
}

impl Controller {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(DilatorCommand::Dilate) => {
                            self.wanted = true;
                            self.try_engage().await;
                        }
                        Some(DilatorCommand::Shutdown) | None => {
                            self.shutdown();
                            return;
                        }
                    }
                }

                info = versions_future(&mut self.versions) => {
                    self.versions = None;
                    match info {
                        Ok(info) => {
                            self.version_info = Some(info);
                            self.try_engage().await;
                        }
                        Err(_) => {
                            tracing::info!("wormhole dropped before version exchange");
                            self.shutdown();
                            return;
                        }
                    }
                }

                message = self.incoming.recv() => {
                    match message {
                        Some((phase, body)) => {
                            match MailboxMessage::decode(&phase, &body) {
                                Some(message) => self.on_mailbox(message).await,
                                None => tracing::debug!(%phase, "ignoring unrelated mailbox message"),
                            }
                        }
                        None => {
                            tracing::info!("wormhole closed");
                            self.shutdown();
                            return;
                        }
                    }
                }

                event = self.connector_events.recv() => {
                    if let Some(event) = event {
                        self.on_connector_event(event).await;
                    }
                }

                notice = notices_future(&mut self.l3_notices) => {
                    match notice {
                        Some(L3Notice::L2Lost) => self.on_l2_lost().await,
                        None => self.l3_notices = None,
                    }
                }
            }
        }
    }

    /// Engage once both preconditions hold: the local application asked
    /// for dilation, and the version exchange has completed.
    async fn try_engage(&mut self) {
        if self.state != ControllerState::Undecided || !self.wanted {
            return;
        }
        let Some(info) = self.version_info.clone() else {
            return;
        };

        if !peer_can_dilate(&info.peer_versions) {
            tracing::warn!("peer does not support dilation");
            self.state = ControllerState::Impossible;
            let _ = self
                .latch
                .send(Some(Err(EndpointError::OldPeerCannotDilate)));
            return;
        }

        let role = Role::from_sides(&info.our_side, &info.their_side);
        let keys = SessionKeys::derive(&self.master_key, role);
        let (l3, notices) = L3Session::spawn(role, &keys, self.config.clone());
        self.role = Some(role);
        self.cipher = Some(FrameCipher::new(&keys));
        self.l3 = Some(l3.clone());
        self.l3_notices = Some(notices);
        let _ = self.latch.send(Some(Ok(l3)));
        tracing::info!(?role, "dilation engaged");

        match role {
            Role::Leader => self.start_leader_generation(1).await,
            Role::Follower => {
                self.send_mailbox(MailboxMessage::PleaseDilate(PleaseDilate {
                    side: info.our_side.clone(),
                }));
                self.state = ControllerState::FollowerWanted;
                if let Some(pending) = self.pending_lets_dilate.take() {
                    self.on_lets_dilate(pending).await;
                }
            }
        }
    }

    async fn on_mailbox(&mut self, message: MailboxMessage) {
        match message {
            MailboxMessage::PleaseDilate(message) => {
                // The leader always initiates once engaged; this only
                // tells us the peer is interested too.
                tracing::debug!(side = %message.side, "peer requests dilation");
            }
            MailboxMessage::LetsDilate(message) => self.on_lets_dilate(message).await,
            MailboxMessage::Hints(message) => self.on_hints(message),
        }
    }

    async fn on_lets_dilate(&mut self, message: LetsDilate) {
        if self.role == Some(Role::Leader) {
            tracing::warn!("ignoring lets-dilate: we are the leader");
            return;
        }
        if self.l3.is_none() {
            // The leader asked before our application did. Hold on to
            // the newest request until dilate() arrives.
            tracing::debug!(generation = message.generation, "lets-dilate before local dilate");
            self.pending_lets_dilate = Some(message);
            return;
        }
        if message.generation <= self.generation {
            tracing::debug!(generation = message.generation, "ignoring stale lets-dilate");
            return;
        }
        let Some(cipher) = self.cipher.clone() else {
            return;
        };

        self.generation = message.generation;
        self.connector = None;
        let handle = Connector::start(
            Role::Follower,
            cipher,
            message.generation,
            self.config.clone(),
            self.connector_events_tx.clone(),
        )
        .await;
        handle.add_hints(message.hints);
        let local_hints = handle.local_hints().to_vec();
        self.connector = Some(handle);
        self.send_mailbox(MailboxMessage::Hints(ConnectionHints {
            generation: message.generation,
            hints: local_hints,
        }));
        self.state = ControllerState::FollowerConnecting;
        tracing::info!(generation = message.generation, "follower connecting");
    }

    fn on_hints(&mut self, message: ConnectionHints) {
        let Some(connector) = &self.connector else {
            tracing::debug!(generation = message.generation, "hints with no connector running");
            return;
        };
        if message.generation != connector.generation() {
            tracing::debug!(generation = message.generation, "ignoring stale hints");
            return;
        }
        connector.add_hints(message.hints);
    }

    async fn on_connector_event(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Selected { generation, pipe } => self.on_selected(generation, pipe),
            ConnectorEvent::GaveUp { generation } => self.on_gave_up(generation).await,
        }
    }

    fn on_selected(&mut self, generation: u64, pipe: NegotiatedPipe) {
        if generation != self.generation {
            tracing::debug!(generation, "dropping selection from a stale generation");
            return;
        }
        let Some(l3) = &self.l3 else { return };
        l3.l2_connected_parsed(pipe.pipe, pipe.parser);
        self.connector = None;
        self.state = match self.role {
            Some(Role::Leader) => ControllerState::LeaderConnected,
            _ => ControllerState::FollowerConnected,
        };
        tracing::info!(generation, "connection established");
    }

    async fn on_gave_up(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        match self.role {
            Some(Role::Leader) => {
                tracing::info!(generation, "generation gave up, starting the next");
                self.start_leader_generation(generation + 1).await;
            }
            Some(Role::Follower) => {
                self.connector = None;
                self.state = ControllerState::FollowerWanted;
            }
            None => {}
        }
    }

    async fn on_l2_lost(&mut self) {
        match self.role {
            Some(Role::Leader) => {
                tracing::info!("connection lost, starting next generation");
                let next = self.generation + 1;
                self.start_leader_generation(next).await;
            }
            Some(Role::Follower) => {
                self.connector = None;
                self.state = ControllerState::FollowerWanted;
                tracing::info!("connection lost, awaiting new lets-dilate");
            }
            None => {}
        }
    }

    async fn start_leader_generation(&mut self, generation: u64) {
        let Some(cipher) = self.cipher.clone() else {
            return;
        };
        self.generation = generation;
        self.connector = None;
        let handle = Connector::start(
            Role::Leader,
            cipher,
            generation,
            self.config.clone(),
            self.connector_events_tx.clone(),
        )
        .await;
        let hints = handle.local_hints().to_vec();
        self.connector = Some(handle);
        self.send_mailbox(MailboxMessage::LetsDilate(LetsDilate { generation, hints }));
        self.state = ControllerState::LeaderConnecting;
        tracing::info!(generation, "leader connecting");
    }

    fn send_mailbox(&self, message: MailboxMessage) {
        let phase = message.phase();
        let body = message.encode();
        if self.outgoing.send((phase, body)).is_err() {
            tracing::warn!("wormhole outgoing channel closed");
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("dilation controller shutting down");
        self.connector = None;
        if let Some(l3) = &self.l3 {
            l3.shutdown();
        }
        // Anyone still parked on an endpoint gets the hard failure.
        self.latch.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(Err(EndpointError::WormholeClosed));
                true
            } else {
                false
            }
        });
    }
}

async fn versions_future(
    slot: &mut Option<oneshot::Receiver<VersionInfo>>,
) -> Result<VersionInfo, oneshot::error::RecvError> {
    match slot {
        Some(versions) => versions.await,
        None => std::future::pending().await,
    }
}

async fn notices_future(slot: &mut Option<mpsc::UnboundedReceiver<L3Notice>>) -> Option<L3Notice> {
    match slot {
        Some(notices) => notices.recv().await,
        None => std::future::pending().await,
    }
}
