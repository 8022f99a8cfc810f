//! L3 — the durable session that survives L2 replacement.
//!
//! Exactly one per dilated wormhole. Owns the outbound seqnum counter,
//! the queue of sealed frames awaiting acknowledgement, the inbound seen
//! set, and the subchannel registry. All of it lives on one task;
//! everything else talks to the session through its command channel, so
//! no state is ever touched from two places.
//!
//! At any instant the session has zero or one active L2. Losing it
//! detaches the connection and keeps the queue; attaching a replacement
//! replays the queue head-to-tail. That replay is the only
//! retransmission trigger.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use burrow_core::config::DilationConfig;
use burrow_core::frame::{FrameBuffer, FrameCipher};
use burrow_core::keys::{Role, SessionKeys};
use burrow_core::record::{Record, SubchannelId, CONTROL_CHANNEL_ID};

use crate::l2::ActiveL2;
use crate::seen::SeenSet;
use crate::subchannel::{
    transition, CloseCause, Producer, Subchannel, SubchannelAction, SubchannelEvent,
    SubchannelInput, SubchannelState,
};
use crate::transport::{BoxPipe, Pipe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("the control channel has already been taken")]
    ControlChannelTaken,
    #[error("an inbound subchannel listener is already registered")]
    InboundListenerTaken,
    #[error("session is closed")]
    SessionClosed,
}

/// Pushed up to the dilation controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Notice {
    /// The active connection is gone; the leader should start a new
    /// generation.
    L2Lost,
}

pub(crate) enum SessionCommand {
    OpenSubchannel {
        reply: oneshot::Sender<Result<Subchannel, SessionError>>,
    },
    OpenControlChannel {
        reply: oneshot::Sender<Result<Subchannel, SessionError>>,
    },
    RegisterInboundListener {
        reply: oneshot::Sender<Result<mpsc::UnboundedReceiver<Subchannel>, SessionError>>,
    },
    LocalData {
        id: SubchannelId,
        data: Bytes,
    },
    LocalClose {
        id: SubchannelId,
    },
    RegisterProducer {
        id: SubchannelId,
        producer: Arc<dyn Producer>,
        streaming: bool,
    },
    UnregisterProducer {
        id: SubchannelId,
    },
    L2Connected {
        pipe: BoxPipe,
        parser: FrameBuffer,
    },
    L2Lost {
        l2_id: u64,
    },
    DetachL2,
    Inbound {
        l2_id: u64,
        seqnum: u32,
        record: Record,
    },
    Shutdown,
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct L3Handle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl L3Handle {
    /// Open a fresh outbound subchannel: allocate the next id for our
    /// role, send OPEN, return the transport handle.
    pub async fn open_subchannel(&self) -> Result<Subchannel, SessionError> {
        self.request(|reply| SessionCommand::OpenSubchannel { reply })
            .await
    }

    /// Take the handle bound to subchannel id 0. Single-use.
    pub async fn open_control_channel(&self) -> Result<Subchannel, SessionError> {
        self.request(|reply| SessionCommand::OpenControlChannel { reply })
            .await
    }

    /// Register the sink for peer-initiated subchannels. Single-use;
    /// subchannels the peer opened before registration are delivered
    /// first, in arrival order.
    pub async fn inbound_subchannels(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Subchannel>, SessionError> {
        self.request(|reply| SessionCommand::RegisterInboundListener { reply })
            .await
    }

    /// Attach an already-negotiated pipe as the active L2. The entire
    /// outbound queue is replayed onto it in order.
    pub fn l2_connected(&self, pipe: impl Pipe) {
        self.l2_connected_parsed(Box::new(pipe), FrameBuffer::new());
    }

    pub(crate) fn l2_connected_parsed(&self, pipe: BoxPipe, parser: FrameBuffer) {
        let _ = self.commands.send(SessionCommand::L2Connected { pipe, parser });
    }

    /// Drop the active L2, keeping the outbound queue intact.
    pub fn detach_l2(&self) {
        let _ = self.commands.send(SessionCommand::DetachL2);
    }

    /// Hard teardown: every subchannel sees a connection-lost close.
    pub fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::SessionClosed)?;
        response.await.map_err(|_| SessionError::SessionClosed)?
    }
}

// ── Producer registry ─────────────────────────────────────────────────────────

struct RegisteredProducer {
    id: SubchannelId,
    producer: Arc<dyn Producer>,
    streaming: bool,
}

/// Producers in FIFO registration order. Pause reaches only streaming
/// (push) producers; resume reaches everyone.
#[derive(Default)]
struct ProducerRegistry {
    entries: Vec<RegisteredProducer>,
}

impl ProducerRegistry {
    fn register(&mut self, id: SubchannelId, producer: Arc<dyn Producer>, streaming: bool) {
        self.remove(id);
        self.entries.push(RegisteredProducer {
            id,
            producer,
            streaming,
        });
    }

    fn remove(&mut self, id: SubchannelId) {
        self.entries.retain(|entry| entry.id != id);
    }

    fn pause_all(&self) {
        for entry in self.entries.iter().filter(|entry| entry.streaming) {
            entry.producer.pause_producing();
        }
    }

    fn resume_all(&self) {
        for entry in &self.entries {
            entry.producer.resume_producing();
        }
    }

    fn stop_all(&self) {
        for entry in &self.entries {
            entry.producer.stop_producing();
        }
    }
}

// ── Session actor ─────────────────────────────────────────────────────────────

struct SubchannelEntry {
    state: SubchannelState,
    events: mpsc::UnboundedSender<SubchannelEvent>,
}

pub struct L3Session {
    role: Role,
    cipher: FrameCipher,
    config: DilationConfig,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    self_tx: mpsc::UnboundedSender<SessionCommand>,
    notices: mpsc::UnboundedSender<L3Notice>,
    next_seqnum: u32,
    outbound_queue: VecDeque<(u32, Bytes)>,
    queued_bytes: usize,
    seen: SeenSet,
    subchannels: HashMap<SubchannelId, SubchannelEntry>,
    next_subchannel_id: u32,
    control_events: Option<mpsc::UnboundedReceiver<SubchannelEvent>>,
    inbound_listener: Option<mpsc::UnboundedSender<Subchannel>>,
    pending_inbound: Vec<Subchannel>,
    producers: ProducerRegistry,
    active: Option<ActiveL2>,
    l2_counter: u64,
    last_outbound: Instant,
    paused: bool,
}

impl L3Session {
    /// Spawn the session actor. The notice receiver reports connection
    /// loss to the dilation controller.
    pub fn spawn(
        role: Role,
        keys: &SessionKeys,
        config: DilationConfig,
    ) -> (L3Handle, mpsc::UnboundedReceiver<L3Notice>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        // The control channel exists from the start on both sides, state
        // open, no OPEN record. Early peer data buffers in its event
        // channel until the application takes the handle.
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let mut subchannels = HashMap::new();
        subchannels.insert(
            CONTROL_CHANNEL_ID,
            SubchannelEntry {
                state: SubchannelState::Open,
                events: control_tx,
            },
        );

        let session = L3Session {
            role,
            cipher: FrameCipher::new(keys),
            config,
            commands: commands_rx,
            self_tx: commands_tx.clone(),
            notices: notices_tx,
            next_seqnum: 0,
            outbound_queue: VecDeque::new(),
            queued_bytes: 0,
            seen: SeenSet::new(),
            subchannels,
            next_subchannel_id: role.first_subchannel_id(),
            control_events: Some(control_rx),
            inbound_listener: None,
            pending_inbound: Vec::new(),
            producers: ProducerRegistry::default(),
            active: None,
            l2_counter: 0,
            last_outbound: Instant::now(),
            paused: false,
        };
        tokio::spawn(session.run());
        (
            L3Handle {
                commands: commands_tx,
            },
            notices_rx,
        )
    }

    async fn run(mut self) {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None => {
                            self.shutdown_session();
                            return;
                        }
                        Some(command) => {
                            if !self.handle_command(command) {
                                return;
                            }
                        }
                    }
                }
                _ = ping.tick() => self.maybe_ping(),
            }
        }
    }

    /// Returns false when the session should stop.
    fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::OpenSubchannel { reply } => {
                let subchannel = self.open_local_subchannel();
                let _ = reply.send(Ok(subchannel));
            }
            SessionCommand::OpenControlChannel { reply } => {
                let result = match self.control_events.take() {
                    Some(events) => Ok(Subchannel::new(
                        CONTROL_CHANNEL_ID,
                        self.self_tx.clone(),
                        events,
                    )),
                    None => Err(SessionError::ControlChannelTaken),
                };
                let _ = reply.send(result);
            }
            SessionCommand::RegisterInboundListener { reply } => {
                let result = if self.inbound_listener.is_some() {
                    Err(SessionError::InboundListenerTaken)
                } else {
                    let (listener_tx, listener_rx) = mpsc::unbounded_channel();
                    for subchannel in self.pending_inbound.drain(..) {
                        let _ = listener_tx.send(subchannel);
                    }
                    self.inbound_listener = Some(listener_tx);
                    Ok(listener_rx)
                };
                let _ = reply.send(result);
            }
            SessionCommand::LocalData { id, data } => {
                self.drive_subchannel(id, SubchannelInput::LocalData(data));
            }
            SessionCommand::LocalClose { id } => {
                self.drive_subchannel(id, SubchannelInput::LocalClose);
            }
            SessionCommand::RegisterProducer {
                id,
                producer,
                streaming,
            } => {
                if self.paused && streaming {
                    producer.pause_producing();
                }
                self.producers.register(id, producer, streaming);
            }
            SessionCommand::UnregisterProducer { id } => {
                self.producers.remove(id);
            }
            SessionCommand::L2Connected { pipe, parser } => {
                self.attach_l2(pipe, parser);
            }
            SessionCommand::L2Lost { l2_id } => {
                if self.active.as_ref().is_some_and(|active| active.id == l2_id) {
                    self.detach_active();
                }
            }
            SessionCommand::DetachL2 => {
                self.detach_active();
            }
            SessionCommand::Inbound {
                l2_id,
                seqnum,
                record,
            } => {
                self.handle_inbound(l2_id, seqnum, record);
            }
            SessionCommand::Shutdown => {
                self.shutdown_session();
                return false;
            }
        }
        true
    }

    // ── Outbound path ─────────────────────────────────────────────────────────

    fn open_local_subchannel(&mut self) -> Subchannel {
        let id = self.next_subchannel_id;
        self.next_subchannel_id += 2;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.subchannels.insert(
            id,
            SubchannelEntry {
                state: SubchannelState::Open,
                events: events_tx,
            },
        );
        self.send_record(Record::Open { subchannel_id: id });
        tracing::debug!(subchannel_id = id, "opened local subchannel");
        Subchannel::new(id, self.self_tx.clone(), events_rx)
    }

    /// Seal a record under the next seqnum, queue it for retransmission,
    /// and transmit it if an L2 is attached.
    fn send_record(&mut self, record: Record) {
        let seqnum = self.next_seqnum;
        let frame = match self.cipher.seal_record(seqnum, &record) {
            Ok(frame) => frame,
            Err(e) => {
                // Only reachable if one session sends ~2^32 records.
                tracing::error!(error = %e, "outbound seqnum space exhausted");
                return;
            }
        };
        self.next_seqnum += 1;
        self.queued_bytes += frame.len();
        self.outbound_queue.push_back((seqnum, frame.clone()));
        if let Some(active) = &self.active {
            active.send_frame(frame);
        }
        self.last_outbound = Instant::now();
        self.maybe_pause();
    }

    /// ACKs consume a seqnum but are never queued: the peer re-sends
    /// whatever went unacknowledged and gets fresh ACKs for it.
    fn send_ack(&mut self, acked_seqnum: u32) {
        let seqnum = self.next_seqnum;
        let frame = match self
            .cipher
            .seal_record(seqnum, &Record::Ack { acked_seqnum })
        {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "outbound seqnum space exhausted");
                return;
            }
        };
        self.next_seqnum += 1;
        if let Some(active) = &self.active {
            active.send_frame(frame);
            self.last_outbound = Instant::now();
        }
    }

    fn maybe_ping(&mut self) {
        if self.active.is_some() && self.last_outbound.elapsed() >= self.config.ping_interval {
            tracing::debug!("link idle, sending ping");
            self.send_record(Record::Ping);
        }
    }

    /// Pause streaming producers once the unacknowledged backlog crosses
    /// the high watermark.
    fn maybe_pause(&mut self) {
        if !self.paused && self.queued_bytes >= self.config.outbound_high_watermark {
            self.paused = true;
            tracing::debug!(
                queued_bytes = self.queued_bytes,
                "outbound backlog above high watermark, pausing producers"
            );
            self.producers.pause_all();
        }
    }

    /// Resume every producer, in registration order, once ACKs have
    /// drained the backlog below the low watermark.
    fn maybe_resume(&mut self) {
        if self.paused && self.queued_bytes <= self.config.outbound_low_watermark {
            self.paused = false;
            tracing::debug!(
                queued_bytes = self.queued_bytes,
                "outbound backlog drained, resuming producers"
            );
            self.producers.resume_all();
        }
    }

    // ── Inbound path ──────────────────────────────────────────────────────────

    fn handle_inbound(&mut self, l2_id: u64, seqnum: u32, record: Record) {
        tracing::trace!(l2_id, seqnum, ?record, "inbound record");
        if let Record::Ack { acked_seqnum } = record {
            self.process_ack(acked_seqnum);
            return;
        }
        if !self.seen.insert(seqnum) {
            tracing::debug!(seqnum, "duplicate record, acknowledging without effect");
            self.send_ack(seqnum);
            return;
        }
        match record {
            Record::Ack { .. } => {}
            Record::Ping => {}
            Record::Open { subchannel_id } => self.handle_remote_open(subchannel_id),
            Record::Data {
                subchannel_id,
                payload,
            } => self.drive_subchannel(subchannel_id, SubchannelInput::RemoteData(payload)),
            Record::Close { subchannel_id } => {
                self.drive_subchannel(subchannel_id, SubchannelInput::RemoteClose)
            }
        }
        self.send_ack(seqnum);
    }

    /// Cumulative: retire every queued frame at or below the ack.
    fn process_ack(&mut self, acked_seqnum: u32) {
        while let Some((seqnum, frame)) = self.outbound_queue.front() {
            if *seqnum > acked_seqnum {
                break;
            }
            self.queued_bytes -= frame.len();
            self.outbound_queue.pop_front();
        }
        self.maybe_resume();
    }

    fn handle_remote_open(&mut self, id: SubchannelId) {
        if self.subchannels.contains_key(&id) {
            // Duplicate open of a live stream; the FSM reports it.
            self.drive_subchannel(id, SubchannelInput::RemoteOpen);
            return;
        }
        let our_parity = self.role.first_subchannel_id() % 2;
        if id == CONTROL_CHANNEL_ID || id % 2 == our_parity {
            tracing::warn!(
                subchannel_id = id,
                "peer opened a subchannel with an id it does not own"
            );
            return;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, actions) = transition(id, SubchannelState::Idle, SubchannelInput::RemoteOpen);
        debug_assert!(actions.is_empty());
        self.subchannels.insert(
            id,
            SubchannelEntry {
                state,
                events: events_tx,
            },
        );
        let handle = Subchannel::new(id, self.self_tx.clone(), events_rx);
        match &self.inbound_listener {
            Some(listener) => {
                let _ = listener.send(handle);
            }
            None => self.pending_inbound.push(handle),
        }
        tracing::debug!(subchannel_id = id, "peer opened subchannel");
    }

    fn drive_subchannel(&mut self, id: SubchannelId, input: SubchannelInput) {
        let Some(entry) = self.subchannels.get_mut(&id) else {
            tracing::warn!(subchannel_id = id, "input for unknown subchannel dropped");
            return;
        };
        let (next, actions) = transition(id, entry.state, input);
        entry.state = next;
        for action in actions {
            self.perform(id, action);
        }
    }

    fn perform(&mut self, id: SubchannelId, action: SubchannelAction) {
        match action {
            SubchannelAction::DeliverData(data) => {
                if let Some(entry) = self.subchannels.get(&id) {
                    let _ = entry.events.send(SubchannelEvent::Data(data));
                }
            }
            SubchannelAction::SendData(data) => self.send_record(Record::Data {
                subchannel_id: id,
                payload: data,
            }),
            SubchannelAction::SendClose => self.send_record(Record::Close { subchannel_id: id }),
            SubchannelAction::Finalize => {
                if let Some(entry) = self.subchannels.remove(&id) {
                    let _ = entry.events.send(SubchannelEvent::Closed(CloseCause::Clean));
                }
                self.producers.remove(id);
                tracing::debug!(subchannel_id = id, "subchannel closed");
            }
            SubchannelAction::Violation(violation) => {
                tracing::warn!(subchannel_id = id, %violation, "subchannel protocol violation");
                if let Some(entry) = self.subchannels.get(&id) {
                    let _ = entry.events.send(SubchannelEvent::Violation(violation));
                }
            }
        }
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    fn attach_l2(&mut self, pipe: BoxPipe, parser: FrameBuffer) {
        if let Some(previous) = self.active.take() {
            tracing::info!(l2_id = previous.id, "replacing active connection");
            previous.detach();
        }
        self.l2_counter += 1;
        let id = self.l2_counter;
        let active = ActiveL2::spawn(
            id,
            pipe,
            parser,
            self.cipher.clone(),
            self.config.liveness_timeout,
            self.self_tx.clone(),
        );
        for (_, frame) in &self.outbound_queue {
            active.send_frame(frame.clone());
        }
        if !self.outbound_queue.is_empty() {
            tracing::info!(
                l2_id = id,
                frames = self.outbound_queue.len(),
                "replayed outbound queue"
            );
            self.last_outbound = Instant::now();
        }
        self.active = Some(active);
    }

    fn detach_active(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::info!(l2_id = active.id, "connection detached, queue retained");
            active.detach();
            let _ = self.notices.send(L3Notice::L2Lost);
        }
    }

    fn shutdown_session(&mut self) {
        tracing::info!("session shutting down");
        if let Some(active) = self.active.take() {
            active.detach();
        }
        self.producers.stop_all();
        for (_, entry) in self.subchannels.drain() {
            let _ = entry
                .events
                .send(SubchannelEvent::Closed(CloseCause::ConnectionLost));
        }
        self.inbound_listener = None;
        self.pending_inbound.clear();
    }
}
