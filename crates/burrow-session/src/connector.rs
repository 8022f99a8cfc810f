//! Connector — establishes one L2 out of a field of candidates.
//!
//! Scoped to a single generation. Both sides listen and dial every hint
//! the peer publishes; every pipe that connects runs negotiation.
//! The leader waits a short "nothing better" window after the first
//! ready candidate, then marks the lowest-RTT one with a selection frame
//! and cancels the rest. The follower treats whichever candidate shows
//! the marker as the winner. Cancelling a candidate just closes its
//! transport; it is never an error.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use burrow_core::config::DilationConfig;
use burrow_core::frame::FrameCipher;
use burrow_core::keys::Role;
use burrow_core::mailbox::{Hint, HintKind};

use crate::l2::{await_selection, negotiate, select_frame, NegotiatedPipe};
use crate::transport::{dial_hint, BoxPipe, HintListener};

#[derive(Debug)]
pub(crate) enum ConnectorEvent {
    /// The winner for this generation; hand it to the session.
    Selected {
        generation: u64,
        pipe: NegotiatedPipe,
    },
    /// Nothing got selected in time; the leader starts the next
    /// generation.
    GaveUp { generation: u64 },
}

/// Owner-side handle. Dropping it cancels the whole attempt: the
/// connector task aborts and its candidate set aborts with it.
pub(crate) struct ConnectorHandle {
    generation: u64,
    local_hints: Vec<Hint>,
    hints_tx: mpsc::UnboundedSender<Vec<Hint>>,
    task: JoinHandle<()>,
}

impl ConnectorHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hints our listeners are reachable at, for publication to the peer.
    pub fn local_hints(&self) -> &[Hint] {
        &self.local_hints
    }

    /// Feed hints received from the peer; each direct hint gets a dial.
    pub fn add_hints(&self, hints: Vec<Hint>) {
        let _ = self.hints_tx.send(hints);
    }
}

impl Drop for ConnectorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) struct Connector {
    role: Role,
    cipher: FrameCipher,
    generation: u64,
    config: DilationConfig,
    listener: Option<HintListener>,
    hints_rx: mpsc::UnboundedReceiver<Vec<Hint>>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
}

impl Connector {
    pub async fn start(
        role: Role,
        cipher: FrameCipher,
        generation: u64,
        config: DilationConfig,
        events: mpsc::UnboundedSender<ConnectorEvent>,
    ) -> ConnectorHandle {
        let listener = match HintListener::bind(&config.advertise_hosts).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                tracing::warn!(error = %e, "failed to bind candidate listener, dial-only");
                None
            }
        };
        let local_hints = listener
            .as_ref()
            .map(|listener| listener.hints().to_vec())
            .unwrap_or_default();
        let (hints_tx, hints_rx) = mpsc::unbounded_channel();
        let connector = Connector {
            role,
            cipher,
            generation,
            config,
            listener,
            hints_rx,
            events,
        };
        let task = tokio::spawn(connector.run());
        ConnectorHandle {
            generation,
            local_hints,
            hints_tx,
            task,
        }
    }

    async fn run(mut self) {
        let giveup = tokio::time::sleep(self.config.connector_giveup);
        tokio::pin!(giveup);

        let mut candidates: JoinSet<Option<NegotiatedPipe>> = JoinSet::new();
        let mut ready: Vec<NegotiatedPipe> = Vec::new();
        let mut selection_deadline: Option<tokio::time::Instant> = None;

        loop {
            let selection = async move {
                match selection_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                accepted = accept_on(self.listener.as_ref()) => {
                    match accepted {
                        Ok((pipe, addr)) => {
                            tracing::debug!(%addr, generation = self.generation, "inbound candidate");
                            self.spawn_candidate(&mut candidates, pipe);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "candidate accept failed");
                        }
                    }
                }

                hints = self.hints_rx.recv() => {
                    match hints {
                        Some(hints) => {
                            for hint in hints {
                                self.spawn_dial(&mut candidates, hint);
                            }
                        }
                        // Handle dropped: the controller cancelled us.
                        None => return,
                    }
                }

                Some(result) = candidates.join_next(), if !candidates.is_empty() => {
                    match result {
                        Ok(Some(candidate)) => {
                            if self.role == Role::Follower {
                                // The marker was observed on this one.
                                tracing::info!(generation = self.generation, "leader selected this candidate");
                                let _ = self.events.send(ConnectorEvent::Selected {
                                    generation: self.generation,
                                    pipe: candidate,
                                });
                                return;
                            }
                            tracing::debug!(rtt = ?candidate.rtt, "candidate ready");
                            ready.push(candidate);
                            if selection_deadline.is_none() {
                                selection_deadline = Some(
                                    tokio::time::Instant::now() + self.config.selection_delay,
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => tracing::warn!(error = %e, "candidate task panicked"),
                    }
                }

                _ = selection => {
                    if let Some(winner) = self.select_winner(&mut ready).await {
                        let _ = self.events.send(ConnectorEvent::Selected {
                            generation: self.generation,
                            pipe: winner,
                        });
                        return;
                    }
                    // Every ready candidate died at selection time; keep
                    // collecting until the give-up timer fires.
                    selection_deadline = None;
                }

                _ = &mut giveup => {
                    tracing::info!(generation = self.generation, "connector giving up");
                    let _ = self.events.send(ConnectorEvent::GaveUp {
                        generation: self.generation,
                    });
                    return;
                }
            }
        }
    }

    /// Pick the lowest-RTT ready candidate and send the selection marker
    /// on it. Falls through to the next-best if the write fails.
    async fn select_winner(&self, ready: &mut Vec<NegotiatedPipe>) -> Option<NegotiatedPipe> {
        while !ready.is_empty() {
            let mut best = 0;
            for (index, candidate) in ready.iter().enumerate() {
                if candidate.rtt < ready[best].rtt {
                    best = index;
                }
            }
            let mut winner = ready.swap_remove(best);
            let marker = select_frame(&self.cipher, self.generation);
            let sent = async {
                winner.pipe.write_all(&marker).await?;
                winner.pipe.flush().await
            }
            .await;
            match sent {
                Ok(()) => {
                    tracing::info!(
                        generation = self.generation,
                        rtt = ?winner.rtt,
                        losers = ready.len(),
                        "selected candidate"
                    );
                    ready.clear();
                    return Some(winner);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "selected candidate died, trying next");
                }
            }
        }
        None
    }

    fn spawn_candidate(&self, candidates: &mut JoinSet<Option<NegotiatedPipe>>, pipe: BoxPipe) {
        let cipher = self.cipher.clone();
        let generation = self.generation;
        let role = self.role;
        let deadline = self.config.negotiation_timeout;
        candidates.spawn(run_candidate(pipe, cipher, generation, role, deadline));
    }

    fn spawn_dial(&self, candidates: &mut JoinSet<Option<NegotiatedPipe>>, hint: Hint) {
        if hint.kind == HintKind::Relay {
            tracing::debug!(hostname = %hint.hostname, "skipping relay hint, no relay transport");
            return;
        }
        let cipher = self.cipher.clone();
        let generation = self.generation;
        let role = self.role;
        let deadline = self.config.negotiation_timeout;
        candidates.spawn(async move {
            let pipe = match dial_hint(&hint).await {
                Ok(pipe) => pipe,
                Err(e) => {
                    tracing::debug!(
                        hostname = %hint.hostname,
                        port = hint.port,
                        error = %e,
                        "dial failed"
                    );
                    return None;
                }
            };
            tracing::debug!(hostname = %hint.hostname, port = hint.port, "outbound candidate");
            run_candidate(pipe, cipher, generation, role, deadline).await
        });
    }
}

async fn accept_on(listener: Option<&HintListener>) -> std::io::Result<(BoxPipe, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// One candidate's life: negotiate within the deadline; the follower then
/// waits for the leader's marker. Failures are silent — the candidate
/// simply never becomes ready.
async fn run_candidate(
    pipe: BoxPipe,
    cipher: FrameCipher,
    generation: u64,
    role: Role,
    deadline: std::time::Duration,
) -> Option<NegotiatedPipe> {
    let negotiated = tokio::time::timeout(deadline, negotiate(pipe, &cipher, generation)).await;
    let mut candidate = match negotiated {
        Ok(Ok(candidate)) => candidate,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "candidate failed negotiation");
            return None;
        }
        Err(_) => {
            tracing::debug!("candidate negotiation timed out");
            return None;
        }
    };
    match role {
        Role::Leader => Some(candidate),
        Role::Follower => match await_selection(&mut candidate, &cipher, generation).await {
            Ok(()) => Some(candidate),
            Err(e) => {
                tracing::debug!(error = %e, "candidate closed before selection");
                None
            }
        },
    }
}
