//! Live channel client: one reconnecting subscription to an election's
//! results group, reporting epoch-tagged events.

pub mod backoff;
pub mod protocol;
pub mod ws;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

pub use backoff::Backoff;
use protocol::{ClientFrame, ServerFrame, decode_results};

use crate::error::ChannelError;
use crate::models::{ConnectionState, Credentials, ResultSet, WatchTarget};

/// Monotonic tag for one subscription attempt.
pub type Epoch = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    ResultsPushed(ResultSet),
    StateChanged(ConnectionState),
    /// The hub refused the credential. The session stops retrying.
    AuthRejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tagged {
    pub epoch: Epoch,
    pub event: ChannelEvent,
}

pub type EventSink = mpsc::UnboundedSender<Tagged>;

/// Opens transport connections to the results hub.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Connection>, ChannelError>;
}

/// An established, bidirectional connection to the hub.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ChannelError>;

    /// Next frame from the server. `None` once the transport has dropped.
    async fn recv(&mut self) -> Option<Result<ServerFrame, ChannelError>>;

    async fn close(&mut self);
}

#[derive(Clone)]
pub struct LiveChannel {
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    leave_timeout: Duration,
}

impl LiveChannel {
    pub fn new(connector: Arc<dyn Connector>, backoff: Backoff, leave_timeout: Duration) -> Self {
        Self {
            connector,
            backoff,
            leave_timeout,
        }
    }

    /// Starts a subscription for `target`. Inactive elections get no
    /// transport at all: the handle reports `Disconnected` straight away
    /// and the caller relies on snapshots.
    pub fn open(
        &self,
        target: WatchTarget,
        credentials: Credentials,
        epoch: Epoch,
        events: EventSink,
    ) -> ChannelHandle {
        if !target.is_election_active {
            info!(
                "Election {} is not live, skipping live channel",
                target.election_id
            );
            let _ = events.send(Tagged {
                epoch,
                event: ChannelEvent::StateChanged(ConnectionState::Disconnected),
            });
            return ChannelHandle {
                epoch,
                target,
                shutdown: None,
                task: None,
            };
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Session {
            connector: Arc::clone(&self.connector),
            backoff: self.backoff.clone(),
            leave_timeout: self.leave_timeout,
            target,
            credentials,
            epoch,
            events,
            shutdown: shutdown_rx,
            last_state: None,
        };
        let task = tokio::spawn(session.run());

        ChannelHandle {
            epoch,
            target,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Owning handle to an open subscription. Dropping it also shuts the
/// session down; [`ChannelHandle::close`] additionally waits for the
/// group-leave and transport close to finish.
pub struct ChannelHandle {
    epoch: Epoch,
    target: WatchTarget,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn target(&self) -> WatchTarget {
        self.target
    }

    /// Whether a transport task was started for this handle.
    pub fn has_transport(&self) -> bool {
        self.task.is_some()
    }

    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(
                        "Live channel task for election {} panicked",
                        self.target.election_id
                    );
                }
            }
        }
        debug!(
            "Closed live channel for election {} (epoch {})",
            self.target.election_id, self.epoch
        );
    }
}

enum Exit {
    Closed,
    /// `stable` is set once the hub has delivered results on the connection.
    Dropped { reason: String, stable: bool },
}

enum Next {
    Shutdown,
    Frame(Option<Result<ServerFrame, ChannelError>>),
}

struct Session {
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    leave_timeout: Duration,
    target: WatchTarget,
    credentials: Credentials,
    epoch: Epoch,
    events: EventSink,
    shutdown: watch::Receiver<bool>,
    last_state: Option<ConnectionState>,
}

impl Session {
    async fn run(mut self) {
        let election_id = self.target.election_id;
        self.set_state(ConnectionState::Connecting);

        // Consecutive failures since the last stable connection. A hub that
        // accepts and then drops straight away counts as a failure too.
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            let connector = Arc::clone(&self.connector);
            let connected = tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => None,
                result = connector.connect(&self.credentials) => Some(result),
            };
            let Some(connected) = connected else {
                debug!("Live channel for election {} closed while connecting", election_id);
                return;
            };

            match connected {
                Ok(mut conn) => {
                    if ever_connected {
                        info!("Live channel for election {} reconnected", election_id);
                    } else {
                        info!("Live channel for election {} connected", election_id);
                    }
                    ever_connected = true;

                    match self.serve(conn.as_mut()).await {
                        Exit::Closed => return,
                        Exit::Dropped { reason, stable: true } => {
                            warn!("Live channel for election {} dropped: {}", election_id, reason);
                            attempt = 0;
                            self.set_state(ConnectionState::Reconnecting);
                        }
                        Exit::Dropped { reason, stable: false } => {
                            attempt = attempt.saturating_add(1);
                            warn!(
                                "Live channel for election {} dropped before delivering results (attempt {}): {}",
                                election_id, attempt, reason
                            );
                            self.set_retry_state(attempt);
                        }
                    }
                }
                Err(ChannelError::Auth(reason)) => {
                    error!(
                        "Live channel for election {} rejected credentials: {}",
                        election_id, reason
                    );
                    self.emit(ChannelEvent::AuthRejected(reason));
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "Live channel connect attempt {} for election {} failed: {}",
                        attempt, election_id, e
                    );
                    if ever_connected {
                        self.set_retry_state(attempt);
                    } else {
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }

            let delay = self.backoff.delay(attempt);
            if !delay.is_zero() {
                debug!("Retrying live channel for election {} in {:?}", election_id, delay);
            }
            let closed = tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => true,
                _ = sleep(delay) => false,
            };
            if closed {
                debug!("Live channel for election {} closed during backoff", election_id);
                return;
            }
        }
    }

    async fn serve(&mut self, conn: &mut dyn Connection) -> Exit {
        let election_id = self.target.election_id;
        self.set_state(ConnectionState::Connected);

        let request = ClientFrame::request_results(election_id);
        let mut pending: HashSet<Uuid> = HashSet::new();
        if let ClientFrame::RequestResults { invocation_id, .. } = &request {
            pending.insert(*invocation_id);
        }
        for frame in [ClientFrame::JoinGroup { election_id }, request] {
            let sent = tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => None,
                sent = conn.send(frame) => Some(sent),
            };
            match sent {
                None => {
                    self.abandon(conn).await;
                    return Exit::Closed;
                }
                Some(Err(e)) => {
                    return Exit::Dropped {
                        reason: format!("handshake failed: {}", e),
                        stable: false,
                    };
                }
                Some(Ok(())) => {}
            }
        }

        let mut stable = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => Next::Shutdown,
                frame = conn.recv() => Next::Frame(frame),
            };

            match next {
                Next::Shutdown => {
                    self.leave(conn).await;
                    return Exit::Closed;
                }
                Next::Frame(None) => {
                    return Exit::Dropped {
                        reason: "connection closed".to_string(),
                        stable,
                    };
                }
                Next::Frame(Some(Err(ChannelError::Protocol(reason)))) => {
                    warn!(
                        "Discarding malformed frame on election {} channel: {}",
                        election_id, reason
                    );
                }
                Next::Frame(Some(Err(e))) => {
                    return Exit::Dropped {
                        reason: e.to_string(),
                        stable,
                    };
                }
                Next::Frame(Some(Ok(frame))) => {
                    if self.handle_frame(frame, &mut pending) {
                        stable = true;
                    }
                }
            }
        }
    }

    /// Returns whether the frame delivered results.
    fn handle_frame(&mut self, frame: ServerFrame, pending: &mut HashSet<Uuid>) -> bool {
        let election_id = self.target.election_id;
        match frame {
            ServerFrame::ResultsPushed {
                election_id: pushed_for,
                results,
            } => {
                if pushed_for != election_id {
                    debug!(
                        "Ignoring push for election {} on election {} channel",
                        pushed_for, election_id
                    );
                    return false;
                }
                self.push_results(&results)
            }
            ServerFrame::Completion {
                invocation_id,
                results,
                error,
            } => {
                if !pending.remove(&invocation_id) {
                    debug!("Ignoring completion for unknown invocation {}", invocation_id);
                    return false;
                }
                if let Some(reason) = error {
                    warn!("Results request for election {} failed: {}", election_id, reason);
                    return false;
                }
                match results {
                    Some(results) => self.push_results(&results),
                    None => {
                        warn!("Results request for election {} returned no results", election_id);
                        false
                    }
                }
            }
            ServerFrame::Ping => false,
        }
    }

    fn push_results(&mut self, payload: &serde_json::Value) -> bool {
        match decode_results(payload) {
            Ok(results) => {
                self.emit(ChannelEvent::ResultsPushed(results));
                true
            }
            Err(e) => {
                warn!(
                    "Discarding results push for election {}: {}",
                    self.target.election_id, e
                );
                false
            }
        }
    }

    async fn leave(&self, conn: &mut dyn Connection) {
        let election_id = self.target.election_id;
        match timeout(self.leave_timeout, conn.send(ClientFrame::LeaveGroup { election_id })).await {
            Ok(Ok(())) => debug!("Left results group for election {}", election_id),
            Ok(Err(e)) => warn!("Failed to leave results group for election {}: {}", election_id, e),
            Err(_) => warn!("Timed out leaving results group for election {}", election_id),
        }
        if timeout(self.leave_timeout, conn.close()).await.is_err() {
            warn!("Timed out closing live channel for election {}", election_id);
        }
    }

    /// Closes a connection that never finished joining.
    async fn abandon(&self, conn: &mut dyn Connection) {
        if timeout(self.leave_timeout, conn.close()).await.is_err() {
            warn!(
                "Timed out closing live channel for election {}",
                self.target.election_id
            );
        }
    }

    fn set_retry_state(&mut self, attempt: u32) {
        if self.backoff.exhausted(attempt) {
            self.set_state(ConnectionState::Disconnected);
        } else {
            self.set_state(ConnectionState::Reconnecting);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.last_state == Some(state) {
            return;
        }
        self.last_state = Some(state);
        self.emit(ChannelEvent::StateChanged(state));
    }

    fn emit(&self, event: ChannelEvent) {
        if self
            .events
            .send(Tagged {
                epoch: self.epoch,
                event,
            })
            .is_err()
        {
            debug!("Live channel listener for election {} is gone", self.target.election_id);
        }
    }
}

/// Resolves once shutdown is requested or the handle is dropped.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
