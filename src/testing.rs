//! Scripted fakes for the hub transport and the snapshot endpoint.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::channel::protocol::{ClientFrame, ServerFrame};
use crate::channel::{Connection, Connector, Tagged};
use crate::error::{ChannelError, FetchError};
use crate::models::{Credentials, ElectionId, ResultEntry, ResultSet};
use crate::snapshot::SnapshotFetcher;

pub fn entry_json(candidate_id: i64, votes: u64) -> Value {
    json!({
        "candidateId": candidate_id,
        "candidateName": format!("Candidate {}", candidate_id),
        "position": "President",
        "voteCount": votes,
    })
}

pub fn result_set(counts: &[(i64, u64)]) -> ResultSet {
    ResultSet::new(
        counts
            .iter()
            .map(|(id, votes)| ResultEntry::new(*id, format!("Candidate {}", id), "President", *votes))
            .collect(),
    )
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<Tagged>) -> Vec<Tagged> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

type Inbox = mpsc::UnboundedSender<Result<ServerFrame, ChannelError>>;

#[derive(Default)]
struct HubState {
    connect_attempts: usize,
    fail_remaining: usize,
    reject: bool,
    connect_delay: Duration,
    fail_sends: bool,
    stall_sends: bool,
    drop_after_join: bool,
    sent: Vec<ClientFrame>,
    closed: usize,
    connections: Vec<Option<Inbox>>,
    current: Option<Inbox>,
}

/// In-memory hub. Clones share state, so a test keeps one clone to drive
/// the "server" side while the channel owns another.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<HubState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn closed_connections(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().unwrap().fail_remaining = count;
    }

    pub fn reject_credentials(&self) {
        self.state.lock().unwrap().reject = true;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().connect_delay = delay;
    }

    pub fn fail_sends(&self) {
        self.state.lock().unwrap().fail_sends = true;
    }

    /// Sends never complete, as on a stalled socket.
    pub fn stall_sends(&self) {
        self.state.lock().unwrap().stall_sends = true;
    }

    /// Every connection accepts the join and then drops.
    pub fn drop_after_join(&self) {
        self.state.lock().unwrap().drop_after_join = true;
    }

    /// Answers the most recent results request on the current connection.
    pub fn complete_request(&self, results: Value) {
        let invocation_id = self.sent_frames().iter().rev().find_map(|frame| match frame {
            ClientFrame::RequestResults { invocation_id, .. } => Some(*invocation_id),
            _ => None,
        });
        if let Some(invocation_id) = invocation_id {
            self.send_frame(ServerFrame::Completion {
                invocation_id,
                results: Some(results),
                error: None,
            });
        }
    }

    /// Sends a frame on the most recent connection.
    pub fn send_frame(&self, frame: ServerFrame) {
        if let Some(inbox) = &self.state.lock().unwrap().current {
            let _ = inbox.send(Ok(frame));
        }
    }

    /// Sends a frame on the `index`th connection ever opened.
    pub fn send_frame_on(&self, index: usize, frame: ServerFrame) {
        if let Some(Some(inbox)) = self.state.lock().unwrap().connections.get(index) {
            let _ = inbox.send(Ok(frame));
        }
    }

    pub fn push_results(&self, election_id: ElectionId, results: Value) {
        self.send_frame(ServerFrame::ResultsPushed { election_id, results });
    }

    /// Simulates the transport dropping underneath the current connection.
    pub fn drop_connection(&self) {
        self.state.lock().unwrap().drop_current();
    }
}

impl HubState {
    fn drop_current(&mut self) {
        if let Some(current) = self.current.take() {
            for slot in self.connections.iter_mut() {
                if slot.as_ref().is_some_and(|c| c.same_channel(&current)) {
                    *slot = None;
                }
            }
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _credentials: &Credentials) -> Result<Box<dyn Connection>, ChannelError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.connect_attempts += 1;
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.reject {
            return Err(ChannelError::Auth("401 Unauthorized".to_string()));
        }
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(ChannelError::Transport("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.push(Some(tx.clone()));
        state.current = Some(tx);
        Ok(Box::new(FakeConnection {
            inbox: rx,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeConnection {
    inbox: mpsc::UnboundedReceiver<Result<ServerFrame, ChannelError>>,
    state: Arc<Mutex<HubState>>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ChannelError> {
        let stalled = {
            let mut state = self.state.lock().unwrap();
            if state.fail_sends {
                return Err(ChannelError::Transport("broken pipe".to_string()));
            }
            if !state.stall_sends {
                if state.drop_after_join && matches!(frame, ClientFrame::JoinGroup { .. }) {
                    state.drop_current();
                }
                state.sent.push(frame);
            }
            state.stall_sends
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ServerFrame, ChannelError>> {
        self.inbox.recv().await
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closed += 1;
        self.inbox.close();
    }
}

struct Scripted {
    delay: Duration,
    response: Result<ResultSet, FetchError>,
}

#[derive(Default)]
struct FetchState {
    calls: Vec<ElectionId>,
    queued: VecDeque<Scripted>,
    fallback: Option<Result<ResultSet, FetchError>>,
}

/// Snapshot endpoint answering from a queue, then from a fallback.
#[derive(Clone, Default)]
pub struct FakeFetcher {
    state: Arc<Mutex<FetchState>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn returning(response: Result<ResultSet, FetchError>) -> Self {
        let fetcher = Self::new();
        fetcher.state.lock().unwrap().fallback = Some(response);
        fetcher
    }

    pub fn enqueue(&self, response: Result<ResultSet, FetchError>) {
        self.enqueue_delayed(Duration::ZERO, response);
    }

    pub fn enqueue_delayed(&self, delay: Duration, response: Result<ResultSet, FetchError>) {
        self.state
            .lock()
            .unwrap()
            .queued
            .push_back(Scripted { delay, response });
    }

    pub fn calls(&self) -> Vec<ElectionId> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl SnapshotFetcher for FakeFetcher {
    async fn fetch_snapshot(
        &self,
        election_id: ElectionId,
        credentials: Option<&Credentials>,
    ) -> Result<ResultSet, FetchError> {
        let scripted = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(election_id);
            state.queued.pop_front()
        };
        if credentials.is_none() {
            return Err(FetchError::Unauthorized);
        }
        match scripted {
            Some(Scripted { delay, response }) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                response
            }
            None => self
                .state
                .lock()
                .unwrap()
                .fallback
                .clone()
                .unwrap_or_else(|| Ok(ResultSet::default())),
        }
    }
}
