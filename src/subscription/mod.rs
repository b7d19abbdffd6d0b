//! Subscription lifecycle manager: one actor task owning the channel
//! handle, the store and the timers, publishing a `LiveView` per event.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::channel::ws::WsConnector;
use crate::channel::{Backoff, ChannelEvent, ChannelHandle, Epoch, LiveChannel, Tagged};
use crate::config::TallyConfig;
use crate::error::FetchError;
use crate::models::{
    ConnectionState, ConnectionStatus, Credentials, LiveView, ResultSet, WatchTarget,
};
use crate::snapshot::{HttpSnapshotFetcher, SnapshotFetcher};
use crate::store::TallyStore;
use crate::tasks::poll_fallback;

/// Per-consumer subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Opening,
    Open,
    Reconnecting,
    Disconnected,
}

impl From<ConnectionState> for Lifecycle {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting => Lifecycle::Opening,
            ConnectionState::Connected => Lifecycle::Open,
            ConnectionState::Reconnecting => Lifecycle::Reconnecting,
            ConnectionState::Disconnected => Lifecycle::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TallySettings {
    pub poll_interval: Duration,
    pub pulse_duration: Duration,
}

impl Default for TallySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            pulse_duration: Duration::from_millis(1000),
        }
    }
}

impl From<&TallyConfig> for TallySettings {
    fn from(config: &TallyConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            pulse_duration: config.pulse_duration,
        }
    }
}

enum Command {
    Watch(Option<WatchTarget>),
    SetCredentials(Option<Credentials>),
    Retry,
    Shutdown(Option<oneshot::Sender<()>>),
}

enum Internal {
    Snapshot {
        epoch: Epoch,
        ticket: u64,
        result: Result<ResultSet, FetchError>,
    },
    PulseElapsed {
        epoch: Epoch,
        token: u64,
    },
}

enum Step {
    Command(Command),
    Channel(Tagged),
    Internal(Internal),
    PollTick(Epoch),
}

/// Live results for one watched election.
///
/// Dropping the handle tears the subscription down in the background;
/// [`LiveTally::shutdown`] does the same and waits for it.
pub struct LiveTally {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<LiveView>,
    lifecycle: watch::Receiver<Lifecycle>,
    task: Option<JoinHandle<()>>,
    #[cfg(test)]
    events: crate::channel::EventSink,
}

impl LiveTally {
    pub fn spawn(
        fetcher: Arc<dyn SnapshotFetcher>,
        channel: LiveChannel,
        settings: TallySettings,
        credentials: Option<Credentials>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(LiveView::idle());
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Idle);

        let manager = Manager {
            fetcher,
            channel,
            settings,
            target: None,
            credentials,
            epoch: 0,
            handle: None,
            poller: None,
            store: TallyStore::new(),
            view_tx,
            lifecycle_tx,
            events_tx: events_tx.clone(),
            internal_tx,
            poll_tx,
        };
        let task = tokio::spawn(manager.run(commands_rx, events_rx, internal_rx, poll_rx));

        Self {
            commands: commands_tx,
            view: view_rx,
            lifecycle: lifecycle_rx,
            task: Some(task),
            #[cfg(test)]
            events: events_tx,
        }
    }

    /// Wires up the HTTP snapshot endpoint and the WebSocket hub from config.
    pub fn from_config(config: &TallyConfig, credentials: Option<Credentials>) -> Result<Self, FetchError> {
        let fetcher = HttpSnapshotFetcher::new(config.api_url.clone(), config.request_timeout)?;
        let channel = LiveChannel::new(
            Arc::new(WsConnector::new(config.hub_url.clone())),
            Backoff::new(config.reconnect_delays.clone()),
            config.leave_timeout,
        );
        Ok(Self::spawn(
            Arc::new(fetcher),
            channel,
            TallySettings::from(config),
            credentials,
        ))
    }

    /// Starts watching `target`, replacing whatever was watched before.
    /// Re-watching the current target is a no-op.
    pub fn watch(&self, target: WatchTarget) {
        self.send(Command::Watch(Some(target)));
    }

    pub fn unwatch(&self) {
        self.send(Command::Watch(None));
    }

    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        self.send(Command::SetCredentials(credentials));
    }

    /// Re-issues the snapshot fetch for the current target.
    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    pub fn current_view(&self) -> LiveView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveView> {
        self.view.clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub async fn shutdown(mut self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Shutdown(Some(done_tx)));
        let _ = done_rx.await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Live tally manager is no longer running");
        }
    }

    #[cfg(test)]
    fn inject(&self, tagged: Tagged) {
        let _ = self.events.send(tagged);
    }
}

struct Manager {
    fetcher: Arc<dyn SnapshotFetcher>,
    channel: LiveChannel,
    settings: TallySettings,
    target: Option<WatchTarget>,
    credentials: Option<Credentials>,
    epoch: Epoch,
    handle: Option<ChannelHandle>,
    poller: Option<JoinHandle<()>>,
    store: TallyStore,
    view_tx: watch::Sender<LiveView>,
    lifecycle_tx: watch::Sender<Lifecycle>,
    events_tx: crate::channel::EventSink,
    internal_tx: mpsc::UnboundedSender<Internal>,
    poll_tx: mpsc::UnboundedSender<Epoch>,
}

impl Manager {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Tagged>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut polls: mpsc::UnboundedReceiver<Epoch>,
    ) {
        loop {
            let step = tokio::select! {
                biased;
                command = commands.recv() => Step::Command(command.unwrap_or(Command::Shutdown(None))),
                Some(tagged) = events.recv() => Step::Channel(tagged),
                Some(message) = internal.recv() => Step::Internal(message),
                Some(epoch) = polls.recv() => Step::PollTick(epoch),
            };

            match step {
                Step::Command(Command::Shutdown(done)) => {
                    self.teardown().await;
                    self.store.reset(None);
                    self.publish();
                    info!("Live tally manager stopped");
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    return;
                }
                Step::Command(command) => self.handle_command(command).await,
                Step::Channel(tagged) => self.handle_channel(tagged),
                Step::Internal(message) => self.handle_internal(message),
                Step::PollTick(epoch) => self.handle_poll_tick(epoch),
            }
            self.publish();
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Watch(target) => {
                if self.target == target {
                    debug!("Already watching {:?}", target);
                    return;
                }
                self.target = target;
                self.rebuild().await;
            }
            Command::SetCredentials(credentials) => {
                if self.credentials == credentials {
                    return;
                }
                self.credentials = credentials;
                self.rebuild().await;
            }
            Command::Retry => {
                if self.store.view().is_loading {
                    debug!("Snapshot already loading, ignoring retry");
                    return;
                }
                self.fetch_snapshot();
            }
            Command::Shutdown(_) => {}
        }
    }

    /// Releases the current subscription, then opens one for the current
    /// target under a fresh epoch.
    async fn rebuild(&mut self) {
        self.teardown().await;
        self.epoch += 1;
        self.store.reset(self.target.map(|t| t.election_id));

        let Some(target) = self.target else {
            return;
        };
        if !target.is_valid() {
            warn!("Refusing to watch invalid election id {}", target.election_id);
            self.store.record_fetch_error(FetchError::NotFound(target.election_id));
            return;
        }
        let Some(credentials) = self.credentials.clone().filter(Credentials::is_valid) else {
            warn!(
                "No credentials available, not subscribing to election {}",
                target.election_id
            );
            self.store.record_fetch_error(FetchError::Unauthorized);
            return;
        };

        info!(
            "Watching election {} (active: {}, epoch {})",
            target.election_id, target.is_election_active, self.epoch
        );
        self.fetch_snapshot();

        self.store.set_connection(ConnectionState::Connecting);
        self.set_lifecycle(Lifecycle::Opening);
        self.handle = Some(
            self.channel
                .open(target, credentials, self.epoch, self.events_tx.clone()),
        );
        if target.is_election_active {
            self.poller = Some(poll_fallback::spawn(
                self.epoch,
                self.settings.poll_interval,
                self.poll_tx.clone(),
            ));
        }
    }

    async fn teardown(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if let Some(handle) = self.handle.take() {
            debug!(
                "Releasing subscription for election {} (epoch {})",
                handle.target().election_id,
                handle.epoch()
            );
            handle.close().await;
        }
        self.store.set_connection(ConnectionState::Disconnected);
        self.set_lifecycle(Lifecycle::Idle);
    }

    fn handle_channel(&mut self, tagged: Tagged) {
        if tagged.epoch != self.epoch || self.handle.is_none() {
            debug!(
                "Discarding channel event from epoch {} (current {})",
                tagged.epoch, self.epoch
            );
            return;
        }

        match tagged.event {
            ChannelEvent::StateChanged(state) => {
                debug!("Live channel state for epoch {}: {:?}", self.epoch, state);
                self.store.set_connection(state);
                self.set_lifecycle(state.into());
            }
            ChannelEvent::ResultsPushed(results) => {
                let token = self.store.apply_push(results);
                self.schedule_pulse_clear(token);
            }
            ChannelEvent::AuthRejected(reason) => {
                error!(
                    "Credentials rejected for election {:?}, stopping live updates: {}",
                    self.store.election_id(),
                    reason
                );
                self.store.reject_credentials();
                // Polling with the same credential would be refused too.
                if let Some(poller) = self.poller.take() {
                    poller.abort();
                }
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Snapshot {
                epoch,
                ticket,
                result,
            } => {
                if epoch != self.epoch {
                    debug!("Discarding snapshot from epoch {} (current {})", epoch, self.epoch);
                    return;
                }
                match result {
                    Ok(results) => {
                        self.store.apply_snapshot(results, ticket);
                    }
                    Err(e) => {
                        if self.store.record_fetch_error(e.clone()) {
                            error!("Initial results load failed: {}", e);
                        } else {
                            warn!("Results refresh failed, keeping last results: {}", e);
                        }
                    }
                }
            }
            Internal::PulseElapsed { epoch, token } => {
                if epoch == self.epoch {
                    self.store.clear_pulse(token);
                }
            }
        }
    }

    fn handle_poll_tick(&mut self, epoch: Epoch) {
        if epoch != self.epoch || self.poller.is_none() {
            return;
        }
        let Some(target) = self.target else {
            return;
        };
        let status = ConnectionStatus::from(self.store.connection_state());
        if target.is_election_active && status == ConnectionStatus::Disconnected {
            info!(
                "Live channel down for election {}, polling results",
                target.election_id
            );
            self.fetch_snapshot();
        }
    }

    fn fetch_snapshot(&mut self) {
        let (Some(target), Some(credentials)) = (
            self.target.filter(WatchTarget::is_valid),
            self.credentials.clone().filter(Credentials::is_valid),
        ) else {
            return;
        };
        let ticket = self.store.begin_fetch();
        let epoch = self.epoch;
        let fetcher = Arc::clone(&self.fetcher);
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = fetcher
                .fetch_snapshot(target.election_id, Some(&credentials))
                .await;
            let _ = tx.send(Internal::Snapshot {
                epoch,
                ticket,
                result,
            });
        });
    }

    fn schedule_pulse_clear(&self, token: u64) {
        let epoch = self.epoch;
        let pulse = self.settings.pulse_duration;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            sleep(pulse).await;
            let _ = tx.send(Internal::PulseElapsed { epoch, token });
        });
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle_tx.send_if_modified(|current| {
            if *current == lifecycle {
                return false;
            }
            debug!("Subscription lifecycle {:?} -> {:?}", current, lifecycle);
            *current = lifecycle;
            true
        });
    }

    fn publish(&self) {
        let view = self.store.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }
}
