use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;

use crate::error::FetchError;
use crate::models::{ConnectionState, ElectionId, LiveView, ResultSet};

/// Authoritative in-memory results for the watched election.
///
/// Snapshots and pushes both carry the full result set, so every update
/// replaces `results` wholesale. The store is plain data: the lifecycle
/// manager applies one event at a time and publishes [`TallyStore::view`]
/// afterwards, so consumers never observe a half-applied update.
#[derive(Debug)]
pub struct TallyStore {
    election_id: Option<ElectionId>,
    results: Arc<ResultSet>,
    state: ConnectionState,
    is_pulsing: bool,
    pulse_token: u64,
    pushes_applied: u64,
    is_loading: bool,
    error: Option<FetchError>,
    credentials_rejected: bool,
    last_updated: Option<DateTime<Utc>>,
}

impl Default for TallyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TallyStore {
    pub fn new() -> Self {
        Self {
            election_id: None,
            results: Arc::new(ResultSet::default()),
            state: ConnectionState::Disconnected,
            is_pulsing: false,
            pulse_token: 0,
            pushes_applied: 0,
            is_loading: false,
            error: None,
            credentials_rejected: false,
            last_updated: None,
        }
    }

    /// Forget everything about the previous target.
    pub fn reset(&mut self, election_id: Option<ElectionId>) {
        let pulse_token = self.pulse_token;
        *self = Self::new();
        // Keep tokens moving so a pulse timer from the old target can't
        // clear a pulse raised for the new one.
        self.pulse_token = pulse_token;
        self.election_id = election_id;
    }

    /// Marks a snapshot request as in flight. Returns the push counter to
    /// hand back to [`TallyStore::apply_snapshot`].
    pub fn begin_fetch(&mut self) -> u64 {
        if self.last_updated.is_none() && !self.credentials_rejected {
            self.is_loading = true;
            self.error = None;
        }
        self.pushes_applied
    }

    /// Seeds or refreshes results from a snapshot. A snapshot requested
    /// before the latest push is older than what we already show and is
    /// dropped.
    pub fn apply_snapshot(&mut self, results: ResultSet, requested_after: u64) -> bool {
        self.is_loading = false;
        if self.pushes_applied > requested_after {
            debug!(
                "Dropping snapshot for election {:?}: a push arrived after it was requested",
                self.election_id
            );
            return false;
        }
        self.results = Arc::new(results);
        self.clear_error();
        self.last_updated = Some(Utc::now());
        true
    }

    /// Replaces results with a pushed set and raises the pulse. Returns the
    /// token that clears this pulse.
    pub fn apply_push(&mut self, results: ResultSet) -> u64 {
        self.results = Arc::new(results);
        self.pushes_applied += 1;
        self.is_loading = false;
        self.clear_error();
        self.last_updated = Some(Utc::now());
        self.is_pulsing = true;
        self.pulse_token += 1;
        self.pulse_token
    }

    /// Clears the pulse if `token` belongs to the most recent push.
    pub fn clear_pulse(&mut self, token: u64) -> bool {
        if token != self.pulse_token || !self.is_pulsing {
            return false;
        }
        self.is_pulsing = false;
        true
    }

    /// Records a failed snapshot. Only an initial load with nothing to show
    /// surfaces as an error; later failures keep the last good results.
    pub fn record_fetch_error(&mut self, error: FetchError) -> bool {
        self.is_loading = false;
        if self.last_updated.is_some() || self.credentials_rejected {
            return false;
        }
        self.error = Some(error);
        true
    }

    /// The hub refused the credential. Shown regardless of existing results
    /// and kept until the next reset.
    pub fn reject_credentials(&mut self) {
        self.credentials_rejected = true;
        self.is_loading = false;
        self.error = Some(FetchError::Unauthorized);
    }

    pub fn credentials_rejected(&self) -> bool {
        self.credentials_rejected
    }

    fn clear_error(&mut self) {
        if !self.credentials_rejected {
            self.error = None;
        }
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn election_id(&self) -> Option<ElectionId> {
        self.election_id
    }

    pub fn view(&self) -> LiveView {
        LiveView {
            election_id: self.election_id,
            results: Arc::clone(&self.results),
            connection_status: self.state.into(),
            is_pulsing: self.is_pulsing,
            is_loading: self.is_loading,
            error: self.error.clone(),
            last_updated: self.last_updated,
        }
    }
}
