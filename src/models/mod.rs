use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::FetchError;
use crate::voting;

pub type ElectionId = i64;
pub type CandidateId = i64;

/// One candidate's standing in an election.
///
/// `percentage` is derived from the vote counts of the whole set and is
/// recomputed whenever a [`ResultSet`] is built; whatever the server sent
/// for it is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    pub candidate_id: CandidateId,
    pub candidate_name: String,
    #[serde(default)]
    pub position: String,
    pub vote_count: u64,
    #[serde(default)]
    pub percentage: f64,
}

impl ResultEntry {
    pub fn new(
        candidate_id: CandidateId,
        candidate_name: impl Into<String>,
        position: impl Into<String>,
        vote_count: u64,
    ) -> Self {
        Self {
            candidate_id,
            candidate_name: candidate_name.into(),
            position: position.into(),
            vote_count,
            percentage: 0.0,
        }
    }

    /// Percentage rounded to two decimals for display.
    pub fn display_percentage(&self) -> f64 {
        voting::round_percentage(self.percentage)
    }
}

/// Full result set for one election, ranked by vote count.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResultSet {
    entries: Vec<ResultEntry>,
}

impl ResultSet {
    /// Builds a normalised set: percentages recomputed, entries ranked.
    pub fn new(entries: Vec<ResultEntry>) -> Self {
        Self {
            entries: voting::normalize(entries),
        }
    }

    pub fn entries(&self) -> &[ResultEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResultEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_votes(&self) -> u64 {
        voting::total_votes(&self.entries)
    }

    pub fn get(&self, candidate_id: CandidateId) -> Option<&ResultEntry> {
        self.entries.iter().find(|e| e.candidate_id == candidate_id)
    }

    /// The outright leader, if one candidate has strictly more votes than
    /// every other.
    pub fn leader(&self) -> Option<&ResultEntry> {
        voting::leader(&self.entries)
    }
}

impl<'de> Deserialize<'de> for ResultSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Vec::<ResultEntry>::deserialize(deserializer).map(ResultSet::new)
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a ResultEntry;
    type IntoIter = std::slice::Iter<'a, ResultEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// What a consumer is watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchTarget {
    pub election_id: ElectionId,
    pub is_election_active: bool,
}

impl WatchTarget {
    pub fn new(election_id: ElectionId, is_election_active: bool) -> Self {
        Self {
            election_id,
            is_election_active,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.election_id > 0
    }
}

/// Bearer credential presented to the election service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_valid(&self) -> bool {
        !self.token.trim().is_empty()
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.trim())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

/// Transport-level state of the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// User-facing connection indicator. `Connecting` is folded into
/// `Disconnected` so startup does not flash an extra state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Reconnecting => ConnectionStatus::Reconnecting,
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                ConnectionStatus::Disconnected
            }
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Immutable snapshot of what a consumer should render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveView {
    pub election_id: Option<ElectionId>,
    pub results: Arc<ResultSet>,
    pub connection_status: ConnectionStatus,
    pub is_pulsing: bool,
    pub is_loading: bool,
    #[serde(skip)]
    pub error: Option<FetchError>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl LiveView {
    pub fn idle() -> Self {
        Self {
            election_id: None,
            results: Arc::new(ResultSet::default()),
            connection_status: ConnectionStatus::Disconnected,
            is_pulsing: false,
            is_loading: false,
            error: None,
            last_updated: None,
        }
    }

    /// True when nothing has arrived within `max_age` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        match self.last_updated {
            Some(at) => now - at > max_age,
            None => true,
        }
    }
}

impl Default for LiveView {
    fn default() -> Self {
        Self::idle()
    }
}
