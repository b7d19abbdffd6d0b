use log::{info, warn};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;
use crate::models::{Credentials, WatchTarget};

const DEFAULT_API_URL: &str = "http://localhost:5000";
const HUB_PATH: &str = "hubs/results";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_PULSE: Duration = Duration::from_millis(1000);
const DEFAULT_RECONNECT_DELAYS_SECS: [u64; 4] = [0, 2, 10, 30];
const DEFAULT_LEAVE_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime settings for the live tally client.
#[derive(Debug, Clone)]
pub struct TallyConfig {
    pub api_url: Url,
    pub hub_url: Url,
    pub poll_interval: Duration,
    pub pulse_duration: Duration,
    pub reconnect_delays: Vec<Duration>,
    pub leave_timeout: Duration,
    pub request_timeout: Duration,
}

impl TallyConfig {
    /// Loads settings from the process environment. Call `dotenvy::dotenv()`
    /// first if a `.env` file should be honoured.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = match lookup("TALLY_API_URL") {
            Some(raw) => parse_url("TALLY_API_URL", &raw)?,
            None => {
                info!("TALLY_API_URL not set, using default: {}", DEFAULT_API_URL);
                parse_url("TALLY_API_URL", DEFAULT_API_URL)?
            }
        };
        let hub_url = match lookup("TALLY_HUB_URL") {
            Some(raw) => parse_url("TALLY_HUB_URL", &raw)?,
            None => derive_hub_url(&api_url)?,
        };

        let poll_interval = match lookup("TALLY_POLL_INTERVAL_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("TALLY_POLL_INTERVAL_SECS", &raw)?),
            None => DEFAULT_POLL_INTERVAL,
        };
        let pulse_duration = match lookup("TALLY_PULSE_MILLIS") {
            Some(raw) => Duration::from_millis(parse_positive("TALLY_PULSE_MILLIS", &raw)?),
            None => DEFAULT_PULSE,
        };
        let reconnect_delays = match lookup("TALLY_RECONNECT_DELAYS_SECS") {
            Some(raw) => parse_delays("TALLY_RECONNECT_DELAYS_SECS", &raw)?,
            None => DEFAULT_RECONNECT_DELAYS_SECS.map(Duration::from_secs).to_vec(),
        };
        let leave_timeout = match lookup("TALLY_LEAVE_TIMEOUT_MILLIS") {
            Some(raw) => Duration::from_millis(parse_positive("TALLY_LEAVE_TIMEOUT_MILLIS", &raw)?),
            None => DEFAULT_LEAVE_TIMEOUT,
        };
        let request_timeout = match lookup("TALLY_REQUEST_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("TALLY_REQUEST_TIMEOUT_SECS", &raw)?),
            None => DEFAULT_REQUEST_TIMEOUT,
        };

        Ok(Self {
            api_url,
            hub_url,
            poll_interval,
            pulse_duration,
            reconnect_delays,
            leave_timeout,
            request_timeout,
        })
    }
}

/// Bearer token from `TALLY_TOKEN`, if one is configured.
pub fn credentials_from_lookup<F>(lookup: F) -> Option<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    let creds = lookup("TALLY_TOKEN").map(Credentials::new);
    if creds.is_none() {
        warn!("TALLY_TOKEN not set, live results will not be available");
    }
    creds.filter(Credentials::is_valid)
}

/// Election to watch from `TALLY_ELECTION_ID` / `TALLY_ELECTION_ACTIVE`.
pub fn target_from_lookup<F>(lookup: F) -> Result<WatchTarget, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw_id = lookup("TALLY_ELECTION_ID").ok_or(ConfigError::Missing("TALLY_ELECTION_ID"))?;
    let election_id = parse::<i64>("TALLY_ELECTION_ID", &raw_id)?;
    let is_active = match lookup("TALLY_ELECTION_ACTIVE") {
        Some(raw) => parse::<bool>("TALLY_ELECTION_ACTIVE", &raw)?,
        None => true,
    };
    let target = WatchTarget::new(election_id, is_active);
    if !target.is_valid() {
        return Err(ConfigError::Invalid {
            key: "TALLY_ELECTION_ID",
            value: raw_id,
            reason: "election ids are positive".to_string(),
        });
    }
    Ok(target)
}

fn derive_hub_url(api_url: &Url) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: "TALLY_API_URL",
        value: api_url.to_string(),
        reason: reason.to_string(),
    };

    let mut hub = api_url.join(HUB_PATH).map_err(|e| invalid(&e.to_string()))?;
    let scheme = match api_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(invalid(&format!("unsupported scheme {}", other))),
    };
    hub.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to a websocket scheme"))?;
    Ok(hub)
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let value = parse::<u64>(key, raw)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_delays(key: &'static str, raw: &str) -> Result<Vec<Duration>, ConfigError> {
    let delays = raw
        .split(',')
        .map(|part| parse::<u64>(key, part).map(Duration::from_secs))
        .collect::<Result<Vec<_>, _>>()?;
    if delays.is_empty() {
        return Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "at least one delay is required".to_string(),
        });
    }
    Ok(delays)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = TallyConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.pulse_duration, Duration::from_secs(1));
        assert_eq!(config.reconnect_delays.len(), 4);
        assert_eq!(config.hub_url.as_str(), "ws://localhost:5000/hubs/results");
    }

    #[test]
    fn hub_url_follows_api_scheme() {
        let config =
            TallyConfig::from_lookup(lookup(&[("TALLY_API_URL", "https://vote.example.edu/")]))
                .unwrap();
        assert_eq!(config.hub_url.as_str(), "wss://vote.example.edu/hubs/results");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = TallyConfig::from_lookup(lookup(&[
            ("TALLY_POLL_INTERVAL_SECS", "5"),
            ("TALLY_RECONNECT_DELAYS_SECS", "0, 1, 4"),
            ("TALLY_HUB_URL", "ws://hub.local/live"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(
            config.reconnect_delays,
            vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(4)]
        );
        assert_eq!(config.hub_url.as_str(), "ws://hub.local/live");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = TallyConfig::from_lookup(lookup(&[("TALLY_POLL_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TALLY_POLL_INTERVAL_SECS", .. }));
    }

    #[test]
    fn target_requires_positive_id() {
        assert!(matches!(
            target_from_lookup(lookup(&[])),
            Err(ConfigError::Missing("TALLY_ELECTION_ID"))
        ));
        assert!(target_from_lookup(lookup(&[("TALLY_ELECTION_ID", "0")])).is_err());

        let target = target_from_lookup(lookup(&[
            ("TALLY_ELECTION_ID", "12"),
            ("TALLY_ELECTION_ACTIVE", "false"),
        ]))
        .unwrap();
        assert_eq!(target, WatchTarget::new(12, false));
    }

    #[test]
    fn blank_token_yields_no_credentials() {
        assert!(credentials_from_lookup(lookup(&[("TALLY_TOKEN", " ")])).is_none());
        assert!(credentials_from_lookup(lookup(&[("TALLY_TOKEN", "abc")])).is_some());
    }
}
