use std::fmt;

use crate::{
    error::{LimitError, StoreError},
    store::ConfigStore,
    types::RelayCommand,
};

pub const KEY_SSID: &str = "ssid";
pub const KEY_PASSWD: &str = "passwd";
pub const KEY_TEMP_LIMIT: &str = "temp";
pub const KEY_RELAY_HOST: &str = "RELAY_HOST";
pub const KEY_RELAY_PORT: &str = "RELAY_PORT";

pub const LIMIT_MIN_C: f32 = 15.0;
pub const LIMIT_MAX_C: f32 = 24.0;
pub const DEFAULT_LIMIT_C: f32 = 20.0;

pub const DEFAULT_RELAY_HOST: &str = "192.168.1.50";
pub const DEFAULT_RELAY_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    pub settle_delay_ms: u64,
    pub bootstrap_backoff_ms: u64,
    pub retry_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub relay_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 10_000,
            bootstrap_backoff_ms: 5_000,
            retry_interval_ms: 1_000,
            poll_interval_ms: 60_000,
            relay_timeout_ms: 20_000,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password_set", &!self.password.is_empty())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
}

impl RelayEndpoint {
    // the relay needs the port even when it is 80
    pub fn host_header(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self, command: RelayCommand) -> String {
        format!("http://{}:{}{}", self.host, self.port, command.path())
    }
}

impl Default for RelayEndpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_RELAY_HOST.to_string(),
            port: DEFAULT_RELAY_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub credentials: Credentials,
    pub relay: RelayEndpoint,
    pub limit_c: f32,
}

impl AgentConfig {
    pub fn load(store: &dyn ConfigStore) -> Result<Self, StoreError> {
        let ssid = store.get(KEY_SSID)?.unwrap_or_default();
        let password = store.get(KEY_PASSWD)?.unwrap_or_default();

        let host = store
            .get(KEY_RELAY_HOST)?
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_RELAY_HOST.to_string());
        let port = store
            .get(KEY_RELAY_PORT)?
            .and_then(|value| value.trim().parse::<u16>().ok())
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_RELAY_PORT);

        let limit_c = sanitize_limit(store.get(KEY_TEMP_LIMIT)?.as_deref());

        Ok(Self {
            credentials: Credentials { ssid, password },
            relay: RelayEndpoint { host, port },
            limit_c,
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.credentials.ssid.trim().is_empty()
    }
}

pub fn parse_limit(raw: &str) -> Result<f32, LimitError> {
    let value = raw
        .trim()
        .parse::<f32>()
        .map_err(|_| LimitError::NotANumber(raw.to_string()))?;
    if !value.is_finite() {
        return Err(LimitError::NotANumber(raw.to_string()));
    }
    if !(LIMIT_MIN_C..=LIMIT_MAX_C).contains(&value) {
        return Err(LimitError::OutOfRange(value));
    }
    Ok(value)
}

pub fn sanitize_limit(stored: Option<&str>) -> f32 {
    stored
        .and_then(|raw| parse_limit(raw).ok())
        .unwrap_or(DEFAULT_LIMIT_C)
}

pub fn format_limit(limit_c: f32) -> String {
    limit_c.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn load_reads_all_keys() {
        let store = MemoryStore::with_entries([
            (KEY_SSID, "net"),
            (KEY_PASSWD, "pw"),
            (KEY_TEMP_LIMIT, "18"),
            (KEY_RELAY_HOST, "10.0.0.7"),
            (KEY_RELAY_PORT, "8081"),
        ]);

        let config = AgentConfig::load(&store).unwrap();

        assert_eq!(config.credentials.ssid, "net");
        assert_eq!(config.credentials.password, "pw");
        assert_eq!(config.limit_c, 18.0);
        assert_eq!(
            config.relay,
            RelayEndpoint {
                host: "10.0.0.7".to_string(),
                port: 8081,
            }
        );
    }

    #[test]
    fn missing_or_invalid_values_fall_back_to_defaults() {
        let store = MemoryStore::with_entries([(KEY_TEMP_LIMIT, "31"), (KEY_RELAY_PORT, "x")]);

        let config = AgentConfig::load(&store).unwrap();

        assert_eq!(config.limit_c, DEFAULT_LIMIT_C);
        assert_eq!(config.relay, RelayEndpoint::default());
        assert!(!config.has_credentials());
    }

    #[test]
    fn limit_bounds_are_inclusive() {
        assert_eq!(parse_limit("15"), Ok(15.0));
        assert_eq!(parse_limit("24"), Ok(24.0));
        assert_eq!(parse_limit("19.5"), Ok(19.5));
        assert_eq!(parse_limit("14.9"), Err(LimitError::OutOfRange(14.9)));
        assert_eq!(parse_limit("24.1"), Err(LimitError::OutOfRange(24.1)));
    }

    #[test]
    fn non_numeric_limits_are_rejected() {
        for raw in ["", "abc", "NaN", "inf", "20c"] {
            assert!(
                matches!(parse_limit(raw), Err(LimitError::NotANumber(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn whole_limits_persist_without_fraction() {
        assert_eq!(format_limit(18.0), "18");
        assert_eq!(format_limit(21.5), "21.5");
        assert_eq!(sanitize_limit(Some(&format_limit(21.5))), 21.5);
    }

    #[test]
    fn host_header_always_carries_port() {
        let relay = RelayEndpoint {
            host: "relay.local".to_string(),
            port: 80,
        };
        assert_eq!(relay.host_header(), "relay.local:80");
        assert_eq!(relay.url(RelayCommand::Off), "http://relay.local:80/off");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            ssid: "net".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
