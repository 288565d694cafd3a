use std::{str::FromStr, time::Duration};

use anyhow::Context;

use crate::{auth::GoogleSettings, hub::DEFAULT_QUEUE_CAPACITY};

pub const MIN_MAILBOX_CAPACITY: usize = 2;

/// Per-connection timing and buffering.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Deadline for any single write, keepalive probes included.
    pub write_wait: Duration,
    /// A peer silent for this long is considered dead.
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub mailbox_capacity: usize,
    pub max_message_size: usize,
}

impl ConnectionSettings {
    pub fn new(write_wait: Duration, pong_wait: Duration) -> Self {
        ConnectionSettings {
            write_wait,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            ..Default::default()
        }
    }

    /// A new connection receives its own presence count and join back to
    /// back, so the mailbox must hold at least two.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.mailbox_capacity >= MIN_MAILBOX_CAPACITY,
            "WS_MAILBOX_CAPACITY must be at least {MIN_MAILBOX_CAPACITY}"
        );
        anyhow::ensure!(!self.pong_wait.is_zero(), "WS_PONG_WAIT_SECS must be positive");
        anyhow::ensure!(!self.write_wait.is_zero(), "WS_WRITE_WAIT_SECS must be positive");
        Ok(())
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        ConnectionSettings {
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            mailbox_capacity: 256,
            max_message_size: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub server_addr: String,
    pub session_ttl_minutes: i64,
    pub registry_queue_capacity: usize,
    pub connection: ConnectionSettings,
    pub google: Option<GoogleSettings>,
}

impl Config {
    /// Reads the environment, after loading `.env` if there is one.
    pub fn from_env() -> anyhow::Result<Config> {
        if dotenv::dotenv().is_err() {
            tracing::debug!("no .env file, using process environment only");
        }

        let defaults = ConnectionSettings::default();
        let write_wait = Duration::from_secs(var_or("WS_WRITE_WAIT_SECS", defaults.write_wait.as_secs())?);
        let pong_wait = Duration::from_secs(var_or("WS_PONG_WAIT_SECS", defaults.pong_wait.as_secs())?);
        let connection = ConnectionSettings {
            mailbox_capacity: var_or("WS_MAILBOX_CAPACITY", defaults.mailbox_capacity)?,
            max_message_size: var_or("WS_MAX_MESSAGE_SIZE", defaults.max_message_size)?,
            ..ConnectionSettings::new(write_wait, pong_wait)
        };
        connection.validate()?;

        let google = match (
            dotenv::var("GOOGLE_CLIENT_ID"),
            dotenv::var("GOOGLE_CLIENT_SECRET"),
            dotenv::var("GOOGLE_REDIRECT_URL"),
        ) {
            (Ok(client_id), Ok(client_secret), Ok(redirect_url)) => Some(GoogleSettings {
                client_id,
                client_secret,
                redirect_url,
            }),
            _ => None,
        };

        Ok(Config {
            database_url: dotenv::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://huddle.db?mode=rwc".to_owned()),
            database_max_connections: var_or("DATABASE_MAX_CONNECTIONS", 16)?,
            server_addr: dotenv::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            session_ttl_minutes: var_or("SESSION_TTL_MINUTES", 24 * 60)?,
            registry_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connection,
            google,
        })
    }
}

fn var_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenv::var(key) {
        Ok(value) => value.trim().parse().with_context(|| format!("invalid {key}: {value:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_fires_before_the_idle_deadline() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.ping_period, Duration::from_secs(54));
        assert!(settings.ping_period < settings.pong_wait);

        let short = ConnectionSettings::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(short.ping_period, Duration::from_millis(450));
        assert_eq!(short.mailbox_capacity, 256);
    }

    #[test]
    fn mailbox_must_fit_presence_and_join() {
        let mut settings = ConnectionSettings::default();
        assert!(settings.validate().is_ok());

        settings.mailbox_capacity = 1;
        assert!(settings.validate().is_err());
        settings.mailbox_capacity = MIN_MAILBOX_CAPACITY;
        assert!(settings.validate().is_ok());

        settings.pong_wait = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unset_variables_fall_back() {
        assert_eq!(var_or("HUDDLE_TEST_SURELY_UNSET", 7u32).unwrap(), 7);
    }
}
