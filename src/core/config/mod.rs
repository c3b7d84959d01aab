//! Process configuration, read once from the environment at startup.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sweep: SweepConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Knobs for the sweeper and the per-cycle timeouts.
#[derive(Clone, Debug)]
pub struct SweepConfig {
    pub tick_seconds: u64,
    pub max_workers: usize,
    pub connect_timeout_seconds: u64,
    pub fetch_timeout_seconds: u64,
    pub cycle_budget_seconds: u64,
}

impl SweepConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds.max(1))
    }

    /// Hard ceiling for one whole poll cycle, connect included. Keeps a
    /// wedged IMAP conversation from pinning a worker slot forever.
    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs(self.cycle_budget_seconds.max(1))
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Ok(AppConfig {
            server: ServerConfig {
                host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_or("SERVER_PORT", 8080),
            },
            sweep: SweepConfig {
                tick_seconds: env_or("SWEEP_TICK_SECONDS", 60),
                max_workers: env_or("SWEEP_MAX_WORKERS", 4),
                connect_timeout_seconds: env_or("IMAP_CONNECT_TIMEOUT_SECONDS", 30),
                fetch_timeout_seconds: env_or("IMAP_FETCH_TIMEOUT_SECONDS", 60),
                cycle_budget_seconds: env_or("POLL_CYCLE_BUDGET_SECONDS", 300),
            },
        })
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
