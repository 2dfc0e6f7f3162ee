use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn from_env_var(value: Option<&str>) -> Self {
        match value {
            Some("production") => Self::Production,
            _ => Self::Development,
        }
    }
}

/// Process-wide runtime knobs, passed explicitly at startup. There is no
/// process-global mutable configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub environment: Environment,
    /// Log worker pass interval.
    #[serde(default = "default_worker_tick_ms")]
    pub worker_tick_ms: u64,
    /// Messages claimed from the main queue per pass.
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
    /// Streaming scanner accumulation cap; overflow drops the buffer.
    #[serde(default = "default_stream_buffer_cap")]
    pub stream_buffer_cap: usize,
    /// How long `stop` waits for the worker loop to drain.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_worker_tick_ms() -> u64 {
    1_000
}

fn default_claim_batch_size() -> usize {
    10
}

fn default_stream_buffer_cap() -> usize {
    10 * 1024 * 1024
}

fn default_stop_grace_ms() -> u64 {
    15_000
}

impl RuntimeConfig {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            worker_tick_ms: default_worker_tick_ms(),
            claim_batch_size: default_claim_batch_size(),
            stream_buffer_cap: default_stream_buffer_cap(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Auto-topup runs every Nth worker iteration.
    pub fn topup_every(&self) -> u64 {
        match self.environment {
            Environment::Production => 120,
            Environment::Development => 5,
        }
    }

    /// Queue depth stats are logged every Nth worker iteration.
    pub fn stats_every(&self) -> u64 {
        match self.environment {
            Environment::Production => 60,
            Environment::Development => 10,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(Environment::Development)
    }
}

/// Provider credentials captured from the process environment once at
/// startup, so request handling never reads env vars and tests can inject
/// a plain map.
#[derive(Clone, Debug, Default)]
pub struct ProviderEnv {
    vars: BTreeMap<String, String>,
}

impl ProviderEnv {
    pub fn from_process_env() -> Self {
        let vars = std::env::vars()
            .filter(|(_, value)| !value.is_empty())
            .collect();
        Self { vars }
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            vars: vars.into_iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadences_follow_environment() {
        let prod = RuntimeConfig::new(Environment::Production);
        assert_eq!(prod.topup_every(), 120);
        assert_eq!(prod.stats_every(), 60);

        let dev = RuntimeConfig::new(Environment::Development);
        assert_eq!(dev.topup_every(), 5);
        assert_eq!(dev.stats_every(), 10);
    }

    #[test]
    fn env_lookup_skips_empty_values() {
        let env = ProviderEnv::from_vars([
            ("OPENAI_API_KEY".to_string(), "sk-live".to_string()),
            ("GROQ_API_KEY".to_string(), String::new()),
        ]);
        assert_eq!(env.get("OPENAI_API_KEY"), Some("sk-live"));
        assert_eq!(env.get("GROQ_API_KEY"), None);
        assert_eq!(env.get("XAI_API_KEY"), None);
    }
}
