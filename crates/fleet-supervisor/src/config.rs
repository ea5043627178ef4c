//! Supervisor tunables.
//!
//! Durations deserialize from strings like `"500ms"`, `"15s"`, `"5m"`,
//! `"24h"` or a bare integer number of seconds.

use std::time::Duration;

use fleet_state::{Node, NodeState};
use serde::{Deserialize, Serialize};

/// Where nodes run. Local mode shortens timeouts and treats a stuck drain
/// as already idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Local,
    #[default]
    Remote,
}

/// Everything the supervisor needs at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub mode: RunnerMode,
    /// Lock budget for one tick. Past it the executor is asked to stop.
    #[serde(with = "duration_str")]
    pub tick_timeout: Duration,
    /// How long `stop()` waits for the loop to wind down.
    #[serde(with = "duration_str")]
    pub stop_timeout: Duration,
    /// Pause after a failed or skipped tick.
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    /// Pause between ticks, outside the lock.
    #[serde(with = "duration_str")]
    pub tick_interval: Duration,
    /// Node search page size.
    pub page_size: usize,
    /// Per-state timeouts. Derived from `mode` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<StateTimeouts>,
    pub notify: NotifyConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mode: RunnerMode::Remote,
            tick_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            page_size: fleet_state::DEFAULT_SEARCH_LIMIT,
            timeouts: None,
            notify: NotifyConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Defaults for running nodes as local processes.
    pub fn local() -> Self {
        Self {
            mode: RunnerMode::Local,
            ..Self::default()
        }
    }

    /// Timeouts in effect: the explicit table, or the mode's defaults.
    pub fn state_timeouts(&self) -> StateTimeouts {
        self.timeouts
            .clone()
            .unwrap_or_else(|| StateTimeouts::for_mode(self.mode))
    }
}

/// How long a node may sit in a state before the planner acts on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTimeouts {
    #[serde(with = "duration_str")]
    pub pending: Duration,
    #[serde(with = "duration_str")]
    pub starting: Duration,
    #[serde(with = "duration_str")]
    pub finishing: Duration,
    #[serde(with = "duration_str")]
    pub idle: Duration,
    /// Retention of TERMINATED records before removal.
    #[serde(with = "duration_str")]
    pub terminated: Duration,
    /// Retention of ERROR records before removal.
    #[serde(with = "duration_str")]
    pub error: Duration,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self::for_mode(RunnerMode::Remote)
    }
}

impl StateTimeouts {
    pub fn for_mode(mode: RunnerMode) -> Self {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        let (starting, finishing) = match mode {
            RunnerMode::Local => (Duration::from_secs(15), Duration::from_secs(15)),
            RunnerMode::Remote => (Duration::from_secs(5 * MINUTE), Duration::from_secs(24 * HOUR)),
        };
        Self {
            pending: Duration::from_secs(15 * MINUTE),
            starting,
            finishing,
            idle: Duration::from_secs(15 * MINUTE),
            terminated: Duration::from_secs(24 * HOUR),
            error: Duration::from_secs(24 * HOUR),
        }
    }

    /// Timeout for `state`, if the state has one.
    pub fn get(&self, state: NodeState) -> Option<Duration> {
        match state {
            NodeState::Pending => Some(self.pending),
            NodeState::Starting => Some(self.starting),
            NodeState::Finishing => Some(self.finishing),
            NodeState::Idle => Some(self.idle),
            NodeState::Terminated => Some(self.terminated),
            NodeState::Error => Some(self.error),
            NodeState::Running | NodeState::Outdated => None,
        }
    }

    /// `now - last_state_transition_at > timeout[state]`, all in milliseconds.
    pub fn is_timed_out(&self, node: &Node, now: u64) -> bool {
        self.get(node.state)
            .is_some_and(|timeout| u128::from(node.time_in_state(now)) > timeout.as_millis())
    }
}

/// Retry policy for the drain notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt. Doubles after each failure.
    #[serde(with = "duration_str")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl NotifyConfig {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Parse a duration string like "500ms", "5s", "1m", "24h" or "30".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().and_then(|m| m.checked_mul(60)).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().and_then(|h| h.checked_mul(3600)).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text)
                .ok_or_else(|| de::Error::custom(format!("invalid duration: {text}"))),
        }
    }
}
