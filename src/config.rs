use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Prefix of the claim tag written into `processing_node`
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_node_id() -> String {
    "settlement-node-1".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "settlement.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            node_id: default_node_id(),
            queue: QueueConfig::default(),
            simulation: SimulationConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Queue engine tuning
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueConfig {
    /// Items claimed per `process_next_batch` call
    pub batch_size: usize,
    /// Attempts per queue item before the transaction is failed
    pub max_retries: u32,
    /// Retry N (0-indexed) waits `backoff_base_secs * 2^N`
    pub backoff_base_secs: i64,
    /// Claims older than this are considered orphaned
    pub stuck_timeout_secs: i64,
    /// Upper bound for `get_queue_status`
    pub status_page_size: usize,
    #[serde(default)]
    pub stage_delays: StageDelays,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            backoff_base_secs: 30,
            stuck_timeout_secs: 300,
            status_page_size: 50,
            stage_delays: StageDelays::default(),
        }
    }
}

impl QueueConfig {
    pub fn stuck_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_timeout_secs)
    }
}

/// Delay between enqueue and the earliest processing time, per target stage
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageDelays {
    pub pending_secs: i64,
    pub sent_secs: i64,
    pub completed_secs: i64,
    /// Any other target (e.g. an explicit move to Failed)
    pub default_secs: i64,
}

impl Default for StageDelays {
    fn default() -> Self {
        Self {
            pending_secs: 10,
            sent_secs: 30,
            completed_secs: 120,
            default_secs: 300,
        }
    }
}

impl StageDelays {
    /// All-zero delays; items become due as soon as they are enqueued
    pub fn immediate() -> Self {
        Self {
            pending_secs: 0,
            sent_secs: 0,
            completed_secs: 0,
            default_secs: 0,
        }
    }
}

/// Simulated bank behaviour
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SimulationConfig {
    /// Probability that the interbank handoff succeeds
    pub send_success_rate: f64,
    /// Probability that the recipient bank acknowledges
    pub acknowledge_success_rate: f64,
    pub screening_latency: LatencyRange,
    pub send_latency: LatencyRange,
    pub acknowledge_latency: LatencyRange,
    /// Fixed seed for reproducible runs
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            send_success_rate: 0.95,
            acknowledge_success_rate: 0.90,
            screening_latency: LatencyRange::new(1000, 3000),
            send_latency: LatencyRange::new(2000, 5000),
            acknowledge_latency: LatencyRange::new(1000, 4000),
            seed: None,
        }
    }
}

impl SimulationConfig {
    /// No latency and no failures
    pub fn instant() -> Self {
        Self {
            send_success_rate: 1.0,
            acknowledge_success_rate: 1.0,
            screening_latency: LatencyRange::ZERO,
            send_latency: LatencyRange::ZERO,
            acknowledge_latency: LatencyRange::ZERO,
            seed: None,
        }
    }
}

/// Inclusive latency window in milliseconds
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct LatencyRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencyRange {
    pub const ZERO: LatencyRange = LatencyRange {
        min_ms: 0,
        max_ms: 0,
    };

    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn is_zero(&self) -> bool {
        self.max_ms == 0
    }
}

/// Worker pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Concurrent tasks allowed in flight
    pub worker_count: usize,
    /// How often the pool pulls a batch
    pub poll_interval_ms: u64,
    /// How often the stuck-item sweep runs
    pub recovery_interval_ms: u64,
    /// Capacity of the explicit hand-off channel
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 1_000,
            recovery_interval_ms: 60_000,
            channel_capacity: 1024,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms.max(1))
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
