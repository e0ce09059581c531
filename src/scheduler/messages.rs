//! Control-channel wire format: JSON messages over a WebSocket.
//!
//! Unrecognized message types are ignored by both sides so either end can
//! evolve independently.

use serde::{Deserialize, Serialize};

/// Full configuration snapshot of one expert, as stored by the operator
/// and shipped to workers inside `job`/`restart` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertRecord {
    /// Hex public key; the scheduler's primary key for the expert.
    pub pubkey: String,
    /// Hex secret key the worker signs with.
    pub privkey: String,
    pub nickname: String,
    #[serde(default)]
    pub description: String,
    /// Model identifier driving the answer generator.
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub discovery_relays: Vec<String>,
    #[serde(default)]
    pub prompt_relays: Vec<String>,
    /// Multiplier applied on top of raw model token prices.
    #[serde(default)]
    pub price_margin: f64,
}

/// Scheduler-tracked lifecycle state of an expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertState {
    Queued,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Messages a worker sends to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Declaration of what the worker currently runs; sent on connect and
    /// periodically as a liveness signal.
    Experts {
        worker_id: String,
        experts: Vec<String>,
    },
    /// The worker has spare capacity.
    NeedJob { worker_id: String },
    /// Confirms `starting → started`.
    Started { worker_id: String, expert: String },
    /// Confirms `stopping → stopped`, or reports an involuntary exit.
    Stopped { worker_id: String, expert: String },
}

/// Messages the scheduler sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerMessage {
    /// Assign an expert, including its full configuration snapshot.
    Job {
        expert: String,
        record: ExpertRecord,
        nwc: String,
    },
    /// No work available; the worker should idle but keep the connection.
    NoJob,
    /// Wind the expert down.
    Stop { expert: String },
    /// Configuration changed: wind down, then bring back up with the new
    /// snapshot.
    Restart {
        expert: String,
        record: ExpertRecord,
        nwc: String,
    },
}
