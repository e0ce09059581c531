//! Control plane assigning experts to worker processes.
//!
//! Workers dial the scheduler over a WebSocket and exchange the JSON
//! messages of [`messages`]. All scheduler state lives on a single event
//! loop task; connection readers only deserialize and forward.

mod messages;
mod server;

pub use messages::{ExpertRecord, ExpertState, SchedulerMessage, WorkerMessage};
pub use server::{
    ExpertSnapshot, Scheduler, SchedulerConfig, SchedulerSnapshot, WorkerSnapshot,
};
