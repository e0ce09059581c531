//! The scheduler process: listener, worker table and expert lifecycle.

use crate::error::{Error, Result};
use crate::scheduler::messages::{ExpertRecord, ExpertState, SchedulerMessage, WorkerMessage};
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a worker may sit on a `job` without confirming `started`.
    pub pending_job_timer: Duration,
    /// Granularity of deadline checks.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pending_job_timer: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Point-in-time view of one tracked expert.
#[derive(Debug, Clone)]
pub struct ExpertSnapshot {
    pub pubkey: String,
    pub state: ExpertState,
    pub assigned_to: Option<String>,
}

/// Point-in-time view of one connected worker.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub assigned: Vec<String>,
    pub ready: bool,
    pub needs_job: bool,
}

/// Point-in-time view of the whole control plane, for operators and tests.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub experts: Vec<ExpertSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
}

type ConnId = u64;

enum Ctl {
    Connected {
        conn: ConnId,
        tx: mpsc::UnboundedSender<SchedulerMessage>,
    },
    Message {
        conn: ConnId,
        msg: WorkerMessage,
    },
    Disconnected {
        conn: ConnId,
    },
    Tick,
    Upsert {
        record: ExpertRecord,
        nwc: String,
    },
    Remove {
        pubkey: String,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
}

/// Handle to a running scheduler.
pub struct Scheduler {
    ctl: mpsc::UnboundedSender<Ctl>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl Scheduler {
    /// Bind `addr` and start accepting worker connections.
    pub async fn start(addr: &str, config: SchedulerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Scheduler(format!("Bind {addr} failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Scheduler(format!("{e}")))?;

        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(listener, ctl_tx.clone(), cancel.clone()));
        tokio::spawn(tick_loop(
            ctl_tx.clone(),
            config.tick_interval,
            cancel.clone(),
        ));
        tokio::spawn(event_loop(ctl_rx, config, cancel.clone()));

        log::info!("Scheduler listening on {local_addr}");
        Ok(Self {
            ctl: ctl_tx,
            cancel,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the listener and the event loop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Insert or update an expert record.
    ///
    /// An update of a started expert triggers a `restart` on its worker;
    /// an update while it is stopping is buffered and applied afterwards.
    pub fn upsert_expert(&self, record: ExpertRecord, nwc: impl Into<String>) -> Result<()> {
        self.ctl
            .send(Ctl::Upsert {
                record,
                nwc: nwc.into(),
            })
            .map_err(|_| Error::Scheduler("Scheduler stopped".into()))
    }

    /// Remove an expert; a running instance is asked to stop first.
    pub fn remove_expert(&self, pubkey: &str) -> Result<()> {
        self.ctl
            .send(Ctl::Remove {
                pubkey: pubkey.to_string(),
            })
            .map_err(|_| Error::Scheduler("Scheduler stopped".into()))
    }

    /// Current expert and worker tables.
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.ctl
            .send(Ctl::Snapshot { reply: tx })
            .map_err(|_| Error::Scheduler("Scheduler stopped".into()))?;
        rx.await
            .map_err(|_| Error::Scheduler("Scheduler stopped".into()))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctl: mpsc::UnboundedSender<Ctl>,
    cancel: CancellationToken,
) {
    let mut next_conn: ConnId = 0;
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => break,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("Accept failed: {e}");
                continue;
            }
        };
        let conn = next_conn;
        next_conn += 1;
        log::debug!("Worker connection {conn} from {peer}");
        tokio::spawn(connection_task(stream, conn, ctl.clone(), cancel.clone()));
    }
}

async fn connection_task(
    stream: TcpStream,
    conn: ConnId,
    ctl: mpsc::UnboundedSender<Ctl>,
    cancel: CancellationToken,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("Handshake failed on connection {conn}: {e}");
            return;
        }
    };
    let (mut sink, mut reader) = ws.split();

    let (tx, mut outbound) = mpsc::unbounded_channel::<SchedulerMessage>();
    if ctl.send(Ctl::Connected { conn, tx }).is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            out = outbound.recv() => {
                let Some(msg) = out else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("Unserializable scheduler message: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            incoming = reader.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WorkerMessage>(text.as_str()) {
                            Ok(msg) => {
                                let _ = ctl.send(Ctl::Message { conn, msg });
                            }
                            // Unknown message types are ignored by contract.
                            Err(e) => log::debug!("Ignoring message on {conn}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Read error on connection {conn}: {e}");
                        break;
                    }
                }
            }
        }
    }

    let _ = ctl.send(Ctl::Disconnected { conn });
}

async fn tick_loop(
    ctl: mpsc::UnboundedSender<Ctl>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                if ctl.send(Ctl::Tick).is_err() {
                    break;
                }
            }
        }
    }
}

struct ExpertEntry {
    record: ExpertRecord,
    nwc: String,
    state: ExpertState,
    assigned_to: Option<String>,
    /// Deadline for a `started` confirmation after a job was sent.
    pending_deadline: Option<Instant>,
    /// Configuration update waiting for the in-flight stop to finish.
    pending_update: Option<(ExpertRecord, String)>,
    /// The current `stopping` is the first half of a restart.
    restarting: bool,
    /// The expert leaves the table once it confirms `stopped`.
    removing: bool,
}

struct WorkerEntry {
    conn: ConnId,
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    assigned: HashSet<String>,
    last_activity: Instant,
    needs_job: bool,
    ready: bool,
}

impl WorkerEntry {
    fn send(&self, msg: SchedulerMessage) {
        let _ = self.tx.send(msg);
    }
}

/// All mutable scheduler state; touched only by the event loop.
struct State {
    /// Keyed by pubkey; BTreeMap gives the deterministic assignment order.
    experts: BTreeMap<String, ExpertEntry>,
    workers: HashMap<String, WorkerEntry>,
    /// Connections that have not yet identified a worker.
    conns: HashMap<ConnId, mpsc::UnboundedSender<SchedulerMessage>>,
    pending_job_timer: Duration,
}

async fn event_loop(
    mut ctl: mpsc::UnboundedReceiver<Ctl>,
    config: SchedulerConfig,
    cancel: CancellationToken,
) {
    let mut state = State {
        experts: BTreeMap::new(),
        workers: HashMap::new(),
        conns: HashMap::new(),
        pending_job_timer: config.pending_job_timer,
    };

    loop {
        let msg = tokio::select! {
            msg = ctl.recv() => msg,
            _ = cancel.cancelled() => break,
        };
        let Some(msg) = msg else { break };
        match msg {
            Ctl::Connected { conn, tx } => {
                state.conns.insert(conn, tx);
            }
            Ctl::Message { conn, msg } => state.handle_message(conn, msg),
            Ctl::Disconnected { conn } => state.handle_disconnected(conn),
            Ctl::Tick => state.handle_tick(),
            Ctl::Upsert { record, nwc } => state.handle_upsert(record, nwc),
            Ctl::Remove { pubkey } => state.handle_remove(&pubkey),
            Ctl::Snapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }
        }
    }
}

impl State {
    fn handle_message(&mut self, conn: ConnId, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Experts { worker_id, experts } => {
                self.bind_worker(conn, &worker_id);
                self.handle_experts(&worker_id, experts);
            }
            WorkerMessage::NeedJob { worker_id } => {
                self.bind_worker(conn, &worker_id);
                self.handle_need_job(&worker_id);
            }
            WorkerMessage::Started { worker_id, expert } => {
                self.bind_worker(conn, &worker_id);
                self.handle_started(&worker_id, &expert);
            }
            WorkerMessage::Stopped { worker_id, expert } => {
                self.bind_worker(conn, &worker_id);
                self.handle_stopped(&worker_id, &expert);
            }
        }
    }

    /// Associate a connection with the worker id it claims. A fresh
    /// connection claiming a known id supersedes the old one (operator
    /// drain or reconnect).
    fn bind_worker(&mut self, conn: ConnId, worker_id: &str) {
        let Some(tx) = self.conns.get(&conn).cloned() else {
            return;
        };
        match self.workers.get_mut(worker_id) {
            Some(worker) => {
                worker.last_activity = Instant::now();
                if worker.conn != conn {
                    log::info!("Worker {worker_id} reconnected on connection {conn}");
                    worker.conn = conn;
                    worker.tx = tx;
                }
            }
            None => {
                self.workers.insert(
                    worker_id.to_string(),
                    WorkerEntry {
                        conn,
                        tx,
                        assigned: HashSet::new(),
                        last_activity: Instant::now(),
                        needs_job: false,
                        ready: true,
                    },
                );
            }
        }
    }

    /// Reconcile a worker's declaration of what it runs.
    fn handle_experts(&mut self, worker_id: &str, declared: Vec<String>) {
        let declared: HashSet<String> = declared.into_iter().collect();

        // A fresh announcement lifts any penalty.
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.ready = true;
        }

        for pubkey in &declared {
            match self.experts.get_mut(pubkey) {
                None => {
                    // Not in the database; nothing it should be running.
                    log::warn!("Worker {worker_id} runs unknown expert {pubkey}");
                    if let Some(worker) = self.workers.get(worker_id) {
                        worker.send(SchedulerMessage::Stop {
                            expert: pubkey.clone(),
                        });
                    }
                }
                Some(entry) => {
                    match &entry.assigned_to {
                        Some(owner) if owner == worker_id => {
                            // Confirmation of what we already believe. A
                            // stop or restart in flight settles through its
                            // own acks, not through announcements.
                            if matches!(
                                entry.state,
                                ExpertState::Starting | ExpertState::Started
                            ) {
                                entry.state = ExpertState::Started;
                                entry.pending_deadline = None;
                            }
                        }
                        Some(owner) if self.workers.contains_key(owner) => {
                            // Someone else holds it; never allow two
                            // started instances.
                            log::warn!(
                                "Worker {worker_id} also runs {pubkey} (owned by {owner})"
                            );
                            if let Some(worker) = self.workers.get(worker_id) {
                                worker.send(SchedulerMessage::Stop {
                                    expert: pubkey.clone(),
                                });
                            }
                        }
                        _ => {
                            // Stale state from a past life: adopt it.
                            log::info!("Adopting expert {pubkey} from worker {worker_id}");
                            entry.assigned_to = Some(worker_id.to_string());
                            entry.state = ExpertState::Started;
                            entry.pending_deadline = None;
                            if let Some(worker) = self.workers.get_mut(worker_id) {
                                worker.assigned.insert(pubkey.clone());
                            }
                        }
                    }
                }
            }
        }

        // Anything we thought the worker ran but it no longer declares
        // exited involuntarily. Jobs still in flight are exempt.
        let assigned: Vec<String> = self
            .workers
            .get(worker_id)
            .map(|w| w.assigned.iter().cloned().collect())
            .unwrap_or_default();
        for pubkey in assigned {
            if declared.contains(&pubkey) {
                continue;
            }
            let Some(entry) = self.experts.get(&pubkey) else {
                continue;
            };
            if entry.state == ExpertState::Started {
                log::warn!("Worker {worker_id} lost expert {pubkey}; requeueing");
                self.requeue(&pubkey);
            }
        }

        self.dispatch_queued();
    }

    fn handle_need_job(&mut self, worker_id: &str) {
        let ready = self.workers.get(worker_id).is_some_and(|w| w.ready);
        if !ready {
            // Penalized workers get nothing until their next announcement.
            if let Some(worker) = self.workers.get(worker_id) {
                worker.send(SchedulerMessage::NoJob);
            }
            return;
        }
        let Some(candidate) = self.next_queued() else {
            if let Some(worker) = self.workers.get_mut(worker_id) {
                worker.needs_job = true;
                worker.send(SchedulerMessage::NoJob);
            }
            return;
        };
        self.assign(&candidate, worker_id);
    }

    fn handle_started(&mut self, worker_id: &str, pubkey: &str) {
        let Some(entry) = self.experts.get_mut(pubkey) else {
            return;
        };
        if entry.assigned_to.as_deref() != Some(worker_id) {
            log::warn!("Unexpected started for {pubkey} from {worker_id}");
            return;
        }
        entry.state = ExpertState::Started;
        entry.pending_deadline = None;
        entry.restarting = false;

        // A config update raced the start: restart with the new snapshot.
        if let Some((record, nwc)) = entry.pending_update.take() {
            entry.record = record.clone();
            entry.nwc = nwc.clone();
            entry.state = ExpertState::Stopping;
            entry.restarting = true;
            if let Some(worker) = self.workers.get(worker_id) {
                worker.send(SchedulerMessage::Restart {
                    expert: pubkey.to_string(),
                    record,
                    nwc,
                });
            }
        }
    }

    fn handle_stopped(&mut self, worker_id: &str, pubkey: &str) {
        let Some(entry) = self.experts.get_mut(pubkey) else {
            return;
        };
        if entry.assigned_to.as_deref() != Some(worker_id) {
            return;
        }

        if entry.removing {
            self.unassign(worker_id, pubkey);
            self.experts.remove(pubkey);
            log::info!("Expert {pubkey} removed");
            return;
        }

        if entry.restarting {
            // First half of a restart done; the worker brings the expert
            // back up with the snapshot it already has.
            entry.state = ExpertState::Starting;
            entry.pending_deadline = Some(Instant::now() + self.pending_job_timer);
            return;
        }

        if let Some((record, nwc)) = entry.pending_update.take() {
            // Buffered update applied after the stop completed.
            entry.record = record.clone();
            entry.nwc = nwc.clone();
            entry.state = ExpertState::Starting;
            entry.pending_deadline = Some(Instant::now() + self.pending_job_timer);
            if let Some(worker) = self.workers.get(worker_id) {
                worker.send(SchedulerMessage::Job {
                    expert: pubkey.to_string(),
                    record,
                    nwc,
                });
            }
            return;
        }

        match entry.state {
            ExpertState::Stopping => {
                // Operator-requested stop; stays parked.
                entry.state = ExpertState::Stopped;
                entry.pending_deadline = None;
                self.unassign(worker_id, pubkey);
            }
            _ => {
                // Involuntary exit (crash, failed start): back to the queue.
                log::warn!("Expert {pubkey} exited on {worker_id}; requeueing");
                self.requeue(pubkey);
                self.dispatch_queued();
            }
        }
    }

    fn handle_disconnected(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        let Some(worker_id) = self
            .workers
            .iter()
            .find(|(_, w)| w.conn == conn)
            .map(|(id, _)| id.clone())
        else {
            return;
        };

        let assigned = self
            .workers
            .remove(&worker_id)
            .map(|w| w.assigned)
            .unwrap_or_default();
        log::warn!(
            "Worker {worker_id} lost; requeueing {} experts",
            assigned.len()
        );
        for pubkey in assigned {
            self.requeue(&pubkey);
        }
        self.dispatch_queued();
    }

    fn handle_tick(&mut self) {
        let now = Instant::now();
        let expired: Vec<(String, Option<String>)> = self
            .experts
            .iter()
            .filter(|(_, e)| {
                e.state == ExpertState::Starting
                    && e.pending_deadline.is_some_and(|d| d <= now)
            })
            .map(|(pubkey, e)| (pubkey.clone(), e.assigned_to.clone()))
            .collect();

        for (pubkey, worker_id) in expired {
            log::warn!("Job for {pubkey} not confirmed in time; requeueing");
            self.requeue(&pubkey);
            // Penalize: no further work until the next announcement.
            if let Some(worker_id) = worker_id {
                if let Some(worker) = self.workers.get_mut(&worker_id) {
                    worker.ready = false;
                }
            }
        }

        self.dispatch_queued();
    }

    fn handle_upsert(&mut self, record: ExpertRecord, nwc: String) {
        let pubkey = record.pubkey.clone();
        match self.experts.get_mut(&pubkey) {
            None => {
                self.experts.insert(
                    pubkey.clone(),
                    ExpertEntry {
                        record,
                        nwc,
                        state: ExpertState::Queued,
                        assigned_to: None,
                        pending_deadline: None,
                        pending_update: None,
                        restarting: false,
                        removing: false,
                    },
                );
                log::info!("Expert {pubkey} queued");
                self.dispatch_queued();
            }
            Some(entry) => {
                if entry.record == record && entry.nwc == nwc {
                    return;
                }
                match entry.state {
                    ExpertState::Started => {
                        entry.record = record.clone();
                        entry.nwc = nwc.clone();
                        entry.state = ExpertState::Stopping;
                        entry.restarting = true;
                        let owner = entry.assigned_to.clone();
                        if let Some(worker) =
                            owner.as_deref().and_then(|id| self.workers.get(id))
                        {
                            worker.send(SchedulerMessage::Restart {
                                expert: pubkey,
                                record,
                                nwc,
                            });
                        }
                    }
                    ExpertState::Starting | ExpertState::Stopping => {
                        // Applied once the in-flight transition settles.
                        entry.pending_update = Some((record, nwc));
                    }
                    ExpertState::Queued | ExpertState::Stopped => {
                        entry.record = record;
                        entry.nwc = nwc;
                    }
                }
            }
        }
    }

    fn handle_remove(&mut self, pubkey: &str) {
        let Some(entry) = self.experts.get_mut(pubkey) else {
            return;
        };
        match &entry.assigned_to {
            Some(worker_id) if self.workers.contains_key(worker_id) => {
                entry.removing = true;
                entry.state = ExpertState::Stopping;
                let worker_id = worker_id.clone();
                if let Some(worker) = self.workers.get(&worker_id) {
                    worker.send(SchedulerMessage::Stop {
                        expert: pubkey.to_string(),
                    });
                }
            }
            _ => {
                self.experts.remove(pubkey);
                log::info!("Expert {pubkey} removed");
            }
        }
    }

    /// First queued, unassigned expert in pubkey-ascending order.
    fn next_queued(&self) -> Option<String> {
        self.experts
            .iter()
            .find(|(_, e)| e.state == ExpertState::Queued && e.assigned_to.is_none())
            .map(|(pubkey, _)| pubkey.clone())
    }

    fn assign(&mut self, pubkey: &str, worker_id: &str) {
        let deadline = Instant::now() + self.pending_job_timer;
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return;
        };
        let Some(entry) = self.experts.get_mut(pubkey) else {
            return;
        };
        entry.state = ExpertState::Starting;
        entry.assigned_to = Some(worker_id.to_string());
        entry.pending_deadline = Some(deadline);
        worker.assigned.insert(pubkey.to_string());
        worker.needs_job = false;
        worker.send(SchedulerMessage::Job {
            expert: pubkey.to_string(),
            record: entry.record.clone(),
            nwc: entry.nwc.clone(),
        });
        log::info!("Expert {pubkey} assigned to worker {worker_id}");
    }

    /// Hand queued experts to workers that signalled spare capacity.
    fn dispatch_queued(&mut self) {
        loop {
            let Some(pubkey) = self.next_queued() else { break };
            let mut ids: Vec<String> = self
                .workers
                .iter()
                .filter(|(_, w)| w.needs_job && w.ready)
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            let Some(worker_id) = ids.into_iter().next() else {
                break;
            };
            self.assign(&pubkey, &worker_id);
        }
    }

    fn requeue(&mut self, pubkey: &str) {
        let Some(entry) = self.experts.get_mut(pubkey) else {
            return;
        };
        if let Some(worker_id) = entry.assigned_to.take() {
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                worker.assigned.remove(pubkey);
            }
        }
        entry.state = ExpertState::Queued;
        entry.pending_deadline = None;
        entry.restarting = false;
        // A buffered update becomes the queued snapshot.
        if let Some((record, nwc)) = entry.pending_update.take() {
            entry.record = record;
            entry.nwc = nwc;
        }
    }

    fn unassign(&mut self, worker_id: &str, pubkey: &str) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.assigned.remove(pubkey);
        }
        if let Some(entry) = self.experts.get_mut(pubkey) {
            entry.assigned_to = None;
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            experts: self
                .experts
                .iter()
                .map(|(pubkey, e)| ExpertSnapshot {
                    pubkey: pubkey.clone(),
                    state: e.state,
                    assigned_to: e.assigned_to.clone(),
                })
                .collect(),
            workers: self
                .workers
                .iter()
                .map(|(id, w)| WorkerSnapshot {
                    worker_id: id.clone(),
                    assigned: w.assigned.iter().cloned().collect(),
                    ready: w.ready,
                    needs_job: w.needs_job,
                })
                .collect(),
        }
    }
}
