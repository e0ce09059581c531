//! Worker process: dials the scheduler, runs assigned experts and reports
//! lifecycle transitions back.

use crate::error::{Error, Result};
use crate::scheduler::{ExpertRecord, SchedulerMessage, WorkerMessage};
use crate::types::OpFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A running expert instance owned by a worker.
pub trait RunningExpert: Send + Sync {
    /// Wind the instance down. Idempotent.
    fn stop(&self) -> OpFuture<'_, ()>;
}

impl RunningExpert for crate::expert::Expert {
    fn stop(&self) -> OpFuture<'_, ()> {
        crate::expert::Expert::stop(self);
        Box::pin(async { Ok(()) })
    }
}

/// Builds expert instances from their configuration snapshots.
pub trait ExpertFactory: Send + Sync {
    fn build<'a>(
        &'a self,
        record: &'a ExpertRecord,
        nwc: &'a str,
    ) -> OpFuture<'a, Box<dyn RunningExpert>>;
}

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Stable worker identifier; generated when absent.
    pub worker_id: Option<String>,
    /// Maximum experts run concurrently.
    pub capacity: usize,
    /// Period of the `experts` liveness announcement.
    pub announce_interval: Duration,
    /// Base delay between reconnect attempts.
    pub reconnect_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: None,
            capacity: 1,
            announce_interval: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

/// Handle to a running worker.
pub struct Worker {
    worker_id: String,
    cancel: CancellationToken,
}

impl Worker {
    /// Spawn the worker loop dialing `url` (a `ws://host:port` address).
    pub fn connect(
        url: impl Into<String>,
        factory: Arc<dyn ExpertFactory>,
        options: WorkerOptions,
    ) -> Self {
        let worker_id = options
            .worker_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancel = CancellationToken::new();

        let task = WorkerTask {
            url: url.into(),
            worker_id: worker_id.clone(),
            factory,
            options,
            cancel: cancel.clone(),
            running: HashMap::new(),
        };
        tokio::spawn(task.run());

        Self { worker_id, cancel }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Disconnect and stop every running expert. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WorkerTask {
    url: String,
    worker_id: String,
    factory: Arc<dyn ExpertFactory>,
    options: WorkerOptions,
    cancel: CancellationToken,
    running: HashMap<String, Box<dyn RunningExpert>>,
}

impl WorkerTask {
    async fn run(mut self) {
        let mut backoff = self.options.reconnect_backoff;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match connect_async(self.url.as_str()).await {
                Ok((ws, _response)) => {
                    backoff = self.options.reconnect_backoff;
                    let (sink, stream) = ws.split();
                    if let Err(e) = self.session(sink, stream).await {
                        log::warn!("Worker session ended: {e}");
                    }
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("Scheduler dial failed: {e}; retry in {backoff:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }

        for (pubkey, expert) in self.running.drain() {
            log::info!("Stopping expert {pubkey}");
            let _ = expert.stop().await;
        }
    }

    /// One connected session; returns when the connection drops.
    async fn session(&mut self, mut sink: WsSink, mut stream: WsStream) -> Result<()> {
        // Announce current state first so the scheduler can rebuild its
        // assignment after our reconnect.
        self.announce(&mut sink).await?;
        if self.running.len() < self.options.capacity {
            self.send(&mut sink, &WorkerMessage::NeedJob {
                worker_id: self.worker_id.clone(),
            })
            .await?;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return Ok(());
                }

                _ = tokio::time::sleep(self.options.announce_interval) => {
                    self.announce(&mut sink).await?;
                    if self.running.len() < self.options.capacity {
                        self.send(&mut sink, &WorkerMessage::NeedJob {
                            worker_id: self.worker_id.clone(),
                        })
                        .await?;
                    }
                }

                incoming = stream.next() => {
                    let msg = match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SchedulerMessage>(text.as_str()) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    // Unknown types are ignored by contract.
                                    log::debug!("Ignoring scheduler message: {e}");
                                    continue;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Error::Scheduler("Connection closed".into()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Err(Error::Scheduler(format!("Read error: {e}")));
                        }
                    };
                    self.handle(&mut sink, msg).await?;
                }
            }
        }
    }

    async fn handle(&mut self, sink: &mut WsSink, msg: SchedulerMessage) -> Result<()> {
        match msg {
            SchedulerMessage::Job {
                expert,
                record,
                nwc,
            } => {
                if self.running.contains_key(&expert) {
                    // Already running (stale scheduler state); confirm.
                    self.send(sink, &WorkerMessage::Started {
                        worker_id: self.worker_id.clone(),
                        expert,
                    })
                    .await?;
                    return Ok(());
                }
                self.start_expert(sink, expert, &record, &nwc).await?;
                if self.running.len() < self.options.capacity {
                    self.send(sink, &WorkerMessage::NeedJob {
                        worker_id: self.worker_id.clone(),
                    })
                    .await?;
                }
            }
            SchedulerMessage::NoJob => {
                // Idle; the announce timer retries when capacity remains.
            }
            SchedulerMessage::Stop { expert } => {
                self.stop_expert(sink, &expert).await?;
                if self.running.len() < self.options.capacity {
                    self.send(sink, &WorkerMessage::NeedJob {
                        worker_id: self.worker_id.clone(),
                    })
                    .await?;
                }
            }
            SchedulerMessage::Restart {
                expert,
                record,
                nwc,
            } => {
                self.stop_expert(sink, &expert).await?;
                self.start_expert(sink, expert, &record, &nwc).await?;
            }
        }
        Ok(())
    }

    async fn start_expert(
        &mut self,
        sink: &mut WsSink,
        expert: String,
        record: &ExpertRecord,
        nwc: &str,
    ) -> Result<()> {
        match self.factory.build(record, nwc).await {
            Ok(instance) => {
                self.running.insert(expert.clone(), instance);
                log::info!("Expert {expert} started");
                self.send(sink, &WorkerMessage::Started {
                    worker_id: self.worker_id.clone(),
                    expert,
                })
                .await
            }
            Err(e) => {
                // Report the failed start so the scheduler requeues
                // without waiting out its job timer.
                log::error!("Expert {expert} failed to start: {e}");
                self.send(sink, &WorkerMessage::Stopped {
                    worker_id: self.worker_id.clone(),
                    expert,
                })
                .await
            }
        }
    }

    async fn stop_expert(&mut self, sink: &mut WsSink, expert: &str) -> Result<()> {
        if let Some(instance) = self.running.remove(expert) {
            let _ = instance.stop().await;
            log::info!("Expert {expert} stopped");
        }
        self.send(sink, &WorkerMessage::Stopped {
            worker_id: self.worker_id.clone(),
            expert: expert.to_string(),
        })
        .await
    }

    async fn announce(&mut self, sink: &mut WsSink) -> Result<()> {
        let experts = self.running.keys().cloned().collect();
        let worker_id = self.worker_id.clone();
        self.send(sink, &WorkerMessage::Experts { worker_id, experts })
            .await
    }

    async fn send(&self, sink: &mut WsSink, msg: &WorkerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| Error::Scheduler(format!("Send failed: {e}")))
    }
}
