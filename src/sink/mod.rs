pub mod backoff;
pub mod buffer;
pub mod plaintext;

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HostPort, SinkConfig};
use crate::export::health::HealthMetrics;
use crate::metric::MetricPoint;

use self::backoff::{Backoff, ConnectionMachine, ConnectionState};
use self::buffer::OutboundBuffer;
use self::plaintext::PlaintextEncoder;

/// Buffer overflow is logged on the first drop and then once per this many.
const DROP_LOG_EVERY: u64 = 1000;

/// Backend connection failure. Always absorbed by the sink state machine.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connecting to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {addr}: timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("writing to backend: {0}")]
    Write(#[source] io::Error),

    #[error("writing to backend: timed out after {0:?}")]
    WriteTimeout(Duration),
}

/// Opens the byte stream the sink writes to.
pub trait Connector: Send + 'static {
    type Stream: AsyncWrite + Unpin + Send + 'static;

    /// Backend description for logs.
    fn describe(&self) -> String;

    fn connect(&mut self) -> impl Future<Output = Result<Self::Stream, ConnectionError>> + Send;
}

/// Plain TCP connection to a `host:port` backend.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: HostPort,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: HostPort, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn describe(&self) -> String {
        self.addr.to_string()
    }

    async fn connect(&mut self) -> Result<TcpStream, ConnectionError> {
        let target = (self.addr.host.as_str(), self.addr.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(target))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout {
                addr: self.addr.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| ConnectionError::Connect {
                addr: self.addr.to_string(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "setting TCP_NODELAY");
        }

        Ok(stream)
    }
}

/// Delivery tuning.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub namespace: String,
    pub buffer_capacity: usize,
    pub batch_size: usize,
    pub backoff_floor: Duration,
    pub backoff_max: Duration,
    pub write_timeout: Duration,
}

impl From<&SinkConfig> for SinkOptions {
    fn from(cfg: &SinkConfig) -> Self {
        Self {
            namespace: cfg.namespace.clone(),
            buffer_capacity: cfg.buffer_capacity,
            batch_size: cfg.batch_size,
            backoff_floor: cfg.backoff_floor,
            backoff_max: cfg.backoff_max,
            write_timeout: cfg.write_timeout,
        }
    }
}

/// Producer side of the sink. Never blocks.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<MetricPoint>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl SinkHandle {
    /// Queues a point. Returns false once the sink has stopped.
    pub fn send(&self, point: MetricPoint) -> bool {
        let ok = self.tx.send(point).is_ok();
        if ok {
            if let Some(m) = &self.metrics {
                m.points_emitted.inc();
            }
        }
        ok
    }

    /// Queues points in order. Returns how many were accepted.
    pub fn send_all(&self, points: impl IntoIterator<Item = MetricPoint>) -> usize {
        let mut accepted = 0;
        for point in points {
            if !self.send(point) {
                break;
            }
            accepted += 1;
        }
        accepted
    }
}

/// Final delivery counts reported when the sink stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub sent: u64,
    pub dropped: u64,
    /// Points still buffered at exit.
    pub pending: usize,
}

/// Delivery sink: a background task owning the backend connection and the
/// outbound buffer.
pub struct Sink {
    handle: SinkHandle,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<SinkStats>>,
}

impl Sink {
    /// Spawns the sink task. Must be called from within a tokio runtime.
    pub fn start<C: Connector>(
        connector: C,
        opts: SinkOptions,
        metrics: Option<Arc<HealthMetrics>>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let task = SinkTask {
            connector,
            intake: Intake {
                rx,
                buffer: OutboundBuffer::new(opts.buffer_capacity),
                metrics: metrics.clone(),
                closed: false,
            },
            encoder: PlaintextEncoder::new(&opts.namespace),
            machine: ConnectionMachine::new(Backoff::new(opts.backoff_floor, opts.backoff_max)),
            batch_size: opts.batch_size.max(1),
            write_timeout: opts.write_timeout,
            state_tx,
            metrics: metrics.clone(),
            cancel: cancel.clone(),
            sent: 0,
        };

        Self {
            handle: SinkHandle { tx, metrics },
            state: state_rx,
            cancel,
            task: Some(tokio::spawn(task.run())),
        }
    }

    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stops the task after a best-effort flush and returns final counts.
    pub async fn stop(&mut self) -> Result<SinkStats> {
        self.cancel.cancel();

        let Some(task) = self.task.take() else {
            return Ok(SinkStats::default());
        };

        task.await.context("joining sink task")
    }
}

/// Channel receiver plus the bounded buffer it drains into.
struct Intake {
    rx: mpsc::UnboundedReceiver<MetricPoint>,
    buffer: OutboundBuffer,
    metrics: Option<Arc<HealthMetrics>>,
    closed: bool,
}

impl Intake {
    /// Waits for the next point and buffers it. Pends forever once every
    /// handle is gone. Cancel safe.
    async fn recv(&mut self) {
        if self.closed {
            return std::future::pending().await;
        }
        match self.rx.recv().await {
            Some(point) => self.push(point),
            None => {
                debug!("all sink handles dropped");
                self.closed = true;
            }
        }
    }

    fn drain_ready(&mut self) {
        while let Ok(point) = self.rx.try_recv() {
            self.push(point);
        }
    }

    fn push(&mut self, point: MetricPoint) {
        if self.buffer.push(point).is_some() {
            if let Some(m) = &self.metrics {
                m.sink_points_dropped.inc();
            }
            let total = self.buffer.dropped();
            if total % DROP_LOG_EVERY == 1 {
                warn!(
                    dropped_total = total,
                    capacity = self.buffer.capacity(),
                    "outbound buffer full, dropping oldest points",
                );
            }
        }
        self.update_gauge();
    }

    fn update_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.sink_buffer_length.set(self.buffer.len() as f64);
        }
    }
}

struct SinkTask<C: Connector> {
    connector: C,
    intake: Intake,
    encoder: PlaintextEncoder,
    machine: ConnectionMachine,
    batch_size: usize,
    write_timeout: Duration,
    state_tx: watch::Sender<ConnectionState>,
    metrics: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    sent: u64,
}

impl<C: Connector> SinkTask<C> {
    async fn run(mut self) -> SinkStats {
        let backend = self.connector.describe();
        let mut conn: Option<C::Stream> = None;

        info!(backend = %backend, "sink started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.machine.state() {
                ConnectionState::Disconnected => {
                    let result = {
                        let attempt = self.connector.connect();
                        tokio::pin!(attempt);
                        loop {
                            tokio::select! {
                                _ = self.cancel.cancelled() => break None,
                                r = &mut attempt => break Some(r),
                                _ = self.intake.recv() => {}
                            }
                        }
                    };
                    let Some(result) = result else { break };

                    match result {
                        Ok(stream) => {
                            self.count_attempt("ok");
                            conn = Some(stream);
                            self.machine.connected();
                            info!(
                                backend = %backend,
                                pending = self.intake.buffer.len(),
                                "connected to metrics backend",
                            );
                        }
                        Err(e) => {
                            self.count_attempt("error");
                            let delay = self.machine.connect_failed();
                            warn!(error = %e, retry_in = ?delay, "backend connection failed");
                        }
                    }
                    self.publish_state();
                }

                ConnectionState::Backoff => {
                    let sleep = tokio::time::sleep(self.machine.delay());
                    tokio::pin!(sleep);
                    let cancelled = loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break true,
                            _ = &mut sleep => break false,
                            _ = self.intake.recv() => {}
                        }
                    };
                    if cancelled {
                        break;
                    }
                    self.machine.retry();
                    self.publish_state();
                }

                ConnectionState::Connected => {
                    let Some(stream) = conn.as_mut() else {
                        self.machine.write_failed();
                        self.publish_state();
                        continue;
                    };

                    self.intake.drain_ready();
                    if self.intake.buffer.is_empty() {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = self.intake.recv() => {}
                        }
                        continue;
                    }

                    if let Err(e) = self.write_batch(stream).await {
                        conn = None;
                        if let Some(m) = &self.metrics {
                            m.sink_write_errors.inc();
                        }
                        let delay = self.machine.write_failed();
                        warn!(
                            error = %e,
                            pending = self.intake.buffer.len(),
                            retry_in = ?delay,
                            "backend write failed, reconnecting",
                        );
                        self.publish_state();
                    }
                }
            }
        }

        self.intake.drain_ready();
        if let Some(mut stream) = conn.take() {
            self.flush_on_shutdown(&mut stream).await;
            let _ = tokio::time::timeout(self.write_timeout, stream.shutdown()).await;
        }

        let stats = SinkStats {
            sent: self.sent,
            dropped: self.intake.buffer.dropped(),
            pending: self.intake.buffer.len(),
        };

        if stats.pending > 0 {
            warn!(pending = stats.pending, "discarding undelivered points on shutdown");
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        if let Some(m) = &self.metrics {
            m.sink_connected.set(0.0);
        }

        info!(sent = stats.sent, dropped = stats.dropped, "sink stopped");

        stats
    }

    /// Writes one batch from the buffer head. Points leave the buffer only
    /// after the whole batch was written.
    async fn write_batch(&mut self, stream: &mut C::Stream) -> Result<usize, ConnectionError> {
        let mut bytes = Vec::with_capacity(self.batch_size * 64);
        let (start, batch) = self.intake.buffer.front_batch(self.batch_size);
        let count = self.encoder.encode_batch(batch, &mut bytes);

        let timeout = self.write_timeout;
        let write = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        };
        tokio::pin!(write);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                r = &mut write => break r.map_err(ConnectionError::Write),
                _ = &mut deadline => break Err(ConnectionError::WriteTimeout(timeout)),
                _ = self.intake.recv() => {}
            }
        };
        result?;

        self.intake.buffer.ack(start, count);
        self.intake.update_gauge();
        self.sent += count as u64;

        if let Some(m) = &self.metrics {
            m.sink_points_sent.inc_by(count as f64);
            m.sink_batch_size.observe(count as f64);
        }

        debug!(count, pending = self.intake.buffer.len(), "wrote batch");

        Ok(count)
    }

    async fn flush_on_shutdown(&mut self, stream: &mut C::Stream) {
        while !self.intake.buffer.is_empty() {
            if let Err(e) = self.write_batch(stream).await {
                warn!(error = %e, "final flush failed");
                return;
            }
        }
    }

    fn count_attempt(&self, result: &str) {
        if let Some(m) = &self.metrics {
            m.sink_connect_attempts.with_label_values(&[result]).inc();
        }
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        self.state_tx.send_replace(state);
        if let Some(m) = &self.metrics {
            m.sink_connected
                .set(if state == ConnectionState::Connected { 1.0 } else { 0.0 });
        }
        debug!(state = state.as_str(), "sink state changed");
    }
}
