pub mod jobs;
pub mod scheduler;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::export::health::HealthMetrics;
use crate::icmp::socket::{EchoSocket, IcmpSocket};
use crate::icmp::{ProbeError, Prober};
use crate::ifstats::{InterfaceCollector, InterfaceReader, SystemInterfaces};
use crate::pf::{CommandRunner, ProcessRunner, QueueCollector};
use crate::sink::{Connector, Sink, SinkOptions, SinkStats, TcpConnector};

use self::jobs::{InterfaceJob, ProbeJob, QueueJob};
use self::scheduler::{Scheduler, SchedulerStats};

/// Agent wires the gathering paths, the scheduler and the delivery sink.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    sink: Option<Sink>,
    scheduler: Option<JoinHandle<SchedulerStats>>,
    scheduler_cancel: CancellationToken,
    cancel: CancellationToken,
}

/// Counts collected while stopping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownReport {
    pub scheduler: SchedulerStats,
    pub sink: SinkStats,
}

impl Agent {
    /// Creates a new Agent. The configuration is validated here so nothing
    /// starts on a bad config.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate().context("invalid configuration")?;

        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let cancel = CancellationToken::new();

        Ok(Self {
            cfg,
            health,
            sink: None,
            scheduler: None,
            scheduler_cancel: cancel.child_token(),
            cancel,
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start with the production collaborators: `pfctl` child processes,
    /// kernel interface counters, ICMP sockets and a TCP backend connection.
    pub async fn start(&mut self) -> Result<()> {
        let addr = self.cfg.sink_address().context("parsing sink.address")?;
        let connector = TcpConnector::new(addr, self.cfg.sink.connect_timeout);
        let payload = self.cfg.probe.payload_size;

        self.start_with(ProcessRunner, SystemInterfaces, connector, |host, addr, ident| {
            let socket = IcmpSocket::open(host, addr, ident, payload)?;
            info!(host, kind = ?socket.kind(), "opened ICMP socket");
            Ok(socket)
        })
        .await
    }

    /// Start all components with injected collaborators.
    ///
    /// Target resolution and socket creation happen before anything is
    /// spawned; either failing aborts startup.
    pub async fn start_with<R, I, C, S, F>(
        &mut self,
        runner: R,
        interfaces: I,
        connector: C,
        mut open_socket: F,
    ) -> Result<()>
    where
        R: CommandRunner + 'static,
        I: InterfaceReader + 'static,
        C: Connector,
        S: EchoSocket + 'static,
        F: FnMut(&str, IpAddr, u16) -> Result<S, ProbeError>,
    {
        // 1. Resolve probe targets and open one socket per target.
        let base_ident = std::process::id() as u16;
        let mut probers = Vec::with_capacity(self.cfg.probe.targets.len());
        for (i, host) in self.cfg.probe.targets.iter().enumerate() {
            let addr = resolve_target(host)
                .await
                .context("resolving probe targets")?;
            let ident = base_ident.wrapping_add(i as u16);
            let socket = open_socket(host, addr, ident)
                .with_context(|| format!("opening ICMP socket for {host}"))?;

            info!(host = %host, %addr, ident, "probe target ready");

            probers.push(Prober::new(
                host.as_str(),
                addr,
                socket,
                self.cfg.interval,
                self.cfg.probe.timeout,
            ));
        }

        let collector = if self.cfg.queues.enabled {
            let collector = QueueCollector::new(runner, &self.cfg.queues)
                .context("queues.command is empty")?;
            info!(command = %collector.command().display(), "queue counter collection enabled");
            Some(collector)
        } else {
            None
        };

        let interfaces = if self.cfg.interfaces.enabled {
            info!("interface counter collection enabled");
            Some(InterfaceCollector::new(interfaces, &self.cfg.interfaces))
        } else {
            None
        };

        // 2. Health metrics server.
        if let Some(addr) = self
            .health
            .start()
            .await
            .context("starting health metrics server")?
        {
            info!(addr = %addr, "health metrics server listening");
        }

        // 3. Delivery sink.
        let sink = Sink::start(
            connector,
            SinkOptions::from(&self.cfg.sink),
            Some(Arc::clone(&self.health)),
            self.cancel.child_token(),
        );

        // 4. Scheduler with one path per gathering source and probe target.
        let mut scheduler = Scheduler::new(self.cfg.interval, Some(Arc::clone(&self.health)));

        if let Some(collector) = collector {
            scheduler.add_path(
                "queues",
                QueueJob::new(collector, sink.handle(), Some(Arc::clone(&self.health))),
            );
        }

        if let Some(collector) = interfaces {
            scheduler.add_path(
                "interfaces",
                InterfaceJob::new(collector, sink.handle(), Some(Arc::clone(&self.health))),
            );
        }

        for prober in probers {
            let name = format!("probe:{}", prober.target());
            scheduler.add_path(
                name,
                ProbeJob::new(prober, sink.handle(), Some(Arc::clone(&self.health))),
            );
        }

        if scheduler.path_names().is_empty() {
            warn!("no gathering path is enabled");
        }

        self.scheduler = Some(scheduler.start(self.scheduler_cancel.clone()));
        self.sink = Some(sink);

        info!(interval = ?self.cfg.interval, "agent fully started");

        Ok(())
    }

    /// Gracefully stop: scheduler first, then the sink (final flush), then
    /// the health server.
    pub async fn stop(&mut self) -> Result<ShutdownReport> {
        let mut report = ShutdownReport::default();

        self.scheduler_cancel.cancel();
        if let Some(handle) = self.scheduler.take() {
            match handle.await {
                Ok(stats) => report.scheduler = stats,
                Err(e) => error!(error = %e, "scheduler task failed"),
            }
        }

        if let Some(sink) = &mut self.sink {
            match sink.stop().await {
                Ok(stats) => report.sink = stats,
                Err(e) => error!(error = %e, "error stopping sink"),
            }
        }
        self.sink = None;

        self.health.stop().await?;
        self.cancel.cancel();

        Ok(report)
    }
}

/// Resolves a probe target once. IP literals skip the resolver.
pub async fn resolve_target(host: &str) -> Result<IpAddr, ConfigError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let unresolvable = |reason: String| ConfigError::Unresolvable {
        host: host.to_string(),
        reason,
    };

    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| unresolvable(e.to_string()))?;

    addrs
        .next()
        .map(|a: SocketAddr| a.ip())
        .ok_or_else(|| unresolvable("no addresses returned".to_string()))
}
