use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;
use crate::metric::unix_seconds;

/// One scheduler firing. Every path triggered by it shares `timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub seq: u64,
    /// Trigger time in unix seconds.
    pub timestamp: u64,
    /// Monotonic instant the tick was scheduled for. Per-tick deadlines
    /// are measured from here.
    pub instant: Instant,
}

/// Work run once per tick for one gathering path.
pub trait Job: Send + 'static {
    fn run(
        &mut self,
        tick: Tick,
        cancel: &CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

/// Object-safe view of a path so jobs of different types share one list.
trait Gate: Send + Sync {
    fn name(&self) -> &str;

    /// Spawns the path's job unless its previous run is still in flight.
    fn trigger(&self, tick: Tick, tasks: &mut JoinSet<()>, cancel: &CancellationToken) -> bool;
}

struct PathGate<J> {
    name: Arc<str>,
    job: Arc<Mutex<J>>,
}

impl<J: Job> Gate for PathGate<J> {
    fn name(&self) -> &str {
        &self.name
    }

    fn trigger(&self, tick: Tick, tasks: &mut JoinSet<()>, cancel: &CancellationToken) -> bool {
        let Ok(mut guard) = Arc::clone(&self.job).try_lock_owned() else {
            return false;
        };
        let cancel = cancel.clone();
        tasks.spawn(async move {
            guard.run(tick, &cancel).await;
        });
        true
    }
}

/// Counts reported when the scheduler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub missed: u64,
}

/// Fixed-interval tick driving every gathering path independently.
pub struct Scheduler {
    interval: Duration,
    paths: Vec<Box<dyn Gate>>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl Scheduler {
    pub fn new(interval: Duration, metrics: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            interval,
            paths: Vec::new(),
            metrics,
        }
    }

    /// Registers a path. `name` labels logs and the missed-tick metric.
    pub fn add_path<J: Job>(&mut self, name: impl Into<Arc<str>>, job: J) {
        self.paths.push(Box::new(PathGate {
            name: name.into(),
            job: Arc::new(Mutex::new(job)),
        }));
    }

    pub fn path_names(&self) -> Vec<&str> {
        self.paths.iter().map(|p| p.name()).collect()
    }

    /// Spawns the tick loop. In-flight runs are awaited after cancellation.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<SchedulerStats> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) -> SchedulerStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut tasks = JoinSet::new();
        let mut stats = SchedulerStats::default();

        info!(
            interval = ?self.interval,
            paths = self.paths.len(),
            "scheduler started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                instant = ticker.tick() => {
                    let tick = Tick {
                        seq: stats.ticks,
                        timestamp: unix_seconds(SystemTime::now()),
                        instant,
                    };
                    stats.ticks += 1;
                    if let Some(m) = &self.metrics {
                        m.ticks.inc();
                    }

                    while let Some(joined) = tasks.try_join_next() {
                        log_join(joined);
                    }

                    for path in &self.paths {
                        if path.trigger(tick, &mut tasks, &cancel) {
                            continue;
                        }
                        stats.missed += 1;
                        if let Some(m) = &self.metrics {
                            m.missed_ticks.with_label_values(&[path.name()]).inc();
                        }
                        warn!(
                            path = path.name(),
                            tick = tick.seq,
                            "previous run still in flight, skipping tick",
                        );
                    }

                    debug!(tick = tick.seq, timestamp = tick.timestamp, "tick");
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        info!(ticks = stats.ticks, missed = stats.missed, "scheduler stopped");

        stats
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "path task panicked");
        }
    }
}
