use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::icmp::socket::EchoSocket;
use crate::icmp::{ProbeOutcome, ProbeResult, Prober};
use crate::ifstats::{InterfaceCollector, InterfaceReader};
use crate::normalize::{interface_points, probe_points, queue_points};
use crate::pf::{CommandRunner, QueueCollector};
use crate::sink::SinkHandle;

use super::scheduler::{Job, Tick};

/// Queue counter path: dump, parse, normalize, hand off.
pub struct QueueJob<R> {
    collector: QueueCollector<R>,
    sink: SinkHandle,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<R: CommandRunner> QueueJob<R> {
    pub fn new(
        collector: QueueCollector<R>,
        sink: SinkHandle,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            collector,
            sink,
            metrics,
        }
    }
}

impl<R: CommandRunner + 'static> Job for QueueJob<R> {
    async fn run(&mut self, tick: Tick, cancel: &CancellationToken) {
        let started = Instant::now();

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = self.collector.collect() => r,
        };

        if let Some(m) = &self.metrics {
            m.collect_duration.observe(started.elapsed().as_secs_f64());
        }

        let collected = match result {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, tick = tick.seq, "queue counter collection failed");
                if let Some(m) = &self.metrics {
                    m.collect_failures.inc();
                }
                return;
            }
        };

        for err in &collected.errors {
            warn!(error = %err, "skipping malformed queue block");
        }

        let mut points = 0;
        for stat in &collected.queues {
            points += self.sink.send_all(queue_points(stat, tick.timestamp));
        }

        if let Some(m) = &self.metrics {
            m.parse_errors.inc_by(collected.errors.len() as f64);
            m.queues_collected.set(collected.queues.len() as f64);
        }

        debug!(
            tick = tick.seq,
            queues = collected.queues.len(),
            points,
            "queue counters collected",
        );
    }
}

/// Interface byte counter path.
pub struct InterfaceJob<R> {
    collector: InterfaceCollector<R>,
    sink: SinkHandle,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<R: InterfaceReader> InterfaceJob<R> {
    pub fn new(
        collector: InterfaceCollector<R>,
        sink: SinkHandle,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            collector,
            sink,
            metrics,
        }
    }
}

impl<R: InterfaceReader + 'static> Job for InterfaceJob<R> {
    async fn run(&mut self, tick: Tick, cancel: &CancellationToken) {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = self.collector.collect() => r,
        };

        let samples = match result {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, tick = tick.seq, "interface counter read failed");
                if let Some(m) = &self.metrics {
                    m.interface_read_failures.inc();
                }
                return;
            }
        };

        let mut points = 0;
        for sample in &samples {
            points += self.sink.send_all(interface_points(sample, tick.timestamp));
        }

        if let Some(m) = &self.metrics {
            m.interfaces_collected.set(samples.len() as f64);
        }

        debug!(
            tick = tick.seq,
            interfaces = samples.len(),
            points,
            "interface counters collected",
        );
    }
}

/// ICMP path for one target.
pub struct ProbeJob<S> {
    prober: Prober<S>,
    sink: SinkHandle,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<S: EchoSocket> ProbeJob<S> {
    pub fn new(prober: Prober<S>, sink: SinkHandle, metrics: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            prober,
            sink,
            metrics,
        }
    }

    fn observe(&self, result: &ProbeResult) {
        let Some(m) = &self.metrics else {
            return;
        };
        m.probe_outcomes
            .with_label_values(&[&result.target, result.outcome.as_str()])
            .inc();
        if let ProbeOutcome::Success(rtt) = result.outcome {
            m.probe_rtt
                .with_label_values(&[&result.target])
                .observe(rtt.as_secs_f64());
        }
    }
}

impl<S: EchoSocket + 'static> Job for ProbeJob<S> {
    async fn run(&mut self, tick: Tick, cancel: &CancellationToken) {
        let Some(cycle) = self.prober.probe(tick.instant, cancel).await else {
            return;
        };

        // Late replies are informational only; the tick they belonged to
        // already reported its loss.
        for late in &cycle.late {
            self.observe(late);
        }

        self.observe(&cycle.result);
        let points = self
            .sink
            .send_all(probe_points(&cycle.result, tick.timestamp));

        debug!(
            host = %cycle.result.target,
            seq = cycle.result.seq,
            outcome = cycle.result.outcome.as_str(),
            points,
            "probe finished",
        );
    }
}
