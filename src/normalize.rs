//! Conversion of gathered samples into metric points.

use crate::icmp::{ProbeOutcome, ProbeResult};
use crate::ifstats::InterfaceSample;
use crate::metric::MetricPoint;
use crate::pf::parse::QueueStat;

/// Replaces whitespace so a value can sit between dots in a metric name.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Four points per queue: packets, bytes, drops, qlength.
pub fn queue_points(stat: &QueueStat, timestamp: u64) -> [MetricPoint; 4] {
    let base = format!("queue.{}", sanitize_component(&stat.name));
    [
        MetricPoint::new(format!("{base}.packets"), stat.packets as f64, timestamp),
        MetricPoint::new(format!("{base}.bytes"), stat.bytes as f64, timestamp),
        MetricPoint::new(format!("{base}.drops"), stat.drops as f64, timestamp),
        MetricPoint::new(format!("{base}.qlength"), stat.qlength as f64, timestamp),
    ]
}

/// A loss point always, plus a latency point in milliseconds on success.
pub fn probe_points(result: &ProbeResult, timestamp: u64) -> Vec<MetricPoint> {
    let base = format!("icmp.{}", sanitize_component(&result.target));
    let mut points = Vec::with_capacity(2);

    if let ProbeOutcome::Success(rtt) = result.outcome {
        points.push(MetricPoint::new(
            format!("{base}.latency_ms"),
            rtt.as_secs_f64() * 1000.0,
            timestamp,
        ));
    }

    let loss = if result.outcome.is_loss() { 1.0 } else { 0.0 };
    points.push(MetricPoint::new(format!("{base}.loss"), loss, timestamp));

    points
}

/// Raw in and out byte counters of one interface.
pub fn interface_points(sample: &InterfaceSample, timestamp: u64) -> [MetricPoint; 2] {
    let base = format!("interface.{}", sanitize_component(&sample.name));
    [
        MetricPoint::new(format!("{base}.in_bytes"), sample.in_bytes as f64, timestamp),
        MetricPoint::new(format!("{base}.out_bytes"), sample.out_bytes as f64, timestamp),
    ]
}
