pub mod packet;
pub mod socket;

use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::socket::EchoSocket;

/// ICMP probing failure.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The socket could not be created or connected. Fatal at startup.
    #[error("opening ICMP socket for {target}: {source}")]
    Socket {
        target: String,
        #[source]
        source: io::Error,
    },

    /// A single echo request could not be sent. Counted as a loss.
    #[error("sending echo request to {target}: {source}")]
    Send {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Classification of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success(Duration),
    Timeout,
    /// Reply for a probe that was already reported as a timeout.
    LateSuccess(Duration),
}

impl ProbeOutcome {
    pub fn is_loss(&self) -> bool {
        !matches!(self, Self::Success(_))
    }

    pub fn latency(&self) -> Option<Duration> {
        match self {
            Self::Success(d) | Self::LateSuccess(d) => Some(*d),
            Self::Timeout => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Timeout => "timeout",
            Self::LateSuccess(_) => "late",
        }
    }
}

/// Outcome of one probe to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub target: Arc<str>,
    pub seq: u16,
    pub outcome: ProbeOutcome,
}

/// Everything one probe cycle observed: the result for this tick plus any
/// late replies to earlier probes that arrived while waiting.
#[derive(Debug, Clone)]
pub struct ProbeCycle {
    pub result: ProbeResult,
    pub late: Vec<ProbeResult>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sent_at: Instant,
    reported: bool,
}

/// Sequence allocation and in-flight bookkeeping for one target.
///
/// Entries survive their timeout so a late reply can still be recognized,
/// and are evicted unconditionally once older than `max_age`.
#[derive(Debug)]
pub struct ProbeTable {
    next_seq: u16,
    in_flight: BTreeMap<u16, InFlight>,
    max_age: Duration,
}

impl ProbeTable {
    /// Creates a table whose entries live for two tick intervals.
    pub fn new(interval: Duration) -> Self {
        Self {
            next_seq: 0,
            in_flight: BTreeMap::new(),
            max_age: interval.saturating_mul(2),
        }
    }

    /// Evicts stale entries, then allocates and records the next sequence.
    pub fn begin(&mut self, now: Instant) -> u16 {
        self.evict(now);
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.in_flight.insert(
            seq,
            InFlight {
                sent_at: now,
                reported: false,
            },
        );
        seq
    }

    /// Correlates a reply. Returns `None` for sequences we no longer track.
    pub fn complete(&mut self, seq: u16, now: Instant) -> Option<ProbeOutcome> {
        let entry = self.in_flight.remove(&seq)?;
        let rtt = now.saturating_duration_since(entry.sent_at);
        Some(if entry.reported {
            ProbeOutcome::LateSuccess(rtt)
        } else {
            ProbeOutcome::Success(rtt)
        })
    }

    /// Marks a sequence as reported lost while keeping it for late replies.
    pub fn expire(&mut self, seq: u16) {
        if let Some(entry) = self.in_flight.get_mut(&seq) {
            entry.reported = true;
        }
    }

    /// Forgets a sequence whose request never left the host.
    pub fn abandon(&mut self, seq: u16) {
        self.in_flight.remove(&seq);
    }

    /// Drops entries older than `max_age`. Returns how many were removed.
    pub fn evict(&mut self, now: Instant) -> usize {
        let before = self.in_flight.len();
        let max_age = self.max_age;
        self.in_flight
            .retain(|_, e| now.saturating_duration_since(e.sent_at) <= max_age);
        before - self.in_flight.len()
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

/// Probes a single target once per call.
pub struct Prober<S> {
    target: Arc<str>,
    addr: IpAddr,
    socket: S,
    table: ProbeTable,
    wait: Duration,
}

impl<S: EchoSocket> Prober<S> {
    /// The reply wait is the probe timeout, capped at nine tenths of the
    /// tick interval so a lost probe always finishes before the next tick.
    pub fn new(
        target: impl Into<Arc<str>>,
        addr: IpAddr,
        socket: S,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            target: target.into(),
            addr,
            socket,
            table: ProbeTable::new(interval),
            wait: timeout.min(interval - interval / 10),
        }
    }

    pub fn target(&self) -> &Arc<str> {
        &self.target
    }

    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Sends one echo request and waits for its reply until `started` plus
    /// the reply wait, where `started` is the instant the tick fired.
    ///
    /// Returns `None` only when cancelled.
    pub async fn probe(
        &mut self,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Option<ProbeCycle> {
        let sent_at = Instant::now();
        let seq = self.table.begin(sent_at);
        let mut late = Vec::new();

        if let Err(source) = self.socket.send_echo(seq).await {
            let err = ProbeError::Send {
                target: self.target.to_string(),
                source,
            };
            warn!(error = %err, addr = %self.addr, seq, "echo send failed, counting as loss");
            self.table.abandon(seq);
            return Some(self.cycle(seq, ProbeOutcome::Timeout, late));
        }

        let deadline = started + self.wait;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,

                _ = tokio::time::sleep_until(deadline) => {
                    self.table.expire(seq);
                    return Some(self.cycle(seq, ProbeOutcome::Timeout, late));
                }

                reply = self.socket.recv_echo() => {
                    let got = match reply {
                        Ok(got) => got,
                        Err(e) => {
                            warn!(
                                host = %self.target,
                                addr = %self.addr,
                                error = %e,
                                "receiving echo reply",
                            );
                            return self.wait_out(seq, deadline, late, cancel).await;
                        }
                    };

                    let Some(outcome) = self.table.complete(got, Instant::now()) else {
                        debug!(host = %self.target, seq = got, "reply for unknown sequence");
                        continue;
                    };

                    if got == seq {
                        return Some(self.cycle(seq, outcome, late));
                    }

                    info!(
                        host = %self.target,
                        seq = got,
                        rtt_ms = outcome.latency().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
                        "late echo reply",
                    );
                    late.push(self.result(got, outcome));
                }
            }
        }
    }

    /// After a receive error, sits out the rest of the wait and reports a loss.
    async fn wait_out(
        &mut self,
        seq: u16,
        deadline: Instant,
        late: Vec<ProbeResult>,
        cancel: &CancellationToken,
    ) -> Option<ProbeCycle> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => {
                self.table.expire(seq);
                Some(self.cycle(seq, ProbeOutcome::Timeout, late))
            }
        }
    }

    fn result(&self, seq: u16, outcome: ProbeOutcome) -> ProbeResult {
        ProbeResult {
            target: Arc::clone(&self.target),
            seq,
            outcome,
        }
    }

    fn cycle(&self, seq: u16, outcome: ProbeOutcome, late: Vec<ProbeResult>) -> ProbeCycle {
        ProbeCycle {
            result: self.result(seq, outcome),
            late,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use super::*;

    /// In-memory echo transport. Each sequence replies after its configured
    /// delay; sequences without a delay never reply.
    #[derive(Default)]
    struct FakeSocket {
        delays: HashMap<u16, Duration>,
        pending: BTreeMap<Instant, u16>,
        fail_sends: bool,
    }

    impl FakeSocket {
        fn with_delays(delays: &[(u16, u64)]) -> Self {
            Self {
                delays: delays
                    .iter()
                    .map(|(seq, ms)| (*seq, Duration::from_millis(*ms)))
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl EchoSocket for FakeSocket {
        async fn send_echo(&mut self, seq: u16) -> io::Result<()> {
            if self.fail_sends {
                return Err(io::Error::new(io::ErrorKind::Other, "network is down"));
            }
            if let Some(delay) = self.delays.get(&seq) {
                self.pending.insert(Instant::now() + *delay, seq);
            }
            Ok(())
        }

        async fn recv_echo(&mut self) -> io::Result<u16> {
            let Some((&at, _)) = self.pending.first_key_value() else {
                return std::future::pending().await;
            };
            tokio::time::sleep_until(at).await;
            let (_, seq) = self
                .pending
                .pop_first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "drained"))?;
            Ok(seq)
        }
    }

    fn prober(socket: FakeSocket, interval_ms: u64, timeout_ms: u64) -> Prober<FakeSocket> {
        Prober::new(
            "10.0.0.1",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            socket,
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_40ms_is_success() {
        let mut p = prober(FakeSocket::with_delays(&[(0, 40)]), 5_000, 1_000);
        let cancel = CancellationToken::new();

        let cycle = p.probe(Instant::now(), &cancel).await.expect("not cancelled");
        assert_eq!(&*cycle.result.target, "10.0.0.1");
        assert_eq!(
            cycle.result.outcome,
            ProbeOutcome::Success(Duration::from_millis(40))
        );
        assert!(cycle.late.is_empty());
        assert_eq!(p.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reply_is_timeout_and_entry_kept() {
        let mut p = prober(FakeSocket::default(), 5_000, 1_000);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let cycle = p.probe(Instant::now(), &cancel).await.expect("not cancelled");
        assert_eq!(cycle.result.outcome, ProbeOutcome::Timeout);
        assert_eq!(start.elapsed(), Duration::from_millis(1_000));
        assert_eq!(p.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded_by_interval() {
        let mut p = prober(FakeSocket::default(), 200, 1_000);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        p.probe(Instant::now(), &cancel).await.expect("not cancelled");
        assert_eq!(start.elapsed(), Duration::from_millis(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_counts_from_tick_instant() {
        let mut p = prober(FakeSocket::default(), 5_000, 1_000);
        let cancel = CancellationToken::new();
        let fired = Instant::now();

        // The job started 300ms after its tick fired.
        tokio::time::advance(Duration::from_millis(300)).await;
        let cycle = p.probe(fired, &cancel).await.expect("not cancelled");

        assert_eq!(cycle.result.outcome, ProbeOutcome::Timeout);
        assert_eq!(fired.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_does_not_change_reported_loss() {
        // seq 0 answers after 1.5s (past its 1s wait), seq 1 after 800ms.
        let mut p = prober(FakeSocket::with_delays(&[(0, 1_500), (1, 800)]), 5_000, 1_000);
        let cancel = CancellationToken::new();

        let first = p.probe(Instant::now(), &cancel).await.expect("not cancelled");
        assert_eq!(first.result.outcome, ProbeOutcome::Timeout);

        let second = p.probe(Instant::now(), &cancel).await.expect("not cancelled");
        assert_eq!(
            second.result.outcome,
            ProbeOutcome::Success(Duration::from_millis(800))
        );
        assert_eq!(second.late.len(), 1);
        assert_eq!(second.late[0].seq, 0);
        assert_eq!(
            second.late[0].outcome,
            ProbeOutcome::LateSuccess(Duration::from_millis(1_500))
        );
        assert!(second.late[0].outcome.is_loss());

        // The first tick's result is final.
        assert_eq!(first.result.outcome, ProbeOutcome::Timeout);
        assert_eq!(p.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_eviction_is_ignored() {
        // max age is 200ms and the wait 90ms; seq 0 answers at 260ms, just
        // after it was evicted.
        let mut p = prober(FakeSocket::with_delays(&[(0, 260)]), 100, 100);
        let cancel = CancellationToken::new();

        let first = p.probe(Instant::now(), &cancel).await.expect("not cancelled");
        assert_eq!(first.result.outcome, ProbeOutcome::Timeout);

        tokio::time::advance(Duration::from_millis(150)).await;

        // seq 1 is sent at 240ms; seq 0 (sent at 0) is evicted first.
        let second = p.probe(Instant::now(), &cancel).await.expect("not cancelled");
        assert_eq!(second.result.outcome, ProbeOutcome::Timeout);
        assert!(second.late.is_empty());
        assert_eq!(p.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_is_timeout() {
        let socket = FakeSocket {
            fail_sends: true,
            ..Default::default()
        };
        let mut p = prober(socket, 5_000, 1_000);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let cycle = p.probe(Instant::now(), &cancel).await.expect("not cancelled");
        assert_eq!(cycle.result.outcome, ProbeOutcome::Timeout);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(p.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let mut p = prober(FakeSocket::default(), 5_000, 1_000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(p.probe(Instant::now(), &cancel).await.is_none());
    }

    #[test]
    fn test_table_sequence_wraps() {
        let mut table = ProbeTable::new(Duration::from_secs(1));
        table.next_seq = u16::MAX;
        let now = Instant::now();
        assert_eq!(table.begin(now), u16::MAX);
        assert_eq!(table.begin(now), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_table_evicts_by_age_under_sustained_loss() {
        let mut table = ProbeTable::new(Duration::from_secs(1));
        let start = Instant::now();
        for i in 0..100u64 {
            let seq = table.begin(start + Duration::from_secs(i));
            table.expire(seq);
        }
        // Entries sent at t-2, t-1 and t survive.
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_table_unknown_sequence() {
        let mut table = ProbeTable::new(Duration::from_secs(1));
        assert_eq!(table.complete(7, Instant::now()), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_outcome_helpers() {
        let ok = ProbeOutcome::Success(Duration::from_millis(3));
        assert!(!ok.is_loss());
        assert_eq!(ok.latency(), Some(Duration::from_millis(3)));
        assert!(ProbeOutcome::Timeout.is_loss());
        assert_eq!(ProbeOutcome::Timeout.latency(), None);
        assert_eq!(ProbeOutcome::LateSuccess(Duration::ZERO).as_str(), "late");
    }
}
