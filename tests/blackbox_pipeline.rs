use std::io;
use std::time::Duration;

use pfstatsd::agent::Agent;
use pfstatsd::config::{Config, HostPort};
use pfstatsd::icmp::socket::EchoSocket;
use pfstatsd::icmp::ProbeError;
use pfstatsd::ifstats::{InterfaceReader, InterfaceSample};
use pfstatsd::pf::{CommandOutput, CommandRunner, CommandSpec};
use pfstatsd::sink::TcpConnector;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const DUMP: &str = "\
queue upload on em0 bandwidth 1Mb qlimit 50
  [ pkts:        100  bytes:      20000  dropped pkts:      0 bytes:      0 ]
  [ qlength:   3/ 50 ]
queue ack on em0 bandwidth 200Kb qlimit 50
  [ pkts:         40  bytes:       2400  dropped pkts:      2 bytes:    120 ]
  [ qlength:   0/ 50 ]
";

struct CannedDump;

impl CommandRunner for CannedDump {
    async fn run(&self, _spec: &CommandSpec) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            status: Some(0),
            stdout: DUMP.to_string(),
            stderr: String::new(),
        })
    }
}

struct FixedInterfaces;

impl InterfaceReader for FixedInterfaces {
    async fn read(&self) -> io::Result<Vec<InterfaceSample>> {
        Ok(vec![InterfaceSample {
            name: "em0".to_string(),
            in_bytes: 640_000,
            out_bytes: 320_000,
        }])
    }
}

/// Answers each echo request after a fixed delay.
struct DelayedEcho {
    delay: Duration,
    pending: Option<(tokio::time::Instant, u16)>,
}

impl DelayedEcho {
    fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            pending: None,
        }
    }
}

impl EchoSocket for DelayedEcho {
    async fn send_echo(&mut self, seq: u16) -> io::Result<()> {
        self.pending = Some((tokio::time::Instant::now() + self.delay, seq));
        Ok(())
    }

    async fn recv_echo(&mut self) -> io::Result<u16> {
        let Some((at, seq)) = self.pending else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(at).await;
        self.pending = None;
        Ok(seq)
    }
}

fn config(port: u16) -> Config {
    let mut cfg = Config::default();
    cfg.interval = Duration::from_millis(200);
    cfg.probe.targets = vec!["10.0.0.1".to_string()];
    cfg.probe.timeout = Duration::from_millis(100);
    cfg.sink.address = format!("127.0.0.1:{port}");
    cfg.sink.backoff_floor = Duration::from_millis(50);
    cfg.sink.backoff_max = Duration::from_millis(100);
    cfg.health.addr = String::new();
    cfg
}

fn connector(cfg: &Config) -> TcpConnector {
    let addr: HostPort = cfg.sink_address().expect("sink address");
    TcpConnector::new(addr, Duration::from_secs(1))
}

/// Accepts connections one after another and forwards every received line.
fn spawn_backend(listener: TcpListener) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    return;
                }
            }
        }
    });
    rx
}

/// Collects lines until every wanted metric name has been seen.
async fn wait_for(rx: &mut mpsc::UnboundedReceiver<String>, wanted: &[&str]) -> Vec<String> {
    let mut lines = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);

    loop {
        let done = wanted
            .iter()
            .all(|w| lines.iter().any(|l: &String| l.starts_with(&format!("{w} "))));
        if done {
            return lines;
        }
        tokio::select! {
            _ = &mut deadline => panic!("timed out waiting for {wanted:?}, got {lines:?}"),
            line = rx.recv() => match line {
                Some(line) => lines.push(line),
                None => panic!("backend closed, got {lines:?}"),
            },
        }
    }
}

fn parse_line(line: &str) -> (&str, f64, u64) {
    let mut parts = line.split(' ');
    let name = parts.next().expect("name");
    let value = parts.next().expect("value").parse().expect("numeric value");
    let ts = parts.next().expect("timestamp").parse().expect("integer timestamp");
    assert!(parts.next().is_none(), "extra fields in {line:?}");
    (name, value, ts)
}

#[tokio::test]
async fn test_queue_and_probe_points_reach_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let mut rx = spawn_backend(listener);

    let mut cfg = config(port);
    cfg.interfaces.enabled = true;
    let conn = connector(&cfg);
    let mut agent = Agent::new(cfg).expect("agent");
    agent
        .start_with(CannedDump, FixedInterfaces, conn, |_, _, _| {
            Ok::<_, ProbeError>(DelayedEcho::new(20))
        })
        .await
        .expect("start");

    let lines = wait_for(
        &mut rx,
        &[
            "queue.upload.packets",
            "queue.upload.bytes",
            "queue.upload.drops",
            "queue.upload.qlength",
            "queue.ack.drops",
            "interface.em0.in_bytes",
            "interface.em0.out_bytes",
            "icmp.10.0.0.1.latency_ms",
            "icmp.10.0.0.1.loss",
        ],
    )
    .await;

    let report = agent.stop().await.expect("stop");
    assert!(report.scheduler.ticks >= 1);

    let find = |name: &str| {
        lines
            .iter()
            .map(|l| parse_line(l))
            .find(|(n, _, _)| *n == name)
            .unwrap_or_else(|| panic!("missing {name}"))
    };

    assert_eq!(find("queue.upload.packets").1, 100.0);
    assert_eq!(find("queue.upload.bytes").1, 20000.0);
    assert_eq!(find("queue.upload.qlength").1, 3.0);
    assert_eq!(find("queue.ack.drops").1, 2.0);
    assert_eq!(find("icmp.10.0.0.1.loss").1, 0.0);
    assert_eq!(find("interface.em0.in_bytes").1, 640_000.0);
    assert_eq!(find("interface.em0.out_bytes").1, 320_000.0);

    let latency = find("icmp.10.0.0.1.latency_ms").1;
    assert!((20.0..100.0).contains(&latency), "latency {latency}");

    // Points of the first tick share its timestamp across every path.
    let ts = find("queue.upload.packets").2;
    assert_eq!(find("icmp.10.0.0.1.loss").2, ts);
    assert_eq!(find("interface.em0.in_bytes").2, ts);
}

#[tokio::test]
async fn test_points_buffered_while_backend_down_arrive_in_order() {
    // Reserve a port and release it so the first connects are refused.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        l.local_addr().expect("local addr").port()
    };

    let mut cfg = config(port);
    cfg.probe.targets.clear();
    let conn = connector(&cfg);
    let mut agent = Agent::new(cfg).expect("agent");
    agent
        .start_with(CannedDump, FixedInterfaces, conn, |_, _, _| {
            Ok::<_, ProbeError>(DelayedEcho::new(20))
        })
        .await
        .expect("start");

    // Let a few ticks accumulate in the outbound buffer.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("rebind");
    let mut rx = spawn_backend(listener);

    let mut lines = wait_for(&mut rx, &["queue.upload.packets"]).await;
    // Wait until at least three ticks worth of upload points arrived.
    while lines
        .iter()
        .filter(|l| l.starts_with("queue.upload.packets "))
        .count()
        < 3
    {
        let more = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("more lines")
            .expect("backend open");
        lines.push(more);
    }

    agent.stop().await.expect("stop");

    let timestamps: Vec<u64> = lines.iter().map(|l| parse_line(l).2).collect();
    assert!(
        timestamps.windows(2).all(|w| w[0] <= w[1]),
        "out of order: {lines:?}"
    );

    // The oldest tick comes first, with queues in name order.
    let names: Vec<&str> = lines.iter().take(4).map(|l| parse_line(l).0).collect();
    assert_eq!(
        names,
        vec![
            "queue.ack.packets",
            "queue.ack.bytes",
            "queue.ack.drops",
            "queue.ack.qlength",
        ]
    );
}

#[tokio::test]
async fn test_stop_without_paths_is_clean() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let _rx = spawn_backend(listener);

    let mut cfg = config(port);
    cfg.queues.enabled = false;
    cfg.probe.targets.clear();
    let conn = connector(&cfg);

    let mut agent = Agent::new(cfg).expect("agent");
    agent
        .start_with(CannedDump, FixedInterfaces, conn, |_, _, _| {
            Ok::<_, ProbeError>(DelayedEcho::new(20))
        })
        .await
        .expect("start");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = agent.stop().await.expect("stop");

    assert_eq!(report.sink.sent, 0);
    assert_eq!(report.sink.pending, 0);
    assert!(report.scheduler.ticks >= 1);
}
