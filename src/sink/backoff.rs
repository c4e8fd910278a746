use std::time::Duration;

/// Exponential reconnect delay between a floor and a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, max: Duration) -> Self {
        let max = max.max(floor);
        Self {
            floor,
            max,
            current: floor,
        }
    }

    /// Returns the delay to wait now and doubles the next one, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }
}

/// State of the sink's single backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Backoff,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        }
    }
}

/// Connection state machine. Has no terminal state.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: Backoff,
    delay: Duration,
}

impl ConnectionMachine {
    pub fn new(backoff: Backoff) -> Self {
        let delay = backoff.floor();
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Delay to wait while in `Backoff`.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Connect attempt succeeded: `Disconnected -> Connected`.
    pub fn connected(&mut self) {
        self.backoff.reset();
        self.state = ConnectionState::Connected;
    }

    /// Connect attempt failed: `Disconnected -> Backoff`. Returns the delay.
    pub fn connect_failed(&mut self) -> Duration {
        self.enter_backoff()
    }

    /// Write failed or timed out: `Connected -> Backoff`. Returns the delay.
    pub fn write_failed(&mut self) -> Duration {
        self.enter_backoff()
    }

    /// Backoff delay elapsed: `Backoff -> Disconnected`.
    pub fn retry(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    fn enter_backoff(&mut self) -> Duration {
        self.delay = self.backoff.next_delay();
        self.state = ConnectionState::Backoff;
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_delays_double_up_to_cap() {
        let mut b = Backoff::new(ms(500), ms(3_000));
        let delays: Vec<Duration> = (0..6).map(|_| b.next_delay()).collect();
        assert_eq!(
            delays,
            vec![ms(500), ms(1_000), ms(2_000), ms(3_000), ms(3_000), ms(3_000)]
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut b = Backoff::new(ms(100), ms(1_000));
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), ms(100));
    }

    #[test]
    fn test_cap_below_floor_is_raised() {
        let mut b = Backoff::new(ms(500), ms(100));
        assert_eq!(b.next_delay(), ms(500));
        assert_eq!(b.next_delay(), ms(500));
    }

    #[test]
    fn test_refused_then_accepted_transitions() {
        let mut m = ConnectionMachine::new(Backoff::new(ms(100), ms(1_000)));
        let mut seen = vec![m.state()];

        assert_eq!(m.connect_failed(), ms(100));
        seen.push(m.state());
        m.retry();
        m.connected();
        seen.push(m.state());

        assert_eq!(
            seen,
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Backoff,
                ConnectionState::Connected,
            ]
        );
    }

    #[test]
    fn test_success_resets_delay_for_next_outage() {
        let mut m = ConnectionMachine::new(Backoff::new(ms(100), ms(1_000)));
        for expected in [100, 200, 400] {
            assert_eq!(m.connect_failed(), ms(expected));
            m.retry();
        }
        m.connected();

        assert_eq!(m.write_failed(), ms(100));
        assert_eq!(m.state(), ConnectionState::Backoff);
        assert_eq!(m.delay(), ms(100));
    }
}
