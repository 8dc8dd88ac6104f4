//! Heartbeat bookkeeping for a connected tunnel session.
//!
//! Instants are passed in by the caller, so the tracker can be exercised
//! without timers.

use std::time::Duration;

use tokio::time::Instant;

/// What the session should do after [`Heartbeat::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing is due yet.
    Idle,
    /// Send a `ping` with this id.
    SendPing(String),
    /// The outstanding ping was not answered in time.
    Expired,
}

#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    next_ping_at: Instant,
    outstanding: Option<Outstanding>,
    seq: u64,
    expired: bool,
}

#[derive(Debug)]
struct Outstanding {
    id: String,
    deadline: Instant,
}

impl Heartbeat {
    /// First ping is due one interval after `now`.
    pub fn new(now: Instant, interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            next_ping_at: now + interval,
            outstanding: None,
            seq: 0,
            expired: false,
        }
    }

    /// When the session should call [`poll`](Self::poll) next.
    pub fn next_deadline(&self) -> Instant {
        match &self.outstanding {
            Some(outstanding) => outstanding.deadline,
            None => self.next_ping_at,
        }
    }

    /// Advance to `now`. `Expired` is reported once; afterwards the tracker
    /// stays idle.
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if self.expired {
            return HeartbeatAction::Idle;
        }
        if let Some(outstanding) = &self.outstanding {
            if now >= outstanding.deadline {
                self.expired = true;
                return HeartbeatAction::Expired;
            }
            return HeartbeatAction::Idle;
        }
        if now < self.next_ping_at {
            return HeartbeatAction::Idle;
        }

        self.seq += 1;
        let id = format!("hb-{}", self.seq);
        self.outstanding = Some(Outstanding {
            id: id.clone(),
            deadline: now + self.timeout,
        });
        self.next_ping_at = now + self.interval;
        HeartbeatAction::SendPing(id)
    }

    /// Record a `pong`. Returns `false` if it does not match the outstanding ping.
    pub fn on_pong(&mut self, id: &str) -> bool {
        match &self.outstanding {
            Some(outstanding) if outstanding.id == id => {
                self.outstanding = None;
                true
            }
            _ => false,
        }
    }

    pub fn awaiting_pong(&self) -> bool {
        self.outstanding.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INTERVAL: Duration = Duration::from_secs(30);
    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_first_ping_after_interval() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(start, INTERVAL, TIMEOUT);
        assert_eq!(hb.next_deadline(), start + INTERVAL);
        assert_eq!(hb.poll(start + Duration::from_secs(29)), HeartbeatAction::Idle);
        assert_eq!(
            hb.poll(start + INTERVAL),
            HeartbeatAction::SendPing("hb-1".to_string())
        );
        assert!(hb.awaiting_pong());
        assert_eq!(hb.next_deadline(), start + INTERVAL + TIMEOUT);
    }

    #[test]
    fn test_answered_ping_schedules_next() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(start, INTERVAL, TIMEOUT);
        hb.poll(start + INTERVAL);
        assert!(hb.on_pong("hb-1"));
        assert!(!hb.awaiting_pong());
        assert_eq!(hb.next_deadline(), start + INTERVAL * 2);
        assert_eq!(
            hb.poll(start + INTERVAL * 2),
            HeartbeatAction::SendPing("hb-2".to_string())
        );
    }

    #[test]
    fn test_mismatched_pong_ignored() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(start, INTERVAL, TIMEOUT);
        assert!(!hb.on_pong("hb-1"));
        hb.poll(start + INTERVAL);
        assert!(!hb.on_pong("hb-0"));
        assert!(hb.awaiting_pong());
    }

    #[test]
    fn test_missed_pong_expires_exactly_once() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(start, INTERVAL, TIMEOUT);
        hb.poll(start + INTERVAL);
        assert_eq!(
            hb.poll(start + INTERVAL + Duration::from_secs(9)),
            HeartbeatAction::Idle
        );
        assert_eq!(hb.poll(start + INTERVAL + TIMEOUT), HeartbeatAction::Expired);
        assert_eq!(
            hb.poll(start + INTERVAL + TIMEOUT + Duration::from_secs(1)),
            HeartbeatAction::Idle
        );
        assert_eq!(hb.poll(start + INTERVAL * 10), HeartbeatAction::Idle);
    }

    #[test]
    fn test_no_second_ping_while_outstanding() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(start, Duration::from_secs(5), Duration::from_secs(20));
        assert!(matches!(
            hb.poll(start + Duration::from_secs(5)),
            HeartbeatAction::SendPing(_)
        ));
        assert_eq!(hb.poll(start + Duration::from_secs(11)), HeartbeatAction::Idle);
    }
}
