//! Connection state and transition bookkeeping.

/// Protocol state of the central client. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Discovering,
    Ready,
    Error,
    Reconnecting,
}

impl ConnectionState {
    /// Upper-case name used in logs and status reports.
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Scanning => "SCANNING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Discovering => "DISCOVERING",
            ConnectionState::Ready => "READY",
            ConnectionState::Error => "ERROR",
            ConnectionState::Reconnecting => "RECONNECTING",
        }
    }

    /// A scan may only be started from these states.
    pub const fn can_scan(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Error)
    }

    /// States in which the link layer connection exists.
    pub const fn is_linked(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Discovering | ConnectionState::Ready
        )
    }
}

/// Current state plus the data needed for timeouts and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateTracker {
    state: ConnectionState,
    previous: ConnectionState,
    entered_at_ms: u64,
}

impl StateTracker {
    pub const fn new(now_ms: u64) -> Self {
        Self {
            state: ConnectionState::Idle,
            previous: ConnectionState::Idle,
            entered_at_ms: now_ms,
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.state
    }

    pub fn previous(&self) -> ConnectionState {
        self.previous
    }

    pub fn entered_at(&self) -> u64 {
        self.entered_at_ms
    }

    /// Time spent in the current state.
    pub fn elapsed(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.entered_at_ms)
    }

    /// Enter `next`, recording the previous state and the entry time.
    ///
    /// Re-entering the current state still restarts its timer.
    pub fn set(&mut self, next: ConnectionState, now_ms: u64) {
        self.previous = self.state;
        self.state = next;
        self.entered_at_ms = now_ms;
        info!("State: {} -> {}", self.previous.as_str(), next.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let t = StateTracker::new(42);
        assert_eq!(t.current(), ConnectionState::Idle);
        assert_eq!(t.previous(), ConnectionState::Idle);
        assert_eq!(t.entered_at(), 42);
    }

    #[test]
    fn transition_records_previous_and_timestamp() {
        let mut t = StateTracker::new(0);
        t.set(ConnectionState::Scanning, 100);
        t.set(ConnectionState::Connecting, 250);
        assert_eq!(t.current(), ConnectionState::Connecting);
        assert_eq!(t.previous(), ConnectionState::Scanning);
        assert_eq!(t.elapsed(1_250), 1_000);
    }

    #[test]
    fn elapsed_never_underflows() {
        let t = StateTracker::new(500);
        assert_eq!(t.elapsed(100), 0);
    }

    #[test]
    fn scan_allowed_only_from_idle_or_error() {
        use ConnectionState::*;
        for s in [Idle, Error] {
            assert!(s.can_scan());
        }
        for s in [Scanning, Connecting, Connected, Discovering, Ready, Reconnecting] {
            assert!(!s.can_scan(), "{} must reject scan", s.as_str());
        }
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::Ready.as_str(), "READY");
        assert_eq!(ConnectionState::Reconnecting.as_str(), "RECONNECTING");
    }
}
