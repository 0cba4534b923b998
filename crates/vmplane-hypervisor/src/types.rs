//! Types describing live domain state.

use serde::{Deserialize, Serialize};

/// Domain state as reported by the hypervisor, mirroring its numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum DomainState {
    /// No state.
    NoState = 0,
    /// Running.
    Running = 1,
    /// Blocked on a resource.
    Blocked = 2,
    /// Paused by user or hypervisor.
    Paused = 3,
    /// Being shut down.
    Shutdown = 4,
    /// Shut off.
    Shutoff = 5,
    /// Crashed.
    Crashed = 6,
    /// Suspended by guest power management.
    PmSuspended = 7,
}

impl DomainState {
    /// Map a numeric state code, treating unknown codes as `NoState`.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            _ => Self::NoState,
        }
    }

    /// The numeric state code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Parse the state text printed by `virsh domstate`.
    #[must_use]
    pub fn from_virsh_text(text: &str) -> Option<Self> {
        match text.trim() {
            "no state" | "nostate" => Some(Self::NoState),
            "running" => Some(Self::Running),
            "idle" | "blocked" => Some(Self::Blocked),
            "paused" => Some(Self::Paused),
            "in shutdown" | "shutdown" => Some(Self::Shutdown),
            "shut off" | "shutoff" => Some(Self::Shutoff),
            "crashed" => Some(Self::Crashed),
            "pmsuspended" => Some(Self::PmSuspended),
            _ => None,
        }
    }

    /// Reason names for this state, indexed by reason code.
    #[must_use]
    pub const fn reason_names(self) -> &'static [&'static str] {
        match self {
            Self::Running => &[
                "unknown",
                "booted",
                "migrated",
                "restored",
                "from snapshot",
                "unpaused",
                "migration canceled",
                "save canceled",
                "wakeup",
                "crashed",
                "post-copy",
            ],
            Self::Paused => &[
                "unknown",
                "user",
                "migrating",
                "saving",
                "dumping",
                "I/O error",
                "watchdog",
                "from snapshot",
                "shutting down",
                "creating snapshot",
                "crashed",
                "starting up",
                "post-copy",
                "post-copy failed",
            ],
            Self::Shutdown => &["unknown", "user"],
            Self::Shutoff => &[
                "unknown",
                "shutdown",
                "destroyed",
                "crashed",
                "migrated",
                "saved",
                "failed",
                "from snapshot",
                "daemon",
            ],
            Self::Crashed => &["unknown", "panicked"],
            Self::NoState | Self::Blocked | Self::PmSuspended => &["unknown"],
        }
    }

    /// Map reason text to its numeric code for this state, `0` when unknown.
    #[must_use]
    pub fn reason_code(self, text: &str) -> i32 {
        let text = text.trim();
        self.reason_names()
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .and_then(|idx| i32::try_from(idx).ok())
            .unwrap_or(0)
    }
}

/// A state observation: state plus its reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStateInfo {
    /// Current state.
    pub state: DomainState,
    /// State-specific reason code.
    pub reason: i32,
}

impl DomainStateInfo {
    /// Create an observation.
    #[must_use]
    pub const fn new(state: DomainState, reason: i32) -> Self {
        Self { state, reason }
    }
}

/// Cumulative resource counters of a running domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStats {
    /// Total CPU time consumed, in nanoseconds.
    pub cpu_time_ns: u64,
    /// Number of active virtual CPUs.
    pub vcpus: u32,
    /// Guest memory in use, in KiB.
    pub memory_used_kib: u64,
    /// Guest memory currently assigned, in KiB.
    pub memory_total_kib: u64,
    /// Bytes received over all interfaces.
    pub net_rx_bytes: u64,
    /// Bytes transmitted over all interfaces.
    pub net_tx_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_roundtrip() {
        for code in 0..=7 {
            assert_eq!(DomainState::from_code(code).code(), code);
        }
        assert_eq!(DomainState::from_code(42), DomainState::NoState);
        assert_eq!(DomainState::from_code(-1), DomainState::NoState);
    }

    #[test]
    fn virsh_state_text() {
        assert_eq!(
            DomainState::from_virsh_text("shut off"),
            Some(DomainState::Shutoff)
        );
        assert_eq!(
            DomainState::from_virsh_text("in shutdown"),
            Some(DomainState::Shutdown)
        );
        assert_eq!(
            DomainState::from_virsh_text(" running "),
            Some(DomainState::Running)
        );
        assert_eq!(DomainState::from_virsh_text("exploded"), None);
    }

    #[test]
    fn reason_codes() {
        assert_eq!(DomainState::Running.reason_code("booted"), 1);
        assert_eq!(DomainState::Running.reason_code("unpaused"), 5);
        assert_eq!(DomainState::Paused.reason_code("user"), 1);
        assert_eq!(DomainState::Paused.reason_code("i/o error"), 5);
        assert_eq!(DomainState::Shutoff.reason_code("destroyed"), 2);
        assert_eq!(DomainState::Crashed.reason_code("panicked"), 1);
        assert_eq!(DomainState::Shutoff.reason_code("something else"), 0);
    }
}
