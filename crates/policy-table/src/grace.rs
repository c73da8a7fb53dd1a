//! Graceful shutdown phases.
//!
//! When IPsec is administratively disabled the policy table does not rip out
//! its policies at once. It first makes every policy optional, then removes
//! outbound policies, then removes everything. The phase is a pure function of
//! `(ipsec_enabled, time since first apply)`.

use std::fmt;
use std::time::Duration;

use crate::model::{Direction, PolicyRule, PolicySelector};

/// Graceful shutdown phase, ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum GracefulShutdownPhase {
    /// IPsec enabled, policies enforced as configured.
    #[default]
    None,
    /// All of our policies are kept but marked optional.
    AllOptional,
    /// Outbound policies removed, the rest optional.
    RemoveOutbound,
    /// All of our policies removed.
    RemoveAll,
}

impl GracefulShutdownPhase {
    /// Phase for the given state and elapsed time since the first apply.
    pub fn for_elapsed(ipsec_enabled: bool, elapsed: Duration, times: GraceTimes) -> Self {
        if ipsec_enabled {
            Self::None
        } else if elapsed < times.all_optional {
            Self::AllOptional
        } else if elapsed < times.remove_outbound {
            Self::RemoveOutbound
        } else {
            Self::RemoveAll
        }
    }

    /// Rule expected in the kernel for an observed policy of ours while in a
    /// grace phase. `None` means the policy should not be present.
    ///
    /// Must not be called in [`GracefulShutdownPhase::None`], where the
    /// desired map is authoritative instead.
    pub fn expected_rule(self, sel: &PolicySelector, observed: &PolicyRule) -> Option<PolicyRule> {
        let keep = match self {
            Self::None | Self::AllOptional => true,
            Self::RemoveOutbound => sel.dir() != Direction::Out,
            Self::RemoveAll => false,
        };
        keep.then_some(observed.with_optional(true))
    }

    /// Numeric index for the phase gauge.
    pub fn index(self) -> u8 {
        match self {
            Self::None => 0,
            Self::AllOptional => 1,
            Self::RemoveOutbound => 2,
            Self::RemoveAll => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AllOptional => "all-optional",
            Self::RemoveOutbound => "remove-outbound",
            Self::RemoveAll => "remove-all",
        }
    }
}

impl fmt::Display for GracefulShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase boundaries measured from the first apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraceTimes {
    /// End of [`GracefulShutdownPhase::AllOptional`].
    pub all_optional: Duration,
    /// End of [`GracefulShutdownPhase::RemoveOutbound`].
    pub remove_outbound: Duration,
}

impl GraceTimes {
    /// Production timings: 60s / 120s.
    pub const STANDARD: Self = Self {
        all_optional: Duration::from_secs(60),
        remove_outbound: Duration::from_secs(120),
    };

    /// Test timings: 5s / 10s.
    pub const SHORT: Self = Self {
        all_optional: Duration::from_secs(5),
        remove_outbound: Duration::from_secs(10),
    };

    pub fn new(use_short_grace_time: bool) -> Self {
        if use_short_grace_time {
            Self::SHORT
        } else {
            Self::STANDARD
        }
    }
}
