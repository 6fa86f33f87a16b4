use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Liveness of a target as inferred from its state reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReachabilityState {
    Online,
    ProbablyOffline,
    Offline,
}

impl ReachabilityState {
    pub fn code(self) -> i32 {
        match self {
            ReachabilityState::Online => 0,
            ReachabilityState::ProbablyOffline => 1,
            ReachabilityState::Offline => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ReachabilityState::Online),
            1 => Some(ReachabilityState::ProbablyOffline),
            2 => Some(ReachabilityState::Offline),
            _ => None,
        }
    }
}

impl Display for ReachabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReachabilityState::Online => write!(f, "Online"),
            ReachabilityState::ProbablyOffline => write!(f, "Probably-offline"),
            ReachabilityState::Offline => write!(f, "Offline"),
        }
    }
}

/// Data freshness of a target relative to its buddy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyState {
    Good,
    NeedsResync,
    Bad,
}

impl ConsistencyState {
    pub fn code(self) -> i32 {
        match self {
            ConsistencyState::Good => 0,
            ConsistencyState::NeedsResync => 1,
            ConsistencyState::Bad => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ConsistencyState::Good),
            1 => Some(ConsistencyState::NeedsResync),
            2 => Some(ConsistencyState::Bad),
            _ => None,
        }
    }
}

impl Display for ConsistencyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyState::Good => write!(f, "Good"),
            ConsistencyState::NeedsResync => write!(f, "Needs-resync"),
            ConsistencyState::Bad => write!(f, "Bad"),
        }
    }
}

/// Both state axes of a target. The default (offline, good) is what an unknown target compares as.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CombinedTargetState {
    pub reachability: ReachabilityState,
    pub consistency: ConsistencyState,
}

impl CombinedTargetState {
    pub fn new(reachability: ReachabilityState, consistency: ConsistencyState) -> Self {
        Self {
            reachability,
            consistency,
        }
    }

    pub fn is_online_and_good(&self) -> bool {
        self.reachability == ReachabilityState::Online
            && self.consistency == ConsistencyState::Good
    }
}

impl Default for CombinedTargetState {
    fn default() -> Self {
        Self::new(ReachabilityState::Offline, ConsistencyState::Good)
    }
}

impl Display for CombinedTargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.reachability, self.consistency)
    }
}
