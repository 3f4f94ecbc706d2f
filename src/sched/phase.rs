//! Phases within a single scheduler tick.
//!
//! Phases bucket work inside one tick into ordered slots: resources update
//! before delayed ports deliver, ports deliver before collection, and the
//! bulk of combinational work runs in `Tick`. Precedence edges may only
//! join work within one phase; ordering across phases comes from the phase
//! order itself.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the seven ordered execution slots within a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SchedulingPhase {
    /// Reserved earliest slot.
    Trigger,
    /// Resources (pipes, buffers) are updated in this phase.
    Update,
    /// N-cycle ports deliver their data in this phase.
    PortUpdate,
    /// Flushing of pipelines and cancellation work.
    Flush,
    /// Observation hooks run here.
    Collection,
    /// Most operations (combinational logic) occur in this phase.
    Tick,
    /// Operations that must follow all `Tick` work.
    PostTick,
}

/// The number of phases.
pub const NUM_SCHEDULING_PHASES: usize = 7;

impl SchedulingPhase {
    pub const ALL: [SchedulingPhase; NUM_SCHEDULING_PHASES] = [
        SchedulingPhase::Trigger,
        SchedulingPhase::Update,
        SchedulingPhase::PortUpdate,
        SchedulingPhase::Flush,
        SchedulingPhase::Collection,
        SchedulingPhase::Tick,
        SchedulingPhase::PostTick,
    ];

    pub fn index(self) -> usize {
        match self {
            SchedulingPhase::Trigger => 0,
            SchedulingPhase::Update => 1,
            SchedulingPhase::PortUpdate => 2,
            SchedulingPhase::Flush => 3,
            SchedulingPhase::Collection => 4,
            SchedulingPhase::Tick => 5,
            SchedulingPhase::PostTick => 6,
        }
    }
}

impl fmt::Display for SchedulingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulingPhase::Trigger => "Trigger",
            SchedulingPhase::Update => "Update",
            SchedulingPhase::PortUpdate => "PortUpdate",
            SchedulingPhase::Flush => "Flush",
            SchedulingPhase::Collection => "Collection",
            SchedulingPhase::Tick => "Tick",
            SchedulingPhase::PostTick => "PostTick",
        };
        write!(f, "{}", name)
    }
}
