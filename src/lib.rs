// CHRONON crate root
//
// A discrete-event simulation kernel for cycle-accurate hardware models:
// tick/phase scheduler with a precedence DAG, ratioed clock domains, pooled
// payload events, and typed ports (data, signal, cross-clock sync).

pub mod clock;
pub mod config;
pub mod events;
pub mod ports;
pub mod sched;
pub mod tree;
pub mod utils;

pub use clock::{Clock, ClockManager};
pub use events::precedence::{precedes, DagParticipant, EventGroup};
pub use events::{Event, EventSet, PayloadEvent, SingleCycleUniqueEvent, UniqueEvent};
pub use ports::{bind, Direction, Port};
pub use sched::dag::GlobalOrderingPoint;
pub use sched::{Scheduler, SchedulingPhase};
pub use tree::TreeNode;

/// The scheduler's atomic unit of simulated time.
pub type Tick = u64;

/// A count in one clock domain; `cycle * period_ticks` gives the tick.
pub type Cycle = u64;
