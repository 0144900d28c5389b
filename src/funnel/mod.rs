//! Funnel core: steps, inbound events, and the transition-table machine.

pub mod event;
pub mod machine;
pub mod step;

pub use event::{EventPayload, InboundEvent, SelectionId};
pub use machine::{default_table, FunnelMachine, Transition, TransitionTable};
pub use step::FunnelStep;
