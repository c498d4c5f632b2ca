//! The collector: phases, marking, forwarding, fixing and the daemon that
//! runs cycles on request.

pub mod collector;
pub mod fix;
pub mod forward;
pub mod marker;
pub mod phase;
pub mod request;
pub mod sync;
pub mod verify;
pub mod worklist;

pub use collector::{Collector, CycleContext};
pub use fix::{FixStats, Fixer};
pub use forward::ForwardingTable;
pub use marker::{MarkStats, Marker};
pub use phase::GcPhase;
pub use request::{GcReason, GcRequest, GcType};
pub use verify::{verify_heap, VerifyReport};
