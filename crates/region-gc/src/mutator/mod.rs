//! Mutator threads and the safepoint protocol.

pub mod handle;
pub mod manager;
pub mod record;

pub use handle::Mutator;
pub use manager::{FlipCallback, MutatorManager, StwScope};
pub use record::{MutatorLocal, MutatorRecord, MutatorState};
