//! Region-based heap layout.
//!
//! The heap is one reserved address range cut into fixed-size units. A
//! region is a run of contiguous units with one type; its metadata lives in
//! the descriptor of its first unit.

pub mod bitmap;
pub mod buffer;
pub mod desc;
pub mod free_units;
pub mod list;
pub mod manager;
pub mod table;
pub mod throttle;

pub use buffer::{AllocBuffer, CopyBuffer};
pub use desc::{RegionDesc, RegionFlags, RegionId, RegionType, UnitRole};
pub use list::RegionList;
pub use manager::{ClassifyStats, RegionManager, SweepStats, UnitAccounting};
pub use table::RegionTable;
