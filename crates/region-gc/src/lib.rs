//! A region-based concurrent mark-copy garbage collector core.
//!
//! `region-gc` manages a reserved address range cut into fixed-size units
//! and collects it with a mostly-concurrent copying collector. It does not
//! know what objects look like: the embedding runtime describes its layout
//! through [`ObjectModel`] and hands out its roots through [`RootProvider`].
//!
//! # Architecture
//!
//! - **Regions**: runs of units with one type (thread-local, from, to, old,
//!   large, pinned, ...), kept on per-type intrusive lists by the
//!   [`RegionManager`](region::RegionManager).
//! - **Collector**: one cycle walks `Idle → Enum → Mark → PostMark → PreCopy
//!   → Copy → Fix → Idle`. Enumeration and the final mark are short
//!   stop-the-world pauses; marking, copying and fixing run alongside the
//!   mutators.
//! - **Mutators**: each application thread attaches a [`Mutator`] that owns
//!   its allocation buffers and runs the read and write barriers. Mutators
//!   poll [`Mutator::safepoint`] and wrap blocking calls in safe regions.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use region_gc::testing::{RootSet, SimpleObjectModel};
//! use region_gc::{GcReason, GcType, Heap, HeapConfig};
//!
//! let model = Arc::new(SimpleObjectModel::new());
//! let roots = Arc::new(RootSet::new());
//! let config = HeapConfig::default().with_heap_size(16 * 1024 * 1024);
//! let heap = Heap::new(config, model.clone(), roots.clone()).unwrap();
//!
//! let mutator = heap.attach();
//! let header = model.header(1, 16);
//! let node = mutator.allocate(header, model.size_of(header)).unwrap();
//! let root = roots.add(Some(node));
//!
//! mutator.request_gc(GcReason::User, false, GcType::Young).unwrap();
//! // The object survived, possibly at a new address.
//! assert!(roots.get(root).is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod gc;
mod heap;
pub mod metrics;
mod model;
pub mod mutator;
pub mod object;
pub mod region;
pub mod testing;
pub mod tracing;

pub use config::HeapConfig;
pub use error::{HeapError, VerifyError};
pub use gc::{GcPhase, GcReason, GcRequest, GcType, VerifyReport};
pub use heap::{GcCriticalSection, Heap};
pub use metrics::{GcMetrics, HeapStats};
pub use model::{ObjectModel, RootProvider};
pub use mutator::Mutator;
pub use object::{ObjectHeader, ObjectRef, RefField, RefValue};
