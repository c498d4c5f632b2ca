//! Error types and the fatal-abort primitive.

use thiserror::Error;

/// Recoverable heap errors surfaced to the embedder.
#[derive(Debug, Error)]
pub enum HeapError {
    /// No region capacity was left for an allocation, even after a
    /// synchronous collection.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request in bytes.
        requested: usize,
    },

    /// A [`HeapConfig`](crate::HeapConfig) violated one of its rules.
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),

    /// A raw GC request carried an unknown reason or type.
    #[error("invalid gc request: reason={reason}, type={gc_type}")]
    InvalidRequest {
        /// Raw reason value.
        reason: u32,
        /// Raw GC type value.
        gc_type: u32,
    },

    /// The OS refused to reserve the heap range.
    #[error("failed to reserve heap memory")]
    Reserve(#[source] std::io::Error),

    /// The collector daemon thread could not be started.
    #[error("failed to spawn collector thread")]
    Spawn(#[source] std::io::Error),

    /// The collector daemon has shut down.
    #[error("collector thread is not running")]
    CollectorStopped,
}

/// A heap invariant violation found by verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// A reference points outside the reserved heap range.
    #[error("object {holder:#x} references {target:#x} outside the heap")]
    OutsideHeap {
        /// Address of the referencing object.
        holder: usize,
        /// The bad target address.
        target: usize,
    },

    /// A reference points into a region that holds no live objects.
    #[error("object {holder:#x} references {target:#x} in a {region} region")]
    DeadRegion {
        /// Address of the referencing object.
        holder: usize,
        /// The bad target address.
        target: usize,
        /// Type of the region containing the target.
        region: &'static str,
    },

    /// An object's state word was left mid-forward.
    #[error("object {object:#x} is still in forward state {state}")]
    StaleForwardState {
        /// Address of the object.
        object: usize,
        /// Name of the forward state.
        state: &'static str,
    },

    /// An object reported a size of zero or ran past its region.
    #[error("object {object:#x} has invalid size {size}")]
    BadSize {
        /// Address of the object.
        object: usize,
        /// Reported size in bytes.
        size: usize,
    },

    /// The embedder's validity check rejected an object.
    #[error("object {object:#x} failed the object model validity check")]
    InvalidObject {
        /// Address of the object.
        object: usize,
    },
}

/// Aborts the process after logging `message`.
///
/// Every unrecoverable heap condition ends here so crash signatures stay
/// uniform: copy-phase exhaustion, verification failures, stop-the-world
/// past its hard ceiling and corrupted object state.
#[cold]
#[inline(never)]
pub fn fatal(message: &str) -> ! {
    tracing::error!(message, "fatal heap error");
    eprintln!("region-gc fatal: {message}");
    std::process::abort()
}
