//! Object references, state words and reference fields.
//!
//! Every heap object starts with one 64-bit state word:
//!
//! | Bits    | Meaning                                              |
//! |---------|------------------------------------------------------|
//! | 0..48   | payload: class word, or forwarding address           |
//! | 48..56  | language tag (`0xFF` is reserved for fillers)        |
//! | 56..58  | forward state: normal, forwarding, forwarded, to-version |
//!
//! The word is only ever changed as a whole through [`StateCell`]; the
//! accessors on [`StateWord`] are pure mask/shift helpers.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Alignment of every object start.
pub const OBJECT_ALIGNMENT: usize = 8;
/// Smallest object: a bare state word.
pub const MIN_OBJECT_SIZE: usize = 8;
/// Language tag reserved for filler objects.
pub const FILLER_TAG: u8 = 0xFF;
/// Low bit of a reference field marking a weak reference.
pub const WEAK_BIT: usize = 1;

const PAYLOAD_BITS: u32 = 48;
const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;
const TAG_SHIFT: u32 = 48;
const TAG_MASK: u64 = 0xFF;
const STATE_SHIFT: u32 = 56;
const STATE_MASK: u64 = 0b11;

/// Rounds an object size up to [`OBJECT_ALIGNMENT`], never below
/// [`MIN_OBJECT_SIZE`].
#[must_use]
pub const fn aligned_size(size: usize) -> usize {
    let size = if size < MIN_OBJECT_SIZE {
        MIN_OBJECT_SIZE
    } else {
        size
    };
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// Relocation state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ForwardState {
    /// Not being moved.
    Normal = 0,
    /// A collector or mutator thread won the right to copy the object and is
    /// copying it now.
    Forwarding = 1,
    /// The payload holds the address of the copy.
    Forwarded = 2,
    /// A to-space copy whose body is still being written.
    ToVersion = 3,
}

impl ForwardState {
    const fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            0 => Self::Normal,
            1 => Self::Forwarding,
            2 => Self::Forwarded,
            _ => Self::ToVersion,
        }
    }

    /// Short name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Forwarding => "forwarding",
            Self::Forwarded => "forwarded",
            Self::ToVersion => "to-version",
        }
    }
}

/// A decoded snapshot of an object's state word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StateWord(u64);

impl StateWord {
    /// A normal-state word carrying `payload` (truncated to 48 bits) and `tag`.
    #[must_use]
    pub const fn new(payload: u64, tag: u8) -> Self {
        Self((payload & PAYLOAD_MASK) | ((tag as u64) << TAG_SHIFT))
    }

    /// The state word of a filler spanning `size` bytes.
    #[must_use]
    pub const fn filler(size: usize) -> Self {
        Self::new(size as u64, FILLER_TAG)
    }

    /// Reinterprets raw bits.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// The 48-bit payload.
    #[must_use]
    pub const fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    /// The language tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        ((self.0 >> TAG_SHIFT) & TAG_MASK) as u8
    }

    /// The forward state.
    #[must_use]
    pub const fn forward_state(self) -> ForwardState {
        ForwardState::from_bits(self.0 >> STATE_SHIFT)
    }

    /// The same word with another forward state.
    #[must_use]
    pub const fn with_forward_state(self, state: ForwardState) -> Self {
        Self((self.0 & !(STATE_MASK << STATE_SHIFT)) | ((state as u64) << STATE_SHIFT))
    }

    /// A forwarded word pointing at `to`, keeping the language tag.
    #[must_use]
    pub const fn forwarded_to(self, to: usize) -> Self {
        Self::new(to as u64, self.tag()).with_forward_state(ForwardState::Forwarded)
    }

    /// The copy's address if this word is forwarded.
    #[must_use]
    pub const fn forwarding_address(self) -> Option<usize> {
        match self.forward_state() {
            ForwardState::Forwarded => Some(self.payload() as usize),
            _ => None,
        }
    }

    /// Whether this word heads a filler.
    #[must_use]
    pub const fn is_filler(self) -> bool {
        self.tag() == FILLER_TAG && matches!(self.forward_state(), ForwardState::Normal)
    }
}

impl fmt::Debug for StateWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateWord")
            .field("payload", &format_args!("{:#x}", self.payload()))
            .field("tag", &self.tag())
            .field("state", &self.forward_state())
            .finish()
    }
}

/// The atomic cell holding a state word at an object's first eight bytes.
#[derive(Debug)]
#[repr(transparent)]
pub struct StateCell(AtomicU64);

impl StateCell {
    /// Creates a cell.
    #[must_use]
    pub const fn new(word: StateWord) -> Self {
        Self(AtomicU64::new(word.0))
    }

    /// Loads the word with acquire ordering.
    pub fn load(&self) -> StateWord {
        StateWord(self.0.load(Ordering::Acquire))
    }

    /// Publishes a word with release ordering.
    pub fn store(&self, word: StateWord) {
        self.0.store(word.0, Ordering::Release);
    }

    /// Replaces `current` with `new`, returning the observed word on failure.
    ///
    /// # Errors
    ///
    /// Returns the actual word if it differed from `current`.
    pub fn compare_exchange(&self, current: StateWord, new: StateWord) -> Result<StateWord, StateWord> {
        self.0
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(StateWord)
            .map_err(StateWord)
    }
}

/// The class word and language tag written into a new object's state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Embedder-defined class word; only the low 48 bits are kept.
    pub class: u64,
    /// Embedder-defined language tag; must not be [`FILLER_TAG`].
    pub tag: u8,
}

impl ObjectHeader {
    /// Creates a header.
    #[must_use]
    pub const fn new(class: u64, tag: u8) -> Self {
        Self { class, tag }
    }

    /// The initial state word for this header.
    #[must_use]
    pub const fn state_word(self) -> StateWord {
        StateWord::new(self.class, self.tag)
    }
}

/// Writes a fresh object of `size` bytes at `address`: the body is zeroed
/// first, then the state word is published with release ordering so region
/// walkers never observe a header without its body.
///
/// # Safety
///
/// `[address, address + size)` must be owned by the caller, 8-byte aligned
/// and `size >= MIN_OBJECT_SIZE`.
pub(crate) unsafe fn initialize_object(address: usize, size: usize, header: ObjectHeader) -> ObjectRef {
    debug_assert!(size >= MIN_OBJECT_SIZE && address % OBJECT_ALIGNMENT == 0);
    // SAFETY: guaranteed by the caller.
    unsafe {
        std::ptr::write_bytes((address + MIN_OBJECT_SIZE) as *mut u8, 0, size - MIN_OBJECT_SIZE);
        let obj = ObjectRef(NonZeroUsize::new_unchecked(address));
        obj.state().store(header.state_word());
        obj
    }
}

/// Overwrites `[address, address + size)` with a filler so linear walks skip it.
///
/// # Safety
///
/// The range must hold only dead objects (or free space) and be 8-byte
/// aligned with `size >= MIN_OBJECT_SIZE`.
pub(crate) unsafe fn write_filler(address: usize, size: usize) {
    debug_assert!(size >= MIN_OBJECT_SIZE && address % OBJECT_ALIGNMENT == 0);
    // SAFETY: guaranteed by the caller.
    unsafe { (*(address as *const StateCell)).store(StateWord::filler(size)) };
}

/// The address of a heap object.
///
/// An `ObjectRef` is only an address; the accessors that read the object are
/// `unsafe` because the address must point at a live object in a heap that is
/// still alive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    /// Wraps a non-null address.
    #[must_use]
    pub const fn from_address(address: usize) -> Option<Self> {
        match NonZeroUsize::new(address) {
            Some(address) => Some(Self(address)),
            None => None,
        }
    }

    /// The object's start address.
    #[must_use]
    pub const fn address(self) -> usize {
        self.0.get()
    }

    /// The object's state word cell.
    ///
    /// # Safety
    ///
    /// The object must be live inside a heap that outlives `'a`.
    #[must_use]
    pub unsafe fn state<'a>(self) -> &'a StateCell {
        // SAFETY: every object starts with an 8-byte aligned state word.
        unsafe { &*(self.address() as *const StateCell) }
    }

    /// The current class word and tag.
    ///
    /// # Safety
    ///
    /// See [`state`](Self::state).
    #[must_use]
    pub unsafe fn header(self) -> ObjectHeader {
        // SAFETY: forwarded to the caller.
        let word = unsafe { self.state() }.load();
        ObjectHeader::new(word.payload(), word.tag())
    }

    /// The reference field `offset` bytes into the object.
    ///
    /// # Safety
    ///
    /// See [`state`](Self::state); `offset` must name a reference slot of the
    /// object's layout.
    #[must_use]
    pub unsafe fn field<'a>(self, offset: usize) -> &'a RefField {
        // SAFETY: forwarded to the caller.
        unsafe { RefField::from_address(self.address() + offset) }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.address())
    }
}

/// The decoded contents of a [`RefField`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RefValue(usize);

impl RefValue {
    /// The null reference.
    pub const NULL: Self = Self(0);

    /// A strong reference to `target`.
    #[must_use]
    pub const fn strong(target: ObjectRef) -> Self {
        Self(target.address())
    }

    /// A weak reference to `target`.
    #[must_use]
    pub const fn weak(target: ObjectRef) -> Self {
        Self(target.address() | WEAK_BIT)
    }

    /// A strong reference, or null.
    #[must_use]
    pub const fn from_option(target: Option<ObjectRef>) -> Self {
        match target {
            Some(target) => Self::strong(target),
            None => Self::NULL,
        }
    }

    /// Reinterprets raw bits.
    #[must_use]
    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }

    /// The referenced object, if any.
    #[must_use]
    pub const fn target(self) -> Option<ObjectRef> {
        ObjectRef::from_address(self.0 & !WEAK_BIT)
    }

    /// Whether the weak bit is set.
    #[must_use]
    pub const fn is_weak(self) -> bool {
        self.0 & WEAK_BIT != 0
    }

    /// Whether no object is referenced.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 & !WEAK_BIT == 0
    }

    /// The same reference kind pointing at `target`.
    #[must_use]
    pub const fn with_target(self, target: ObjectRef) -> Self {
        Self(target.address() | (self.0 & WEAK_BIT))
    }
}

impl fmt::Debug for RefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.target(), self.is_weak()) {
            (None, _) => f.write_str("RefValue(null)"),
            (Some(t), false) => write!(f, "RefValue({:#x})", t.address()),
            (Some(t), true) => write!(f, "RefValue(weak {:#x})", t.address()),
        }
    }
}

/// Result of [`RefField::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// This call installed the new value.
    Updated,
    /// Another thread had already installed the same new value.
    AlreadyUpdated,
    /// The field held something else.
    Raced(RefValue),
}

impl UpdateOutcome {
    /// Whether the field now holds the requested value.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Updated | Self::AlreadyUpdated)
    }
}

/// A reference slot inside an object or a root.
///
/// Writers always compare-and-exchange against the value they observed:
/// markers, fixers and mutators race on the same slots.
#[derive(Default)]
#[repr(transparent)]
pub struct RefField(AtomicUsize);

impl RefField {
    /// Creates a slot holding `value`.
    #[must_use]
    pub const fn new(value: RefValue) -> Self {
        Self(AtomicUsize::new(value.0))
    }

    /// Views heap memory at `address` as a reference slot.
    ///
    /// # Safety
    ///
    /// `address` must be 8-byte aligned and stay valid for `'a`.
    #[must_use]
    pub unsafe fn from_address<'a>(address: usize) -> &'a Self {
        // SAFETY: guaranteed by the caller.
        unsafe { &*(address as *const Self) }
    }

    /// The slot's own address.
    #[must_use]
    pub fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Loads the slot with acquire ordering.
    pub fn load(&self) -> RefValue {
        RefValue(self.0.load(Ordering::Acquire))
    }

    /// Stores `value` with release ordering. Only for slots no other thread
    /// can reach yet.
    pub fn store(&self, value: RefValue) {
        self.0.store(value.0, Ordering::Release);
    }

    /// Replaces `current` with `new`.
    ///
    /// # Errors
    ///
    /// Returns the actual value if it differed from `current`.
    pub fn compare_exchange(&self, current: RefValue, new: RefValue) -> Result<RefValue, RefValue> {
        self.0
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(RefValue)
            .map_err(RefValue)
    }

    /// Rewrites `old` to `new`, treating a slot that already holds `new` as
    /// success.
    pub fn update(&self, old: RefValue, new: RefValue) -> UpdateOutcome {
        match self.compare_exchange(old, new) {
            Ok(_) => UpdateOutcome::Updated,
            Err(actual) if actual == new => UpdateOutcome::AlreadyUpdated,
            Err(actual) => UpdateOutcome::Raced(actual),
        }
    }
}

impl fmt::Debug for RefField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefField").field(&self.load()).finish()
    }
}
