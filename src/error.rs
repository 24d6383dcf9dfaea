//! Fatal-error taxonomy.
//!
//! None of these are recoverable at the core's boundary (spec §7):
//! every variant here backs a `panic!`, never a `Result`. The type
//! exists so the panic messages are consistent and so callers
//! building on top of this crate have something to `match` on in a
//! panic hook if they want to log before the process dies.

use core::fmt;

/// A condition that this crate treats as a fatal assertion rather than
/// a recoverable error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalError {
    /// `index` exceeds the table's addressable range (height cap 7).
    IndexOverflow { index: u64 },
    /// The allocator returned no elements/nodes where it was required to.
    AllocationFailure,
    /// Debug-mode only: double free, reentrant write lock, or mixed
    /// read/write hold detected.
    InvariantViolation(&'static str),
    /// A free list's `next_alloc` counter would wrap around `Index`.
    StripeExhaustion,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::IndexOverflow { index } => {
                write!(f, "index {index} exceeds the table's addressable range")
            }
            FatalError::AllocationFailure => {
                write!(f, "allocator returned no elements/nodes")
            }
            FatalError::InvariantViolation(what) => {
                write!(f, "invariant violated: {what}")
            }
            FatalError::StripeExhaustion => {
                write!(f, "free list stripe counter exhausted the identifier space")
            }
        }
    }
}

impl FatalError {
    /// Panic with this error as the message. Never returns.
    #[cold]
    #[inline(never)]
    pub fn fail(self) -> ! {
        panic!("{self}")
    }
}
