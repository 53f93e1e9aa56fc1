//! Error taxonomy for the cache core (§7 of the spec).
//!
//! Most anomalies are masked locally (read failures against dirty buffers,
//! duplicate hash inserts, CoW conflicts) rather than surfaced here — see
//! the module docs on `read_path` and `dirty_path`. What's left are the
//! errors a caller can legitimately observe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbufError {
    /// A clean (no dirty records) buffer's read failed and there is no
    /// salvageable data to hand back.
    #[error("I/O error reading block {0}")]
    Eio(String),

    /// `NOFILL` buffers always fail reads this way, by design.
    #[error("read of NOFILL buffer {0} is not permitted")]
    NofillRead(String),

    /// No block pointer exists for the requested block and the caller asked
    /// to fail rather than synthesize a hole.
    #[error("no block pointer for {0}")]
    NoBlockPointer(String),

    /// `new_size`/spill-size requested on a buffer kind that does not
    /// support it.
    #[error("operation not supported for buffer kind: {0}")]
    NotSupported(String),

    /// Hash table or dirty-record slab allocation failed after retrying
    /// with progressively smaller sizes.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An invariant from §3/§5 was violated. In debug builds these should
    /// have been caught by `Buffer::verify`/assertions before this is ever
    /// constructed; kept as a typed error so release builds can propagate
    /// instead of aborting.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A collaborator (adaptive cache, object layer, storage I/O) reported
    /// a failure outside the read/write taxonomy above.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

pub type Result<T> = std::result::Result<T, DbufError>;
