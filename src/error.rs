use thiserror::Error;

/// Errors that can occur during filesystem operations. Marked non-exhaustive
/// to allow for future additions without breaking the API; most callers only
/// need to handle `FlashError` and `FlashFull`, the rest are static.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The backend geometry is unusable: the capacity is not a whole number
    /// of blocks, a block cannot hold a header plus payload, the payload
    /// capacity exceeds the header's 16-bit block size field, or the backend
    /// is not byte-granular.
    #[error("invalid flash geometry")]
    InvalidGeometry,

    /// The internal error value is returned from the storage backend.
    #[error("internal flash error")]
    FlashError,

    /// No erased block is available, or a reservation ran out of erased
    /// blocks before covering the requested size.
    #[error("flash full")]
    FlashFull,

    /// The tag is `0xFF` (reserved for erased headers) or beyond the
    /// context's tag range.
    #[error("tag out of range")]
    TagOutOfRange,

    /// No live chain exists for the tag. Either nothing has been written yet
    /// or the last write never committed.
    #[error("object not found")]
    ObjectNotFound,

    /// The destination buffer is shorter than the stored object.
    #[error("buffer too small")]
    BufferTooSmall,

    /// A block failed its checksum, a chain is shorter than its recorded
    /// size, or a commit found the start block in an unexpected state.
    #[error("corrupted data")]
    CorruptedData,
}
