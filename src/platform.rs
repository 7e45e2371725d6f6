//! The capability set the filesystem requires of its flash backend.

use embedded_storage::nor_flash::{ErrorType, NorFlash};

use crate::wire::WireInt;

/// See README.md for an example implementation.
///
/// On top of [`NorFlash`] (read, program, erase, `ERASE_SIZE` as the block
/// size, `capacity()` as the device size) the backend supplies per-block
/// hardware write-locking and a checksum primitive. Requirements beyond the
/// `embedded-storage` contract:
///
/// * byte-granular access: `READ_SIZE == WRITE_SIZE == 1`;
/// * re-programming already-programmed bytes with bit-clearing values must
///   be permitted (cf. `MultiwriteNorFlash`) — block headers are programmed
///   incrementally as a write progresses.
///
/// Writing or erasing a locked block, and locking after a freeze, are
/// caller bugs; the backend reports them as its own errors.
pub trait Storage: NorFlash + BlockLock + Checksum {}

impl<T: NorFlash + BlockLock + Checksum> Storage for T {}

/// Per-block hardware write-locking.
pub trait BlockLock: ErrorType {
    /// Lock the block starting at `addr` against programs and erases. The
    /// block's tag is passed through so the implementation can choose a
    /// special kind of locking for some objects (e.g. permanent locking for
    /// tags at or below its non-volatile threshold).
    fn lock(&mut self, addr: u32, tag: u8) -> Result<(), Self::Error>;

    /// Make all current lock states immutable until the next power cycle.
    fn freeze(&mut self) -> Result<(), Self::Error>;
}

/// Backend-defined block payload checksum.
pub trait Checksum: ErrorType {
    /// The on-flash checksum value. Its width fixes the header size.
    type Digest: WireInt;

    /// Checksum over `len` bytes of flash starting at `addr`.
    fn compute_checksum(&mut self, addr: u32, len: u32) -> Result<Self::Digest, Self::Error>;

    /// Whether the checksum over `[addr, addr + len)` matches `expected`.
    fn verify_checksum(
        &mut self,
        addr: u32,
        len: u32,
        expected: Self::Digest,
    ) -> Result<bool, Self::Error>;
}

impl<T: BlockLock> BlockLock for &mut T {
    fn lock(&mut self, addr: u32, tag: u8) -> Result<(), Self::Error> {
        (*self).lock(addr, tag)
    }

    fn freeze(&mut self) -> Result<(), Self::Error> {
        (*self).freeze()
    }
}

impl<T: Checksum> Checksum for &mut T {
    type Digest = T::Digest;

    fn compute_checksum(&mut self, addr: u32, len: u32) -> Result<Self::Digest, Self::Error> {
        (*self).compute_checksum(addr, len)
    }

    fn verify_checksum(
        &mut self,
        addr: u32,
        len: u32,
        expected: Self::Digest,
    ) -> Result<bool, Self::Error> {
        (*self).verify_checksum(addr, len, expected)
    }
}
