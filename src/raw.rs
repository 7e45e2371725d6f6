//! The on-flash block layout.
//!
//! Every non-erased block starts with a header laid out as
//! `tag(1) | flags(1) | revision(1) | blockSize(2 LE) | checksum(K LE)`,
//! where `K` is the width of the backend's checksum digest. The remaining
//! `ERASE_SIZE - SIZE` bytes of the block carry payload. An erased block is
//! all `0xFF`, so an all-ones field is indistinguishable from an unwritten
//! one; the write protocol relies on that to program header fields in
//! several steps.

use crate::error::Error;
use crate::platform::Storage;
use crate::wire::WireInt;

/// Untouched state of a flash byte. Programs can only clear bits.
pub(crate) const ERASED_BYTE: u8 = 0xFF;

/// Flags bit 7: set (erased state) until the block's chain is committed.
pub const ERASED_BIT: u8 = 0x80;

/// Flags bit 6: set on every chain block except the start block.
pub const CONTINUATION_BIT: u8 = 0x40;

/// Committed flags byte of a continuation block. Reserved bits are masked
/// to zero.
pub(crate) const FLAGS_CONTINUATION: u8 = CONTINUATION_BIT;

/// Committed flags byte of a start block.
pub(crate) const FLAGS_START: u8 = 0x00;

/// `0xFF` never names an object; it is what an erased tag field reads as.
pub const NO_TAG: u8 = 0xFF;

// Largest supported header: 5 fixed bytes plus a u64 digest. Stack buffers
// are sized with this and sliced down to `Header::<C>::SIZE`.
const MAX_SIZE: usize = 5 + 8;

/// A decoded block header. Fields appear on flash in declaration order.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header<C> {
    /// User-assigned object identifier; [`NO_TAG`] on erased blocks.
    pub tag: u8,
    /// [`ERASED_BIT`] | [`CONTINUATION_BIT`]; reserved bits are zero once
    /// committed.
    pub flags: u8,
    /// Per-tag revision counter, incremented mod 256 on every write.
    pub revision: u8,
    /// Payload bytes stored in this block, excluding the header.
    pub block_size: u16,
    /// Backend-defined checksum over the block's payload.
    pub checksum: C,
}

impl<C: WireInt> Header<C> {
    /// Serialised size in bytes.
    pub const SIZE: usize = 3 + 2 + C::WIDTH;

    /// The header of an untouched block: every field all-ones.
    pub(crate) fn erased() -> Self {
        Self {
            tag: ERASED_BYTE,
            flags: ERASED_BYTE,
            revision: ERASED_BYTE,
            block_size: u16::filled(ERASED_BYTE),
            checksum: C::filled(ERASED_BYTE),
        }
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        Self {
            tag: u8::load_le(&buf[0..]),
            flags: u8::load_le(&buf[1..]),
            revision: u8::load_le(&buf[2..]),
            block_size: u16::load_le(&buf[3..]),
            checksum: C::load_le(&buf[5..]),
        }
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        self.tag.store_le(&mut buf[0..]);
        self.flags.store_le(&mut buf[1..]);
        self.revision.store_le(&mut buf[2..]);
        self.block_size.store_le(&mut buf[3..]);
        self.checksum.store_le(&mut buf[5..]);
    }

    /// Reads and decodes the header of the block at `addr`.
    pub(crate) fn read<T>(flash: &mut T, addr: u32) -> Result<Self, Error>
    where
        T: Storage<Digest = C>,
    {
        let mut buf = [ERASED_BYTE; MAX_SIZE];
        let buf = &mut buf[..Self::SIZE];
        flash.read(addr, buf).map_err(|_| Error::FlashError)?;
        Ok(Self::decode(buf))
    }

    /// Encodes the header and programs it at `addr` with a single backend
    /// write. The scratch buffer starts out all-ones, never zeroed: an
    /// all-ones field leaves the corresponding flash bytes untouched, which
    /// is how in-flight headers carry only the fields committed so far.
    pub(crate) fn write<T>(&self, flash: &mut T, addr: u32) -> Result<(), Error>
    where
        T: Storage<Digest = C>,
    {
        let mut buf = [ERASED_BYTE; MAX_SIZE];
        let buf = &mut buf[..Self::SIZE];
        self.encode(buf);
        flash.write(addr, buf).map_err(|_| Error::FlashError)
    }

    pub fn is_erased(&self) -> bool {
        self.flags & ERASED_BIT != 0
    }

    pub fn is_continuation(&self) -> bool {
        self.flags & CONTINUATION_BIT != 0
    }

    /// Whether every field still reads as erased. A blank block has never
    /// been touched since its last erase; a merely [`is_erased`] one may be
    /// an in-flight reservation carrying a tag and revision.
    ///
    /// [`is_erased`]: Header::is_erased
    pub(crate) fn is_blank(&self) -> bool {
        self.tag == ERASED_BYTE
            && self.flags == ERASED_BYTE
            && self.revision == ERASED_BYTE
            && self.block_size == u16::filled(ERASED_BYTE)
            && self.checksum == C::filled(ERASED_BYTE)
    }

    /// Signed-modular revision comparison: `self` is newer iff the 8-bit
    /// wrapping distance to `other` is strictly positive, so revisions may
    /// wrap (254, 255, 0, 1, ...) within a window of ±127.
    pub fn newer_than(&self, other: &Self) -> bool {
        (self.revision.wrapping_sub(other.revision) as i8) > 0
    }
}
