#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
mod internal;
pub mod platform;
mod raw;
mod wire;

pub use raw::{CONTINUATION_BIT, ERASED_BIT, Header, NO_TAG};
pub use wire::WireInt;

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::error::Error;
use crate::platform::Storage;

/// Upper bound on the number of tags a [`Context`] can admit. Keeps the
/// reserved tag value `0xFF` from ever indexing a slot.
pub const MAX_TAGS: usize = 255;

/// In-RAM state for one tag.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RamHeader<C> {
    /// Mirror of the chain's start-block header. Erased while no live chain
    /// exists for the tag.
    pub current: Header<C>,
    /// Address of the chain's start block.
    pub start_block: u32,
    /// The block being filled during a write; `start_block` otherwise.
    pub current_block: u32,
    /// Total payload bytes of the chain. During a write, the declared
    /// payload length.
    pub size: u32,
}

impl<C: WireInt> RamHeader<C> {
    pub(crate) fn erased() -> Self {
        Self {
            current: Header::erased(),
            start_block: 0,
            current_block: 0,
            size: 0,
        }
    }
}

/// Per-mount RAM state: one [`RamHeader`] per admissible tag plus the
/// next-free-block hint. Owned by the caller and borrowed into each
/// operation; [`LockFs::mount`] fills it in.
pub struct Context<C> {
    pub(crate) headers: Vec<RamHeader<C>>,
    pub(crate) next_free_block: Option<u32>,
}

impl<C: WireInt> Context<C> {
    /// Creates a context admitting tags `0..tags`. Blocks carrying a tag at
    /// or beyond `tags` are ignored at mount time.
    ///
    /// Panics if `tags` exceeds [`MAX_TAGS`].
    pub fn new(tags: usize) -> Self {
        assert!(tags <= MAX_TAGS);
        Self {
            headers: vec![RamHeader::erased(); tags],
            next_free_block: None,
        }
    }

    /// Returns every entry to the erased state and clears the free-block
    /// hint.
    pub fn reset(&mut self) {
        for slot in &mut self.headers {
            *slot = RamHeader::erased();
        }
        self.next_free_block = None;
    }

    /// The entry for `tag`, or `None` if the tag is out of range. The entry
    /// of a tag without a live chain has an erased `current` header.
    pub fn header(&self, tag: u8) -> Option<&RamHeader<C>> {
        self.headers.get(tag as usize)
    }

    /// Start of the erased run the next write will be placed in. `None`
    /// when the device is full.
    pub fn next_free_block(&self) -> Option<u32> {
        self.next_free_block
    }

    /// Number of admissible tags.
    pub fn tags(&self) -> usize {
        self.headers.len()
    }
}

/// An in-flight write obtained from [`LockFs::start_write`].
///
/// Holds the context borrowed exclusively, so at most one write is in
/// flight at a time. Dropping the handle abandons the write: the reserved
/// blocks keep their in-flight headers and are erased on the next mount.
pub struct WriteHandle<'c, C: WireInt> {
    pub(crate) ctx: &'c mut Context<C>,
    pub(crate) ram: RamHeader<C>,
}

impl<C: WireInt> WriteHandle<'_, C> {
    /// Address of the chain's start block.
    pub fn start_block(&self) -> u32 {
        self.ram.start_block
    }

    /// The revision this write will commit as.
    pub fn revision(&self) -> u8 {
        self.ram.current.revision
    }
}

/// The filesystem over a [`Storage`] backend.
pub struct LockFs<T: Storage> {
    pub(crate) flash: T,
    pub(crate) size: u32,
}

impl<T: Storage> LockFs<T> {
    /// Wraps a backend after validating its geometry: a byte-granular
    /// device of at least one block, each block big enough for a header and
    /// a payload the header's 16-bit size field can count.
    pub fn new(flash: T) -> Result<Self, Error> {
        if T::READ_SIZE != 1 || T::WRITE_SIZE != 1 {
            return Err(Error::InvalidGeometry);
        }
        let size = flash.capacity();
        let block = T::ERASE_SIZE;
        let header = Header::<T::Digest>::SIZE;
        if size == 0 || !size.is_multiple_of(block) {
            return Err(Error::InvalidGeometry);
        }
        if block <= header || block - header > u16::MAX as usize {
            return Err(Error::InvalidGeometry);
        }
        let size = u32::try_from(size).map_err(|_| Error::InvalidGeometry)?;
        Ok(Self { flash, size })
    }

    /// Device size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Physical block size in bytes.
    pub fn block_size(&self) -> u32 {
        T::ERASE_SIZE as u32
    }

    /// Serialised header size for this backend's checksum width.
    pub fn header_size(&self) -> u32 {
        Header::<T::Digest>::SIZE as u32
    }

    /// Payload bytes per block.
    pub fn block_payload(&self) -> u32 {
        self.block_size() - self.header_size()
    }

    /// Mounts the filesystem. Must be the first operation after boot.
    ///
    /// Scans all blocks to rebuild `ctx` (newest revision per tag wins),
    /// erases superseded revisions and the leftovers of writes that never
    /// committed, write-locks every block of every live chain, and finally
    /// freezes the lock state for the rest of the power cycle.
    pub fn mount(&mut self, ctx: &mut Context<T::Digest>) -> Result<(), Error> {
        ctx.reset();
        self.scan_pass(ctx)?;
        self.reclaim_pass(ctx)?;
        self.lock_pass(ctx)?;
        self.flash.freeze().map_err(|_| Error::FlashError)
    }

    /// Reserves a chain of erased blocks for `len` payload bytes under
    /// `tag`, as the revision after the currently live one.
    ///
    /// The chain stays in-flight (invisible to a future mount) until
    /// [`finish_write`](LockFs::finish_write) commits it.
    pub fn start_write<'c>(
        &mut self,
        ctx: &'c mut Context<T::Digest>,
        tag: u8,
        len: u32,
    ) -> Result<WriteHandle<'c, T::Digest>, Error> {
        if tag == NO_TAG || tag as usize >= ctx.headers.len() {
            return Err(Error::TagOutOfRange);
        }
        let ram = self.reserve_chain(ctx, tag, len)?;
        Ok(WriteHandle { ctx, ram })
    }

    /// Streams payload bytes into the reserved chain. Callable repeatedly;
    /// the byte total across calls must equal the length declared to
    /// [`start_write`](LockFs::start_write). Each block filled to capacity
    /// is sealed with its checksum as the stream moves past it.
    pub fn write(
        &mut self,
        handle: &mut WriteHandle<'_, T::Digest>,
        data: &[u8],
    ) -> Result<(), Error> {
        self.stream(&mut handle.ram, data)
    }

    /// Commits the chain: seals the final block, clears the erased bit on
    /// every chain block in reverse physical order, the start block last.
    /// Once the start block is committed the new revision is live and
    /// `ctx` reflects it.
    pub fn finish_write(&mut self, handle: WriteHandle<'_, T::Digest>) -> Result<(), Error> {
        let WriteHandle { ctx, ram } = handle;
        self.commit(ctx, ram)
    }

    /// Reads the live object stored under `tag` into `dest`, verifying each
    /// block's checksum, and returns its length.
    pub fn read(
        &mut self,
        ctx: &Context<T::Digest>,
        tag: u8,
        dest: &mut [u8],
    ) -> Result<usize, Error> {
        let slot = *ctx.header(tag).ok_or(Error::TagOutOfRange)?;
        if slot.current.is_erased() {
            return Err(Error::ObjectNotFound);
        }
        if dest.len() < slot.size as usize {
            return Err(Error::BufferTooSmall);
        }
        self.read_chain(&slot, dest)
    }

    /// [`read`](LockFs::read) into a freshly allocated vector.
    pub fn read_to_vec(&mut self, ctx: &Context<T::Digest>, tag: u8) -> Result<Vec<u8>, Error> {
        let slot = ctx.header(tag).ok_or(Error::TagOutOfRange)?;
        if slot.current.is_erased() {
            return Err(Error::ObjectNotFound);
        }
        let mut buf = vec![0u8; slot.size as usize];
        let n = self.read(ctx, tag, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}
