//! Mount passes and the write engine.

use crate::error::Error;
use crate::platform::Storage;
use crate::raw::{ERASED_BYTE, FLAGS_CONTINUATION, FLAGS_START, Header};
use crate::wire::WireInt;
use crate::{Context, LockFs, RamHeader};

#[cfg(feature = "defmt")]
use defmt::{trace, warn};

impl<T: Storage> LockFs<T> {
    fn block_count(&self) -> u32 {
        self.size / self.block_size()
    }

    fn next_block(&self, addr: u32) -> u32 {
        (addr + self.block_size()) % self.size
    }

    fn prev_block(&self, addr: u32) -> u32 {
        if addr == 0 {
            self.size - self.block_size()
        } else {
            addr - self.block_size()
        }
    }

    fn read_header(&mut self, addr: u32) -> Result<Header<T::Digest>, Error> {
        Header::read(&mut self.flash, addr)
    }

    fn erase_block(&mut self, addr: u32) -> Result<(), Error> {
        self.flash
            .erase(addr, addr + self.block_size())
            .map_err(|_| Error::FlashError)
    }

    /// Whether a non-erased header belongs to the live chain of its tag.
    fn belongs_to_live_chain(&self, ctx: &Context<T::Digest>, hdr: &Header<T::Digest>) -> bool {
        let Some(slot) = ctx.headers.get(hdr.tag as usize) else {
            return false;
        };
        !slot.current.is_erased() && hdr.revision == slot.current.revision
    }

    /// First pass of `mount`: adopt the newest start block per tag.
    pub(crate) fn scan_pass(&mut self, ctx: &mut Context<T::Digest>) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("scan: {} blocks", self.block_count());

        for i in 0..self.block_count() {
            let addr = i * self.block_size();
            let hdr = self.read_header(addr)?;
            if hdr.is_erased() || hdr.is_continuation() {
                continue;
            }
            // Continuation sizes are summed by the lock pass, once every
            // adoption is final; a chain that wraps around the device end
            // would otherwise be undercounted.
            let Some(slot) = ctx.headers.get_mut(hdr.tag as usize) else {
                continue;
            };
            if slot.current.is_erased() || hdr.newer_than(&slot.current) {
                *slot = RamHeader {
                    current: hdr,
                    start_block: addr,
                    current_block: addr,
                    size: hdr.block_size as u32,
                };
            }
        }
        Ok(())
    }

    /// Second pass of `mount`: erase superseded revisions and the leftovers
    /// of writes that never committed, then pick the free-block hint as the
    /// start of the last erased run.
    pub(crate) fn reclaim_pass(&mut self, ctx: &mut Context<T::Digest>) -> Result<(), Error> {
        let mut run_start = None;
        for i in 0..self.block_count() {
            let addr = i * self.block_size();
            let hdr = self.read_header(addr)?;
            let free = if hdr.is_erased() {
                if !hdr.is_blank() {
                    // Reserved by an interrupted write; its half-programmed
                    // header would collide with a later reservation.
                    #[cfg(feature = "defmt")]
                    warn!("reclaim: in-flight leftover @{:#08x}", addr);
                    self.erase_block(addr)?;
                }
                true
            } else if self.belongs_to_live_chain(ctx, &hdr) {
                false
            } else {
                // Superseded revision, or a tag this context does not admit.
                #[cfg(feature = "defmt")]
                warn!("reclaim: superseded block @{:#08x}", addr);
                self.erase_block(addr)?;
                true
            };
            if free {
                if run_start.is_none() {
                    run_start = Some(addr);
                }
            } else if let Some(start) = run_start.take() {
                // A run just ended; the last complete run wins, its start
                // lies at the highest address and keeps writes cycling.
                ctx.next_free_block = Some(start);
            }
        }
        if let Some(start) = run_start {
            ctx.next_free_block = Some(start);
        }
        Ok(())
    }

    /// Third pass of `mount`: lock every block matching a live chain, in
    /// physical order so stray matching blocks are locked too, and sum the
    /// continuation payloads into the per-tag sizes.
    pub(crate) fn lock_pass(&mut self, ctx: &mut Context<T::Digest>) -> Result<(), Error> {
        for i in 0..self.block_count() {
            let addr = i * self.block_size();
            let hdr = self.read_header(addr)?;
            if hdr.is_erased() || !self.belongs_to_live_chain(ctx, &hdr) {
                continue;
            }
            #[cfg(feature = "defmt")]
            trace!("lock: @{:#08x} tag {}", addr, hdr.tag);
            self.flash
                .lock(addr, hdr.tag)
                .map_err(|_| Error::FlashError)?;
            if hdr.is_continuation() {
                ctx.headers[hdr.tag as usize].size += hdr.block_size as u32;
            }
        }
        Ok(())
    }

    /// Reserves a chain for `len` payload bytes: programs the in-flight
    /// header (tag and revision only, the rest left erased) into enough
    /// erased blocks, starting at the first erased block at or after the
    /// free hint and skipping over live blocks. At least one block is
    /// always reserved so a zero-length write still gets its start block.
    pub(crate) fn reserve_chain(
        &mut self,
        ctx: &Context<T::Digest>,
        tag: u8,
        len: u32,
    ) -> Result<RamHeader<T::Digest>, Error> {
        let hint = ctx.next_free_block.ok_or(Error::FlashFull)?;
        let slot = &ctx.headers[tag as usize];
        let revision = if slot.current.is_erased() {
            0
        } else {
            slot.current.revision.wrapping_add(1)
        };
        let current = Header {
            tag,
            flags: ERASED_BYTE,
            revision,
            block_size: u16::filled(ERASED_BYTE),
            checksum: T::Digest::filled(ERASED_BYTE),
        };

        #[cfg(feature = "defmt")]
        trace!("reserve: tag {} rev {} len {} hint @{:#08x}", tag, revision, len, hint);

        // The chain starts at the first erased block at or after the hint
        // (the hint itself can be stale by one failed in-cycle write).
        let payload = self.block_payload();
        let mut remaining = len;
        let mut start = hint;
        let mut reserved_any = false;
        let mut cursor = hint;
        loop {
            let hdr = self.read_header(cursor)?;
            if hdr.is_erased() {
                if !hdr.is_blank() {
                    // Leftover of a failed write this power cycle; erase it
                    // so the reservation programs onto clean bytes.
                    self.erase_block(cursor)?;
                }
                current.write(&mut self.flash, cursor)?;
                if !reserved_any {
                    start = cursor;
                    reserved_any = true;
                }
                remaining = remaining.saturating_sub(payload);
                if remaining == 0 {
                    break;
                }
            }
            cursor = self.next_block(cursor);
            if cursor == hint {
                return Err(Error::FlashFull);
            }
        }

        Ok(RamHeader {
            current: Header {
                block_size: 0,
                ..current
            },
            start_block: start,
            current_block: start,
            size: len,
        })
    }

    /// Streams payload into the reserved chain, sealing each block filled
    /// to capacity with its checksum. The final, possibly partial block is
    /// sealed by `commit`.
    pub(crate) fn stream(
        &mut self,
        ram: &mut RamHeader<T::Digest>,
        mut data: &[u8],
    ) -> Result<(), Error> {
        let payload = self.block_payload();
        let header_size = self.header_size();
        while !data.is_empty() {
            let filled = ram.current.block_size as u32;
            if filled < payload {
                let to_write = data.len().min((payload - filled) as usize);
                self.flash
                    .write(ram.current_block + header_size + filled, &data[..to_write])
                    .map_err(|_| Error::FlashError)?;
                ram.current.block_size += to_write as u16;
                data = &data[to_write..];
            } else {
                // Block full: program its checksum and size. The flags byte
                // is still all-ones, so the block stays in-flight.
                ram.current.checksum = self
                    .flash
                    .compute_checksum(ram.current_block + header_size, payload)
                    .map_err(|_| Error::FlashError)?;
                #[cfg(feature = "defmt")]
                trace!("seal: @{:#08x} len {}", ram.current_block, payload);
                ram.current.write(&mut self.flash, ram.current_block)?;
                ram.current.block_size = 0;
                ram.current.checksum = T::Digest::filled(ERASED_BYTE);
                ram.current_block = self.advance_to_reserved(ram)?;
            }
        }
        Ok(())
    }

    // Next block of the chain: the closest following block still carrying
    // the in-flight header of this tag and revision. Blank blocks read an
    // all-ones revision, which a revision-255 chain would collide with,
    // hence the tag check as well.
    fn advance_to_reserved(&mut self, ram: &RamHeader<T::Digest>) -> Result<u32, Error> {
        let mut cursor = self.next_block(ram.current_block);
        while cursor != ram.start_block {
            let hdr = self.read_header(cursor)?;
            if hdr.is_erased() && hdr.tag == ram.current.tag && hdr.revision == ram.current.revision
            {
                return Ok(cursor);
            }
            cursor = self.next_block(cursor);
        }
        Err(Error::FlashFull)
    }

    /// Commits the chain and publishes the new revision into the context.
    pub(crate) fn commit(
        &mut self,
        ctx: &mut Context<T::Digest>,
        mut ram: RamHeader<T::Digest>,
    ) -> Result<(), Error> {
        let header_size = self.header_size();
        let tag = ram.current.tag;
        let revision = ram.current.revision;

        // Checksum of the final, partially filled block.
        ram.current.checksum = self
            .flash
            .compute_checksum(
                ram.current_block + header_size,
                ram.current.block_size as u32,
            )
            .map_err(|_| Error::FlashError)?;

        #[cfg(feature = "defmt")]
        trace!("commit: tag {} rev {} start @{:#08x}", tag, revision, ram.start_block);

        // Clear the erased bit on every chain block, walking backwards so
        // the start block - the marker that makes the chain live - is last.
        let mut cursor = self.prev_block(ram.start_block);
        while cursor != ram.start_block {
            let hdr = self.read_header(cursor)?;
            if hdr.is_erased() && hdr.tag == tag && hdr.revision == revision {
                let mut sealed = if cursor == ram.current_block {
                    ram.current
                } else {
                    hdr
                };
                sealed.flags = FLAGS_CONTINUATION;
                sealed.write(&mut self.flash, cursor)?;
            }
            cursor = self.prev_block(cursor);
        }

        let hdr = self.read_header(ram.start_block)?;
        if !(hdr.is_erased() && hdr.tag == tag && hdr.revision == revision) {
            return Err(Error::CorruptedData);
        }
        let mut sealed = if ram.start_block == ram.current_block {
            ram.current
        } else {
            hdr
        };
        sealed.flags = FLAGS_START;
        sealed.write(&mut self.flash, ram.start_block)?;

        ctx.headers[tag as usize] = RamHeader {
            current: sealed,
            start_block: ram.start_block,
            current_block: ram.start_block,
            size: ram.size,
        };

        // Advance the hint past the chain so consecutive writes cycle
        // through the device instead of reusing the lowest run.
        ctx.next_free_block = self.find_erased_after(ram.current_block)?;
        Ok(())
    }

    fn find_erased_after(&mut self, addr: u32) -> Result<Option<u32>, Error> {
        let origin = self.next_block(addr);
        let mut cursor = origin;
        loop {
            if self.read_header(cursor)?.is_erased() {
                return Ok(Some(cursor));
            }
            cursor = self.next_block(cursor);
            if cursor == origin {
                return Ok(None);
            }
        }
    }

    /// Walks the live chain in physical order from its start block,
    /// verifying each block's checksum and concatenating payloads until the
    /// recorded size is reached.
    pub(crate) fn read_chain(
        &mut self,
        slot: &RamHeader<T::Digest>,
        dest: &mut [u8],
    ) -> Result<usize, Error> {
        let header_size = self.header_size();
        let tag = slot.current.tag;
        let revision = slot.current.revision;
        let total = slot.size as usize;
        let mut filled = 0usize;
        let mut cursor = slot.start_block;
        loop {
            let hdr = self.read_header(cursor)?;
            if !hdr.is_erased() && hdr.tag == tag && hdr.revision == revision {
                let len = hdr.block_size as usize;
                if len > total - filled {
                    return Err(Error::CorruptedData);
                }
                let ok = self
                    .flash
                    .verify_checksum(cursor + header_size, len as u32, hdr.checksum)
                    .map_err(|_| Error::FlashError)?;
                if !ok {
                    return Err(Error::CorruptedData);
                }
                self.flash
                    .read(cursor + header_size, &mut dest[filled..filled + len])
                    .map_err(|_| Error::FlashError)?;
                filled += len;
                if filled == total {
                    return Ok(filled);
                }
            }
            cursor = self.next_block(cursor);
            if cursor == slot.start_block {
                // Ran out of chain blocks before the recorded size.
                return Err(Error::CorruptedData);
            }
        }
    }
}
