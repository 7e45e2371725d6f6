#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use lockfs::platform::{BlockLock, Checksum};

pub const BLOCK_SIZE: usize = 16;
// tag(1) | flags(1) | revision(1) | blockSize(2) | crc32(4)
pub const HEADER_SIZE: usize = 9;
pub const BLOCK_PAYLOAD: usize = BLOCK_SIZE - HEADER_SIZE;

/// Tags at or below this get permanent locks that survive `power_cycle`,
/// the rest get volatile ones.
pub const MAX_NONVOLATILE_TAG: u8 = 1;

pub const ERASED: u8 = 0xFF;
pub const ERASED_BIT: u8 = 0x80;
pub const CONTINUATION_BIT: u8 = 0x40;

pub fn block(i: usize) -> u32 {
    (i * BLOCK_SIZE) as u32
}

/// Raw header bytes for hand-crafting device images in tests.
pub fn header_bytes(tag: u8, flags: u8, revision: u8, block_size: u16, crc: u32) -> [u8; HEADER_SIZE] {
    let mut buf = [ERASED; HEADER_SIZE];
    buf[0] = tag;
    buf[1] = flags;
    buf[2] = revision;
    buf[3..5].copy_from_slice(&block_size.to_le_bytes());
    buf[5..9].copy_from_slice(&crc.to_le_bytes());
    buf
}

pub fn crc32(data: &[u8]) -> u32 {
    unsafe { libz_sys::crc32(0, data.as_ptr(), data.len() as u32) as u32 }
}

/// Whether block `i` is fully erased.
pub fn blank(flash: &Flash, i: usize) -> bool {
    flash.buf[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE]
        .iter()
        .all(|&b| b == ERASED)
}

/// Places a committed single-block chain with payload `[tag, revision]`
/// into the raw image.
pub fn put_chain(flash: &mut Flash, i: usize, tag: u8, revision: u8) {
    let payload = [tag, revision];
    let hdr = header_bytes(tag, 0x00, revision, 2, crc32(&payload));
    flash.buf[block(i) as usize..][..HEADER_SIZE].copy_from_slice(&hdr);
    flash.buf[block(i) as usize + HEADER_SIZE..][..2].copy_from_slice(&payload);
}

pub struct Flash {
    pub buf: Vec<u8>,
    pub volatile_locks: Vec<u32>,
    pub permanent_locks: Vec<u32>,
    pub frozen: bool,
    pub fail_after_operation: usize,
    pub fail_after_write: usize,
    pub operations: Vec<Operation>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
    Lock { addr: u32, tag: u8 },
    Freeze,
}

impl Flash {
    pub fn new(blocks: usize) -> Self {
        Self {
            buf: vec![ERASED; BLOCK_SIZE * blocks],
            volatile_locks: vec![],
            permanent_locks: vec![],
            frozen: false,
            fail_after_operation: usize::MAX,
            fail_after_write: usize::MAX,
            operations: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
        self.fail_after_write = usize::MAX;
    }

    /// Drops volatile locks and the freeze, like a reboot would. Permanent
    /// locks stay.
    pub fn power_cycle(&mut self) {
        self.volatile_locks.clear();
        self.frozen = false;
    }

    pub fn is_locked(&self, addr: u32) -> bool {
        self.volatile_locks.contains(&addr) || self.permanent_locks.contains(&addr)
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    fn faulted(&self) -> bool {
        self.operations.len() >= self.fail_after_operation
    }

    fn blocks_touched(offset: u32, len: usize) -> std::ops::RangeInclusive<usize> {
        let first = offset as usize / BLOCK_SIZE;
        let last = (offset as usize + len.max(1) - 1) / BLOCK_SIZE;
        first..=last
    }

    fn any_locked(&self, offset: u32, len: usize) -> bool {
        Self::blocks_touched(offset, len).any(|i| self.is_locked(block(i)))
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        println!(
            "    flash: read:  0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );
        if self.faulted() {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = 1;

    const ERASE_SIZE: usize = BLOCK_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as u32));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as u32));

        println!(
            "    flash: erase: {from:04X} - {to:04X} #{:>2}",
            self.operations.len()
        );
        if self.faulted() {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        if self.any_locked(from, (to - from) as usize) {
            println!("    flash: erase of locked block");
            return Err(FlashError);
        }
        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        for addr in from..to {
            self.buf[addr as usize] = ERASED;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        println!(
            "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
            bytes.len(),
            self.operations.len()
        );
        if self.faulted() || self.writes() >= self.fail_after_write {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        if self.any_locked(offset, bytes.len()) {
            println!("    flash: write to locked block");
            return Err(FlashError);
        }
        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // NOR flash can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl BlockLock for Flash {
    fn lock(&mut self, addr: u32, tag: u8) -> Result<(), Self::Error> {
        assert!(addr.is_multiple_of(BLOCK_SIZE as u32));
        assert!(!self.frozen, "lock after freeze");

        println!("    flash: lock:  0x{addr:04X} tag {tag}");
        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Lock { addr, tag });

        if tag <= MAX_NONVOLATILE_TAG {
            self.permanent_locks.push(addr);
        } else {
            self.volatile_locks.push(addr);
        }
        Ok(())
    }

    fn freeze(&mut self) -> Result<(), Self::Error> {
        println!("    flash: freeze");
        if self.faulted() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Freeze);
        self.frozen = true;
        Ok(())
    }
}

impl Checksum for Flash {
    type Digest = u32;

    fn compute_checksum(&mut self, addr: u32, len: u32) -> Result<u32, Self::Error> {
        let addr = addr as usize;
        Ok(crc32(&self.buf[addr..addr + len as usize]))
    }

    fn verify_checksum(&mut self, addr: u32, len: u32, expected: u32) -> Result<bool, Self::Error> {
        Ok(self.compute_checksum(addr, len)? == expected)
    }
}
