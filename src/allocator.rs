//! First-fit heap allocator living inside VM memory.
//!
//! Every block starts with a tag word computed from the block's bookkeeping.
//! The tag is rewritten on every state change and checked against memory each
//! time a search walks past the block, so a guest that scribbles over a header
//! is caught at its next `malloc`.
//!
//! Freed blocks are never merged with their neighbours; a block is reused as
//! is by any later request that fits in it.

use std::fmt::{Display, Formatter};

use log::{debug, error, warn};

use crate::memory::{Memory, Word};
use crate::vm::VmError;

/// Mixed into every block tag.
pub const MAGIC: i64 = 0xBEAF;

/// Bookkeeping for one heap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<W: Word> {
    pub id: W,
    /// Address of the tag word; the caller's pointer is one word past it.
    pub start: W,
    /// Requested size plus the tag word.
    pub length: W,
    /// Capacity of the block, `length` rounded up to a word.
    pub real_length: W,
    pub in_use: bool,
    pub tag: W,
}

impl<W: Word> Entry<W> {
    /// The address handed out by `malloc`.
    pub fn pointer(&self) -> W {
        self.start.wrapping_add(W::size())
    }

    /// One past the last byte of the block's capacity.
    pub fn end(&self) -> W {
        self.start.wrapping_add(self.real_length)
    }

    /// Checksum over the entry's current state.
    pub fn compute_tag(&self) -> W {
        let magic = W::from_i64(MAGIC);
        let two = W::ONE.wrapping_add(W::ONE);
        let in_use = if self.in_use { W::ONE } else { W::ZERO };
        let spread = self
            .length
            .wrapping_mul(two)
            .trunc_rem(self.real_length)
            .unwrap_or(self.length);
        let mix = self
            .id
            .wrapping_add(W::ONE)
            .wrapping_mul(self.real_length ^ spread)
            .wrapping_add(self.length.wrapping_mul(in_use).wrapping_mul(two).wrapping_mul(self.id));
        let mix = mix.trunc_rem(self.start).unwrap_or(mix);
        self.start.wrapping_sub(magic) ^ mix
    }
}

impl<W: Word> Display for Entry<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} start={:#x} length={} real_length={} {} tag={:#x}",
            self.id,
            self.start.to_i64(),
            self.length,
            self.real_length,
            if self.in_use { "in-use" } else { "free" },
            self.tag.to_i64()
        )
    }
}

/// A block still allocated when the allocator shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakedBlock {
    pub id: i64,
    /// The pointer the guest received.
    pub address: i64,
    /// Bytes the guest asked for.
    pub size: i64,
}

impl Display for LeakedBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "block #{} at {:#x} ({} bytes)", self.id, self.address, self.size)
    }
}

/// Heap manager for the region starting at `start`.
#[derive(Debug, Clone)]
pub struct Allocator<W: Word> {
    start: W,
    entries: Vec<Entry<W>>,
    last_id: W,
}

impl<W: Word> Allocator<W> {
    pub fn new(start: W) -> Self {
        Allocator { start, entries: Vec::new(), last_id: W::ZERO }
    }

    /// First address managed by the allocator.
    pub fn start(&self) -> W {
        self.start
    }

    pub fn entries(&self) -> &[Entry<W>] {
        &self.entries
    }

    /// Blocks currently handed out.
    pub fn in_use(&self) -> usize {
        self.entries.iter().filter(|entry| entry.in_use).count()
    }

    /// Allocates `size` bytes and returns the address, or zero when the
    /// memory ceiling leaves no room. Fails only on a corrupted heap.
    pub fn malloc(&mut self, memory: &mut Memory<W>, size: W) -> Result<W, VmError> {
        if size < W::ZERO {
            warn!("malloc({}) with a negative size", size);
            return Ok(W::ZERO);
        }
        // Room for the tag word. Anything past the memory ceiling can never
        // be satisfied, and must not wrap into a small length.
        let length = match Self::block_length(memory, size) {
            Some(length) => length,
            None => {
                warn!(
                    "malloc({}) exceeds the {} byte memory ceiling",
                    size,
                    memory.max_size()
                );
                return Ok(W::ZERO);
            }
        };
        let index = match self.find_free(memory, length)? {
            Some(index) => index,
            None => match self.append(memory, length) {
                Some(index) => index,
                None => return Ok(W::ZERO),
            },
        };

        let entry = &mut self.entries[index];
        entry.length = length;
        entry.in_use = true;
        entry.tag = entry.compute_tag();
        let entry = *entry;

        memory.write_word(entry.start, entry.tag)?;
        debug!("malloc({}) = {:#x}", size, entry.pointer().to_i64());
        Ok(entry.pointer())
    }

    /// `size` plus the tag word, or `None` when the word-aligned block would
    /// not fit under the memory ceiling.
    fn block_length(memory: &Memory<W>, size: W) -> Option<W> {
        let word = W::SIZE as i64;
        let length = size.to_i64().checked_add(word)?;
        let aligned = length.checked_add(word - 1)? & !(word - 1);
        let max = i64::try_from(memory.max_size()).ok()?;
        if aligned > max || W::from_i64(aligned).to_i64() != aligned {
            return None;
        }
        Some(W::from_i64(length))
    }

    /// First-fit search over the blocks in address order. Every tag passed on
    /// the way is checked against memory.
    fn find_free(&mut self, memory: &Memory<W>, length: W) -> Result<Option<usize>, VmError> {
        let wanted = memory.align(length);
        self.entries.sort_by_key(|entry| entry.start);
        for (index, entry) in self.entries.iter().enumerate() {
            let found = memory.read_word(entry.start)?;
            if found != entry.tag {
                error!(
                    "heap corruption detected on entry {}: found {:#x} at {:#x}, expected {:#x}",
                    index,
                    found.to_i64(),
                    entry.start.to_i64(),
                    entry.tag.to_i64()
                );
                for entry in &self.entries {
                    error!("  {}", entry);
                }
                return Err(VmError::HeapCorruption {
                    index,
                    addr: entry.start.to_i64(),
                    found: found.to_i64(),
                    expected: entry.tag.to_i64(),
                });
            }
            if !entry.in_use && entry.real_length >= wanted {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Adds a block past the highest one, growing memory as needed.
    fn append(&mut self, memory: &mut Memory<W>, length: W) -> Option<usize> {
        let next_start = self.entries.last().map_or(self.start, Entry::end);
        let start = memory.align(next_start);
        let real_length = memory.align(length);
        let end = start.wrapping_add(real_length);
        let fits = end > start && end.to_addr().is_some_and(|end| memory.grow(end).is_ok());
        if !fits {
            warn!(
                "malloc: {} bytes at {:#x} would exceed the {} byte memory ceiling",
                length,
                start.to_i64(),
                memory.max_size()
            );
            return None;
        }
        self.last_id = self.last_id.wrapping_add(W::ONE);
        self.entries.push(Entry {
            id: self.last_id,
            start,
            length,
            real_length,
            in_use: true,
            tag: W::ZERO,
        });
        Some(self.entries.len() - 1)
    }

    /// Releases the block whose pointer is `addr`. Zero is ignored. An address
    /// that is not the pointer of an in-use block, a second free included, is
    /// rejected.
    pub fn free(&mut self, memory: &mut Memory<W>, addr: W) -> Result<(), VmError> {
        if addr.is_zero() {
            return Ok(());
        }
        let start = addr.wrapping_sub(W::size());
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.in_use && entry.start == start)
            .ok_or(VmError::InvalidFree { addr: addr.to_i64() })?;
        entry.in_use = false;
        entry.tag = entry.compute_tag();
        memory.write_word(entry.start, entry.tag)?;
        debug!("free({:#x})", addr.to_i64());
        Ok(())
    }

    /// Drops all bookkeeping. Blocks still in use are returned as leaks.
    pub fn shutdown(&mut self) -> Vec<LeakedBlock> {
        self.entries.retain(|entry| entry.in_use);
        let leaks: Vec<LeakedBlock> = self
            .entries
            .drain(..)
            .map(|entry| LeakedBlock {
                id: entry.id.to_i64(),
                address: entry.pointer().to_i64(),
                size: entry.length.to_i64() - W::SIZE as i64,
            })
            .collect();
        if !leaks.is_empty() {
            warn!("still {} allocated blocks at exit", leaks.len());
            for leak in &leaks {
                warn!("  leaked {}", leak);
            }
        }
        leaks
    }
}
