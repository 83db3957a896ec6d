//! Word-addressable memory for the C4 virtual machine.
//!
//! A single growable byte region backs every address the VM touches: code,
//! data, the stack and the allocator's heap. Words are read and written in
//! little-endian order using the configured `Word` width; a word address that
//! is not aligned is truncated down to the containing word.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{BitAnd, BitOr, BitXor};

use crate::vm::VmError;

// --- Constants ---

/// Hard ceiling on the size of VM memory (32 MiB).
pub const MAX_MEMORY: usize = 32 * 1024 * 1024;
/// Initial memory size when none is configured (256 KiB).
pub const DEFAULT_POOL_SIZE: usize = 256 * 1024;

// --- Word Width ---

/// Integer width of a VM instance, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W32,
    W64,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    pub fn from_bits(bits: u32) -> Option<Width> {
        match bits {
            32 => Some(Width::W32),
            64 => Some(Width::W64),
            _ => None,
        }
    }
}

impl Display for Width {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// The VM's integer unit. Registers, stack slots and heap metadata are all
/// stored as a `Word`; arithmetic wraps like C on a two's complement machine.
pub trait Word:
    Copy
    + Default
    + Debug
    + Display
    + Eq
    + Ord
    + Hash
    + Send
    + Sync
    + 'static
    + BitAnd<Output = Self>
    + BitOr<Output = Self>
    + BitXor<Output = Self>
{
    /// Size of a word in bytes.
    const SIZE: usize;
    const WIDTH: Width;
    const ZERO: Self;
    const ONE: Self;
    /// Result of a comparison that holds.
    const TRUE: Self;
    /// Result of a comparison that fails.
    const FALSE: Self;

    /// Truncates `value` to the word width.
    fn from_i64(value: i64) -> Self;
    /// Sign-extends the word to 64 bits.
    fn to_i64(self) -> i64;

    fn wrapping_add(self, rhs: Self) -> Self;
    fn wrapping_sub(self, rhs: Self) -> Self;
    fn wrapping_mul(self, rhs: Self) -> Self;
    /// Division truncating toward zero. `None` on a zero divisor.
    fn trunc_div(self, rhs: Self) -> Option<Self>;
    /// Remainder with the sign of the dividend. `None` on a zero divisor.
    fn trunc_rem(self, rhs: Self) -> Option<Self>;
    fn shift_left(self, rhs: Self) -> Self;
    /// Arithmetic (sign-propagating) right shift.
    fn shift_right(self, rhs: Self) -> Self;

    /// Decodes a little-endian word; `bytes` is exactly `SIZE` long.
    fn from_le_slice(bytes: &[u8]) -> Self;
    /// Encodes the word little-endian into `out`, exactly `SIZE` long.
    fn write_le(self, out: &mut [u8]);

    fn from_usize(value: usize) -> Self {
        Self::from_i64(value as i64)
    }

    /// The word as a memory address, if it is not negative.
    fn to_addr(self) -> Option<usize> {
        usize::try_from(self.to_i64()).ok()
    }

    /// The word size as a word, for pointer arithmetic.
    fn size() -> Self {
        Self::from_usize(Self::SIZE)
    }

    fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    fn truth(cond: bool) -> Self {
        if cond { Self::TRUE } else { Self::FALSE }
    }
}

macro_rules! impl_word {
    ($ty:ty, $width:expr) => {
        impl Word for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            const WIDTH: Width = $width;
            const ZERO: Self = 0;
            const ONE: Self = 1;
            const TRUE: Self = 1;
            const FALSE: Self = 0;

            #[inline]
            fn from_i64(value: i64) -> Self {
                value as $ty
            }

            #[inline]
            fn to_i64(self) -> i64 {
                self as i64
            }

            #[inline]
            fn wrapping_add(self, rhs: Self) -> Self {
                <$ty>::wrapping_add(self, rhs)
            }

            #[inline]
            fn wrapping_sub(self, rhs: Self) -> Self {
                <$ty>::wrapping_sub(self, rhs)
            }

            #[inline]
            fn wrapping_mul(self, rhs: Self) -> Self {
                <$ty>::wrapping_mul(self, rhs)
            }

            #[inline]
            fn trunc_div(self, rhs: Self) -> Option<Self> {
                // Rust's `/` already truncates toward zero; only MIN / -1 needs wrapping.
                if rhs == 0 { None } else { Some(<$ty>::wrapping_div(self, rhs)) }
            }

            #[inline]
            fn trunc_rem(self, rhs: Self) -> Option<Self> {
                if rhs == 0 { None } else { Some(<$ty>::wrapping_rem(self, rhs)) }
            }

            #[inline]
            fn shift_left(self, rhs: Self) -> Self {
                <$ty>::wrapping_shl(self, rhs as u32)
            }

            #[inline]
            fn shift_right(self, rhs: Self) -> Self {
                <$ty>::wrapping_shr(self, rhs as u32)
            }

            #[inline]
            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_word!(i32, Width::W32);
impl_word!(i64, Width::W64);

// --- Memory ---

/// Byte storage viewed as `W`-sized words. The 32-bit and 64-bit variants
/// share this contract so nothing above it depends on the width.
#[derive(Debug, Clone, PartialEq)]
pub struct Memory<W: Word> {
    bytes: Vec<u8>,
    max: usize,
    _word: PhantomData<W>,
}

pub type Memory32 = Memory<i32>;
pub type Memory64 = Memory<i64>;

impl<W: Word> Memory<W> {
    /// Creates a zeroed region of `size` bytes that may later grow up to `max`
    /// (itself capped at `MAX_MEMORY`).
    pub fn new(size: usize, max: usize) -> Result<Self, VmError> {
        let max = max.min(MAX_MEMORY);
        if size > max {
            return Err(VmError::MemoryCeiling { requested: size, max });
        }
        Ok(Memory { bytes: vec![0; size], max, _word: PhantomData })
    }

    /// Currently committed size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Largest size `grow` will accept.
    pub fn max_size(&self) -> usize {
        self.max
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Rounds `value` up to the next word boundary.
    pub fn align(&self, value: W) -> W {
        let mask = W::from_usize(W::SIZE - 1);
        value.wrapping_add(W::ZERO.wrapping_sub(value) & mask)
    }

    /// Makes at least `new_size` bytes addressable. Never shrinks.
    pub fn grow(&mut self, new_size: usize) -> Result<(), VmError> {
        if new_size > self.max {
            return Err(VmError::MemoryCeiling { requested: new_size, max: self.max });
        }
        if new_size > self.bytes.len() {
            log::debug!("memory growing from {:#x} to {:#x}", self.bytes.len(), new_size);
            self.bytes.resize(new_size, 0);
        }
        Ok(())
    }

    #[inline]
    fn word_range(&self, addr: W) -> Result<std::ops::Range<usize>, VmError> {
        let start = addr
            .to_addr()
            .map(|a| a / W::SIZE * W::SIZE)
            .filter(|a| a + W::SIZE <= self.bytes.len())
            .ok_or(VmError::OutOfBounds { addr: addr.to_i64(), len: self.bytes.len() })?;
        Ok(start..start + W::SIZE)
    }

    #[inline]
    fn byte_index(&self, addr: W) -> Result<usize, VmError> {
        addr.to_addr()
            .filter(|&a| a < self.bytes.len())
            .ok_or(VmError::OutOfBounds { addr: addr.to_i64(), len: self.bytes.len() })
    }

    /// Reads the word containing `addr`.
    #[inline]
    pub fn read_word(&self, addr: W) -> Result<W, VmError> {
        let range = self.word_range(addr)?;
        Ok(W::from_le_slice(&self.bytes[range]))
    }

    /// Writes the word containing `addr`.
    #[inline]
    pub fn write_word(&mut self, addr: W, value: W) -> Result<(), VmError> {
        let range = self.word_range(addr)?;
        value.write_le(&mut self.bytes[range]);
        Ok(())
    }

    #[inline]
    pub fn read_byte(&self, addr: W) -> Result<u8, VmError> {
        let index = self.byte_index(addr)?;
        Ok(self.bytes[index])
    }

    #[inline]
    pub fn write_byte(&mut self, addr: W, value: u8) -> Result<(), VmError> {
        let index = self.byte_index(addr)?;
        self.bytes[index] = value;
        Ok(())
    }

    #[inline]
    fn byte_range(&self, addr: W, len: usize) -> Result<std::ops::Range<usize>, VmError> {
        addr.to_addr()
            .and_then(|start| start.checked_add(len).map(|end| start..end))
            .filter(|range| range.end <= self.bytes.len())
            .ok_or(VmError::OutOfBounds { addr: addr.to_i64(), len: self.bytes.len() })
    }

    /// Borrows `len` bytes starting at `addr`.
    pub fn slice(&self, addr: W, len: usize) -> Result<&[u8], VmError> {
        let range = self.byte_range(addr, len)?;
        Ok(&self.bytes[range])
    }

    /// Stores `data` starting at byte address `addr`.
    pub fn write_bytes(&mut self, addr: W, data: &[u8]) -> Result<(), VmError> {
        let range = self.byte_range(addr, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Sets `len` bytes starting at `addr` to `value`.
    pub fn fill(&mut self, addr: W, value: u8, len: usize) -> Result<(), VmError> {
        let range = self.byte_range(addr, len)?;
        self.bytes[range].fill(value);
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dest`; the ranges may overlap.
    pub fn copy(&mut self, dest: W, src: W, len: usize) -> Result<(), VmError> {
        let from = self.byte_range(src, len)?;
        let to = self.byte_range(dest, len)?;
        self.bytes.copy_within(from, to.start);
        Ok(())
    }

    /// Reads a NUL-terminated string at `addr`. A string running off the end
    /// of memory is cut there.
    pub fn read_string(&self, addr: W) -> Result<Vec<u8>, VmError> {
        let start = self.byte_index(addr)?;
        let tail = &self.bytes[start..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(tail[..end].to_vec())
    }
}
