//! Program images and the loader that stages them into a VM.
//!
//! Image layout (little-endian):
//! - 4 bytes: magic `C4VM`
//! - 1 byte: word width in bits (32 or 64)
//! - u32: entry point, as a code word index
//! - u32 word count, then that many i64 code words
//! - u32 byte count, then the data segment
//! - u32 patch count, then per patch: u8 kind (0 code, 1 data), u32 code word
//!   index, i64 value
//!
//! Loading places code at address 0 and data straight after it, fixes up the
//! patched address operands, stores `argv` after the data and builds the
//! initial stack so that returning from the entry function runs `PSH; EXIT`.

use std::io::{self, Read, Write};

use log::debug;

use crate::memory::{Width, Word, MAX_MEMORY};
use crate::vm::{Vm, VmError};

const MAGIC: &[u8; 4] = b"C4VM";

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("not a c4vm image (magic {0:?})")]
    BadMagic([u8; 4]),

    #[error("unsupported word width {0}")]
    UnsupportedWidth(u8),

    #[error("image is {image} but the vm is {vm}")]
    WidthMismatch { image: Width, vm: Width },

    #[error("opcode table has no {0} instruction")]
    MissingOpcode(&'static str),

    #[error("entry point {entry} is outside the code ({len} words)")]
    BadEntry { entry: usize, len: usize },

    #[error("patch of word {index} is outside the code ({len} words)")]
    BadPatch { index: usize, len: usize },

    #[error("program needs {needed:#x} bytes below the stack but only {available:#x} are reserved")]
    TooLarge { needed: usize, available: usize },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Vm(#[from] VmError),
}

/// What a patched word points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// `value` is a code word index.
    Code,
    /// `value` is a byte offset into the data segment.
    Data,
}

/// A code word whose final value depends on where the image is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub kind: PatchKind,
    /// Index of the code word to overwrite.
    pub index: usize,
    pub value: i64,
}

/// A compiled program: code words, the data segment and address fixups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: Width,
    /// Code word index of the entry function.
    pub entry: usize,
    pub code: Vec<i64>,
    pub data: Vec<u8>,
    pub patches: Vec<Patch>,
}

impl Image {
    pub fn new(width: Width, code: Vec<i64>) -> Self {
        Image { width, entry: 0, code, data: Vec::new(), patches: Vec::new() }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ImageError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ImageError::BadMagic(magic));
        }
        let bits = read_u8(reader)?;
        let width = Width::from_bits(bits as u32).ok_or(ImageError::UnsupportedWidth(bits))?;
        let entry = read_u32(reader)? as usize;

        let count = read_len(reader, 8)?;
        let mut code = Vec::with_capacity(count);
        for _ in 0..count {
            code.push(read_i64(reader)?);
        }

        let len = read_len(reader, 1)?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        let count = read_len(reader, 13)?;
        let mut patches = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = match read_u8(reader)? {
                0 => PatchKind::Code,
                1 => PatchKind::Data,
                other => {
                    return Err(ImageError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown patch kind {}", other),
                    )))
                }
            };
            let index = read_u32(reader)? as usize;
            let value = read_i64(reader)?;
            patches.push(Patch { kind, index, value });
        }

        debug!(
            "read {} image: {} code words, {} data bytes, {} patches",
            width,
            code.len(),
            data.len(),
            patches.len()
        );
        Ok(Image { width, entry, code, data, patches })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ImageError> {
        writer.write_all(MAGIC)?;
        writer.write_all(&[self.width.bits() as u8])?;
        write_u32(writer, self.entry)?;

        write_u32(writer, self.code.len())?;
        for word in &self.code {
            writer.write_all(&word.to_le_bytes())?;
        }

        write_u32(writer, self.data.len())?;
        writer.write_all(&self.data)?;

        write_u32(writer, self.patches.len())?;
        for patch in &self.patches {
            let kind: u8 = match patch.kind {
                PatchKind::Code => 0,
                PatchKind::Data => 1,
            };
            writer.write_all(&[kind])?;
            write_u32(writer, patch.index)?;
            writer.write_all(&patch.value.to_le_bytes())?;
        }
        Ok(())
    }
}

// --- Codec helpers ---

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    reader.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    reader.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_i64<R: Read>(reader: &mut R) -> io::Result<i64> {
    let mut b = [0u8; 8];
    reader.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

/// Reads a count of `item_size`-byte items, refusing anything that could not
/// fit in VM memory.
fn read_len<R: Read>(reader: &mut R, item_size: usize) -> Result<usize, ImageError> {
    let count = read_u32(reader)? as usize;
    let needed = count.saturating_mul(item_size);
    if needed > MAX_MEMORY {
        return Err(ImageError::TooLarge { needed, available: MAX_MEMORY });
    }
    Ok(count)
}

fn write_u32<W: Write>(writer: &mut W, value: usize) -> Result<(), ImageError> {
    let value = u32::try_from(value).map_err(|_| ImageError::TooLarge {
        needed: value,
        available: u32::MAX as usize,
    })?;
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

// --- Loading ---

fn align(value: usize, word: usize) -> usize {
    value.div_ceil(word) * word
}

/// Stages `image` into `vm` and prepares registers to run its entry function
/// as `main(argc, argv)`. `args[0]` is conventionally the program name.
pub fn load<W: Word>(vm: &mut Vm<W>, image: &Image, args: &[String]) -> Result<(), ImageError> {
    if image.width != W::WIDTH {
        return Err(ImageError::WidthMismatch { image: image.width, vm: W::WIDTH });
    }
    if image.entry >= image.code.len() {
        return Err(ImageError::BadEntry { entry: image.entry, len: image.code.len() });
    }
    let exit = vm.table().code_of("EXIT").ok_or(ImageError::MissingOpcode("EXIT"))?;
    let psh = vm.table().code_of("PSH").ok_or(ImageError::MissingOpcode("PSH"))?;

    let word = W::SIZE;
    let data_addr = image.code.len() * word;
    let argv_addr = align(data_addr + image.data.len() + word, word);
    let strings_addr = argv_addr + args.len() * word;
    let end = strings_addr + args.iter().map(|arg| arg.len() + 1).sum::<usize>();

    // The stack grows down from the heap start, so everything static must fit
    // below it along with the five words pushed here.
    let stack_top = vm.heap_start().to_addr().unwrap_or(0);
    let needed = align(end, word) + 5 * word;
    if needed > stack_top {
        return Err(ImageError::TooLarge { needed, available: stack_top });
    }

    vm.load_words(W::ZERO, &image.code)?;
    vm.load_bytes(W::from_usize(data_addr), &image.data)?;

    for patch in &image.patches {
        if patch.index >= image.code.len() {
            return Err(ImageError::BadPatch { index: patch.index, len: image.code.len() });
        }
        let value = match patch.kind {
            PatchKind::Code => patch.value.wrapping_mul(word as i64),
            PatchKind::Data => (data_addr as i64).wrapping_add(patch.value),
        };
        vm.patch(W::from_usize(patch.index * word), W::from_i64(value))?;
    }

    // argv: a pointer array followed by the strings it points at.
    let mut ptr = argv_addr;
    let mut string = strings_addr;
    for arg in args {
        vm.patch(W::from_usize(ptr), W::from_usize(string))?;
        vm.load_bytes(W::from_usize(string), arg.as_bytes())?;
        vm.load_bytes(W::from_usize(string + arg.len()), &[0])?;
        ptr += word;
        string += arg.len() + 1;
    }

    vm.pc = W::from_usize(image.entry * word);
    vm.sp = vm.heap_start();
    vm.bp = vm.sp;
    vm.push(W::from_i64(exit))?;
    vm.push(W::from_i64(psh))?;
    let t = vm.sp;
    vm.push(W::from_usize(args.len()))?;
    vm.push(W::from_usize(argv_addr))?;
    vm.push(t)?;

    debug!(
        "loaded {} code words, {} data bytes at {:#x}, {} args at {:#x}; pc = {:#x}, sp = {:#x}",
        image.code.len(),
        image.data.len(),
        data_addr,
        args.len(),
        argv_addr,
        vm.pc.to_i64(),
        vm.sp.to_i64()
    );
    Ok(())
}
