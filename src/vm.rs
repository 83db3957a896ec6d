// src/vm.rs

//! The C4 virtual machine: registers, the fetch-decode-execute loop and the
//! instruction handlers.
//!
//! All instruction semantics live in one place, `Vm::execute`. The two
//! dispatch strategies are built from it:
//! - `Dispatch::Table` looks the code up in a table of handler function
//!   pointers, one per configured code, each a monomorphised `execute` for a
//!   single opcode;
//! - `Dispatch::Specialized` decodes the opcode and runs the inlined `match`
//!   directly.

use std::io::{self, Write};

use log::{debug, error, info, warn};

use crate::allocator::{Allocator, LeakedBlock};
use crate::host::Host;
use crate::memory::{Memory, Word, DEFAULT_POOL_SIZE, MAX_MEMORY};
use crate::opcode::{Opcode, OpcodeTable};

// --- Configuration ---

/// How the run loop gets from an instruction code to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// One indirect call per instruction through a code-indexed table.
    Table,
    /// Every handler inlined into one `match`.
    #[default]
    Specialized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Initial memory size in bytes. The stack starts here and grows down;
    /// the heap starts here and grows up.
    pub pool_size: usize,
    /// Memory never grows past this; clamped to `MAX_MEMORY`.
    pub max_memory: usize,
    pub dispatch: Dispatch,
    /// Log every instruction before it executes.
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            pool_size: DEFAULT_POOL_SIZE,
            max_memory: MAX_MEMORY,
            dispatch: Dispatch::default(),
            trace: false,
        }
    }
}

// --- Errors ---

/// Faults that stop the VM.
#[derive(thiserror::Error, Debug)]
pub enum VmError {
    #[error("unknown instruction {code} at pc {pc:#x}")]
    UnknownOpcode { code: i64, pc: i64 },

    #[error("memory access out of bounds at address {addr:#x} (memory size {len:#x})")]
    OutOfBounds { addr: i64, len: usize },

    #[error("memory size {requested:#x} exceeds the {max:#x} byte ceiling")]
    MemoryCeiling { requested: usize, max: usize },

    #[error("division by zero at pc {pc:#x}")]
    DivisionByZero { pc: i64 },

    #[error("heap corruption detected on entry {index}: found {found:#x} at {addr:#x}, expected {expected:#x}")]
    HeapCorruption { index: usize, addr: i64, found: i64, expected: i64 },

    #[error("invalid free: {addr:#x}")]
    InvalidFree { addr: i64 },

    #[error("readback after write failed at {addr:#x}: read {found}, expected {expected}")]
    ReadbackMismatch { addr: i64, found: i64, expected: i64 },

    #[error("failed to write program output: {0}")]
    Io(#[from] io::Error),
}

// --- Dispatch Table ---

/// An entry in the dispatch table.
pub type Handler<W> = fn(&mut Vm<W>, &mut Host<'_>) -> Result<(), VmError>;

/// `execute` specialised to a single opcode.
fn handler<W: Word, const OP: u8>(vm: &mut Vm<W>, host: &mut Host<'_>) -> Result<(), VmError> {
    vm.execute(Opcode::try_from(OP).unwrap_or(Opcode::Unknown), host)
}

fn handler_for<W: Word>(opcode: Opcode) -> Handler<W> {
    match opcode {
        Opcode::Lea => handler::<W, { Opcode::Lea as u8 }>,
        Opcode::Imm => handler::<W, { Opcode::Imm as u8 }>,
        Opcode::Jmp => handler::<W, { Opcode::Jmp as u8 }>,
        Opcode::Jsr => handler::<W, { Opcode::Jsr as u8 }>,
        Opcode::Jsri => handler::<W, { Opcode::Jsri as u8 }>,
        Opcode::Jsrs => handler::<W, { Opcode::Jsrs as u8 }>,
        Opcode::Bz => handler::<W, { Opcode::Bz as u8 }>,
        Opcode::Bnz => handler::<W, { Opcode::Bnz as u8 }>,
        Opcode::Ent => handler::<W, { Opcode::Ent as u8 }>,
        Opcode::Adj => handler::<W, { Opcode::Adj as u8 }>,
        Opcode::Lev => handler::<W, { Opcode::Lev as u8 }>,
        Opcode::Li => handler::<W, { Opcode::Li as u8 }>,
        Opcode::Lc => handler::<W, { Opcode::Lc as u8 }>,
        Opcode::Si => handler::<W, { Opcode::Si as u8 }>,
        Opcode::Sc => handler::<W, { Opcode::Sc as u8 }>,
        Opcode::Psh => handler::<W, { Opcode::Psh as u8 }>,
        Opcode::Or => handler::<W, { Opcode::Or as u8 }>,
        Opcode::Xor => handler::<W, { Opcode::Xor as u8 }>,
        Opcode::And => handler::<W, { Opcode::And as u8 }>,
        Opcode::Eq => handler::<W, { Opcode::Eq as u8 }>,
        Opcode::Ne => handler::<W, { Opcode::Ne as u8 }>,
        Opcode::Lt => handler::<W, { Opcode::Lt as u8 }>,
        Opcode::Gt => handler::<W, { Opcode::Gt as u8 }>,
        Opcode::Le => handler::<W, { Opcode::Le as u8 }>,
        Opcode::Ge => handler::<W, { Opcode::Ge as u8 }>,
        Opcode::Shl => handler::<W, { Opcode::Shl as u8 }>,
        Opcode::Shr => handler::<W, { Opcode::Shr as u8 }>,
        Opcode::Add => handler::<W, { Opcode::Add as u8 }>,
        Opcode::Sub => handler::<W, { Opcode::Sub as u8 }>,
        Opcode::Mul => handler::<W, { Opcode::Mul as u8 }>,
        Opcode::Div => handler::<W, { Opcode::Div as u8 }>,
        Opcode::Mod => handler::<W, { Opcode::Mod as u8 }>,
        Opcode::Open => handler::<W, { Opcode::Open as u8 }>,
        Opcode::Read => handler::<W, { Opcode::Read as u8 }>,
        Opcode::Clos => handler::<W, { Opcode::Clos as u8 }>,
        Opcode::Prtf => handler::<W, { Opcode::Prtf as u8 }>,
        Opcode::Malc => handler::<W, { Opcode::Malc as u8 }>,
        Opcode::Free => handler::<W, { Opcode::Free as u8 }>,
        Opcode::Mset => handler::<W, { Opcode::Mset as u8 }>,
        Opcode::Mcmp => handler::<W, { Opcode::Mcmp as u8 }>,
        Opcode::Mcpy => handler::<W, { Opcode::Mcpy as u8 }>,
        Opcode::Exit => handler::<W, { Opcode::Exit as u8 }>,
        Opcode::Unknown => handler::<W, { Opcode::Unknown as u8 }>,
    }
}

// --- Virtual Machine ---

/// A C4 virtual machine over `W`-sized words.
pub struct Vm<W: Word> {
    // Registers
    pub pc: W, // Program counter: byte address of the next instruction word.
    pub a: W,  // Accumulator.
    pub bp: W, // Base of the current frame.
    pub sp: W, // Top of the stack; grows toward lower addresses.

    // Run state
    exit_code: W,
    running: bool,
    cycles: u64,
    fault_pc: W,     // Address of the instruction being executed.
    fault_code: i64, // Its raw code.

    memory: Memory<W>,
    allocator: Allocator<W>,
    table: OpcodeTable,
    handlers: Vec<Handler<W>>,
    config: VmConfig,
    leaks: Vec<LeakedBlock>,
}

impl<W: Word> Vm<W> {
    /// Creates a VM with `config.pool_size` bytes of zeroed memory. The
    /// opcode table fixes the numeric code of every instruction.
    pub fn new(table: OpcodeTable, config: VmConfig) -> Result<Self, VmError> {
        let memory = Memory::new(config.pool_size, config.max_memory)?;
        let heap_start = W::from_usize(config.pool_size / W::SIZE * W::SIZE);
        let handlers = (0..table.len())
            .map(|code| handler_for::<W>(table.lookup(code as i64)))
            .collect();
        debug!(
            "new {} vm: {} bytes of memory, heap at {:#x}, {:?} dispatch",
            W::WIDTH,
            memory.size(),
            heap_start.to_i64(),
            config.dispatch
        );
        let unbound = table.unbound();
        if !unbound.is_empty() {
            debug!("instructions with no code: {:?}", unbound);
        }
        Ok(Vm {
            pc: W::ZERO,
            a: W::ZERO,
            bp: W::ZERO,
            sp: W::ZERO,
            exit_code: W::ZERO,
            running: false,
            cycles: 0,
            fault_pc: W::ZERO,
            fault_code: 0,
            memory,
            allocator: Allocator::new(heap_start),
            table,
            handlers,
            config,
            leaks: Vec::new(),
        })
    }

    // --- Accessors ---

    pub fn memory(&self) -> &Memory<W> {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory<W> {
        &mut self.memory
    }

    pub fn allocator(&self) -> &Allocator<W> {
        &self.allocator
    }

    pub fn table(&self) -> &OpcodeTable {
        &self.table
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Where the heap begins and the initial stack ends.
    pub fn heap_start(&self) -> W {
        self.allocator.start()
    }

    pub fn exit_code(&self) -> W {
        self.exit_code
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Instructions executed by the last `run`.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Blocks the guest never freed, collected when the last run stopped.
    pub fn leaks(&self) -> &[LeakedBlock] {
        &self.leaks
    }

    // --- Program Staging ---

    /// Stores `words` one after another from `addr`, verifying each by
    /// reading it back.
    pub fn load_words(&mut self, addr: W, words: &[i64]) -> Result<(), VmError> {
        let mut loc = addr;
        for &word in words {
            let value = W::from_i64(word);
            self.memory.write_word(loc, value)?;
            let found = self.memory.read_word(loc)?;
            if found != value {
                error!("readback after write failed, read: {}, expected: {}", found, value);
                return Err(VmError::ReadbackMismatch {
                    addr: loc.to_i64(),
                    found: found.to_i64(),
                    expected: value.to_i64(),
                });
            }
            loc = loc.wrapping_add(W::size());
        }
        Ok(())
    }

    pub fn load_bytes(&mut self, addr: W, bytes: &[u8]) -> Result<(), VmError> {
        self.memory.write_bytes(addr, bytes)
    }

    /// Overwrites the word at `addr`, typically an address operand fixed up
    /// after loading.
    pub fn patch(&mut self, addr: W, value: W) -> Result<(), VmError> {
        self.memory.write_word(addr, value)
    }

    pub fn read_string(&self, addr: W) -> Result<Vec<u8>, VmError> {
        self.memory.read_string(addr)
    }

    /// Grows memory to at least `size` bytes.
    pub fn ensure_memory(&mut self, size: usize) -> Result<(), VmError> {
        self.memory.grow(size)
    }

    // --- Stack Operations ---

    /// `*--sp = value`
    #[inline]
    pub fn push(&mut self, value: W) -> Result<(), VmError> {
        self.sp = self.sp.wrapping_sub(W::size());
        self.memory.write_word(self.sp, value)
    }

    /// `*sp++`
    #[inline]
    pub fn pop(&mut self) -> Result<W, VmError> {
        let value = self.memory.read_word(self.sp)?;
        self.sp = self.sp.wrapping_add(W::size());
        Ok(value)
    }

    /// The `n`th word above the stack top: a system call argument, counting
    /// from the last one pushed.
    #[inline]
    fn arg(&self, n: i64) -> Result<W, VmError> {
        let offset = W::from_i64(n).wrapping_mul(W::size());
        self.memory.read_word(self.sp.wrapping_add(offset))
    }

    /// `*pc++`
    #[inline]
    fn operand(&mut self) -> Result<W, VmError> {
        let value = self.memory.read_word(self.pc)?;
        self.pc = self.pc.wrapping_add(W::size());
        Ok(value)
    }

    // --- Execution Loop ---

    /// Runs until EXIT or a fault, then shuts the allocator down. Returns the
    /// guest's exit code.
    pub fn run(&mut self, host: &mut Host<'_>) -> Result<W, VmError> {
        self.running = true;
        self.exit_code = W::ZERO;
        self.cycles = 0;
        self.leaks.clear();

        let result = match self.config.dispatch {
            Dispatch::Table => self.run_table(host),
            Dispatch::Specialized => self.run_specialized(host),
        }
        .and_then(|()| host.stdout.flush().map_err(VmError::from));
        self.running = false;

        if let Err(e) = &result {
            error!("vm stopped after {} cycles: {}", self.cycles, e);
        }
        self.leaks = self.allocator.shutdown();
        result.map(|()| self.exit_code)
    }

    fn run_table(&mut self, host: &mut Host<'_>) -> Result<(), VmError> {
        let unknown: Handler<W> = handler::<W, { Opcode::Unknown as u8 }>;
        while self.running {
            let code = self.fetch()?;
            let handler = usize::try_from(code)
                .ok()
                .and_then(|index| self.handlers.get(index))
                .copied()
                .unwrap_or(unknown);
            handler(self, host)?;
        }
        Ok(())
    }

    fn run_specialized(&mut self, host: &mut Host<'_>) -> Result<(), VmError> {
        while self.running {
            let code = self.fetch()?;
            let opcode = self.table.lookup(code);
            self.execute(opcode, host)?;
        }
        Ok(())
    }

    /// Executes the single instruction at PC.
    pub fn step(&mut self, host: &mut Host<'_>) -> Result<(), VmError> {
        let code = self.fetch()?;
        let opcode = self.table.lookup(code);
        self.execute(opcode, host)
    }

    /// Reads the instruction code at PC and moves PC past it.
    #[inline]
    fn fetch(&mut self) -> Result<i64, VmError> {
        if self.config.trace {
            debug!(target: "c4vm::trace", "{}", self.trace_line());
        }
        let code = self.memory.read_word(self.pc)?.to_i64();
        self.fault_pc = self.pc;
        self.fault_code = code;
        self.pc = self.pc.wrapping_add(W::size());
        self.cycles += 1;
        Ok(code)
    }

    /// Describes the instruction at PC: address, name, operand (for
    /// instructions that take one) and the accumulator.
    pub fn trace_line(&self) -> String {
        let code = self.memory.read_word(self.pc).map_or(-1, W::to_i64);
        let name = self.table.name_of(code).unwrap_or("UNKNOWN");
        if self.table.lookup(code).has_operand() {
            let operand = self
                .memory
                .read_word(self.pc.wrapping_add(W::size()))
                .map_or(0, W::to_i64);
            format!("PC: {} {} {}, A = {}", self.pc, name, operand, self.a)
        } else {
            format!("PC: {} {}, A = {}", self.pc, name, self.a)
        }
    }

    /// Semantics of every instruction. PC already points past the opcode.
    #[inline(always)]
    fn execute(&mut self, opcode: Opcode, host: &mut Host<'_>) -> Result<(), VmError> {
        let word = W::size();
        match opcode {
            // --- Immediates and Control Flow ---
            Opcode::Lea => {
                let offset = self.operand()?;
                self.a = self.bp.wrapping_add(offset.wrapping_mul(word));
            }
            Opcode::Imm => self.a = self.operand()?,
            Opcode::Jmp => self.pc = self.memory.read_word(self.pc)?,
            Opcode::Jsr => {
                self.push(self.pc.wrapping_add(word))?;
                self.pc = self.memory.read_word(self.pc)?;
            }
            Opcode::Jsri => {
                self.push(self.pc.wrapping_add(word))?;
                let slot = self.memory.read_word(self.pc)?;
                self.pc = self.memory.read_word(slot)?;
            }
            Opcode::Jsrs => {
                self.push(self.pc.wrapping_add(word))?;
                let offset = self.memory.read_word(self.pc)?;
                self.pc = self.memory.read_word(self.bp.wrapping_add(offset))?;
            }
            Opcode::Bz => {
                self.pc = if self.a.is_zero() {
                    self.memory.read_word(self.pc)?
                } else {
                    self.pc.wrapping_add(word)
                };
            }
            Opcode::Bnz => {
                self.pc = if self.a.is_zero() {
                    self.pc.wrapping_add(word)
                } else {
                    self.memory.read_word(self.pc)?
                };
            }

            // --- Frames ---
            Opcode::Ent => {
                self.push(self.bp)?;
                self.bp = self.sp;
                let locals = self.operand()?;
                self.sp = self.sp.wrapping_sub(locals.wrapping_mul(word));
            }
            Opcode::Adj => {
                let count = self.operand()?;
                self.sp = self.sp.wrapping_add(count.wrapping_mul(word));
            }
            Opcode::Lev => {
                self.sp = self.bp;
                self.bp = self.pop()?;
                self.pc = self.pop()?;
            }

            // --- Memory Access ---
            Opcode::Li => self.a = self.memory.read_word(self.a)?,
            Opcode::Lc => self.a = W::from_i64(self.memory.read_byte(self.a)? as i64),
            Opcode::Si => {
                let addr = self.pop()?;
                self.memory.write_word(addr, self.a)?;
            }
            Opcode::Sc => {
                let addr = self.pop()?;
                self.memory.write_byte(addr, self.a.to_i64() as u8)?;
            }
            Opcode::Psh => self.push(self.a)?,

            // --- Operators: a = *sp++ <op> a ---
            Opcode::Or => self.a = self.pop()? | self.a,
            Opcode::Xor => self.a = self.pop()? ^ self.a,
            Opcode::And => self.a = self.pop()? & self.a,
            Opcode::Eq => self.a = W::truth(self.pop()? == self.a),
            Opcode::Ne => self.a = W::truth(self.pop()? != self.a),
            Opcode::Lt => self.a = W::truth(self.pop()? < self.a),
            Opcode::Gt => self.a = W::truth(self.pop()? > self.a),
            Opcode::Le => self.a = W::truth(self.pop()? <= self.a),
            Opcode::Ge => self.a = W::truth(self.pop()? >= self.a),
            Opcode::Shl => self.a = self.pop()?.shift_left(self.a),
            Opcode::Shr => self.a = self.pop()?.shift_right(self.a),
            Opcode::Add => self.a = self.pop()?.wrapping_add(self.a),
            Opcode::Sub => self.a = self.pop()?.wrapping_sub(self.a),
            Opcode::Mul => self.a = self.pop()?.wrapping_mul(self.a),
            Opcode::Div => {
                let left = self.pop()?;
                self.a = left.trunc_div(self.a).ok_or(VmError::DivisionByZero {
                    pc: self.fault_pc.to_i64(),
                })?;
            }
            Opcode::Mod => {
                let left = self.pop()?;
                self.a = left.trunc_rem(self.a).ok_or(VmError::DivisionByZero {
                    pc: self.fault_pc.to_i64(),
                })?;
            }

            // --- System Calls ---
            Opcode::Open => self.sys_open(host)?,
            Opcode::Read => self.sys_read(host)?,
            Opcode::Clos => self.sys_close(host)?,
            Opcode::Prtf => self.sys_printf(host)?,
            Opcode::Malc => {
                let size = self.arg(0)?;
                self.a = self.allocator.malloc(&mut self.memory, size)?;
            }
            Opcode::Free => self.sys_free()?,
            Opcode::Mset => self.sys_memset()?,
            Opcode::Mcmp => self.sys_memcmp()?,
            Opcode::Mcpy => self.sys_memcpy()?,
            Opcode::Exit => {
                self.exit_code = self.arg(0)?;
                self.running = false;
                info!("exit({}) cycle = {}", self.exit_code, self.cycles);
            }
            Opcode::Unknown => {
                error!(
                    "unknown instruction {} ({}) at pc {:#x}",
                    self.fault_code,
                    self.table.name_of(self.fault_code).unwrap_or("unbound"),
                    self.fault_pc.to_i64()
                );
                self.running = false;
                return Err(VmError::UnknownOpcode {
                    code: self.fault_code,
                    pc: self.fault_pc.to_i64(),
                });
            }
        }
        Ok(())
    }

    // --- System Call Handlers ---

    /// open(pathname, mode)
    fn sys_open(&mut self, host: &mut Host<'_>) -> Result<(), VmError> {
        let pathname = self.memory.read_string(self.arg(1)?)?;
        let mode = self.arg(0)?.to_i64() as i32;
        let pathname = String::from_utf8_lossy(&pathname);
        let fd = host.fs.open(&pathname, mode);
        if fd < 0 {
            debug!("open({:?}, {}) failed", pathname, mode);
        }
        self.a = W::from_i64(fd as i64);
        Ok(())
    }

    /// read(fd, buf, nbyte)
    fn sys_read(&mut self, host: &mut Host<'_>) -> Result<(), VmError> {
        let fd = self.arg(2)?.to_i64() as i32;
        let buf = self.arg(1)?;
        let nbyte = self.arg(0)?.to_addr().unwrap_or(0);
        match host.fs.read(fd, nbyte) {
            Ok(content) => {
                self.memory.write_bytes(buf, &content)?;
                self.a = W::from_usize(content.len());
            }
            Err(e) => {
                warn!("read({}, {:#x}, {}): {}", fd, buf.to_i64(), nbyte, e);
                self.a = W::from_i64(-1);
            }
        }
        Ok(())
    }

    /// close(fd)
    fn sys_close(&mut self, host: &mut Host<'_>) -> Result<(), VmError> {
        let fd = self.arg(0)?.to_i64() as i32;
        self.a = match host.fs.close(fd) {
            Ok(()) => W::ZERO,
            Err(e) => {
                warn!("close({}): {}", fd, e);
                W::from_i64(-1)
            }
        };
        Ok(())
    }

    /// printf(format, ...). The argument count is the operand of the ADJ
    /// that follows the PRTF instruction.
    fn sys_printf(&mut self, host: &mut Host<'_>) -> Result<(), VmError> {
        let word = W::size();
        let argc = self.memory.read_word(self.pc.wrapping_add(word))?;
        let top = self.sp.wrapping_add(argc.wrapping_mul(word));
        let template = self.memory.read_string(self.memory.read_word(top.wrapping_sub(word))?)?;

        let mut args = Vec::new();
        let mut i = W::ONE;
        while i < argc {
            let slot = top.wrapping_sub(word.wrapping_mul(i.wrapping_add(W::ONE)));
            args.push(self.memory.read_word(slot)?.to_i64());
            i = i.wrapping_add(W::ONE);
        }

        let memory = &self.memory;
        let mut strings =
            |addr: i64| memory.read_string(W::from_i64(addr)).unwrap_or_default();
        let output = host.formatter.format(&template, &args, &mut strings);
        host.stdout.write_all(&output)?;
        self.a = W::from_usize(output.len());
        Ok(())
    }

    /// free(ptr). Freeing an address that is not a live allocation is
    /// reported and otherwise ignored.
    fn sys_free(&mut self) -> Result<(), VmError> {
        let ptr = self.arg(0)?;
        match self.allocator.free(&mut self.memory, ptr) {
            Err(VmError::InvalidFree { addr }) => {
                warn!("invalid free: {:#x} at pc {:#x}", addr, self.fault_pc.to_i64());
                self.a = W::from_i64(-1);
                Ok(())
            }
            other => other,
        }
    }

    /// memset(dest, val, n). Word-aligned requests are filled a word at a
    /// time, each word set to `val`.
    fn sys_memset(&mut self) -> Result<(), VmError> {
        let word = W::size();
        let dest = self.arg(2)?;
        let value = self.arg(1)?;
        let n = self.arg(0)?;
        if dest.trunc_rem(word) == Some(W::ZERO) && n.trunc_rem(word) == Some(W::ZERO) {
            let mut offset = W::ZERO;
            while offset < n {
                self.memory.write_word(dest.wrapping_add(offset), value)?;
                offset = offset.wrapping_add(word);
            }
        } else {
            let len = n.to_addr().unwrap_or(0);
            self.memory.fill(dest, value.to_i64() as u8, len)?;
        }
        self.a = W::ZERO;
        Ok(())
    }

    /// memcmp(s1, s2, n): FALSE when the regions are equal, TRUE otherwise.
    fn sys_memcmp(&mut self) -> Result<(), VmError> {
        let s1 = self.arg(2)?;
        let s2 = self.arg(1)?;
        let n = self.arg(0)?.to_addr().unwrap_or(0);
        let equal = self.memory.slice(s1, n)? == self.memory.slice(s2, n)?;
        self.a = W::truth(!equal);
        Ok(())
    }

    /// memcpy(dest, src, n), returning dest.
    fn sys_memcpy(&mut self) -> Result<(), VmError> {
        let dest = self.arg(2)?;
        let src = self.arg(1)?;
        let n = self.arg(0)?.to_addr().unwrap_or(0);
        self.memory.copy(dest, src, n)?;
        self.a = dest;
        Ok(())
    }

    // --- Diagnostics ---

    pub fn dump_registers(&self) -> String {
        format!(
            "PC:{:#06x} SP:{:#06x} BP:{:#06x} A:{} | exit:{} cycles:{}",
            self.pc.to_i64(),
            self.sp.to_i64(),
            self.bp.to_i64(),
            self.a,
            self.exit_code,
            self.cycles
        )
    }

    /// The `count` words nearest the stack top, one per line.
    pub fn dump_stack(&self, count: usize) -> String {
        let mut out = String::new();
        let mut addr = self.sp;
        for _ in 0..count {
            let Ok(value) = self.memory.read_word(addr) else { break };
            let marker = if addr == self.bp { " <- bp" } else { "" };
            out.push_str(&format!("{:#06x}: {}{}\n", addr.to_i64(), value, marker));
            addr = addr.wrapping_add(W::size());
        }
        out
    }
}
