//! A virtual machine for the C4 instruction set.
//!
//! Programs run over a single growable memory region holding code, data, the
//! stack and a first-fit heap. The VM works at either 32- or 64-bit word width
//! and reaches the outside world only through the collaborators in `host`.

pub mod allocator;
pub mod host;
pub mod loader;
pub mod memory;
pub mod opcode;
pub mod printf;
pub mod vm;

pub use memory::{Memory, Width, Word};
pub use opcode::{Opcode, OpcodeTable};
pub use vm::{Dispatch, Vm, VmConfig, VmError};
