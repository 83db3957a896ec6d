//! Opcodes of the C4 virtual machine and the table that binds them to numbers.
//!
//! The numeric value of an instruction is not fixed by the VM: the program
//! loader supplies a list of `(code, name)` pairs, and the VM resolves each
//! name to the handler implementing it. Names without a handler keep their
//! debug name but dispatch to `Opcode::Unknown`.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum::IntoEnumIterator;
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString, IntoStaticStr};

/// Largest numeric code (exclusive) a table may bind.
pub const MAX_OPCODE: i64 = 4096;

/// Every instruction this VM implements. The discriminant is an internal
/// index, not the numeric code found in a program image.
#[derive(
    StrumDisplay, IntoStaticStr, EnumString, EnumIter, TryFromPrimitive, IntoPrimitive,
    Clone, Copy, PartialEq, Eq, Debug, Hash,
)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum Opcode {
    // Instructions carrying an immediate operand
    Lea,  // a = bp + *pc++ * word
    Imm,  // a = *pc++
    Jmp,  // pc = *pc
    Jsr,  // *--sp = pc + 1; pc = *pc
    Jsri, // *--sp = pc + 1; pc = **pc
    Jsrs, // *--sp = pc + 1; pc = *(bp + *pc)
    Bz,   // pc = a ? pc + 1 : *pc
    Bnz,  // pc = a ? *pc : pc + 1
    Ent,  // *--sp = bp; bp = sp; sp -= *pc++ * word
    Adj,  // sp += *pc++ * word

    // Frame and memory access
    Lev, // sp = bp; bp = *sp++; pc = *sp++
    Li,  // a = *(int *)a
    Lc,  // a = *(char *)a
    Si,  // *(int *)*sp++ = a
    Sc,  // *(char *)*sp++ = a
    Psh, // *--sp = a

    // Binary operators: a = *sp++ <op> a
    Or, Xor, And,
    Eq, Ne, Lt, Gt, Le, Ge,
    Shl, Shr,
    Add, Sub, Mul, Div, Mod,

    // System calls
    Open, Read, Clos, Prtf, Malc, Free, Mset, Mcmp, Mcpy, Exit,

    /// Fault handler for codes with no implementation.
    Unknown,
}

impl Opcode {
    /// The internal index of this opcode.
    pub fn index(self) -> u8 {
        self.into()
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether the instruction is followed by an operand word.
    pub fn has_operand(self) -> bool {
        self.index() <= Opcode::Adj.index()
    }

    /// Whether the instruction delegates to the host or the allocator.
    pub fn is_syscall(self) -> bool {
        (Opcode::Open.index()..=Opcode::Exit.index()).contains(&self.index())
    }
}

/// Instruction names in the numbering emitted by the C4 compiler, code 0 first.
pub const STANDARD_NAMES: &[&str] = &[
    "LEA", "IMM", "JMP", "JSR", "JSRI", "JSRS", "BZ", "BNZ", "ENT", "ADJ", "LEV", "LI", "LC",
    "SI", "SC", "PSH",
    "JMPA", "TLEV",
    "OR", "XOR", "AND", "EQ", "NE", "LT", "GT", "LE", "GE", "SHL", "SHR", "ADD", "SUB", "MUL",
    "DIV", "MOD",
    "OPEN", "READ", "CLOS", "PRTF", "MALC", "RALC", "FREE", "MSET", "MCMP", "MCPY", "STRC",
    "ITH", "_OPC", "_BLT", "_TRP",
    "OPCD", "_JMP", "_ADJ", "C4CF", "C4CY", "TIME", "SIGH", "SIGI", "USLP", "INFO", "OPSL",
    "EXIT",
];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("opcode {0} is outside 0..{MAX_OPCODE}")]
    CodeOutOfRange(i64),

    #[error("opcode {code} bound twice ({first} and {second})")]
    DuplicateCode { code: i64, first: String, second: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    name: String,
    opcode: Opcode,
}

/// Binds numeric instruction codes to opcodes and debug names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeTable {
    slots: Vec<Option<Slot>>,
}

impl OpcodeTable {
    /// Builds a table from `(code, name)` pairs. Unrecognised names are kept
    /// for tracing and resolve to `Opcode::Unknown`.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = (i64, &'a str)>,
    {
        let mut slots: Vec<Option<Slot>> = Vec::new();
        for (code, name) in pairs {
            if !(0..MAX_OPCODE).contains(&code) {
                return Err(TableError::CodeOutOfRange(code));
            }
            let index = code as usize;
            if index >= slots.len() {
                slots.resize(index + 1, None);
            }
            if let Some(existing) = &slots[index] {
                return Err(TableError::DuplicateCode {
                    code,
                    first: existing.name.clone(),
                    second: name.to_string(),
                });
            }
            let opcode = match Opcode::from_str(name) {
                Ok(Opcode::Unknown) | Err(_) => Opcode::Unknown,
                Ok(opcode) => opcode,
            };
            slots[index] = Some(Slot { name: name.to_string(), opcode });
        }
        Ok(OpcodeTable { slots })
    }

    /// The table used by the C4 compiler's code generator.
    pub fn standard() -> Self {
        let mut slots = Vec::with_capacity(STANDARD_NAMES.len());
        for name in STANDARD_NAMES {
            let opcode = Opcode::from_str(name).unwrap_or(Opcode::Unknown);
            slots.push(Some(Slot { name: name.to_string(), opcode }));
        }
        OpcodeTable { slots }
    }

    /// Resolves a numeric code to its opcode.
    #[inline]
    pub fn lookup(&self, code: i64) -> Opcode {
        usize::try_from(code)
            .ok()
            .and_then(|index| self.slots.get(index))
            .and_then(|slot| slot.as_ref())
            .map_or(Opcode::Unknown, |slot| slot.opcode)
    }

    pub fn name_of(&self, code: i64) -> Option<&str> {
        usize::try_from(code)
            .ok()
            .and_then(|index| self.slots.get(index))
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.name.as_str())
    }

    pub fn code_of(&self, name: &str) -> Option<i64> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.name == name))
            .map(|index| index as i64)
    }

    /// One past the highest bound code.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Implemented instructions that no code in this table reaches.
    pub fn unbound(&self) -> Vec<Opcode> {
        Opcode::iter()
            .filter(|&opcode| opcode != Opcode::Unknown)
            .filter(|&opcode| !self.iter().any(|(_, bound)| bound == opcode))
            .collect()
    }

    /// Bound `(code, opcode)` pairs in ascending code order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, Opcode)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(code, slot)| slot.as_ref().map(|slot| (code as i64, slot.opcode)))
    }
}

impl Display for OpcodeTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (code, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                writeln!(f, "{:>4}  {:<5} -> {}", code, slot.name, slot.opcode)?;
            }
        }
        Ok(())
    }
}
