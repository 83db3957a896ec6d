//! Default formatted-output engine for the PRTF system call.
//!
//! Supports the C conversions a C4 program can reach: `%d %i %u %x %X %o %c
//! %s %p %%`, with flags `- 0 + space #`, field width, precision and `*` for
//! either. Length modifiers are accepted and ignored; every argument is a VM
//! word. Unsigned conversions see the word at the VM's width, so `%x` of -1 in
//! a 32-bit VM prints `ffffffff`.
//!
//! Widths and precisions are capped at the VM memory ceiling.

use crate::host::Formatter;
use crate::memory::{Width, MAX_MEMORY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Printf {
    width: Width,
}

impl Printf {
    pub fn new(width: Width) -> Self {
        Printf { width }
    }

    fn unsigned(&self, value: i64) -> u64 {
        match self.width {
            Width::W32 => value as u32 as u64,
            Width::W64 => value as u64,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Directive {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    width: usize,
    precision: Option<usize>,
}

/// Appends decimal digit `d` to a width or precision.
fn push_digit(field: usize, d: u8) -> usize {
    field.saturating_mul(10).saturating_add((d - b'0') as usize).min(MAX_MEMORY)
}

/// A width or precision taken from a `*` argument.
fn field_arg(value: i64) -> usize {
    usize::try_from(value.unsigned_abs()).map_or(MAX_MEMORY, |field| field.min(MAX_MEMORY))
}

impl Directive {
    /// Pads `body` (with `prefix` such as a sign or `0x`) to the field width.
    fn pad(&self, out: &mut Vec<u8>, prefix: &[u8], body: &[u8], numeric: bool) {
        let len = prefix.len() + body.len();
        let fill = self.width.saturating_sub(len);
        if self.left {
            out.extend_from_slice(prefix);
            out.extend_from_slice(body);
            out.resize(out.len() + fill, b' ');
        } else if self.zero && numeric && self.precision.is_none() {
            out.extend_from_slice(prefix);
            out.resize(out.len() + fill, b'0');
            out.extend_from_slice(body);
        } else {
            out.resize(out.len() + fill, b' ');
            out.extend_from_slice(prefix);
            out.extend_from_slice(body);
        }
    }

    /// Applies the precision to a run of digits.
    fn digits(&self, digits: String) -> Vec<u8> {
        match self.precision {
            Some(0) if digits == "0" => Vec::new(),
            Some(precision) if precision > digits.len() => {
                let mut padded = vec![b'0'; precision - digits.len()];
                padded.extend_from_slice(digits.as_bytes());
                padded
            }
            _ => digits.into_bytes(),
        }
    }
}

impl Formatter for Printf {
    fn format(
        &mut self,
        template: &[u8],
        args: &[i64],
        strings: &mut dyn FnMut(i64) -> Vec<u8>,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(template.len());
        let mut args = args.iter().copied();
        let mut next_arg = move || args.next().unwrap_or(0);
        let mut i = 0;

        while i < template.len() {
            let c = template[i];
            i += 1;
            if c != b'%' {
                out.push(c);
                continue;
            }
            let directive_start = i - 1;
            let mut directive = Directive::default();

            // Flags
            while let Some(&flag) = template.get(i) {
                match flag {
                    b'-' => directive.left = true,
                    b'0' => directive.zero = true,
                    b'+' => directive.plus = true,
                    b' ' => directive.space = true,
                    b'#' => directive.alternate = true,
                    _ => break,
                }
                i += 1;
            }

            // Width
            if template.get(i) == Some(&b'*') {
                let width = next_arg();
                if width < 0 {
                    directive.left = true;
                }
                directive.width = field_arg(width);
                i += 1;
            } else {
                while let Some(d @ b'0'..=b'9') = template.get(i).copied() {
                    directive.width = push_digit(directive.width, d);
                    i += 1;
                }
            }

            // Precision
            if template.get(i) == Some(&b'.') {
                i += 1;
                if template.get(i) == Some(&b'*') {
                    let precision = next_arg();
                    directive.precision = (precision >= 0).then(|| field_arg(precision));
                    i += 1;
                } else {
                    let mut precision = 0;
                    while let Some(d @ b'0'..=b'9') = template.get(i).copied() {
                        precision = push_digit(precision, d);
                        i += 1;
                    }
                    directive.precision = Some(precision);
                }
            }

            // Length modifiers
            while matches!(template.get(i), Some(b'l' | b'h' | b'z' | b'j' | b't' | b'L' | b'q')) {
                i += 1;
            }

            let Some(&conversion) = template.get(i) else {
                out.extend_from_slice(&template[directive_start..]);
                break;
            };
            i += 1;

            match conversion {
                b'd' | b'i' => {
                    let value = next_arg();
                    let sign: &[u8] = if value < 0 {
                        b"-"
                    } else if directive.plus {
                        b"+"
                    } else if directive.space {
                        b" "
                    } else {
                        b""
                    };
                    let body = directive.digits(value.unsigned_abs().to_string());
                    directive.pad(&mut out, sign, &body, true);
                }
                b'u' => {
                    let value = self.unsigned(next_arg());
                    let body = directive.digits(value.to_string());
                    directive.pad(&mut out, b"", &body, true);
                }
                b'x' | b'X' => {
                    let value = self.unsigned(next_arg());
                    let digits = if conversion == b'x' {
                        format!("{:x}", value)
                    } else {
                        format!("{:X}", value)
                    };
                    let prefix: &[u8] = match (directive.alternate && value != 0, conversion) {
                        (true, b'x') => b"0x",
                        (true, _) => b"0X",
                        (false, _) => b"",
                    };
                    let body = directive.digits(digits);
                    directive.pad(&mut out, prefix, &body, true);
                }
                b'o' => {
                    let value = self.unsigned(next_arg());
                    let mut digits = format!("{:o}", value);
                    if directive.alternate && !digits.starts_with('0') {
                        digits.insert(0, '0');
                    }
                    let body = directive.digits(digits);
                    directive.pad(&mut out, b"", &body, true);
                }
                b'p' => {
                    let value = self.unsigned(next_arg());
                    let body = format!("{:x}", value).into_bytes();
                    directive.pad(&mut out, b"0x", &body, true);
                }
                b'c' => {
                    let value = next_arg() as u8;
                    directive.pad(&mut out, b"", &[value], false);
                }
                b's' => {
                    let mut body = strings(next_arg());
                    if let Some(precision) = directive.precision {
                        body.truncate(precision);
                    }
                    directive.pad(&mut out, b"", &body, false);
                }
                b'%' => out.push(b'%'),
                _ => {
                    // Not a conversion we know; emit it untouched.
                    out.extend_from_slice(&template[directive_start..i]);
                }
            }
        }
        out
    }
}
