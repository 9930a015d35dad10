//! Binary checks for freshly linked programs
//!
//! The linker's output is compiled per run and never cached, so it is
//! checked before handing it to the engine: a bad header or a missing entry
//! point is reported as such instead of as an opaque compile failure.

use super::abi::exports;
use crate::error::{RuntimeError, RuntimeResult};

/// `\0asm` followed by version 1
const PREAMBLE: [u8; 8] = [0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

const EXPORT_SECTION: u8 = 7;

/// Export kinds the command convention cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ExportKind {
    Func = 0,
    Memory = 2,
}

/// Forward-only reader over a byte slice; every step is bounds checked
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn byte(&mut self) -> RuntimeResult<u8> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| invalid("unexpected end of module"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize, what: &str) -> RuntimeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| invalid(&format!("{} extends past end of module", what)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Unsigned LEB128 that must fit in 32 bits
    fn u32(&mut self) -> RuntimeResult<u32> {
        let mut value = 0u32;
        for shift in (0..35).step_by(7) {
            let byte = self.byte()?;
            let bits = u32::from(byte & 0x7F);
            // the fifth byte only has room for the top four bits
            if shift == 28 && bits > 0x0F {
                return Err(invalid("LEB128 value exceeds 32 bits"));
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(invalid("invalid LEB128"))
    }

    fn sized(&mut self, what: &str) -> RuntimeResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len, what)
    }
}

/// Validates a program module against the command conventions
pub struct ModuleValidator;

impl ModuleValidator {
    /// Check header, section framing and the `memory`/`_start` exports
    pub fn validate(bytes: &[u8]) -> RuntimeResult<()> {
        if bytes.len() < PREAMBLE.len() {
            return Err(invalid("module too small"));
        }
        if bytes[..4] != PREAMBLE[..4] {
            return Err(invalid("invalid magic number"));
        }
        if bytes[4..8] != PREAMBLE[4..] {
            return Err(invalid("unsupported WASM version"));
        }

        let mut module = Cursor::new(&bytes[PREAMBLE.len()..]);
        let mut has_memory = false;
        let mut has_start = false;
        while !module.at_end() {
            let id = module.byte()?;
            let body = module.sized("section")?;
            if id != EXPORT_SECTION {
                continue;
            }

            let mut section = Cursor::new(body);
            if section.at_end() {
                continue;
            }
            for _ in 0..section.u32()? {
                let name = section.sized("export name")?;
                let kind = section.byte()?;
                section.u32()?;
                has_memory |=
                    name == exports::MEMORY.as_bytes() && kind == ExportKind::Memory as u8;
                has_start |=
                    name == exports::START.as_bytes() && kind == ExportKind::Func as u8;
            }
        }

        if !has_memory {
            return Err(RuntimeError::MissingExport {
                name: exports::MEMORY,
            });
        }
        if !has_start {
            return Err(RuntimeError::MissingExport {
                name: exports::START,
            });
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> RuntimeError {
    RuntimeError::InvalidModule {
        reason: reason.to_string(),
    }
}
