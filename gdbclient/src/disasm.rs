/// Instruction decoding for the disassembly view

use serde::{Deserialize, Serialize};
use yaxpeax_arch::{Decoder, LengthedInstruction, U8Reader};
use yaxpeax_x86::amd64::InstDecoder;

/// One decoded (or undecodable) instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub ip: u64,
    pub length: usize,
    pub mnemonic: String,
    pub bytes: Vec<u8>,
    pub valid: bool,
    /// `name+0x10` of the nearest symbol, if one is known
    pub symbol: Option<String>,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex: Vec<String> = self.bytes.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{:016x}  {:<30} {}", self.ip, hex.join(" "), self.mnemonic)?;
        if let Some(symbol) = &self.symbol {
            write!(f, "    ; {}", symbol)?;
        }
        Ok(())
    }
}

pub trait Disassembler: Send + Sync {
    /// Decode `bytes` as if mapped at `base`. Never fails: a byte that does
    /// not start a valid instruction becomes a one-byte invalid entry.
    fn disassemble(&self, bytes: &[u8], base: u64) -> Vec<Instruction>;
}

#[derive(Default)]
pub struct X86_64Disassembler {
    decoder: InstDecoder,
}

impl X86_64Disassembler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Disassembler for X86_64Disassembler {
    fn disassemble(&self, bytes: &[u8], base: u64) -> Vec<Instruction> {
        let mut out = Vec::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let ip = base.wrapping_add(offset as u64);
            let mut reader = U8Reader::new(&bytes[offset..]);

            let decoded = match self.decoder.decode(&mut reader) {
                Ok(inst) => {
                    let length = inst.len().to_const() as usize;
                    if length == 0 || offset + length > bytes.len() {
                        None
                    } else {
                        Some((inst.to_string(), length))
                    }
                }
                Err(e) => {
                    log::trace!("Undecodable byte at {:#x}: {}", ip, e);
                    None
                }
            };

            let instruction = match decoded {
                Some((mnemonic, length)) => Instruction {
                    ip,
                    length,
                    mnemonic,
                    bytes: bytes[offset..offset + length].to_vec(),
                    valid: true,
                    symbol: None,
                },
                None => Instruction {
                    ip,
                    length: 1,
                    mnemonic: format!("db {:#04x}", bytes[offset]),
                    bytes: vec![bytes[offset]],
                    valid: false,
                    symbol: None,
                },
            };

            offset += instruction.length;
            out.push(instruction);
        }

        out
    }
}
