//! Core IR, traits, and error types for the Nuclide Export normalizer.
//!
//! This library takes the per-instruction view of a binary that an external
//! disassembly backend already built (functions, basic blocks, code
//! references, names) and turns it into one self-contained model: functions
//! decomposed into blocks of normalized instructions, a bidirectional code
//! reference graph, recursive / leaf classification, and a merged symbol
//! table. Control flow is never rediscovered here.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use nuclide_export::{
//!     backend::InMemoryBackend,
//!     exporter::Exporter,
//!     Architecture, Bitness,
//! };
//!
//! // A backend that knows one function made of a single `ret`
//! let backend = InMemoryBackend::new(Architecture::X86, Bitness::Bits32)
//!     .with_function(0x401000, vec![vec![(0x401000, vec![0xc3])]]);
//!
//! // Normalize it into a disassembly result
//! let result = Exporter::new(backend).run().unwrap();
//!
//! assert!(result.leaf_functions.contains(&0x401000));
//! ```

pub mod backend;
pub mod config;
pub mod decoder;
pub mod exporter;
pub mod model;
pub mod normalizer;
pub mod parser;
pub mod symbols;
pub mod xref;

pub use crate::model::{BasicBlock, DisassemblyResult, ErrorKind, ErrorRecord};
pub use crate::xref::CodeRefGraph;

/// Represents an address in the mapped image
pub type Address = u64;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Mnemonic and operand string given to instructions that failed to decode.
pub const PLACEHOLDER_MNEMONIC: &str = "error";

/// One normalized instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes, always `bytes.len()`
    pub size: usize,
    /// Instruction mnemonic (e.g., "mov", "add")
    pub mnemonic: String,
    /// Instruction operands as string representation
    pub operands: String,
    /// Raw bytes of the instruction
    pub bytes: Vec<u8>,
}

impl Insn {
    /// Build an instruction record, deriving `size` from the raw bytes.
    pub fn new(
        addr: Address,
        mnemonic: impl Into<String>,
        operands: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            addr,
            size: bytes.len(),
            mnemonic: mnemonic.into(),
            operands: operands.into(),
            bytes,
        }
    }

    /// Synthetic record standing in for bytes the decoder rejected.
    pub fn placeholder(addr: Address, bytes: Vec<u8>) -> Self {
        Self::new(addr, PLACEHOLDER_MNEMONIC, PLACEHOLDER_MNEMONIC, bytes)
    }

    /// Returns true if this record was synthesized after a decode failure
    pub fn is_placeholder(&self) -> bool {
        self.mnemonic == PLACEHOLDER_MNEMONIC && self.operands == PLACEHOLDER_MNEMONIC
    }

    /// Raw bytes rendered as lowercase hex
    pub fn hex_bytes(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Address of the byte following this instruction
    pub fn end_address(&self) -> Address {
        self.addr + self.size as Address
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.operands)
    }
}

/// Decoder trait: the external instruction decoding capability.
pub trait Decoder {
    /// Decode exactly one instruction from `bytes`, placed at `address`.
    ///
    /// # Returns
    /// Some(Insn) for the first instruction in the buffer, None if the
    /// bytes do not start with a valid instruction for this ISA
    fn decode_one(&self, address: Address, bytes: &[u8]) -> Option<Insn>;
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    fn decode_one(&self, address: Address, bytes: &[u8]) -> Option<Insn> {
        (**self).decode_one(address, bytes)
    }
}

/// Instruction-set families a backend may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Architecture {
    /// Intel x86 family (16, 32 and 64 bit)
    #[serde(alias = "intel", alias = "metapc")]
    X86,
    /// ARM (32-bit)
    Arm,
    /// ARM Thumb mode
    Thumb,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// MIPS
    Mips,
    /// RISC-V
    RiscV,
    /// PowerPC
    Ppc,
    /// Unknown architecture
    Unknown,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "intel"),
            Architecture::Arm => write!(f, "arm"),
            Architecture::Thumb => write!(f, "thumb"),
            Architecture::AArch64 => write!(f, "aarch64"),
            Architecture::Mips => write!(f, "mips"),
            Architecture::RiscV => write!(f, "riscv"),
            Architecture::Ppc => write!(f, "ppc"),
            Architecture::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Architecture {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86" | "intel" | "metapc" | "i386" | "x86_64" | "amd64" => Ok(Architecture::X86),
            "arm" | "armv7" => Ok(Architecture::Arm),
            "thumb" => Ok(Architecture::Thumb),
            "aarch64" | "arm64" => Ok(Architecture::AArch64),
            "mips" | "mips32" | "mips64" => Ok(Architecture::Mips),
            "riscv" | "riscv32" | "riscv64" => Ok(Architecture::RiscV),
            "ppc" | "powerpc" | "ppc32" | "ppc64" => Ok(Architecture::Ppc),
            _ => Err(ExportError::UnsupportedArchitecture(Architecture::Unknown)),
        }
    }
}

/// Instruction-set width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Bitness {
    /// 16-bit (real mode x86, Thumb)
    Bits16,
    /// 32-bit
    Bits32,
    /// 64-bit
    Bits64,
}

impl Bitness {
    /// Width in bits
    pub fn bits(self) -> u32 {
        match self {
            Bitness::Bits16 => 16,
            Bitness::Bits32 => 32,
            Bitness::Bits64 => 64,
        }
    }
}

impl TryFrom<u32> for Bitness {
    type Error = ExportError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(Bitness::Bits16),
            32 => Ok(Bitness::Bits32),
            64 => Ok(Bitness::Bits64),
            other => Err(ExportError::InvalidBitness(other)),
        }
    }
}

impl From<Bitness> for u32 {
    fn from(bitness: Bitness) -> Self {
        bitness.bits()
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// Errors that abort a whole export run
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The backend reported an architecture no decoder exists for
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),

    /// The architecture is known but not at this width
    #[error("Unsupported target: {architecture} at {bitness} bits")]
    UnsupportedTarget {
        architecture: Architecture,
        bitness: Bitness,
    },

    /// Bitness other than 16, 32 or 64
    #[error("Invalid bitness: {0}")]
    InvalidBitness(u32),

    /// Decoder could not be constructed
    #[error("Decoder error: {0}")]
    Decoder(#[from] decoder::DecoderError),

    /// A precondition query to the backend failed
    #[error("Backend error: {0}")]
    Backend(#[from] backend::BackendError),

    /// The run configuration is unusable
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_insn_size_tracks_bytes() {
        let insn = Insn::new(0x1000, "add", "eax, ebx", vec![0x01, 0xd8]);

        assert_eq!(insn.size, 2);
        assert_eq!(insn.end_address(), 0x1002);
        assert_eq!(insn.hex_bytes(), "01d8");
        assert!(!insn.is_placeholder());
        assert_eq!(insn.to_string(), "add\teax, ebx");
    }

    #[test]
    fn test_placeholder_insn() {
        let insn = Insn::placeholder(0x401000, vec![0xff, 0xff]);

        assert!(insn.is_placeholder());
        assert_eq!(insn.size, 2);
        assert_eq!(insn.mnemonic, "error");
        assert_eq!(insn.operands, "error");
    }

    #[rstest]
    #[case("intel", Architecture::X86)]
    #[case("metapc", Architecture::X86)]
    #[case("AMD64", Architecture::X86)]
    #[case("arm64", Architecture::AArch64)]
    #[case("powerpc", Architecture::Ppc)]
    fn test_architecture_from_str(#[case] tag: &str, #[case] expected: Architecture) {
        assert_eq!(tag.parse::<Architecture>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_architecture_tag() {
        assert!(matches!(
            "z80".parse::<Architecture>(),
            Err(ExportError::UnsupportedArchitecture(Architecture::Unknown))
        ));
    }

    #[rstest]
    #[case(16, Bitness::Bits16)]
    #[case(32, Bitness::Bits32)]
    #[case(64, Bitness::Bits64)]
    fn test_bitness_from_bits(#[case] bits: u32, #[case] expected: Bitness) {
        assert_eq!(Bitness::try_from(bits).unwrap(), expected);
        assert_eq!(u32::from(expected), bits);
    }

    #[test]
    fn test_invalid_bitness() {
        assert!(matches!(Bitness::try_from(8), Err(ExportError::InvalidBitness(8))));
    }

    #[test]
    fn test_architecture_serde_aliases() {
        let arch: Architecture = serde_json::from_str("\"intel\"").unwrap();
        assert_eq!(arch, Architecture::X86);

        let bits: Bitness = serde_json::from_str("64").unwrap();
        assert_eq!(bits, Bitness::Bits64);
        assert!(serde_json::from_str::<Bitness>("12").is_err());
    }
}
