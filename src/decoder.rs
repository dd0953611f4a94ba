//! Capstone-based instruction decoders, plus a scripted decoder for tests.

use std::collections::HashMap;
use std::fmt;

use capstone::arch::arm::ArchMode as ArmMode;
use capstone::arch::arm64::ArchMode as Arm64Mode;
use capstone::arch::mips::ArchMode as MipsMode;
use capstone::arch::ppc::ArchMode as PpcMode;
use capstone::arch::riscv::ArchMode as RiscVMode;
use capstone::arch::x86::ArchMode as X86Mode;
use capstone::prelude::*;
use capstone::Capstone;

use crate::{Address, Architecture, Bitness, Decoder, Insn};

/// Errors that can occur while building a decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// No Capstone mode for this architecture / width pair
    #[error("Unsupported target: {0} at {1} bits")]
    UnsupportedTarget(Architecture, Bitness),
}

/// A Capstone decoder bound to one architecture and width.
pub struct CapstoneDecoder {
    cs: Capstone,
    architecture: Architecture,
    bitness: Bitness,
}

impl CapstoneDecoder {
    /// Create a decoder for an architecture at the given width
    pub fn for_target(architecture: Architecture, bitness: Bitness) -> Result<Self, DecoderError> {
        let cs = match (architecture, bitness) {
            (Architecture::X86, Bitness::Bits16) => Self::build_x86(X86Mode::Mode16)?,
            (Architecture::X86, Bitness::Bits32) => Self::build_x86(X86Mode::Mode32)?,
            (Architecture::X86, Bitness::Bits64) => Self::build_x86(X86Mode::Mode64)?,
            (Architecture::Arm, Bitness::Bits32) => Self::build_arm(ArmMode::Arm)?,
            (Architecture::Thumb, Bitness::Bits16 | Bitness::Bits32) => {
                Self::build_arm(ArmMode::Thumb)?
            }
            (Architecture::AArch64, Bitness::Bits64) => Self::build_aarch64()?,
            (Architecture::Mips, Bitness::Bits32) => Self::build_mips(MipsMode::Mips32)?,
            (Architecture::Mips, Bitness::Bits64) => Self::build_mips(MipsMode::Mips64)?,
            (Architecture::RiscV, Bitness::Bits32) => Self::build_riscv(RiscVMode::RiscV32)?,
            (Architecture::RiscV, Bitness::Bits64) => Self::build_riscv(RiscVMode::RiscV64)?,
            (Architecture::Ppc, Bitness::Bits32) => Self::build_ppc(PpcMode::Mode32)?,
            (Architecture::Ppc, Bitness::Bits64) => Self::build_ppc(PpcMode::Mode64)?,
            (arch, bits) => return Err(DecoderError::UnsupportedTarget(arch, bits)),
        };

        Ok(Self {
            cs,
            architecture,
            bitness,
        })
    }

    fn build_x86(mode: X86Mode) -> Result<Capstone, DecoderError> {
        Ok(Capstone::new().x86().mode(mode).detail(false).build()?)
    }

    fn build_arm(mode: ArmMode) -> Result<Capstone, DecoderError> {
        Ok(Capstone::new().arm().mode(mode).detail(false).build()?)
    }

    fn build_aarch64() -> Result<Capstone, DecoderError> {
        Ok(Capstone::new()
            .arm64()
            .mode(Arm64Mode::Arm)
            .detail(false)
            .build()?)
    }

    fn build_mips(mode: MipsMode) -> Result<Capstone, DecoderError> {
        Ok(Capstone::new().mips().mode(mode).detail(false).build()?)
    }

    fn build_riscv(mode: RiscVMode) -> Result<Capstone, DecoderError> {
        Ok(Capstone::new().riscv().mode(mode).detail(false).build()?)
    }

    fn build_ppc(mode: PpcMode) -> Result<Capstone, DecoderError> {
        Ok(Capstone::new().ppc().mode(mode).detail(false).build()?)
    }

    /// Get the architecture of this decoder
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Get the width of this decoder
    pub fn bitness(&self) -> Bitness {
        self.bitness
    }
}

impl fmt::Debug for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapstoneDecoder")
            .field("architecture", &self.architecture)
            .field("bitness", &self.bitness)
            .finish()
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}/{}", self.architecture, self.bitness)
    }
}

impl Decoder for CapstoneDecoder {
    fn decode_one(&self, address: Address, bytes: &[u8]) -> Option<Insn> {
        if bytes.is_empty() {
            return None;
        }

        let decoded = self.cs.disasm_count(bytes, address, 1).ok()?;
        let i = decoded.iter().next()?;

        // The backend delimits instructions; anything not at offset 0 is not ours.
        if i.address() != address {
            return None;
        }

        Some(Insn::new(
            i.address(),
            i.mnemonic().unwrap_or(""),
            i.op_str().unwrap_or(""),
            i.bytes().to_vec(),
        ))
    }
}

/// In-memory decoder that knows a fixed set of addresses.
///
/// Every scripted address decodes to its `(mnemonic, operands)` pair and
/// consumes the whole buffer; any other address fails to decode.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDecoder {
    table: HashMap<Address, (String, String)>,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the instruction found at `address`.
    pub fn with(
        mut self,
        address: Address,
        mnemonic: impl Into<String>,
        operands: impl Into<String>,
    ) -> Self {
        self.table
            .insert(address, (mnemonic.into(), operands.into()));
        self
    }
}

impl Decoder for ScriptedDecoder {
    fn decode_one(&self, address: Address, bytes: &[u8]) -> Option<Insn> {
        if bytes.is_empty() {
            return None;
        }
        let (mnemonic, operands) = self.table.get(&address)?;
        Some(Insn::new(address, mnemonic.as_str(), operands.as_str(), bytes.to_vec()))
    }
}
