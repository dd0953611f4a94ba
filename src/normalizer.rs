//! Instruction normalization: turns backend-delimited bytes into `Insn` records.

use std::collections::BTreeMap;

use crate::model::{ErrorKind, ErrorRecord};
use crate::{Address, Decoder, Insn};

/// Normalize the instruction the backend delimited at `address`.
///
/// The first instruction the decoder produces is kept; whatever else the
/// buffer might hold is ignored. When the decoder produces nothing, a
/// placeholder `error`/`error` record covering all of `raw` is returned and a
/// decode failure is recorded in `ledger` under `address`.
///
/// # Arguments
/// * `decoder` - The decoder for the run's architecture
/// * `address` - Address of the instruction in the mapped image
/// * `raw` - Bytes the backend attributes to this instruction
/// * `ledger` - Error ledger of the run, keyed by address
pub fn normalize(
    decoder: &dyn Decoder,
    address: Address,
    raw: &[u8],
    ledger: &mut BTreeMap<Address, ErrorRecord>,
) -> Insn {
    match decoder.decode_one(address, raw) {
        Some(insn) => insn,
        None => {
            let record = ErrorRecord::new(ErrorKind::DecodeFailure, raw);
            log::warn!(
                "missing decoder output at 0x{:x} ({})",
                address,
                record.instruction_bytes
            );
            ledger.insert(address, record);
            Insn::placeholder(address, raw.to_vec())
        }
    }
}
