//! Backend adapters: the disassembler / debugger side of an export.
//!
//! A backend already knows where functions, blocks and instructions are; the
//! exporter only asks it questions through [`BackendAdapter`]. Every query may
//! fail independently.

mod memory;

pub use self::memory::InMemoryBackend;

use std::collections::{BTreeMap, BTreeSet};

use crate::{Address, Architecture, Bitness};

/// Errors raised by a backend query
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A query failed inside the backend
    #[error("{call} failed{}: {reason}", .address.map(|a| format!(" at 0x{a:x}")).unwrap_or_default())]
    Fetch {
        call: &'static str,
        address: Option<Address>,
        reason: String,
    },

    /// The backend's processor has no counterpart here
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Asked for blocks of an address that is not a function
    #[error("No function at 0x{0:x}")]
    MissingFunction(Address),

    /// Asked for bytes of an address that is not an instruction
    #[error("No instruction at 0x{0:x}")]
    MissingInstruction(Address),

    /// A backend dump could not be read
    #[error("Invalid backend dump: {0}")]
    Dump(#[from] serde_json::Error),
}

/// Query interface over a disassembler's view of one binary.
pub trait BackendAdapter {
    /// Entry addresses of all functions, ascending
    fn functions(&self) -> Result<BTreeSet<Address>, BackendError>;

    /// Blocks of a function, each an ordered list of instruction addresses
    fn blocks(&self, function: Address) -> Result<Vec<Vec<Address>>, BackendError>;

    /// Bytes of the instruction at `address`, as long as the backend says it is
    fn instruction_bytes(&self, address: Address) -> Result<Vec<u8>, BackendError>;

    /// Edges `(from, address)` of control transfers into `address`
    fn code_in_refs(&self, address: Address) -> Result<Vec<(Address, Address)>, BackendError>;

    /// Edges `(address, to)` of control transfers out of `address`
    fn code_out_refs(&self, address: Address) -> Result<Vec<(Address, Address)>, BackendError>;

    /// Native function names; placeholders may still be among them
    fn function_symbols(&self) -> Result<BTreeMap<Address, String>, BackendError>;

    /// Import entry points, `address -> "module!symbol"`
    fn api_map(&self) -> Result<BTreeMap<Address, String>, BackendError>;

    fn architecture(&self) -> Result<Architecture, BackendError>;

    fn bitness(&self) -> Result<Bitness, BackendError>;

    fn base_addr(&self) -> Result<Address, BackendError>;

    /// Raw bytes of the mapped image
    fn binary(&self) -> Result<Vec<u8>, BackendError>;
}

impl<B: BackendAdapter + ?Sized> BackendAdapter for &B {
    fn functions(&self) -> Result<BTreeSet<Address>, BackendError> {
        (**self).functions()
    }

    fn blocks(&self, function: Address) -> Result<Vec<Vec<Address>>, BackendError> {
        (**self).blocks(function)
    }

    fn instruction_bytes(&self, address: Address) -> Result<Vec<u8>, BackendError> {
        (**self).instruction_bytes(address)
    }

    fn code_in_refs(&self, address: Address) -> Result<Vec<(Address, Address)>, BackendError> {
        (**self).code_in_refs(address)
    }

    fn code_out_refs(&self, address: Address) -> Result<Vec<(Address, Address)>, BackendError> {
        (**self).code_out_refs(address)
    }

    fn function_symbols(&self) -> Result<BTreeMap<Address, String>, BackendError> {
        (**self).function_symbols()
    }

    fn api_map(&self) -> Result<BTreeMap<Address, String>, BackendError> {
        (**self).api_map()
    }

    fn architecture(&self) -> Result<Architecture, BackendError> {
        (**self).architecture()
    }

    fn bitness(&self) -> Result<Bitness, BackendError> {
        (**self).bitness()
    }

    fn base_addr(&self) -> Result<Address, BackendError> {
        (**self).base_addr()
    }

    fn binary(&self) -> Result<Vec<u8>, BackendError> {
        (**self).binary()
    }
}
