//! In-memory backend, built in code or loaded from a JSON dump.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{BackendAdapter, BackendError};
use crate::parser::ImageInfo;
use crate::{Address, Architecture, Bitness};

/// Byte strings travel as hex in dumps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct HexBytes(Vec<u8>);

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim())
            .map(HexBytes)
            .map_err(serde::de::Error::custom)
    }
}

/// A backend whose whole view of the binary is held in maps.
///
/// Dumps use decimal addresses as keys and hex strings for bytes:
///
/// ```json
/// {
///   "architecture": "intel",
///   "bitness": 32,
///   "base_addr": 4194304,
///   "functions": { "4198400": [[4198400, 4198405]] },
///   "instructions": { "4198400": "e8fb0f0000", "4198405": "c3" },
///   "code_refs": [[4198400, 4202496]],
///   "api_map": { "4202496": "kernel32.dll!ExitProcess" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryBackend {
    architecture: Architecture,
    bitness: Bitness,
    #[serde(default)]
    base_addr: Address,
    #[serde(default)]
    binary: HexBytes,
    #[serde(default)]
    functions: BTreeMap<Address, Vec<Vec<Address>>>,
    #[serde(default)]
    instructions: BTreeMap<Address, HexBytes>,
    #[serde(default)]
    code_refs: BTreeSet<(Address, Address)>,
    #[serde(default)]
    function_symbols: BTreeMap<Address, String>,
    #[serde(default)]
    api_map: BTreeMap<Address, String>,
    #[serde(skip)]
    failing_functions: BTreeSet<Address>,
    #[serde(skip)]
    failing_queries: BTreeSet<&'static str>,
}

impl InMemoryBackend {
    pub fn new(architecture: Architecture, bitness: Bitness) -> Self {
        Self {
            architecture,
            bitness,
            base_addr: 0,
            binary: HexBytes::default(),
            functions: BTreeMap::new(),
            instructions: BTreeMap::new(),
            code_refs: BTreeSet::new(),
            function_symbols: BTreeMap::new(),
            api_map: BTreeMap::new(),
            failing_functions: BTreeSet::new(),
            failing_queries: BTreeSet::new(),
        }
    }

    /// Load a backend dump
    pub fn from_json(text: &str) -> Result<Self, BackendError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn with_base_addr(mut self, base_addr: Address) -> Self {
        self.base_addr = base_addr;
        self
    }

    pub fn with_binary(mut self, binary: Vec<u8>) -> Self {
        self.binary = HexBytes(binary);
        self
    }

    /// Add a function as blocks of `(address, bytes)` instructions.
    pub fn with_function(mut self, entry: Address, blocks: Vec<Vec<(Address, Vec<u8>)>>) -> Self {
        let mut layout = Vec::with_capacity(blocks.len());
        for block in blocks {
            let mut addresses = Vec::with_capacity(block.len());
            for (address, bytes) in block {
                self.instructions.insert(address, HexBytes(bytes));
                addresses.push(address);
            }
            layout.push(addresses);
        }
        self.functions.insert(entry, layout);
        self
    }

    pub fn with_code_ref(mut self, from: Address, to: Address) -> Self {
        self.code_refs.insert((from, to));
        self
    }

    pub fn with_symbol(mut self, address: Address, name: impl Into<String>) -> Self {
        self.function_symbols.insert(address, name.into());
        self
    }

    pub fn with_api(mut self, address: Address, api: impl Into<String>) -> Self {
        self.api_map.insert(address, api.into());
        self
    }

    /// Take architecture, width, base address, imports and names from a parsed image.
    ///
    /// Names and imports already present win over the image's.
    pub fn with_image_info(mut self, info: &ImageInfo) -> Self {
        self.architecture = info.architecture;
        self.bitness = info.bitness;
        self.base_addr = info.base_addr;
        for (&address, api) in &info.api_map {
            self.api_map.entry(address).or_insert_with(|| api.clone());
        }
        for (&address, name) in &info.function_symbols {
            self.function_symbols
                .entry(address)
                .or_insert_with(|| name.clone());
        }
        self
    }

    /// Make every block fetch for `entry` fail.
    pub fn fail_function(mut self, entry: Address) -> Self {
        self.failing_functions.insert(entry);
        self
    }

    /// Make a whole-image query (`"functions"`, `"api_map"`, ...) fail.
    pub fn fail_query(mut self, call: &'static str) -> Self {
        self.failing_queries.insert(call);
        self
    }

    fn check(&self, call: &'static str) -> Result<(), BackendError> {
        if self.failing_queries.contains(call) {
            return Err(BackendError::Fetch {
                call,
                address: None,
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl BackendAdapter for InMemoryBackend {
    fn functions(&self) -> Result<BTreeSet<Address>, BackendError> {
        self.check("functions")?;
        Ok(self.functions.keys().copied().collect())
    }

    fn blocks(&self, function: Address) -> Result<Vec<Vec<Address>>, BackendError> {
        if self.failing_functions.contains(&function) {
            return Err(BackendError::Fetch {
                call: "blocks",
                address: Some(function),
                reason: "injected failure".into(),
            });
        }
        self.functions
            .get(&function)
            .cloned()
            .ok_or(BackendError::MissingFunction(function))
    }

    fn instruction_bytes(&self, address: Address) -> Result<Vec<u8>, BackendError> {
        self.instructions
            .get(&address)
            .map(|bytes| bytes.0.clone())
            .ok_or(BackendError::MissingInstruction(address))
    }

    fn code_in_refs(&self, address: Address) -> Result<Vec<(Address, Address)>, BackendError> {
        Ok(self
            .code_refs
            .iter()
            .filter(|(_, to)| *to == address)
            .copied()
            .collect())
    }

    fn code_out_refs(&self, address: Address) -> Result<Vec<(Address, Address)>, BackendError> {
        Ok(self
            .code_refs
            .range((address, Address::MIN)..=(address, Address::MAX))
            .copied()
            .collect())
    }

    fn function_symbols(&self) -> Result<BTreeMap<Address, String>, BackendError> {
        self.check("function_symbols")?;
        Ok(self.function_symbols.clone())
    }

    fn api_map(&self) -> Result<BTreeMap<Address, String>, BackendError> {
        self.check("api_map")?;
        Ok(self.api_map.clone())
    }

    fn architecture(&self) -> Result<Architecture, BackendError> {
        self.check("architecture")?;
        Ok(self.architecture)
    }

    fn bitness(&self) -> Result<Bitness, BackendError> {
        self.check("bitness")?;
        Ok(self.bitness)
    }

    fn base_addr(&self) -> Result<Address, BackendError> {
        self.check("base_addr")?;
        Ok(self.base_addr)
    }

    fn binary(&self) -> Result<Vec<u8>, BackendError> {
        self.check("binary")?;
        Ok(self.binary.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"{
        "architecture": "intel",
        "bitness": 32,
        "base_addr": 4194304,
        "binary": "e8fb0f0000c3",
        "functions": { "4198400": [[4198400, 4198405]] },
        "instructions": { "4198400": "e8fb0f0000", "4198405": "c3" },
        "code_refs": [[4198400, 4202496]],
        "function_symbols": { "4198400": "start" },
        "api_map": { "4202496": "kernel32.dll!ExitProcess" }
    }"#;

    #[test]
    fn test_load_dump() {
        let backend = InMemoryBackend::from_json(DUMP).unwrap();

        assert_eq!(backend.architecture().unwrap(), Architecture::X86);
        assert_eq!(backend.bitness().unwrap(), Bitness::Bits32);
        assert_eq!(backend.base_addr().unwrap(), 0x400000);
        assert_eq!(backend.binary().unwrap().len(), 6);
        assert_eq!(backend.functions().unwrap(), BTreeSet::from([0x401000]));
        assert_eq!(backend.blocks(0x401000).unwrap(), vec![vec![0x401000, 0x401005]]);
        assert_eq!(backend.instruction_bytes(0x401005).unwrap(), vec![0xc3]);
        assert_eq!(
            backend.api_map().unwrap()[&0x402000],
            "kernel32.dll!ExitProcess"
        );
    }

    #[test]
    fn test_bad_dump_is_rejected() {
        let err = InMemoryBackend::from_json(r#"{"architecture": "intel", "bitness": 12}"#)
            .unwrap_err();
        assert!(matches!(err, BackendError::Dump(_)));

        let err = InMemoryBackend::from_json(
            r#"{"architecture": "intel", "bitness": 32, "instructions": {"1": "zz"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::Dump(_)));
    }

    #[test]
    fn test_refs_by_direction() {
        let backend = InMemoryBackend::new(Architecture::X86, Bitness::Bits32)
            .with_code_ref(0x10, 0x20)
            .with_code_ref(0x10, 0x30)
            .with_code_ref(0x40, 0x20);

        assert_eq!(backend.code_out_refs(0x10).unwrap(), vec![(0x10, 0x20), (0x10, 0x30)]);
        assert_eq!(backend.code_in_refs(0x20).unwrap(), vec![(0x10, 0x20), (0x40, 0x20)]);
        assert!(backend.code_out_refs(0x20).unwrap().is_empty());
    }

    #[test]
    fn test_injected_failures() {
        let backend = InMemoryBackend::new(Architecture::X86, Bitness::Bits32)
            .with_function(0x10, vec![vec![(0x10, vec![0xc3])]])
            .fail_function(0x10)
            .fail_query("api_map");

        let err = backend.blocks(0x10).unwrap_err();
        assert_eq!(err.to_string(), "blocks failed at 0x10: injected failure");
        assert!(backend.api_map().is_err());
        assert!(backend.function_symbols().is_ok());
        assert!(matches!(
            backend.instruction_bytes(0x99),
            Err(BackendError::MissingInstruction(0x99))
        ));
    }

    #[test]
    fn test_image_info_does_not_override_backend_names() {
        let mut info = ImageInfo::new(Architecture::X86, Bitness::Bits64);
        info.base_addr = 0x140000000;
        info.function_symbols.insert(0x140001000, "exported_name".into());
        info.function_symbols.insert(0x140002000, "other".into());
        info.api_map.insert(0x140003000, "user32.dll!MessageBoxA".into());

        let backend = InMemoryBackend::new(Architecture::Unknown, Bitness::Bits32)
            .with_symbol(0x140001000, "backend_name")
            .with_image_info(&info);

        let names = backend.function_symbols().unwrap();
        assert_eq!(names[&0x140001000], "backend_name");
        assert_eq!(names[&0x140002000], "other");
        assert_eq!(backend.architecture().unwrap(), Architecture::X86);
        assert_eq!(backend.bitness().unwrap(), Bitness::Bits64);
        assert_eq!(backend.base_addr().unwrap(), 0x140000000);
        assert_eq!(backend.api_map().unwrap().len(), 1);
    }
}
