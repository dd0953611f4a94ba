//! Symbol sources and the resolver that merges them.
//!
//! Names come from three places, in decreasing order of trust:
//! 1. the backend itself (names a human or the disassembler assigned),
//! 2. debug-symbol providers, matched by relocated address,
//! 3. the import map, for addresses that are import entry points.
//!
//! Backend placeholders such as `sub_401000` never count as names, so a
//! lower-precedence source can still supply the real one.

mod debug_file;
pub mod demangle;

pub use self::debug_file::{ObjectSymbolProvider, SymbolError};

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::Address;

/// Placeholder names backends generate for unnamed code.
pub const DEFAULT_AUTO_NAME_PATTERNS: &[&str] = &[
    r"^sub_[0-9a-fA-F]+$",
    r"^fcn\.[0-9a-fA-F]+$",
    r"^FUN_[0-9a-fA-F]+$",
    r"^func_(0x)?[0-9a-fA-F]+$",
    r"^loc_[0-9a-fA-F]+$",
];

static DEFAULT_AUTO_NAMES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new(DEFAULT_AUTO_NAME_PATTERNS).expect("default auto-name patterns are valid")
});

/// Recognizes backend-generated placeholder names.
#[derive(Debug, Clone)]
pub struct AutoNamePatterns {
    set: RegexSet,
}

impl AutoNamePatterns {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            set: RegexSet::new(patterns)?,
        })
    }

    pub fn is_auto_name(&self, name: &str) -> bool {
        self.set.is_match(name)
    }
}

impl Default for AutoNamePatterns {
    fn default() -> Self {
        Self {
            set: DEFAULT_AUTO_NAMES.clone(),
        }
    }
}

/// A debug-symbol source.
///
/// Providers must never fail a run: a missing, unreadable or foreign file
/// simply leaves them without symbols.
pub trait SymbolProvider {
    /// (Re)scan `file_path`; addresses are relocated against `base_addr`.
    fn update(&mut self, file_path: Option<&Path>, binary: &[u8], base_addr: Address);

    fn get_symbol(&self, address: Address) -> Option<&str>;

    /// All function symbols found by the last `update`
    fn function_symbols(&self) -> &BTreeMap<Address, String>;
}

/// Merges backend, debug and import names behind one lookup.
#[derive(Debug, Clone, Default)]
pub struct SymbolResolver {
    patterns: AutoNamePatterns,
    backend: BTreeMap<Address, String>,
    debug: BTreeMap<Address, String>,
    apis: BTreeMap<Address, String>,
}

impl SymbolResolver {
    pub fn new(patterns: AutoNamePatterns) -> Self {
        Self {
            patterns,
            ..Self::default()
        }
    }

    /// Add the backend's native names, dropping placeholders.
    pub fn add_backend_symbols(&mut self, symbols: &BTreeMap<Address, String>) {
        for (&address, name) in symbols {
            if name.is_empty() || self.patterns.is_auto_name(name) {
                continue;
            }
            self.backend.insert(address, name.clone());
        }
    }

    /// Add every name a provider knows. Earlier providers win on conflicts.
    pub fn add_provider(&mut self, provider: &dyn SymbolProvider) {
        for (&address, name) in provider.function_symbols() {
            if name.is_empty() || self.patterns.is_auto_name(name) {
                continue;
            }
            self.debug.entry(address).or_insert_with(|| name.clone());
        }
    }

    pub fn add_api_map(&mut self, api_map: &BTreeMap<Address, String>) {
        self.apis
            .extend(api_map.iter().map(|(&address, api)| (address, api.clone())));
    }

    /// Best name for `address`, if any source has one
    pub fn resolve(&self, address: Address) -> Option<&str> {
        self.backend
            .get(&address)
            .or_else(|| self.debug.get(&address))
            .or_else(|| self.apis.get(&address))
            .map(String::as_str)
    }

    /// `module!symbol` if `address` is an import entry point
    pub fn resolve_api(&self, address: Address) -> Option<&str> {
        self.apis.get(&address).map(String::as_str)
    }

    /// Function names with precedence applied; imports are not included.
    pub fn function_symbols(&self) -> BTreeMap<Address, String> {
        let mut merged = self.debug.clone();
        merged.extend(
            self.backend
                .iter()
                .map(|(&address, name)| (address, name.clone())),
        );
        merged
    }
}
