//! The export orchestrator: walks a backend and fills a `DisassemblyResult`.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::backend::{BackendAdapter, BackendError};
use crate::config::ExportConfig;
use crate::decoder::{CapstoneDecoder, DecoderError};
use crate::model::{BasicBlock, DisassemblyResult, ErrorRecord};
use crate::normalizer::normalize;
use crate::symbols::{ObjectSymbolProvider, SymbolProvider, SymbolResolver};
use crate::{Address, Architecture, Decoder, ExportError};

/// Everything learned about one function, committed only once it is complete.
#[derive(Debug, Default)]
struct StagedFunction {
    blocks: Vec<BasicBlock>,
    edges: Vec<(Address, Address)>,
    api_refs: Vec<(Address, String)>,
}

/// Drives one export run over a backend.
///
/// ```rust,no_run
/// use nuclide_export::backend::InMemoryBackend;
/// use nuclide_export::exporter::Exporter;
/// use nuclide_export::symbols::ObjectSymbolProvider;
/// use nuclide_export::{Architecture, Bitness};
///
/// let backend = InMemoryBackend::new(Architecture::X86, Bitness::Bits64);
/// let result = Exporter::new(backend)
///     .with_symbol_provider(ObjectSymbolProvider::new())
///     .run()
///     .unwrap();
/// println!("{} functions", result.functions.len());
/// ```
pub struct Exporter<B: BackendAdapter> {
    backend: B,
    decoder: Option<Box<dyn Decoder>>,
    providers: Vec<Box<dyn SymbolProvider>>,
    config: ExportConfig,
}

impl<B: BackendAdapter> Exporter<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            decoder: None,
            providers: Vec::new(),
            config: ExportConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExportConfig) -> Self {
        self.config = config;
        self
    }

    /// Decode with `decoder` instead of a Capstone decoder for the backend's target.
    pub fn with_decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Some(Box::new(decoder));
        self
    }

    /// Register a debug-symbol provider. Earlier providers win on conflicts.
    pub fn with_symbol_provider(mut self, provider: impl SymbolProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run a full export and return the resulting model.
    ///
    /// Only an unusable architecture or width aborts the
    /// run; failures for single functions or whole-image queries are
    /// recorded on the model instead.
    pub fn run(&mut self) -> Result<DisassemblyResult, ExportError> {
        let mut model = DisassemblyResult::new();
        model.analysis_start_ts = Some(Utc::now());

        let architecture = self.backend.architecture()?;
        if architecture == Architecture::Unknown {
            return Err(ExportError::UnsupportedArchitecture(architecture));
        }
        let bitness = match self.config.bitness {
            Some(bitness) => bitness,
            None => self.backend.bitness()?,
        };
        let auto_names = self.config.auto_names()?;
        model.architecture = architecture;
        model.bitness = Some(bitness);

        let owned_decoder;
        let decoder: &dyn Decoder = match &self.decoder {
            Some(decoder) => decoder.as_ref(),
            None => {
                owned_decoder = CapstoneDecoder::for_target(architecture, bitness).map_err(
                    |e| match e {
                        DecoderError::UnsupportedTarget(architecture, bitness) => {
                            ExportError::UnsupportedTarget {
                                architecture,
                                bitness,
                            }
                        }
                        other => ExportError::Decoder(other),
                    },
                )?;
                &owned_decoder
            }
        };

        let warnings = &mut model.warnings;
        model.base_addr = match self.config.base_addr {
            Some(base_addr) => base_addr,
            None => or_default(self.backend.base_addr(), warnings),
        };
        model.binary = or_default(self.backend.binary(), warnings);
        let backend_symbols = or_default(self.backend.function_symbols(), warnings);
        let api_map = or_default(self.backend.api_map(), warnings);
        let functions = or_default(self.backend.functions(), warnings);

        if self.providers.is_empty() && self.config.symbol_file.is_some() {
            self.providers.push(Box::new(
                ObjectSymbolProvider::new().with_demangling(self.config.demangle),
            ));
        }
        model.symbol_file = self.config.symbol_file.clone();

        let mut resolver = SymbolResolver::new(auto_names);
        resolver.add_backend_symbols(&backend_symbols);
        for provider in &mut self.providers {
            provider.update(self.config.symbol_file.as_deref(), &model.binary, model.base_addr);
            resolver.add_provider(&**provider);
        }
        resolver.add_api_map(&api_map);
        model.function_symbols = resolver.function_symbols();

        log::info!(
            "exporting {} functions ({}, {} bit, base 0x{:x})",
            functions.len(),
            architecture,
            bitness,
            model.base_addr
        );

        for entry in functions {
            match Self::export_function(&self.backend, decoder, &resolver, entry, &mut model.errors) {
                Ok(staged) => commit(&mut model, entry, staged),
                Err(e) => {
                    log::warn!("skipping function 0x{:x}: {}", entry, e);
                    model.skipped_functions.insert(entry, e.to_string());
                }
            }
        }

        model.classify_functions();
        model.analysis_end_ts = Some(Utc::now());

        log::info!(
            "export done: {} functions, {} instructions, {} code refs, {} errors, {} skipped",
            model.functions.len(),
            model.instruction_count(),
            model.code_refs.edge_count(),
            model.errors.len(),
            model.skipped_functions.len()
        );
        Ok(model)
    }

    /// Fetch and normalize one function without touching the model's graph.
    fn export_function(
        backend: &B,
        decoder: &dyn Decoder,
        resolver: &SymbolResolver,
        entry: Address,
        errors: &mut BTreeMap<Address, ErrorRecord>,
    ) -> Result<StagedFunction, BackendError> {
        let mut staged = StagedFunction::default();

        for addresses in backend.blocks(entry)? {
            let Some(&start) = addresses.first() else {
                log::debug!("empty block in function 0x{:x}", entry);
                continue;
            };
            let mut block = BasicBlock::new(start);

            for address in addresses {
                let raw = backend.instruction_bytes(address)?;
                let insn = normalize(decoder, address, &raw, errors);

                staged.edges.extend(backend.code_in_refs(address)?);
                for (from, to) in backend.code_out_refs(address)? {
                    staged.edges.push((from, to));
                    if let Some(api) = resolver.resolve_api(to) {
                        staged.api_refs.push((address, api.to_string()));
                    }
                }
                block.add_instruction(insn);
            }
            staged.blocks.push(block);
        }

        log::debug!(
            "function 0x{:x}: {} blocks, {} refs",
            entry,
            staged.blocks.len(),
            staged.edges.len()
        );
        Ok(staged)
    }
}

fn commit(model: &mut DisassemblyResult, entry: Address, staged: StagedFunction) {
    for insn in staged.blocks.iter().flat_map(|block| block.insns.iter()) {
        model.index_instruction(insn);
    }
    for (from, to) in staged.edges {
        model.add_code_ref(from, to);
    }
    model.addr_to_api.extend(staged.api_refs);
    model.functions.insert(entry, staged.blocks);
}

/// Whole-image queries fall back to an empty value and leave a warning.
fn or_default<T: Default>(result: Result<T, BackendError>, warnings: &mut Vec<String>) -> T {
    result.unwrap_or_else(|e| {
        log::warn!("{}; continuing without it", e);
        warnings.push(e.to_string());
        T::default()
    })
}
