//! The disassembly result model: functions, blocks, references, classification and symbols.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use petgraph::algo::kosaraju_scc;
use petgraph::graphmap::DiGraphMap;
use rayon::prelude::*;
use serde::Serialize;

use crate::xref::CodeRefGraph;
use crate::{Address, Architecture, Bitness, Insn};

/// One basic block, in the instruction order the backend delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasicBlock {
    /// Address of the first instruction
    pub start: Address,
    /// Instructions within this basic block
    pub insns: Vec<Insn>,
}

impl BasicBlock {
    /// Create a new, empty basic block
    pub fn new(start: Address) -> Self {
        Self {
            start,
            insns: Vec::new(),
        }
    }

    /// Address just past the last instruction in the block
    pub fn end_address(&self) -> Option<Address> {
        self.insns.last().map(Insn::end_address)
    }

    /// Add an instruction to this basic block
    pub fn add_instruction(&mut self, insn: Insn) {
        self.insns.push(insn);
    }

    /// Get the last instruction in the block
    pub fn last_instruction(&self) -> Option<&Insn> {
        self.insns.last()
    }

    /// Get the size of the block in bytes
    pub fn size(&self) -> usize {
        self.insns.iter().map(|i| i.size).sum()
    }

    pub fn instruction_addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.insns.iter().map(|i| i.addr)
    }
}

/// Kind of a recorded per-address error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The decoder produced nothing for the backend's bytes
    DecodeFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::DecodeFailure => write!(f, "decode failure"),
        }
    }
}

/// An entry of the error ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    /// The offending bytes as lowercase hex
    pub instruction_bytes: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, bytes: &[u8]) -> Self {
        Self {
            kind,
            instruction_bytes: hex::encode(bytes),
        }
    }
}

/// Everything one export run learned about a binary.
///
/// Built empty at the start of a run and filled in by the exporter; a new
/// run always starts from a fresh instance.
#[derive(Debug, Clone, Serialize)]
pub struct DisassemblyResult {
    pub analysis_start_ts: Option<DateTime<Utc>>,
    pub analysis_end_ts: Option<DateTime<Utc>>,
    pub base_addr: Address,
    #[serde(skip)]
    pub binary: Vec<u8>,
    pub architecture: Architecture,
    pub bitness: Option<Bitness>,
    pub symbol_file: Option<PathBuf>,
    /// Function entry -> blocks
    pub functions: BTreeMap<Address, Vec<BasicBlock>>,
    /// Instruction address -> (mnemonic, size)
    pub instructions: BTreeMap<Address, (String, usize)>,
    pub code_refs: CodeRefGraph,
    pub recursive_functions: BTreeSet<Address>,
    pub leaf_functions: BTreeSet<Address>,
    /// Error ledger, keyed by instruction address
    pub errors: BTreeMap<Address, ErrorRecord>,
    pub function_symbols: BTreeMap<Address, String>,
    /// Call/jump site -> "module!symbol" of the import it targets
    pub addr_to_api: BTreeMap<Address, String>,
    /// Functions dropped because the backend failed while fetching them
    pub skipped_functions: BTreeMap<Address, String>,
    /// Whole-image backend queries that failed and fell back to defaults
    pub warnings: Vec<String>,
}

impl Default for DisassemblyResult {
    fn default() -> Self {
        Self::new()
    }
}

impl DisassemblyResult {
    pub fn new() -> Self {
        Self {
            analysis_start_ts: None,
            analysis_end_ts: None,
            base_addr: 0,
            binary: Vec::new(),
            architecture: Architecture::Unknown,
            bitness: None,
            symbol_file: None,
            functions: BTreeMap::new(),
            instructions: BTreeMap::new(),
            code_refs: CodeRefGraph::new(),
            recursive_functions: BTreeSet::new(),
            leaf_functions: BTreeSet::new(),
            errors: BTreeMap::new(),
            function_symbols: BTreeMap::new(),
            addr_to_api: BTreeMap::new(),
            skipped_functions: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Insert a code reference; both directions are maintained.
    pub fn add_code_ref(&mut self, from: Address, to: Address) -> bool {
        self.code_refs.add_code_ref(from, to)
    }

    /// Insert or replace the flat index entry for `insn`.
    pub fn index_instruction(&mut self, insn: &Insn) {
        self.instructions
            .insert(insn.addr, (insn.mnemonic.clone(), insn.size));
    }

    pub fn function_entries(&self) -> impl Iterator<Item = Address> + '_ {
        self.functions.keys().copied()
    }

    pub fn is_function_entry(&self, address: Address) -> bool {
        self.functions.contains_key(&address)
    }

    /// Blocks of the function at `entry`, if it was exported
    pub fn blocks(&self, entry: Address) -> Option<&[BasicBlock]> {
        self.functions.get(&entry).map(Vec::as_slice)
    }

    /// All instructions of a function, block by block
    pub fn function_instructions(&self, entry: Address) -> impl Iterator<Item = &Insn> + '_ {
        self.functions
            .get(&entry)
            .into_iter()
            .flat_map(|blocks| blocks.iter().flat_map(|block| block.insns.iter()))
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn block_count(&self) -> usize {
        self.functions.values().map(Vec::len).sum()
    }

    /// Function entries (own entry included) that `entry` transfers control to
    pub fn function_calls(&self, entry: Address) -> BTreeSet<Address> {
        self.function_instructions(entry)
            .flat_map(|insn| self.code_refs.out_refs(insn.addr))
            .filter(|target| self.is_function_entry(*target))
            .collect()
    }

    /// Function-entry to function-entry edges induced by the code references.
    ///
    /// Built fresh on every call, walking every instruction and its out-refs.
    pub fn call_graph(&self) -> BTreeMap<Address, BTreeSet<Address>> {
        self.functions
            .par_iter()
            .map(|(&entry, _)| (entry, self.function_calls(entry)))
            .collect()
    }

    /// Functions with at least one reference into `entry`.
    ///
    /// Rebuilds the call graph, so each query walks the whole model; use
    /// [`Self::call_graph`] once when asking about many functions.
    pub fn callers_of(&self, entry: Address) -> BTreeSet<Address> {
        self.call_graph()
            .into_iter()
            .filter(|(_, callees)| callees.contains(&entry))
            .map(|(caller, _)| caller)
            .collect()
    }

    /// True if `entry` references no function entry at all, its own included
    pub fn is_leaf_function(&self, entry: Address) -> bool {
        self.is_function_entry(entry) && self.function_calls(entry).is_empty()
    }

    /// True if `entry` can reach itself through the call graph.
    ///
    /// Only the functions reachable from `entry` are visited. After
    /// [`Self::classify_functions`] the same answer is in `recursive_functions`.
    pub fn is_recursive_function(&self, entry: Address) -> bool {
        if !self.is_function_entry(entry) {
            return false;
        }
        let mut visited = BTreeSet::new();
        let mut stack: Vec<Address> = self.function_calls(entry).into_iter().collect();

        while let Some(node) = stack.pop() {
            if node == entry {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            stack.extend(
                self.function_calls(node)
                    .into_iter()
                    .filter(|callee| !visited.contains(callee)),
            );
        }
        false
    }

    /// Recompute `recursive_functions` and `leaf_functions` from the current edges.
    pub fn classify_functions(&mut self) {
        let graph = self.call_graph();

        self.leaf_functions = graph
            .iter()
            .filter(|(_, callees)| callees.is_empty())
            .map(|(&entry, _)| entry)
            .collect();
        self.recursive_functions = recursive_entries(&graph);
    }

    pub fn function_name(&self, address: Address) -> Option<&str> {
        self.function_symbols.get(&address).map(String::as_str)
    }

    /// Import the instruction at `address` calls or jumps to
    pub fn api_at(&self, address: Address) -> Option<&str> {
        self.addr_to_api.get(&address).map(String::as_str)
    }

    pub fn analysis_duration(&self) -> Option<Duration> {
        Some(self.analysis_end_ts? - self.analysis_start_ts?)
    }
}

/// Entries that sit on a call-graph cycle: members of a strongly connected
/// component with more than one function, or functions calling themselves.
fn recursive_entries(graph: &BTreeMap<Address, BTreeSet<Address>>) -> BTreeSet<Address> {
    let mut call_graph = DiGraphMap::<Address, ()>::new();
    for (&caller, callees) in graph {
        call_graph.add_node(caller);
        for &callee in callees {
            call_graph.add_edge(caller, callee, ());
        }
    }

    kosaraju_scc(&call_graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || call_graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .collect()
}
