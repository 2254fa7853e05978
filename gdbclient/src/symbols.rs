/// Symbol tables and address resolution
///
/// Tables are built by a [`SymbolSource`] (or the built-in kernel fallback),
/// then installed into a [`SymbolResolver`] as an immutable snapshot. Lookups
/// never see a half-built table.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use serde::{Deserialize, Serialize};

use crate::pe::DebugDescriptor;

/// Relaxed matches further than this from their symbol are flagged
pub const LOW_CONFIDENCE_THRESHOLD: u64 = 4096;

/// Module name the kernel's symbols are installed under
pub const KERNEL_MODULE: &str = "ntoskrnl.exe";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// How strictly an address must fall inside a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupStrategy {
    /// Exact first, then Relaxed
    #[default]
    Default,
    /// Address lies within the symbol's declared size
    Exact,
    /// Address lies between the symbol and the next one
    Relaxed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolMatch {
    pub module: String,
    pub name: String,
    pub offset: u64,
    pub low_confidence: bool,
}

impl std::fmt::Display for SymbolMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if self.low_confidence {
            write!(f, "?")?;
        }
        if self.offset != 0 {
            write!(f, "+{:#x}", self.offset)?;
        }
        Ok(())
    }
}

/// Symbols of one module, sorted by address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSymbols {
    name: String,
    symbols: Vec<Symbol>,
}

impl ModuleSymbols {
    pub fn new(name: impl Into<String>, mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.address);
        symbols.dedup_by_key(|s| s.address);
        Self {
            name: name.into(),
            symbols,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Index of the last symbol at or below `address`
    fn floor(&self, address: u64) -> Option<usize> {
        match self.symbols.partition_point(|s| s.address <= address) {
            0 => None,
            n => Some(n - 1),
        }
    }

    fn lookup_exact(&self, address: u64) -> Option<SymbolMatch> {
        let symbol = &self.symbols[self.floor(address)?];
        let offset = address - symbol.address;
        if symbol.size > 0 && offset < symbol.size {
            Some(self.make_match(symbol, offset, false))
        } else {
            None
        }
    }

    fn lookup_relaxed(&self, address: u64) -> Option<SymbolMatch> {
        let index = self.floor(address)?;
        let symbol = &self.symbols[index];
        if let Some(next) = self.symbols.get(index + 1) {
            if address >= next.address {
                return None;
            }
        }
        let offset = address - symbol.address;
        Some(self.make_match(symbol, offset, offset > LOW_CONFIDENCE_THRESHOLD))
    }

    fn make_match(&self, symbol: &Symbol, offset: u64, low_confidence: bool) -> SymbolMatch {
        SymbolMatch {
            module: self.name.clone(),
            name: symbol.name.clone(),
            offset,
            low_confidence,
        }
    }
}

/// `module name -> symbols`; replaced as a whole, never edited in place
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    modules: BTreeMap<String, ModuleSymbols>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, module: ModuleSymbols) -> Self {
        self.modules.insert(module.name.clone(), module);
        self
    }

    pub fn module(&self, name: &str) -> Option<&ModuleSymbols> {
        self.modules.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleSymbols> {
        self.modules.values()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules may interleave in the address space, so every module is
    /// asked and the closest symbol below `address` wins.
    pub fn lookup(&self, address: u64, strategy: LookupStrategy) -> Option<SymbolMatch> {
        match strategy {
            LookupStrategy::Exact => self.nearest(|m| m.lookup_exact(address)),
            LookupStrategy::Relaxed => self.nearest(|m| m.lookup_relaxed(address)),
            LookupStrategy::Default => self
                .lookup(address, LookupStrategy::Exact)
                .or_else(|| self.lookup(address, LookupStrategy::Relaxed)),
        }
    }

    fn nearest<F>(&self, lookup: F) -> Option<SymbolMatch>
    where
        F: Fn(&ModuleSymbols) -> Option<SymbolMatch>,
    {
        self.modules.values().filter_map(lookup).min_by_key(|m| m.offset)
    }
}

/// Shared, atomically swapped view of the current symbol table
#[derive(Default)]
pub struct SymbolResolver {
    table: RwLock<Arc<SymbolTable>>,
}

impl SymbolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<SymbolTable> {
        Arc::clone(&self.table.read().unwrap())
    }

    pub fn install(&self, table: SymbolTable) {
        *self.table.write().unwrap() = Arc::new(table);
    }

    /// Add or replace one module, publishing a new snapshot
    pub fn install_module(&self, module: ModuleSymbols) {
        let mut table = self.table.write().unwrap();
        let next = (**table).clone().with_module(module);
        *table = Arc::new(next);
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.snapshot().module(name).is_some()
    }

    pub fn clear(&self) {
        self.install(SymbolTable::new());
    }

    pub fn lookup(&self, address: u64, strategy: LookupStrategy) -> Option<SymbolMatch> {
        self.snapshot().lookup(address, strategy)
    }
}

/// Produces symbols for a module identified by its CodeView descriptor.
/// Called on a blocking worker thread.
pub trait SymbolSource: Send + Sync {
    fn load_symbols(&self, descriptor: &DebugDescriptor, base: u64) -> Option<Vec<Symbol>>;
}

/// A source that never finds anything
pub struct NoSymbols;

impl SymbolSource for NoSymbols {
    fn load_symbols(&self, _descriptor: &DebugDescriptor, _base: u64) -> Option<Vec<Symbol>> {
        None
    }
}

/// One entry of a symbol file; `rva` is relative to the module base
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub name: String,
    pub rva: u64,
    #[serde(default)]
    pub size: u64,
}

/// Reads pre-extracted symbol lists laid out like a symbol store:
/// `<root>/<pdb name>/<GUID><age>/symbols.json`, each a JSON array of
/// [`SymbolRecord`]
pub struct JsonSymbolStore {
    root: PathBuf,
}

impl JsonSymbolStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, descriptor: &DebugDescriptor) -> PathBuf {
        self.root
            .join(&descriptor.pdb_name)
            .join(descriptor.symbol_key())
            .join("symbols.json")
    }
}

impl SymbolSource for JsonSymbolStore {
    fn load_symbols(&self, descriptor: &DebugDescriptor, base: u64) -> Option<Vec<Symbol>> {
        let path = self.path_for(descriptor);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                log::debug!("No symbol file at {}: {}", path.display(), e);
                return None;
            }
        };

        let records: Vec<SymbolRecord> = match serde_json::from_str(&text) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Invalid symbol file {}: {}", path.display(), e);
                return None;
            }
        };

        Some(
            records
                .into_iter()
                .map(|r| Symbol {
                    name: r.name,
                    address: base.wrapping_add(r.rva),
                    size: r.size,
                })
                .collect(),
        )
    }
}

/// Well-known kernel exports at fixed offsets, used when no real symbols
/// can be loaded. The offsets are approximate.
pub fn kernel_fallback_symbols(base: u64) -> Vec<Symbol> {
    const KNOWN: [(&str, u64, u64); 9] = [
        ("KeInitializeProcess", 0x1A000, 0x100),
        ("PsCreateSystemThread", 0x1A200, 0x150),
        ("IoCreateDevice", 0x1B000, 0x200),
        ("ObRegisterCallbacks", 0x1C500, 0x180),
        ("ExAllocatePoolWithTag", 0x1D800, 0x120),
        ("ExFreePoolWithTag", 0x1DA00, 0x100),
        ("MmMapIoSpace", 0x1F200, 0x150),
        ("ZwCreateFile", 0x20500, 0x200),
        ("RtlInitUnicodeString", 0x21700, 0x100),
    ];

    KNOWN
        .iter()
        .map(|(name, offset, size)| Symbol {
            name: name.to_string(),
            address: base.wrapping_add(*offset),
            size: *size,
        })
        .collect()
}
