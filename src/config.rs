//! Transformation configuration (`spec.md` §6). A plain builder struct with
//! `set_*` methods returning `&mut Self`, mirroring `wasmi::Config` in
//! `crates/wasmi/src/engine/config.rs`; no file-format parsing (out of
//! scope per `spec.md` §1) — construction is purely programmatic.

use crate::matcher::{ImportMatcher, NameMatcher};

/// Configures one [`crate::transform`] invocation.
#[derive(Debug, Clone, Default)]
pub struct Config {
    import_matcher: Option<ImportMatcher>,
    ignore_imports: bool,
    ignore_indirect: bool,
    add_list: Option<NameMatcher>,
    remove_list: Option<NameMatcher>,
    only_list: Option<NameMatcher>,
    propagate_add_list: bool,
    assertions: bool,
    use_secondary_memory: bool,
    secondary_memory_pages: u64,
    memory_index: u32,
    import_globals: bool,
    export_globals: bool,
    wasm64: bool,
}

impl Config {
    pub fn new() -> Self {
        Self {
            secondary_memory_pages: 1,
            ..Default::default()
        }
    }

    /// Sets the predicate that decides whether an imported function is an
    /// async import.
    pub fn set_import_matcher(&mut self, matcher: ImportMatcher) -> &mut Self {
        self.import_matcher = Some(matcher);
        self
    }

    pub fn import_matcher(&self) -> Option<&ImportMatcher> {
        self.import_matcher.as_ref()
    }

    /// If set, no import is considered async; only indirect calls and
    /// add-list entries can trigger transformation. Default `false`.
    pub fn set_ignore_imports(&mut self, value: bool) -> &mut Self {
        self.ignore_imports = value;
        self
    }

    pub fn ignore_imports(&self) -> bool {
        self.ignore_imports
    }

    /// If set, `call_indirect`/`call_ref` are not treated as async call
    /// sites. Default `false`.
    pub fn set_ignore_indirect(&mut self, value: bool) -> &mut Self {
        self.ignore_indirect = value;
        self
    }

    pub fn ignore_indirect(&self) -> bool {
        self.ignore_indirect
    }

    /// Exported functions matching this predicate are added to the async
    /// set (`spec.md` §4.5 step 7).
    pub fn set_add_list(&mut self, matcher: NameMatcher) -> &mut Self {
        self.add_list = Some(matcher);
        self
    }

    pub fn add_list(&self) -> Option<&NameMatcher> {
        self.add_list.as_ref()
    }

    /// Exported functions matching this predicate are removed from the
    /// async set after every other inclusion rule has run.
    pub fn set_remove_list(&mut self, matcher: NameMatcher) -> &mut Self {
        self.remove_list = Some(matcher);
        self
    }

    pub fn remove_list(&self) -> Option<&NameMatcher> {
        self.remove_list.as_ref()
    }

    /// If set, restricts the async set to the transitive callees of exported
    /// functions matching this predicate.
    pub fn set_only_list(&mut self, matcher: NameMatcher) -> &mut Self {
        self.only_list = Some(matcher);
        self
    }

    pub fn only_list(&self) -> Option<&NameMatcher> {
        self.only_list.as_ref()
    }

    /// Apply the transitive-callers closure to add-list entries too, not
    /// just import-matched functions. Default `false`.
    pub fn set_propagate_add_list(&mut self, value: bool) -> &mut Self {
        self.propagate_add_list = value;
        self
    }

    pub fn propagate_add_list(&self) -> bool {
        self.propagate_add_list
    }

    /// Emit `if (state != Normal) unreachable` guards at the top of every
    /// non-transformed function body. Default `false`.
    pub fn set_assertions(&mut self, value: bool) -> &mut Self {
        self.assertions = value;
        self
    }

    pub fn assertions(&self) -> bool {
        self.assertions
    }

    /// Add a dedicated memory for the asyncify data buffer instead of using
    /// an existing one. Default `false`.
    pub fn set_use_secondary_memory(&mut self, value: bool) -> &mut Self {
        self.use_secondary_memory = value;
        self
    }

    pub fn use_secondary_memory(&self) -> bool {
        self.use_secondary_memory
    }

    /// Page count for the secondary memory, if [`Self::set_use_secondary_memory`]
    /// is set. Default `1`.
    pub fn set_secondary_memory_pages(&mut self, pages: u64) -> &mut Self {
        self.secondary_memory_pages = pages;
        self
    }

    pub fn secondary_memory_pages(&self) -> u64 {
        self.secondary_memory_pages
    }

    /// 0-based index into the imported+defined memory space used for
    /// asyncify load/store operations. Default `0`; validated against the
    /// module's memory count (`spec.md` §4.5 step 6).
    pub fn set_memory_index(&mut self, index: u32) -> &mut Self {
        self.memory_index = index;
        self
    }

    pub fn memory_index(&self) -> u32 {
        self.memory_index
    }

    /// Import the state/data globals from module `asyncify` instead of
    /// defining them. Mutually exclusive with [`Self::set_export_globals`].
    /// Default `false`.
    pub fn set_import_globals(&mut self, value: bool) -> &mut Self {
        self.import_globals = value;
        self
    }

    pub fn import_globals(&self) -> bool {
        self.import_globals
    }

    /// Export the state/data globals under fixed names. Default `false`.
    pub fn set_export_globals(&mut self, value: bool) -> &mut Self {
        self.export_globals = value;
        self
    }

    pub fn export_globals(&self) -> bool {
        self.export_globals
    }

    /// Use `i64` pointer parameters and 8-byte header offsets for the
    /// start_unwind/start_rewind helpers. Default `false`.
    pub fn set_wasm64(&mut self, value: bool) -> &mut Self {
        self.wasm64 = value;
        self
    }

    pub fn wasm64(&self) -> bool {
        self.wasm64
    }

    pub(crate) fn ptr_val_type(&self) -> wasm_encoder::ValType {
        if self.wasm64 {
            wasm_encoder::ValType::I64
        } else {
            wasm_encoder::ValType::I32
        }
    }

    pub(crate) fn ptr_wp_val_type(&self) -> wasmparser::ValType {
        if self.wasm64 {
            wasmparser::ValType::I64
        } else {
            wasmparser::ValType::I32
        }
    }
}

// `Config` holds `Arc<dyn Fn(...) + Send + Sync>` matcher closures; this
// static check guards against a future matcher variant silently dropping
// `Send`/`Sync` and making `Config` unusable across thread boundaries, the
// way `wasmi::Config` already is for free (it holds no closures at all).
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Config>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::new();
        assert!(!config.ignore_imports());
        assert!(!config.ignore_indirect());
        assert!(!config.assertions());
        assert!(!config.use_secondary_memory());
        assert_eq!(config.secondary_memory_pages(), 1);
        assert_eq!(config.memory_index(), 0);
        assert!(!config.import_globals());
        assert!(!config.export_globals());
        assert!(!config.wasm64());
    }

    #[test]
    fn builder_methods_chain() {
        let mut config = Config::new();
        config
            .set_ignore_indirect(true)
            .set_memory_index(1)
            .set_wasm64(true);
        assert!(config.ignore_indirect());
        assert_eq!(config.memory_index(), 1);
        assert!(config.wasm64());
    }
}
