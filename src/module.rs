//! The decoded module IR this crate rewrites.
//!
//! Shaped after a plain section-oriented `Module` struct (one field per core
//! Wasm section), the way a hand-rolled binary-format IR is usually laid out
//! in this corpus rather than being coupled to an execution engine. Decoding
//! happens once, in [`decode::decode`]; re-encoding happens once, in
//! [`encode::encode`]. Everything in between — call graph, liveness, the
//! function transformer — operates purely on these types.

mod decode;
mod encode;

pub use decode::{decode, decode_function_body};
pub use encode::encode;

use wasmparser::{GlobalType, MemoryType, RefType, TableType, ValType};

use crate::instr::Instr;

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub types: Vec<wasmparser::FuncType>,
    pub imports: Vec<Import>,
    /// Type index of each *defined* (non-imported) function, in index-space
    /// order after imports.
    pub functions: Vec<u32>,
    pub tables: Vec<TableType>,
    pub memories: Vec<MemoryType>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    pub data_count_section_present: bool,
    /// Defined-function bodies, parallel to `functions`.
    pub code: Vec<FunctionBody>,
    pub start: Option<u32>,
    /// Preserved byte-for-byte and re-emitted in original order; a custom
    /// section is never interpreted, only carried through.
    pub customs: Vec<CustomSection>,
}

impl Module {
    /// Number of functions in the combined import+defined index space.
    pub fn imported_func_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Func(_)))
            .count() as u32
    }

    pub fn func_count(&self) -> u32 {
        self.imported_func_count() + self.functions.len() as u32
    }

    /// Type index of function `idx` in the combined index space, or `None`
    /// if `idx` is out of range.
    pub fn func_type_index(&self, idx: u32) -> Option<u32> {
        let imported = self.imported_func_count();
        if idx < imported {
            self.imports
                .iter()
                .filter_map(|i| match i.kind {
                    ImportKind::Func(ty) => Some(ty),
                    _ => None,
                })
                .nth(idx as usize)
        } else {
            self.functions.get((idx - imported) as usize).copied()
        }
    }

    pub fn func_type(&self, idx: u32) -> Option<&wasmparser::FuncType> {
        self.func_type_index(idx).and_then(|ty| self.types.get(ty as usize))
    }

    pub fn memory_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Memory(_)))
            .count() as u32
            + self.memories.len() as u32
    }

    pub fn global_count(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Global(_)))
            .count() as u32
            + self.globals.len() as u32
    }

    /// Resolves a global's type across the imported+defined index space, the
    /// way [`Self::func_type`] does for functions. Needed by the stack
    /// simulator to resolve `global.get`/`global.set`'s instruction-dependent
    /// effect (`spec.md` §4.3).
    pub fn global_type(&self, idx: u32) -> Option<GlobalType> {
        let imported = self
            .imports
            .iter()
            .filter_map(|i| match i.kind {
                ImportKind::Global(ty) => Some(ty),
                _ => None,
            });
        let imported_count = self
            .imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Global(_)))
            .count();
        if (idx as usize) < imported_count {
            imported.clone().nth(idx as usize)
        } else {
            self.globals.get(idx as usize - imported_count).map(|g| g.ty)
        }
    }

    /// Resolves a table's type across the imported+defined index space; see
    /// [`Self::global_type`]. Needed to reject reference-typed values
    /// produced by `table.get` et al. in a transformed function.
    pub fn table_type(&self, idx: u32) -> Option<TableType> {
        let imported_count = self
            .imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Table(_)))
            .count();
        if (idx as usize) < imported_count {
            self.imports
                .iter()
                .filter_map(|i| match i.kind {
                    ImportKind::Table(ty) => Some(ty),
                    _ => None,
                })
                .nth(idx as usize)
        } else {
            self.tables.get(idx as usize - imported_count).copied()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone)]
pub enum ImportKind {
    Func(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

#[derive(Debug, Clone)]
pub struct Global {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
}

/// A constant initializer expression, as used by globals, element segment
/// offsets, and data segment offsets. `spec.md` only requires these four
/// shapes; anything else is rejected as [`crate::error::MalformedError::InitExpr`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    GlobalGet(u32),
    RefNull(ValType),
    RefFunc(u32),
}

#[derive(Debug, Clone)]
pub struct ElementSegment {
    pub kind: ElementKind,
    pub ty: RefType,
    pub items: ElementItems,
}

#[derive(Debug, Clone)]
pub enum ElementKind {
    Active { table_index: u32, offset: ConstExpr },
    Passive,
    Declared,
}

#[derive(Debug, Clone)]
pub enum ElementItems {
    Functions(Vec<u32>),
    Expressions(Vec<ConstExpr>),
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub kind: DataKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum DataKind {
    Active { memory_index: u32, offset: ConstExpr },
    Passive,
}

#[derive(Debug, Clone)]
pub struct CustomSection {
    pub name: String,
    pub data: Vec<u8>,
}

/// A defined function's body.
///
/// Functions outside the async set are never decoded past their raw bytes —
/// they are spliced back into the encoded output unchanged, which is what
/// makes "non-transformed functions are byte-identical in the output" hold
/// by construction rather than by careful re-encoding.
#[derive(Debug, Clone)]
pub enum FunctionBody {
    Raw(Vec<u8>),
    Decoded {
        locals: Vec<(u32, ValType)>,
        instrs: Vec<Instr>,
    },
}

impl FunctionBody {
    pub fn is_decoded(&self) -> bool {
        matches!(self, Self::Decoded { .. })
    }
}
