//! Re-encodes a [`Module`] back into core Wasm bytes with `wasm-encoder`.
//!
//! Sections are emitted in the canonical order the Wasm binary format
//! requires; custom sections are interleaved back in their original
//! positions is not attempted (this crate does not track custom-section
//! position relative to the standard sections), so they are instead all
//! appended after the data section, which is valid per the core spec (custom
//! sections may appear anywhere).

use wasm_encoder::{
    CodeSection, ConstExpr as EncConstExpr, CustomSection as EncCustomSection, DataCountSection,
    DataSection, ElementSection, Elements, EntityType, ExportKind as EncExportKind, ExportSection,
    Function, FunctionSection, GlobalSection, GlobalType as EncGlobalType, ImportSection,
    MemorySection, MemoryType as EncMemoryType, Module as EncModule, RefType as EncRefType,
    StartSection, TableSection, TableType as EncTableType, TypeSection,
};

use crate::instr::Instr;

use super::{
    ConstExpr, DataKind, ElementItems, ElementKind, Export, ExportKind, FunctionBody, ImportKind,
    Module,
};

pub fn encode(module: &Module) -> Vec<u8> {
    let mut out = EncModule::new();

    let mut types = TypeSection::new();
    for ty in &module.types {
        types.ty().function(
            ty.params().iter().map(|t| super::super::valtype::to_encoder(*t)),
            ty.results().iter().map(|t| super::super::valtype::to_encoder(*t)),
        );
    }
    out.section(&types);

    if !module.imports.is_empty() {
        let mut imports = ImportSection::new();
        for import in &module.imports {
            let ty = match &import.kind {
                ImportKind::Func(idx) => EntityType::Function(*idx),
                ImportKind::Table(t) => EntityType::Table(table_type(t)),
                ImportKind::Memory(m) => EntityType::Memory(memory_type(m)),
                ImportKind::Global(g) => EntityType::Global(global_type(g)),
            };
            imports.import(&import.module, &import.name, ty);
        }
        out.section(&imports);
    }

    if !module.functions.is_empty() {
        let mut funcs = FunctionSection::new();
        for ty in &module.functions {
            funcs.function(*ty);
        }
        out.section(&funcs);
    }

    if !module.tables.is_empty() {
        let mut tables = TableSection::new();
        for t in &module.tables {
            tables.table(table_type(t));
        }
        out.section(&tables);
    }

    if !module.memories.is_empty() {
        let mut mems = MemorySection::new();
        for m in &module.memories {
            mems.memory(memory_type(m));
        }
        out.section(&mems);
    }

    if !module.globals.is_empty() {
        let mut globals = GlobalSection::new();
        for g in &module.globals {
            globals.global(global_type(&g.ty), &const_expr(&g.init));
        }
        out.section(&globals);
    }

    if !module.exports.is_empty() {
        let mut exports = ExportSection::new();
        for e in &module.exports {
            exports.export(&e.name, export_kind(e.kind), e.index);
        }
        out.section(&exports);
    }

    if let Some(start) = module.start {
        out.section(&StartSection { function_index: start });
    }

    if !module.elements.is_empty() {
        let mut elements = ElementSection::new();
        for seg in &module.elements {
            let funcs;
            let exprs;
            let encoded_elems = match &seg.items {
                ElementItems::Functions(f) => {
                    funcs = f.clone();
                    Elements::Functions(funcs.clone().into())
                }
                ElementItems::Expressions(e) => {
                    exprs = e.iter().map(const_expr).collect::<Vec<_>>();
                    Elements::Expressions(elem_reftype(seg.ty), exprs.clone().into())
                }
            };
            match &seg.kind {
                ElementKind::Active { table_index, offset } => {
                    elements.active(Some(*table_index), &const_expr(offset), encoded_elems);
                }
                ElementKind::Passive => {
                    elements.passive(encoded_elems);
                }
                ElementKind::Declared => {
                    elements.declared(encoded_elems);
                }
            }
        }
        out.section(&elements);
    }

    if module.data_count_section_present {
        out.section(&DataCountSection { count: module.data.len() as u32 });
    }

    if !module.code.is_empty() {
        let mut code = CodeSection::new();
        for body in &module.code {
            match body {
                // Raw bodies are the exact bytes `wasmparser::FunctionBody::range()`
                // captured at decode time (locals + instructions, no leading size
                // varint); `CodeSection::raw` re-prepends the size and splices the
                // payload back in unmodified, which is what keeps non-transformed
                // functions byte-identical in the output.
                FunctionBody::Raw(bytes) => {
                    code.raw(bytes);
                }
                FunctionBody::Decoded { .. } => {
                    code.function(&encode_function_body(body));
                }
            }
        }
        out.section(&code);
    }

    if !module.data.is_empty() {
        let mut data = DataSection::new();
        for seg in &module.data {
            match &seg.kind {
                DataKind::Active { memory_index, offset } => {
                    data.active(*memory_index, &const_expr(offset), seg.data.iter().copied());
                }
                DataKind::Passive => {
                    data.passive(seg.data.iter().copied());
                }
            }
        }
        out.section(&data);
    }

    for custom in &module.customs {
        out.section(&EncCustomSection {
            name: custom.name.as_str().into(),
            data: custom.data.as_slice().into(),
        });
    }

    out.finish()
}

fn table_type(t: &wasmparser::TableType) -> EncTableType {
    EncTableType {
        element_type: elem_reftype(t.element_type),
        minimum: t.initial,
        maximum: t.maximum,
        table64: t.table64,
        shared: t.shared,
    }
}

fn memory_type(m: &wasmparser::MemoryType) -> EncMemoryType {
    EncMemoryType {
        minimum: m.initial,
        maximum: m.maximum,
        memory64: m.memory64,
        shared: m.shared,
        page_size_log2: m.page_size_log2,
    }
}

fn global_type(g: &wasmparser::GlobalType) -> EncGlobalType {
    EncGlobalType {
        val_type: super::super::valtype::to_encoder(g.content_type),
        mutable: g.mutable,
        shared: g.shared,
    }
}

fn elem_reftype(rt: wasmparser::RefType) -> EncRefType {
    match super::super::valtype::to_encoder(wasmparser::ValType::Ref(rt)) {
        wasm_encoder::ValType::Ref(rt) => rt,
        _ => unreachable!("RefType always converts to a Ref ValType"),
    }
}

fn export_kind(kind: ExportKind) -> EncExportKind {
    match kind {
        ExportKind::Func => EncExportKind::Func,
        ExportKind::Table => EncExportKind::Table,
        ExportKind::Memory => EncExportKind::Memory,
        ExportKind::Global => EncExportKind::Global,
    }
}

fn const_expr(expr: &ConstExpr) -> EncConstExpr {
    match *expr {
        ConstExpr::I32(v) => EncConstExpr::i32_const(v),
        ConstExpr::I64(v) => EncConstExpr::i64_const(v),
        ConstExpr::F32(v) => EncConstExpr::f32_const(v),
        ConstExpr::F64(v) => EncConstExpr::f64_const(v),
        ConstExpr::GlobalGet(idx) => EncConstExpr::global_get(idx),
        ConstExpr::RefNull(ty) => {
            let heap_type = match super::super::valtype::to_encoder(ty) {
                wasm_encoder::ValType::Ref(rt) => rt.heap_type,
                _ => unreachable!("RefNull always carries a reference type"),
            };
            EncConstExpr::ref_null(heap_type)
        }
        ConstExpr::RefFunc(idx) => EncConstExpr::ref_func(idx),
    }
}

/// Re-encodes one function body. [`FunctionBody::Raw`] bodies are spliced
/// back in as a pre-built `Function` wrapping the original bytes verbatim —
/// this is what keeps non-transformed functions byte-identical in the
/// output. [`FunctionBody::Decoded`] bodies (the async-transformed ones) are
/// assembled instruction-by-instruction from the owned [`Instr`] stream.
fn encode_function_body(body: &FunctionBody) -> Function {
    match body {
        FunctionBody::Raw(_) => unreachable!("raw bodies are spliced in via CodeSection::raw"),
        FunctionBody::Decoded { locals, instrs } => {
            let locals = locals
                .iter()
                .map(|(count, ty)| (*count, super::super::valtype::to_encoder(*ty)));
            let mut func = Function::new(locals);
            for instr in instrs {
                func.instruction(&to_encoder_instr(instr));
            }
            func
        }
    }
}

/// Converts one owned [`Instr`] to a borrowed `wasm_encoder::Instruction`.
/// Exposed at crate visibility so the function transformer's emit stage can
/// reuse it without re-threading the whole module through this file.
pub(crate) fn to_encoder_instr(instr: &Instr) -> wasm_encoder::Instruction<'static> {
    use wasm_encoder::Instruction as E;
    use wasm_encoder::MemArg as EncMemArg;

    let conv_memarg = |m: &crate::instr::MemArg| EncMemArg {
        offset: m.offset,
        align: m.align,
        memory_index: m.memory_index,
    };

    match instr {
        Instr::Unreachable => E::Unreachable,
        Instr::Nop => E::Nop,
        Instr::Block(bt) => E::Block(bt.to_encoder()),
        Instr::Loop(bt) => E::Loop(bt.to_encoder()),
        Instr::If(bt) => E::If(bt.to_encoder()),
        Instr::Else => E::Else,
        Instr::End => E::End,
        Instr::Br(d) => E::Br(*d),
        Instr::BrIf(d) => E::BrIf(*d),
        Instr::BrTable(labels, default) => {
            E::BrTable(labels.clone().into(), *default)
        }
        Instr::Return => E::Return,
        Instr::Call(idx) => E::Call(*idx),
        Instr::CallIndirect { type_index, table_index } => E::CallIndirect {
            type_index: *type_index,
            table_index: *table_index,
        },
        Instr::CallRef(idx) => E::CallRef(*idx),
        Instr::Drop => E::Drop,
        Instr::Select => E::Select,
        Instr::TypedSelect(tys) => E::TypedSelect(super::super::valtype::to_encoder(tys[0])),
        Instr::LocalGet(idx) => E::LocalGet(*idx),
        Instr::LocalSet(idx) => E::LocalSet(*idx),
        Instr::LocalTee(idx) => E::LocalTee(*idx),
        Instr::GlobalGet(idx) => E::GlobalGet(*idx),
        Instr::GlobalSet(idx) => E::GlobalSet(*idx),
        Instr::TableGet(idx) => E::TableGet(*idx),
        Instr::TableSet(idx) => E::TableSet(*idx),
        Instr::TableInit { elem_index, table_index } => E::TableInit {
            elem_index: *elem_index,
            table: *table_index,
        },
        Instr::ElemDrop(idx) => E::ElemDrop(*idx),
        Instr::TableCopy { dst_table, src_table } => E::TableCopy {
            dst_table: *dst_table,
            src_table: *src_table,
        },
        Instr::TableGrow(idx) => E::TableGrow(*idx),
        Instr::TableSize(idx) => E::TableSize(*idx),
        Instr::TableFill(idx) => E::TableFill(*idx),
        Instr::RefNull(ty) => {
            let heap_type = match super::super::valtype::to_encoder(*ty) {
                wasm_encoder::ValType::Ref(rt) => rt.heap_type,
                _ => unreachable!("RefNull always carries a reference type"),
            };
            E::RefNull(heap_type)
        }
        Instr::RefIsNull => E::RefIsNull,
        Instr::RefFunc(idx) => E::RefFunc(*idx),
        Instr::RefAsNonNull => E::RefAsNonNull,
        Instr::BrOnNull(d) => E::BrOnNull(*d),
        Instr::BrOnNonNull(d) => E::BrOnNonNull(*d),
        Instr::MemorySize(idx) => E::MemorySize(*idx),
        Instr::MemoryGrow(idx) => E::MemoryGrow(*idx),
        Instr::MemoryInit { data_index, mem_index } => E::MemoryInit {
            data_index: *data_index,
            mem: *mem_index,
        },
        Instr::DataDrop(idx) => E::DataDrop(*idx),
        Instr::MemoryCopy { dst_mem, src_mem } => E::MemoryCopy {
            dst_mem: *dst_mem,
            src_mem: *src_mem,
        },
        Instr::MemoryFill(idx) => E::MemoryFill(*idx),
        Instr::Load { op, memarg: m } => load_instr(*op, conv_memarg(m)),
        Instr::Store { op, memarg: m } => store_instr(*op, conv_memarg(m)),
        Instr::I32Const(v) => E::I32Const(*v),
        Instr::I64Const(v) => E::I64Const(*v),
        Instr::F32Const(v) => E::F32Const(*v),
        Instr::F64Const(v) => E::F64Const(*v),
        Instr::V128Const(v) => E::V128Const(*v),
        Instr::Simple(op) => op.to_encoder(),
    }
}

fn load_instr(op: crate::instr::LoadOp, memarg: wasm_encoder::MemArg) -> wasm_encoder::Instruction<'static> {
    use crate::instr::LoadOp as L;
    use wasm_encoder::Instruction as E;
    match op {
        L::I32Load => E::I32Load(memarg),
        L::I64Load => E::I64Load(memarg),
        L::F32Load => E::F32Load(memarg),
        L::F64Load => E::F64Load(memarg),
        L::I32Load8S => E::I32Load8S(memarg),
        L::I32Load8U => E::I32Load8U(memarg),
        L::I32Load16S => E::I32Load16S(memarg),
        L::I32Load16U => E::I32Load16U(memarg),
        L::I64Load8S => E::I64Load8S(memarg),
        L::I64Load8U => E::I64Load8U(memarg),
        L::I64Load16S => E::I64Load16S(memarg),
        L::I64Load16U => E::I64Load16U(memarg),
        L::I64Load32S => E::I64Load32S(memarg),
        L::I64Load32U => E::I64Load32U(memarg),
    }
}

fn store_instr(op: crate::instr::StoreOp, memarg: wasm_encoder::MemArg) -> wasm_encoder::Instruction<'static> {
    use crate::instr::StoreOp as S;
    use wasm_encoder::Instruction as E;
    match op {
        S::I32Store => E::I32Store(memarg),
        S::I64Store => E::I64Store(memarg),
        S::F32Store => E::F32Store(memarg),
        S::F64Store => E::F64Store(memarg),
        S::I32Store8 => E::I32Store8(memarg),
        S::I32Store16 => E::I32Store16(memarg),
        S::I64Store8 => E::I64Store8(memarg),
        S::I64Store16 => E::I64Store16(memarg),
        S::I64Store32 => E::I64Store32(memarg),
    }
}
