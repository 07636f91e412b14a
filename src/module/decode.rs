use wasmparser::{
    ConstExpr as WpConstExpr, ElementKind as WpElementKind, ElementItems as WpElementItems,
    ExternalKind, Operator, Parser, Payload, TypeRef, ValidPayload, Validator, WasmFeatures,
};

use crate::error::{Error, MalformedError, UnsupportedError};
use crate::instr::{BlockTy, Instr, LoadOp, MemArg, SimpleOp, StoreOp};

use super::{
    ConstExpr, CustomSection, DataKind, DataSegment, ElementItems, ElementKind, ElementSegment,
    Export, ExportKind, FunctionBody, Global, Import, ImportKind, Module,
};

/// Decodes `bytes` into a [`Module`], validating the input with
/// `wasmparser::Validator` along the way (per `spec.md` §4.5 step 1: a
/// malformed or invalid module is rejected before any transformation is
/// attempted). Function bodies are kept as [`FunctionBody::Raw`] — only
/// functions later selected into the async set are decoded into
/// [`crate::instr::Instr`] by [`decode_function_body`].
pub fn decode(bytes: &[u8]) -> Result<Module, Error> {
    let mut validator = Validator::new_with_features(WasmFeatures::default());
    let mut module = Module {
        types: Vec::new(),
        imports: Vec::new(),
        functions: Vec::new(),
        tables: Vec::new(),
        memories: Vec::new(),
        globals: Vec::new(),
        exports: Vec::new(),
        elements: Vec::new(),
        data: Vec::new(),
        data_count_section_present: false,
        code: Vec::new(),
        start: None,
        customs: Vec::new(),
    };

    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload?;
        if let ValidPayload::Func(_, body) = validator.payload(&payload)? {
            let _ = body;
        }

        match payload {
            Payload::TypeSection(reader) => {
                for group in reader {
                    for ty in group?.into_types() {
                        module.types.push(
                            ty.composite_type
                                .inner
                                .unwrap_func()
                                .clone(),
                        );
                    }
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import?;
                    let kind = match import.ty {
                        TypeRef::Func(ty) => ImportKind::Func(ty),
                        TypeRef::Table(ty) => ImportKind::Table(ty),
                        TypeRef::Memory(ty) => ImportKind::Memory(ty),
                        TypeRef::Global(ty) => ImportKind::Global(ty),
                        TypeRef::Tag(_) => {
                            return Err(UnsupportedError::Exception {
                                func_idx: u32::MAX,
                                opcode: "tag import",
                            }
                            .into())
                        }
                    };
                    module.imports.push(Import {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                        kind,
                    });
                }
            }
            Payload::FunctionSection(reader) => {
                for ty in reader {
                    module.functions.push(ty?);
                }
            }
            Payload::TableSection(reader) => {
                for table in reader {
                    module.tables.push(table?.ty);
                }
            }
            Payload::MemorySection(reader) => {
                for memory in reader {
                    module.memories.push(memory?);
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global?;
                    module.globals.push(Global {
                        ty: global.ty,
                        init: const_expr(&global.init_expr, "global initializer")?,
                    });
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export?;
                    let kind = match export.kind {
                        ExternalKind::Func => ExportKind::Func,
                        ExternalKind::Table => ExportKind::Table,
                        ExternalKind::Memory => ExportKind::Memory,
                        ExternalKind::Global => ExportKind::Global,
                        ExternalKind::Tag => {
                            return Err(UnsupportedError::Exception {
                                func_idx: u32::MAX,
                                opcode: "tag export",
                            }
                            .into())
                        }
                    };
                    module.exports.push(Export {
                        name: export.name.to_string(),
                        kind,
                        index: export.index,
                    });
                }
            }
            Payload::ElementSection(reader) => {
                for elem in reader {
                    let elem = elem?;
                    let kind = match elem.kind {
                        WpElementKind::Active {
                            table_index,
                            offset_expr,
                        } => ElementKind::Active {
                            table_index: table_index.unwrap_or(0),
                            offset: const_expr(&offset_expr, "element segment offset")?,
                        },
                        WpElementKind::Passive => ElementKind::Passive,
                        WpElementKind::Declared => ElementKind::Declared,
                    };
                    let items = match elem.items {
                        WpElementItems::Functions(reader) => {
                            ElementItems::Functions(reader.into_iter().collect::<Result<_, _>>()?)
                        }
                        WpElementItems::Expressions(_ty, reader) => {
                            let mut exprs = Vec::new();
                            for expr in reader {
                                exprs.push(const_expr(&expr?, "element segment item")?);
                            }
                            ElementItems::Expressions(exprs)
                        }
                    };
                    module.elements.push(ElementSegment {
                        kind,
                        ty: elem.ty,
                        items,
                    });
                }
            }
            Payload::DataCountSection { .. } => {
                module.data_count_section_present = true;
            }
            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data?;
                    let kind = match data.kind {
                        wasmparser::DataKind::Active {
                            memory_index,
                            offset_expr,
                        } => DataKind::Active {
                            memory_index,
                            offset: const_expr(&offset_expr, "data segment offset")?,
                        },
                        wasmparser::DataKind::Passive => DataKind::Passive,
                    };
                    module.data.push(DataSegment {
                        kind,
                        data: data.data.to_vec(),
                    });
                }
            }
            Payload::StartSection { func, .. } => {
                module.start = Some(func);
            }
            Payload::CodeSectionEntry(body) => {
                let range = body.range();
                module.code.push(FunctionBody::Raw(bytes[range.start..range.end].to_vec()));
            }
            Payload::CustomSection(reader) => {
                module.customs.push(CustomSection {
                    name: reader.name().to_string(),
                    data: reader.data().to_vec(),
                });
            }
            Payload::TagSection(reader) => {
                if reader.count() > 0 {
                    return Err(UnsupportedError::Exception {
                        func_idx: u32::MAX,
                        opcode: "tag section",
                    }
                    .into());
                }
            }
            Payload::End(_) => {}
            _ => {}
        }
    }

    Ok(module)
}

fn const_expr(expr: &WpConstExpr<'_>, context: &'static str) -> Result<ConstExpr, Error> {
    let mut reader = expr.get_operators_reader();
    let op = reader.read().map_err(Error::from)?;
    let result = match op {
        Operator::I32Const { value } => ConstExpr::I32(value),
        Operator::I64Const { value } => ConstExpr::I64(value),
        Operator::F32Const { value } => ConstExpr::F32(f32::from_bits(value.bits())),
        Operator::F64Const { value } => ConstExpr::F64(f64::from_bits(value.bits())),
        Operator::GlobalGet { global_index } => ConstExpr::GlobalGet(global_index),
        Operator::RefNull { hty } => {
            ConstExpr::RefNull(wasmparser::ValType::Ref(wasmparser::RefType::new(true, hty).ok_or_else(|| crate::error::malformed(context))?))
        }
        Operator::RefFunc { function_index } => ConstExpr::RefFunc(function_index),
        _ => return Err(crate::error::malformed(context)),
    };
    match reader.read() {
        Ok(Operator::End) => Ok(result),
        _ => Err(crate::error::malformed(context)),
    }
}

/// Fully decodes a single function body's locals and instruction stream into
/// owned [`Instr`]s. Called only for functions selected into the async set;
/// see the module-level docs for why everything else stays raw.
pub fn decode_function_body(func_idx: u32, raw: &[u8]) -> Result<FunctionBody, Error> {
    let reader = wasmparser::FunctionBody::new(wasmparser::BinaryReader::new(raw, 0, wasmparser::WasmFeatures::default()));
    let mut locals = Vec::new();
    let mut locals_reader = reader.get_locals_reader()?;
    for _ in 0..locals_reader.get_count() {
        let (count, ty) = locals_reader.read()?;
        locals.push((count, ty));
    }

    let mut instrs = Vec::new();
    let mut ops = reader.get_operators_reader()?;
    while !ops.eof() {
        let op = ops.read()?;
        instrs.push(decode_instr(func_idx, op)?);
    }

    Ok(FunctionBody::Decoded { locals, instrs })
}

fn decode_instr(func_idx: u32, op: Operator<'_>) -> Result<Instr, Error> {
    if let Some(simple) = SimpleOp::from_wasmparser_name(&op) {
        return Ok(Instr::Simple(simple));
    }

    Ok(match op {
        Operator::Unreachable => Instr::Unreachable,
        Operator::Nop => Instr::Nop,
        Operator::Block { blockty } => Instr::Block(BlockTy::from_wasmparser(blockty)),
        Operator::Loop { blockty } => Instr::Loop(BlockTy::from_wasmparser(blockty)),
        Operator::If { blockty } => Instr::If(BlockTy::from_wasmparser(blockty)),
        Operator::Else => Instr::Else,
        Operator::End => Instr::End,
        Operator::Br { relative_depth } => Instr::Br(relative_depth),
        Operator::BrIf { relative_depth } => Instr::BrIf(relative_depth),
        Operator::BrTable { targets } => {
            let default = targets.default();
            let labels = targets.targets().collect::<Result<Vec<_>, _>>()?;
            Instr::BrTable(labels, default)
        }
        Operator::Return => Instr::Return,
        Operator::Call { function_index } => Instr::Call(function_index),
        Operator::CallIndirect { type_index, table_index, .. } => Instr::CallIndirect { type_index, table_index },
        Operator::CallRef { .. } => {
            return Err(UnsupportedError::ReferenceType { func_idx, context: "call_ref" }.into())
        }
        Operator::ReturnCall { .. } | Operator::ReturnCallIndirect { .. } | Operator::ReturnCallRef { .. } => {
            return Err(UnsupportedError::TailCall { func_idx, opcode: operator_name(&op) }.into())
        }
        Operator::Drop => Instr::Drop,
        Operator::Select => Instr::Select,
        Operator::TypedSelect { ty } => Instr::TypedSelect(vec![ty]),
        Operator::LocalGet { local_index } => Instr::LocalGet(local_index),
        Operator::LocalSet { local_index } => Instr::LocalSet(local_index),
        Operator::LocalTee { local_index } => Instr::LocalTee(local_index),
        Operator::GlobalGet { global_index } => Instr::GlobalGet(global_index),
        Operator::GlobalSet { global_index } => Instr::GlobalSet(global_index),
        Operator::TableGet { table } => Instr::TableGet(table),
        Operator::TableSet { table } => Instr::TableSet(table),
        Operator::TableInit { elem_index, table } => Instr::TableInit { elem_index, table_index: table },
        Operator::ElemDrop { elem_index } => Instr::ElemDrop(elem_index),
        Operator::TableCopy { dst_table, src_table } => Instr::TableCopy { dst_table, src_table },
        Operator::TableGrow { table } => Instr::TableGrow(table),
        Operator::TableSize { table } => Instr::TableSize(table),
        Operator::TableFill { table } => Instr::TableFill(table),
        Operator::RefNull { hty } => Instr::RefNull(wasmparser::ValType::Ref(
            wasmparser::RefType::new(true, hty).ok_or_else(|| crate::error::malformed("ref.null"))?,
        )),
        Operator::RefIsNull => Instr::RefIsNull,
        Operator::RefFunc { function_index } => Instr::RefFunc(function_index),
        Operator::RefAsNonNull => Instr::RefAsNonNull,
        Operator::BrOnNull { relative_depth } => Instr::BrOnNull(relative_depth),
        Operator::BrOnNonNull { relative_depth } => Instr::BrOnNonNull(relative_depth),
        Operator::MemorySize { mem, .. } => Instr::MemorySize(mem),
        Operator::MemoryGrow { mem, .. } => Instr::MemoryGrow(mem),
        Operator::MemoryInit { data_index, mem } => Instr::MemoryInit { data_index, mem_index: mem },
        Operator::DataDrop { data_index } => Instr::DataDrop(data_index),
        Operator::MemoryCopy { dst_mem, src_mem } => Instr::MemoryCopy { dst_mem, src_mem },
        Operator::MemoryFill { mem } => Instr::MemoryFill(mem),
        Operator::I32Const { value } => Instr::I32Const(value),
        Operator::I64Const { value } => Instr::I64Const(value),
        Operator::F32Const { value } => Instr::F32Const(f32::from_bits(value.bits())),
        Operator::F64Const { value } => Instr::F64Const(f64::from_bits(value.bits())),

        Operator::I32Load { memarg } => load(LoadOp::I32Load, memarg),
        Operator::I64Load { memarg } => load(LoadOp::I64Load, memarg),
        Operator::F32Load { memarg } => load(LoadOp::F32Load, memarg),
        Operator::F64Load { memarg } => load(LoadOp::F64Load, memarg),
        Operator::I32Load8S { memarg } => load(LoadOp::I32Load8S, memarg),
        Operator::I32Load8U { memarg } => load(LoadOp::I32Load8U, memarg),
        Operator::I32Load16S { memarg } => load(LoadOp::I32Load16S, memarg),
        Operator::I32Load16U { memarg } => load(LoadOp::I32Load16U, memarg),
        Operator::I64Load8S { memarg } => load(LoadOp::I64Load8S, memarg),
        Operator::I64Load8U { memarg } => load(LoadOp::I64Load8U, memarg),
        Operator::I64Load16S { memarg } => load(LoadOp::I64Load16S, memarg),
        Operator::I64Load16U { memarg } => load(LoadOp::I64Load16U, memarg),
        Operator::I64Load32S { memarg } => load(LoadOp::I64Load32S, memarg),
        Operator::I64Load32U { memarg } => load(LoadOp::I64Load32U, memarg),

        Operator::I32Store { memarg } => store(StoreOp::I32Store, memarg),
        Operator::I64Store { memarg } => store(StoreOp::I64Store, memarg),
        Operator::F32Store { memarg } => store(StoreOp::F32Store, memarg),
        Operator::F64Store { memarg } => store(StoreOp::F64Store, memarg),
        Operator::I32Store8 { memarg } => store(StoreOp::I32Store8, memarg),
        Operator::I32Store16 { memarg } => store(StoreOp::I32Store16, memarg),
        Operator::I64Store8 { memarg } => store(StoreOp::I64Store8, memarg),
        Operator::I64Store16 { memarg } => store(StoreOp::I64Store16, memarg),
        Operator::I64Store32 { memarg } => store(StoreOp::I64Store32, memarg),

        other => return Err(classify_unsupported(func_idx, &other)),
    })
}

fn load(op: LoadOp, memarg: wasmparser::MemArg) -> Instr {
    Instr::Load { op, memarg: MemArg::from(memarg) }
}

fn store(op: StoreOp, memarg: wasmparser::MemArg) -> Instr {
    Instr::Store { op, memarg: MemArg::from(memarg) }
}

/// Names an opcode this transformer has no explicit case for (SIMD, atomics,
/// exceptions, tail calls) by its `Debug` variant name and buckets it into
/// the right [`UnsupportedError`] variant. `wasmparser::Operator` has several
/// hundred variants across extension proposals; matching the handful this
/// crate actually rejects by name avoids enumerating all of them twice.
/// The opcode's variant name, read off its `Debug` output (`wasmparser`
/// doesn't expose operator names as a stable API; its `Debug` impl is
/// generated from the same `for_each_operator!` table as the variant list
/// itself, so the leading identifier is always the bare mnemonic).
fn operator_name(op: &Operator<'_>) -> String {
    let debug = format!("{op:?}");
    debug
        .split(|c: char| !c.is_alphanumeric())
        .next()
        .unwrap_or("unknown")
        .to_string()
}

fn classify_unsupported(func_idx: u32, op: &Operator<'_>) -> Error {
    let opcode = operator_name(op);
    let name = opcode.as_str();
    if matches!(
        op,
        Operator::ReturnCall { .. } | Operator::ReturnCallIndirect { .. } | Operator::ReturnCallRef { .. }
    ) {
        UnsupportedError::TailCall { func_idx, opcode }.into()
    } else if name.starts_with("Try") || name.starts_with("Catch") || name.starts_with("Throw") || name == "Rethrow" || name == "Delegate" {
        UnsupportedError::Exception { func_idx, opcode }.into()
    } else if name.contains("Atomic") {
        UnsupportedError::Atomic { func_idx }.into()
    } else {
        UnsupportedError::Opcode { func_idx, opcode }.into()
    }
}
