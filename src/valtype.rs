//! Per-value-type utilities: encoded byte size, the load/store opcode family
//! used to spill a value of that type to linear memory, and the
//! `local.get`/`store` and `load`/`local.set` instruction pairs the
//! transformer emits when saving and restoring live locals across a call
//! site.

use wasmparser::ValType;

use crate::instr::{Instr, LoadOp, MemArg, StoreOp};

/// Converts a `wasmparser` value type to its `wasm-encoder` counterpart.
/// Both crates model the same four numeric types plus `v128`/`funcref`/
/// `externref`; this is a straight rename, not a narrowing.
pub fn to_encoder(ty: ValType) -> wasm_encoder::ValType {
    match ty {
        ValType::I32 => wasm_encoder::ValType::I32,
        ValType::I64 => wasm_encoder::ValType::I64,
        ValType::F32 => wasm_encoder::ValType::F32,
        ValType::F64 => wasm_encoder::ValType::F64,
        ValType::V128 => wasm_encoder::ValType::V128,
        ValType::Ref(rt) => wasm_encoder::ValType::Ref(to_encoder_reftype(rt)),
    }
}

fn to_encoder_reftype(rt: wasmparser::RefType) -> wasm_encoder::RefType {
    wasm_encoder::RefType {
        nullable: rt.is_nullable(),
        heap_type: to_encoder_heaptype(rt.heap_type()),
    }
}

fn to_encoder_heaptype(ht: wasmparser::HeapType) -> wasm_encoder::HeapType {
    use wasmparser::{AbstractHeapType as A, HeapType as H};
    match ht {
        H::Abstract { shared, ty } => wasm_encoder::HeapType::Abstract {
            shared,
            ty: match ty {
                A::Func => wasm_encoder::AbstractHeapType::Func,
                A::Extern => wasm_encoder::AbstractHeapType::Extern,
                A::Any => wasm_encoder::AbstractHeapType::Any,
                A::None => wasm_encoder::AbstractHeapType::None,
                A::NoExtern => wasm_encoder::AbstractHeapType::NoExtern,
                A::NoFunc => wasm_encoder::AbstractHeapType::NoFunc,
                A::Eq => wasm_encoder::AbstractHeapType::Eq,
                A::Struct => wasm_encoder::AbstractHeapType::Struct,
                A::Array => wasm_encoder::AbstractHeapType::Array,
                A::I31 => wasm_encoder::AbstractHeapType::I31,
                A::Exn => wasm_encoder::AbstractHeapType::Exn,
                A::NoExn => wasm_encoder::AbstractHeapType::NoExn,
                A::Cont => wasm_encoder::AbstractHeapType::Cont,
                A::NoCont => wasm_encoder::AbstractHeapType::NoCont,
            },
        },
        H::Concrete(idx) => wasm_encoder::HeapType::Concrete(idx),
    }
}

/// Is this a reference type (`funcref`/`externref`/etc)? Asyncify cannot
/// spill reference values to linear memory (they may not have a stable
/// numeric representation), so any reference type live across a call site
/// is rejected with [`crate::error::UnsupportedError::ReferenceType`].
pub fn is_reference(ty: ValType) -> bool {
    matches!(ty, ValType::Ref(_))
}

/// Encoded byte width of a value of this type when spilled to linear memory.
/// Reference types have no defined width here; callers must reject them
/// before reaching this function.
pub fn byte_size(ty: ValType) -> u32 {
    match ty {
        ValType::I32 | ValType::F32 => 4,
        ValType::I64 | ValType::F64 => 8,
        ValType::V128 => 16,
        ValType::Ref(_) => unreachable!("reference types are rejected before byte_size is called"),
    }
}

fn load_op(ty: ValType) -> LoadOp {
    match ty {
        ValType::I32 => LoadOp::I32Load,
        ValType::I64 => LoadOp::I64Load,
        ValType::F32 => LoadOp::F32Load,
        ValType::F64 => LoadOp::F64Load,
        ValType::V128 | ValType::Ref(_) => {
            unreachable!("v128/reference locals are rejected before save/restore emission")
        }
    }
}

fn store_op(ty: ValType) -> StoreOp {
    match ty {
        ValType::I32 => StoreOp::I32Store,
        ValType::I64 => StoreOp::I64Store,
        ValType::F32 => StoreOp::F32Store,
        ValType::F64 => StoreOp::F64Store,
        ValType::V128 | ValType::Ref(_) => {
            unreachable!("v128/reference locals are rejected before save/restore emission")
        }
    }
}

/// `local.get $local; i32/i64/f32/f64.store offset=$offset $data_ptr`
///
/// Emits the pair of instructions that saves a live local's current value to
/// the scratch data area at `$data_ptr + offset`, assuming `$data_ptr` (the
/// unwind/rewind data pointer) is already on the stack when the `store`
/// executes — callers push it immediately before calling this.
pub fn emit_save(local_index: u32, ty: ValType, offset: u64, memory_index: u32) -> Vec<Instr> {
    vec![
        Instr::LocalGet(local_index),
        Instr::Store {
            op: store_op(ty),
            memarg: MemArg {
                align: align_for(ty),
                offset,
                memory_index,
            },
        },
    ]
}

/// `i32/i64/f32/f64.load offset=$offset $data_ptr; local.set $local`
///
/// The inverse of [`emit_save`]: restores a local from the scratch data area,
/// assuming `$data_ptr` is already on the stack when the `load` executes.
pub fn emit_restore(local_index: u32, ty: ValType, offset: u64, memory_index: u32) -> Vec<Instr> {
    vec![
        Instr::Load {
            op: load_op(ty),
            memarg: MemArg {
                align: align_for(ty),
                offset,
                memory_index,
            },
        },
        Instr::LocalSet(local_index),
    ]
}

fn align_for(ty: ValType) -> u32 {
    match ty {
        ValType::I32 | ValType::F32 => 2,
        ValType::I64 | ValType::F64 => 3,
        ValType::V128 | ValType::Ref(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes_match_wasm_value_widths() {
        assert_eq!(byte_size(ValType::I32), 4);
        assert_eq!(byte_size(ValType::I64), 8);
        assert_eq!(byte_size(ValType::F32), 4);
        assert_eq!(byte_size(ValType::F64), 8);
    }

    #[test]
    fn reference_types_are_flagged() {
        assert!(!is_reference(ValType::I32));
        assert!(is_reference(ValType::Ref(wasmparser::RefType::FUNCREF)));
    }

    #[test]
    fn save_restore_round_trip_shape() {
        let save = emit_save(3, ValType::I64, 16, 0);
        assert_eq!(save.len(), 2);
        assert_eq!(save[0], Instr::LocalGet(3));

        let restore = emit_restore(3, ValType::I64, 16, 0);
        assert_eq!(restore.len(), 2);
        assert_eq!(restore[1], Instr::LocalSet(3));
    }
}
