//! Step 3 of the per-function rewrite (`spec.md` §4.6 step 8): assembles the
//! final guarded body around the linearized, materialized instruction
//! stream produced by [`super::linearize`]/[`super::simulate`] — the rewind
//! prelude, the repeating `if (state == Normal)` guard around every plain
//! instruction, the three-way guard expanding each async call site, and the
//! save path that runs once the function itself starts unwinding.
//!
//! # Guard-boundary rule
//!
//! [`super::simulate::materialize`]'s "zero residual stack" discipline
//! (see that module's docs) means every *ordinary* instruction's pushed
//! value is drained into a fresh local immediately. The only place a value
//! is ever left resident on the real operand stack across an instruction
//! boundary is the handful of bare `local.get`s [`super::simulate`] emits
//! immediately before a stack-consuming control instruction — `if`'s
//! condition, `br_if`'s condition (or its rewritten loop-param fetch),
//! `br`/`br_table`'s loop-param fetch, and `return`'s result values. Those
//! bare `local.get`s are therefore always exactly the ones needed to bridge
//! the real stack for the *next* control instruction; nothing else ever sits
//! unconsumed at a guard boundary. This emitter identifies them the same way
//! it identifies a call site's own argument locals (`spec.md` §4.6 step 7):
//! by carving them out of the ordinary guard and emitting them unconditionally
//! immediately before the control instruction they feed, so the guard itself
//! only ever needs the trivial `(param) -> ()` type.

use std::collections::HashMap;

use wasmparser::ValType;

use crate::config::Config;
use crate::error::Error;
use crate::instr::{BlockTy, Instr, LoadOp, MemArg, StoreOp};
use crate::instr::SimpleOp;
use crate::liveness::LiveSets;

use super::{CallSite, FrameLayout, GlobalIndices, LocalAllocator};

const STATE_NORMAL: i32 = 0;
const STATE_UNWINDING: i32 = 1;
const STATE_REWINDING: i32 = 2;

/// Fixed scratch-local layout appended to every transformed function
/// (`spec.md` §3 "Scratch locals"): three index/pointer-carrying i32s, two
/// each of i64/f32/f64, and one extra i32.
///
/// `spec.md` lists all three of `call_index_save`/`call_index_rewind`/
/// `stack_ptr_cache` as i32, which is exactly right in the common `wasm32`
/// case; under the `wasm64` option the data pointer the third scratch local
/// caches is 8 bytes wide, so it widens to `i64` there while the two
/// call-site indices (always small integers, never pointers) stay `i32`
/// regardless — an open question resolved in `DESIGN.md`.
pub(crate) struct ScratchLocals {
    pub call_index_save: u32,
    pub call_index_rewind: u32,
    pub stack_ptr_cache: u32,
    #[allow(dead_code)]
    pub i64_scratch: [u32; 2],
    #[allow(dead_code)]
    pub f32_scratch: [u32; 2],
    #[allow(dead_code)]
    pub f64_scratch: [u32; 2],
    #[allow(dead_code)]
    pub extra_i32: u32,
}

impl ScratchLocals {
    fn allocate(alloc: &mut LocalAllocator, ptr_ty: ValType) -> Self {
        Self {
            call_index_save: alloc.alloc(ValType::I32),
            call_index_rewind: alloc.alloc(ValType::I32),
            stack_ptr_cache: alloc.alloc(ptr_ty),
            i64_scratch: [alloc.alloc(ValType::I64), alloc.alloc(ValType::I64)],
            f32_scratch: [alloc.alloc(ValType::F32), alloc.alloc(ValType::F32)],
            f64_scratch: [alloc.alloc(ValType::F64), alloc.alloc(ValType::F64)],
            extra_i32: alloc.alloc(ValType::I32),
        }
    }
}

pub(crate) struct EmitInput<'a> {
    pub func_idx: u32,
    pub result_types: Vec<ValType>,
    pub instrs: Vec<Instr>,
    pub call_sites: Vec<CallSite>,
    pub live_sets: LiveSets,
    pub frame_size: FrameLayout,
    pub local_types: Vec<ValType>,
    pub globals: GlobalIndices,
    pub config: &'a Config,
    pub alloc: &'a mut LocalAllocator,
}

pub(crate) fn emit(input: EmitInput<'_>) -> Result<Vec<Instr>, Error> {
    let EmitInput {
        func_idx: _func_idx,
        result_types,
        mut instrs,
        call_sites,
        live_sets: _live_sets,
        frame_size,
        local_types,
        globals,
        config,
        alloc,
    } = input;

    // This emitter assembles its own closing structure and appends exactly
    // one `end` at the very end; the function's own terminating `end` (kept
    // through `linearize`/`simulate` so non-async functions stay a trivial
    // passthrough, see those modules' docs) is therefore redundant here.
    if matches!(instrs.last(), Some(Instr::End)) {
        instrs.pop();
    }

    let ptr_ty = config.ptr_wp_val_type();
    let memory_index = config.memory_index();
    let scratch = ScratchLocals::allocate(alloc, ptr_ty);

    // Call sites indexed by the position in `instrs` where their argument
    // locals begin — `position - arg_locals.len()` — which is where this
    // emitter must stop accumulating the ordinary guard and hand off to the
    // call site's own three-way guard (`spec.md` §4.6 step 7).
    let call_site_by_start: HashMap<usize, usize> = call_sites
        .iter()
        .enumerate()
        .map(|(k, cs)| (cs.position - cs.arg_locals.len(), k))
        .collect();

    let mut out = Vec::with_capacity(instrs.len() * 2);

    emit_prelude(&mut out, &globals, &scratch, &frame_size, &local_types, memory_index, ptr_ty);

    out.push(Instr::Block(BlockTy::Single(ValType::I32))); // OUTER
    out.push(Instr::Block(BlockTy::Empty)); // MIDDLE
    out.push(Instr::Block(BlockTy::Empty)); // INNER

    if !call_sites.is_empty() {
        emit_rewind_call_index_load(&mut out, &globals, &scratch, memory_index);
    }

    let mut pending: Vec<Instr> = Vec::new();
    let mut depth: u32 = 0;
    let mut i = 0usize;
    while i < instrs.len() {
        if let Some(&k) = call_site_by_start.get(&i) {
            flush_guard(&mut out, &mut pending, globals.state_global);
            let cs = &call_sites[k];
            emit_call_site(&mut out, k, cs, &globals, &scratch, depth);
            i = cs.position + 1 + cs.result_locals.len();
            continue;
        }

        match &instrs[i] {
            Instr::Block(_) | Instr::Loop(_) | Instr::If(_) => {
                flush_guard(&mut out, &mut pending, globals.state_global);
                out.push(instrs[i].clone());
                depth += 1;
            }
            Instr::End => {
                flush_guard(&mut out, &mut pending, globals.state_global);
                depth = depth.saturating_sub(1);
                out.push(Instr::End);
            }
            Instr::Else | Instr::Br(_) | Instr::BrIf(_) | Instr::BrTable(..) | Instr::Return => {
                flush_guard(&mut out, &mut pending, globals.state_global);
                out.push(instrs[i].clone());
            }
            other => pending.push(other.clone()),
        }
        i += 1;
    }

    // Any instructions still pending are the tail of the body with no
    // further control instruction to close the guard — only possible if the
    // original function fell off its end carrying implicit result values
    // (`super::simulate`'s `Instr::End` handling drains those onto bare
    // trailing `local.get`s, just like an explicit `return` would). Treat
    // this exactly like a `return` boundary: those trailing fetches feed the
    // `return` this emitter appends next, unguarded.
    flush_guard(&mut out, &mut pending, globals.state_global);
    out.push(Instr::Return);

    out.push(Instr::End); // close INNER
    out.push(Instr::End); // close MIDDLE
    // OUTER is `(result i32)`; the only value ever reaching its label is the
    // call-site index pushed by `br (4 + depth)` in `emit_call_site`. MIDDLE's
    // own textual fallthrough is statically reachable with an empty stack, so
    // the `unreachable` has to sit directly in OUTER's body (not MIDDLE's) to
    // make that fallthrough stack-polymorphic — block-end resets
    // polymorphism, so putting it inside MIDDLE doesn't carry over to OUTER.
    out.push(Instr::Unreachable);
    out.push(Instr::End); // close OUTER; stack top holds the escaping call-site index

    out.push(Instr::LocalSet(scratch.call_index_save));

    emit_save_path(&mut out, &globals, &scratch, &frame_size, &local_types, memory_index, ptr_ty);

    for ty in &result_types {
        out.push(dummy_const(*ty));
    }

    out.push(Instr::End);

    Ok(out)
}

/// Closes out `pending` as one `if (state == Normal) { ...pending... }`
/// block (`spec.md` §4.6 step 8's "Normal-state guard"), after first
/// carving off any trailing bare `local.get`s (see module docs) to re-emit
/// unconditionally — they bridge the real stack for whatever control
/// instruction follows and must run regardless of state.
fn flush_guard(out: &mut Vec<Instr>, pending: &mut Vec<Instr>, state_global: u32) {
    let mut feed_start = pending.len();
    while feed_start > 0 && matches!(pending[feed_start - 1], Instr::LocalGet(_)) {
        feed_start -= 1;
    }
    let feed: Vec<Instr> = pending.split_off(feed_start);

    if !pending.is_empty() {
        push_state_eq(out, state_global, STATE_NORMAL);
        out.push(Instr::If(BlockTy::Empty));
        out.append(pending);
        out.push(Instr::End);
    } else {
        pending.clear();
    }

    out.extend(feed);
}

fn push_state_eq(out: &mut Vec<Instr>, state_global: u32, value: i32) {
    out.push(Instr::GlobalGet(state_global));
    out.push(Instr::I32Const(value));
    out.push(Instr::Simple(SimpleOp::I32Eq));
}

/// The async call-site expansion (`spec.md` §4.6 step 7): a three-way guard
/// admitting either a fresh, in-order call (`state == Normal`) or a replayed
/// one (`state == Rewinding` and this is the saved resume point), followed by
/// an escape back to `OUTER` if the call itself just triggered a fresh
/// unwind.
fn emit_call_site(
    out: &mut Vec<Instr>,
    k: usize,
    cs: &CallSite,
    globals: &GlobalIndices,
    scratch: &ScratchLocals,
    depth: u32,
) {
    push_state_eq(out, globals.state_global, STATE_NORMAL);
    push_state_eq(out, globals.state_global, STATE_REWINDING);
    out.push(Instr::LocalGet(scratch.call_index_rewind));
    out.push(Instr::I32Const(k as i32));
    out.push(Instr::Simple(SimpleOp::I32Eq));
    out.push(Instr::Simple(SimpleOp::I32And));
    out.push(Instr::Simple(SimpleOp::I32Or));
    out.push(Instr::If(BlockTy::Empty));

    for &(local, _) in &cs.arg_locals {
        out.push(Instr::LocalGet(local));
    }
    out.push(cs.call_instr.clone());
    for &(local, _) in cs.result_locals.iter().rev() {
        out.push(Instr::LocalSet(local));
    }

    push_state_eq(out, globals.state_global, STATE_UNWINDING);
    out.push(Instr::If(BlockTy::Empty));
    out.push(Instr::I32Const(k as i32));
    out.push(Instr::Br(4 + depth)); // unwind-check-if(0), condition-if(1), INNER(2), MIDDLE(3), OUTER(4)
    out.push(Instr::End);

    out.push(Instr::End);
}

/// Rewind prelude (`spec.md` §4.6 step 8, "Prelude (rewind path)"): restores
/// this function's own frame — every locally-live local across every call
/// site, at the offsets [`super::frame_size`] assigned — and parks
/// `stack_ptr_cache` at the frame base so the call-index load that follows
/// can read the saved resume point.
fn emit_prelude(
    out: &mut Vec<Instr>,
    globals: &GlobalIndices,
    scratch: &ScratchLocals,
    frame: &FrameLayout,
    local_types: &[ValType],
    memory_index: u32,
    ptr_ty: ValType,
) {
    if frame.offsets.is_empty() && frame.size == 4 {
        // No live locals ever need saving (every call site has an empty
        // union); still worth guarding, since `stack_ptr_cache` must be
        // parked correctly so the call-index load below reads the right
        // word even when no locals are restored alongside it.
    }

    push_state_eq(out, globals.state_global, STATE_REWINDING);
    out.push(Instr::If(BlockTy::Empty));

    out.push(Instr::GlobalGet(globals.data_global)); // store address
    out.push(Instr::GlobalGet(globals.data_global)); // load address
    out.push(load_ptr(memory_index, ptr_ty, 0));
    out.push(ptr_const(ptr_ty, frame.size as i64));
    out.push(ptr_sub(ptr_ty));
    out.push(Instr::LocalTee(scratch.stack_ptr_cache));
    out.push(store_ptr(memory_index, ptr_ty, 0));

    for (idx, offset) in ascending_offsets(frame) {
        let ty = local_types[idx as usize];
        out.push(Instr::LocalGet(scratch.stack_ptr_cache));
        out.extend(crate::valtype::emit_restore(idx, ty, offset + 4, memory_index));
    }

    out.push(Instr::End);
}

/// Rewind call-index load (`spec.md` §4.6 step 8): reads the 4-byte call
/// index stored at the base of this frame into `call_index_rewind`, so every
/// call site's three-way guard can test whether it is the saved resume
/// point.
fn emit_rewind_call_index_load(
    out: &mut Vec<Instr>,
    globals: &GlobalIndices,
    scratch: &ScratchLocals,
    memory_index: u32,
) {
    push_state_eq(out, globals.state_global, STATE_REWINDING);
    out.push(Instr::If(BlockTy::Empty));
    out.push(Instr::LocalGet(scratch.stack_ptr_cache));
    out.push(Instr::Load {
        op: LoadOp::I32Load,
        memarg: MemArg { align: 2, offset: 0, memory_index },
    });
    out.push(Instr::LocalSet(scratch.call_index_rewind));
    out.push(Instr::End);
}

/// Save path (`spec.md` §4.6 step 8, "Save path"): runs once, after `OUTER`
/// closes with the escaping call-site index on the stack, and only takes
/// effect if this function itself is unwinding (as opposed to merely having
/// fallen through `OUTER` some other way, which `spec.md` §9 notes cannot
/// actually happen given how `br OUTER` is only ever reached from inside an
/// `if (state == Unwinding)` check — kept anyway because `spec.md` specifies
/// it unconditionally).
fn emit_save_path(
    out: &mut Vec<Instr>,
    globals: &GlobalIndices,
    scratch: &ScratchLocals,
    frame: &FrameLayout,
    local_types: &[ValType],
    memory_index: u32,
    ptr_ty: ValType,
) {
    let ptr_size: u64 = if ptr_ty == ValType::I64 { 8 } else { 4 };

    push_state_eq(out, globals.state_global, STATE_UNWINDING);
    out.push(Instr::If(BlockTy::Empty));

    out.push(Instr::GlobalGet(globals.data_global));
    out.push(load_ptr(memory_index, ptr_ty, 0));
    out.push(Instr::LocalTee(scratch.stack_ptr_cache));

    // Frame-bounds trap (`spec.md` §3, §9 "Frame bounds trap"): guards every
    // store below it, the same invariant the helpers re-validate at their
    // own entry/exit.
    out.push(Instr::LocalGet(scratch.stack_ptr_cache));
    out.push(ptr_const(ptr_ty, frame.size as i64));
    out.push(ptr_add(ptr_ty));
    out.push(Instr::GlobalGet(globals.data_global));
    out.push(load_ptr(memory_index, ptr_ty, ptr_size));
    out.push(gt_u(ptr_ty));
    out.push(Instr::If(BlockTy::Empty));
    out.push(Instr::Unreachable);
    out.push(Instr::End);

    out.push(Instr::LocalGet(scratch.stack_ptr_cache));
    out.push(Instr::LocalGet(scratch.call_index_save));
    out.push(Instr::Store {
        op: StoreOp::I32Store,
        memarg: MemArg { align: 2, offset: 0, memory_index },
    });

    for (idx, offset) in ascending_offsets(frame) {
        let ty = local_types[idx as usize];
        out.push(Instr::LocalGet(scratch.stack_ptr_cache));
        out.extend(crate::valtype::emit_save(idx, ty, offset + 4, memory_index));
    }

    out.push(Instr::GlobalGet(globals.data_global));
    out.push(Instr::LocalGet(scratch.stack_ptr_cache));
    out.push(ptr_const(ptr_ty, frame.size as i64));
    out.push(ptr_add(ptr_ty));
    out.push(store_ptr(memory_index, ptr_ty, 0));

    out.push(Instr::End);
}

fn ascending_offsets(frame: &FrameLayout) -> Vec<(u32, u64)> {
    let mut locals: Vec<(u32, u64)> = frame.offsets.iter().map(|(&idx, &off)| (idx, off)).collect();
    locals.sort_by_key(|&(idx, _)| idx);
    locals
}

fn dummy_const(ty: ValType) -> Instr {
    match ty {
        ValType::I32 => Instr::I32Const(0),
        ValType::I64 => Instr::I64Const(0),
        ValType::F32 => Instr::F32Const(0.0),
        ValType::F64 => Instr::F64Const(0.0),
        ValType::V128 => Instr::V128Const(0),
        ValType::Ref(_) => unreachable!("reference types are rejected before emission reaches this point"),
    }
}

fn ptr_const(ty: ValType, value: i64) -> Instr {
    if ty == ValType::I64 {
        Instr::I64Const(value)
    } else {
        Instr::I32Const(value as i32)
    }
}

fn ptr_sub(ty: ValType) -> Instr {
    if ty == ValType::I64 {
        Instr::Simple(SimpleOp::I64Sub)
    } else {
        Instr::Simple(SimpleOp::I32Sub)
    }
}

fn ptr_add(ty: ValType) -> Instr {
    if ty == ValType::I64 {
        Instr::Simple(SimpleOp::I64Add)
    } else {
        Instr::Simple(SimpleOp::I32Add)
    }
}

fn gt_u(ty: ValType) -> Instr {
    if ty == ValType::I64 {
        Instr::Simple(SimpleOp::I64GtU)
    } else {
        Instr::Simple(SimpleOp::I32GtU)
    }
}

fn load_ptr(memory_index: u32, ty: ValType, offset: u64) -> Instr {
    let align = if ty == ValType::I64 { 3 } else { 2 };
    let op = if ty == ValType::I64 { LoadOp::I64Load } else { LoadOp::I32Load };
    Instr::Load { op, memarg: MemArg { align, offset, memory_index } }
}

fn store_ptr(memory_index: u32, ty: ValType, offset: u64) -> Instr {
    let align = if ty == ValType::I64 { 3 } else { 2 };
    let op = if ty == ValType::I64 { StoreOp::I64Store } else { StoreOp::I32Store };
    Instr::Store { op, memarg: MemArg { align, offset, memory_index } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::BitSet;
    use crate::config::Config;
    use crate::module::Module;

    fn base_module_with_async_import() -> (Module, u32) {
        let mut module = Module::default();
        let callee_ty = super::super::intern_func_type(&mut module, &[], &[]);
        module.imports.push(crate::module::Import {
            module: "env".into(),
            name: "sleep".into(),
            kind: crate::module::ImportKind::Func(callee_ty),
        });
        let caller_ty = super::super::intern_func_type(&mut module, &[], &[]);
        module.functions.push(caller_ty);
        module.code.push(crate::module::FunctionBody::Raw(Vec::new()));
        (module, callee_ty)
    }

    #[test]
    fn minimal_async_function_contains_state_checks_and_scratch_locals() {
        let (mut module, _callee_ty) = base_module_with_async_import();
        let func_idx = 1u32; // one imported func (index 0) then this one
        let instrs = vec![Instr::Call(0), Instr::End];
        let async_funcs: BitSet = [0u32].into_iter().collect();
        let config = Config::new();
        let globals = GlobalIndices { state_global: 0, data_global: 1 };

        let body = super::super::transform_function(
            &mut module,
            func_idx,
            Vec::new(),
            instrs,
            &async_funcs,
            &config,
            globals,
        )
        .unwrap();

        let crate::module::FunctionBody::Decoded { locals, instrs } = body.clone() else {
            panic!("expected a decoded body");
        };

        // At least ten scratch locals beyond the (zero) original locals.
        let total_locals: u32 = locals.iter().map(|(c, _)| *c).sum();
        assert!(total_locals >= 10, "expected >=10 locals, got {total_locals}");

        // Rewinding check: global.get ; i32.const 2 ; i32.eq
        let has_rewind_check = instrs.windows(3).any(|w| {
            matches!(w[0], Instr::GlobalGet(_))
                && matches!(w[1], Instr::I32Const(2))
                && matches!(w[2], Instr::Simple(SimpleOp::I32Eq))
        });
        assert!(has_rewind_check, "missing a state==Rewinding check");

        // Unwinding check: i32.const 1 immediately following a state read.
        let has_unwind_check = instrs.windows(2).any(|w| {
            matches!(w[0], Instr::GlobalGet(_)) && matches!(w[1], Instr::I32Const(1))
        });
        assert!(has_unwind_check, "missing a state==Unwinding check");

        assert!(instrs.iter().any(|i| matches!(i, Instr::Call(0))));

        // The `Instr` vector shape alone doesn't catch a structurally invalid
        // guard nest (wrong block result type, mismatched stack on a
        // fallthrough). Wire the transformed body into a standalone module
        // with the memory and the two globals it references, then validate
        // the encoded bytes.
        module.code[0] = body;
        module.memories.push(wasmparser::MemoryType {
            initial: 1,
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.globals.push(crate::module::Global {
            ty: wasmparser::GlobalType { content_type: ValType::I32, mutable: true, shared: false },
            init: crate::module::ConstExpr::I32(0),
        });
        module.globals.push(crate::module::Global {
            ty: wasmparser::GlobalType { content_type: ValType::I32, mutable: true, shared: false },
            init: crate::module::ConstExpr::I32(0),
        });
        let bytes = crate::module::encode(&module);
        wasmparser::Validator::new().validate_all(&bytes).unwrap_or_else(|e| panic!("invalid module: {e}"));
    }

    #[test]
    fn non_async_function_is_left_unguarded() {
        let mut module = Module::default();
        let ty = super::super::intern_func_type(&mut module, &[], &[ValType::I32]);
        module.functions.push(ty);
        module.code.push(crate::module::FunctionBody::Raw(Vec::new()));

        let instrs = vec![Instr::I32Const(42), Instr::End];
        let async_funcs = BitSet::new();
        let config = Config::new();
        let globals = GlobalIndices { state_global: 0, data_global: 1 };

        let body = super::super::transform_function(&mut module, 0, Vec::new(), instrs, &async_funcs, &config, globals)
            .unwrap();
        let crate::module::FunctionBody::Decoded { instrs, .. } = body else {
            panic!("expected a decoded body");
        };
        // No call sites: no state checks should have been introduced at all.
        assert!(!instrs.iter().any(|i| matches!(i, Instr::GlobalGet(_))));
    }
}
