//! Step 1 of the per-function rewrite (`spec.md` §4.6 step 3): route every
//! `block`/`loop`/`if` exit value through a dedicated local instead of the
//! operand stack.
//!
//! Only *result* arities are linearized here, not a block's own parameter
//! arity: a block's param values are ordinary stack pushes produced by the
//! code right before it, and [`super::simulate::materialize`] already turns
//! every such push into a local a moment later. Branches that *continue* a
//! `loop` (rather than exit a `block`/`if`) carry the loop's *parameter*
//! types, not its result types, for the same reason they need no separate
//! handling here.
//!
//! Grounded on `crates/wasmi/src/engine/func_builder/control_frame.rs`'s
//! frame-stack bookkeeping (one entry per open `block`/`loop`/`if`, consulted
//! by relative branch depth) — generalized here from "does this frame have a
//! label" to "does this frame's exit value need a local".

use wasmparser::ValType;

use crate::error::{Error, UnsupportedError};
use crate::instr::{BlockTy, Instr};
use crate::module::Module;

use super::{intern_func_type, LocalAllocator};

/// One open `block`/`loop`/`if` frame, tracked from the matching opener to
/// its `end`.
struct Frame {
    is_loop: bool,
    /// `Some` once this frame's result arity is non-empty: the locals
    /// holding its exit value(s), and their types (for `BlockTy::FuncType`'s
    /// benefit nowhere else — kept here simply so callers don't need to
    /// re-resolve the type to emit a `br_table` scratch sequence).
    result_locals: Option<(Vec<u32>, Vec<ValType>)>,
}

fn resolve_block_ty(module: &Module, bt: BlockTy) -> (Vec<ValType>, Vec<ValType>) {
    match bt {
        BlockTy::Empty => (Vec::new(), Vec::new()),
        BlockTy::Single(ty) => (Vec::new(), vec![ty]),
        BlockTy::FuncType(idx) => {
            let ty = &module.types[idx as usize];
            (ty.params().to_vec(), ty.results().to_vec())
        }
    }
}

/// Stores the top `locals.len()` stack values into `locals`, most-recently
/// pushed first (`local.set` pops, so writing last-declared-type first).
fn emit_store(out: &mut Vec<Instr>, locals: &[u32]) {
    for &local in locals.iter().rev() {
        out.push(Instr::LocalSet(local));
    }
}

fn target_frame(frames: &[Frame], depth: u32) -> Option<&Frame> {
    let len = frames.len();
    if (depth as usize) < len {
        Some(&frames[len - 1 - depth as usize])
    } else {
        None
    }
}

pub(crate) fn linearize(
    module: &mut Module,
    alloc: &mut LocalAllocator,
    instrs: &[Instr],
) -> Result<Vec<Instr>, Error> {
    let mut out = Vec::with_capacity(instrs.len());
    let mut frames: Vec<Frame> = Vec::new();

    for instr in instrs {
        match instr {
            Instr::Block(bt) | Instr::Loop(bt) | Instr::If(bt) => {
                let is_loop = matches!(instr, Instr::Loop(_));
                let (params, results) = resolve_block_ty(module, *bt);

                if results.is_empty() {
                    out.push(instr.clone());
                    frames.push(Frame { is_loop, result_locals: None });
                } else {
                    let result_locals: Vec<u32> = results.iter().map(|ty| alloc.alloc(*ty)).collect();
                    let new_ty = intern_func_type(module, &params, &[]);
                    out.push(match instr {
                        Instr::Block(_) => Instr::Block(BlockTy::FuncType(new_ty)),
                        Instr::Loop(_) => Instr::Loop(BlockTy::FuncType(new_ty)),
                        Instr::If(_) => Instr::If(BlockTy::FuncType(new_ty)),
                        _ => unreachable!(),
                    });
                    frames.push(Frame { is_loop, result_locals: Some((result_locals, results)) });
                }
            }

            Instr::Else => {
                // The `then` arm's own fallthrough exit is implicitly an
                // "end" of that arm: store its result before the `else`
                // token so the `else` arm produces the same value through
                // the same locals at the real `end`.
                if let Some(frame) = frames.last() {
                    if let Some((locals, _)) = &frame.result_locals {
                        emit_store(&mut out, locals);
                    }
                }
                out.push(Instr::Else);
            }

            Instr::End => {
                // A function body's instruction stream carries one `end` per
                // open `block`/`loop`/`if` plus a final trailing `end` that
                // terminates the function itself and has no matching opener
                // in `frames`. That last one passes through untouched; the
                // emitter is responsible for deciding whether to keep or
                // replace it once it wraps the body in its own block nest.
                match frames.pop() {
                    Some(frame) => {
                        if let Some((locals, _)) = &frame.result_locals {
                            emit_store(&mut out, locals);
                            out.push(Instr::End);
                            for &local in &locals {
                                out.push(Instr::LocalGet(local));
                            }
                        } else {
                            out.push(Instr::End);
                        }
                    }
                    None => out.push(Instr::End),
                }
            }

            Instr::Br(depth) => {
                if let Some(frame) = target_frame(&frames, *depth) {
                    if !frame.is_loop {
                        if let Some((locals, _)) = &frame.result_locals {
                            emit_store(&mut out, locals);
                        }
                    }
                }
                out.push(Instr::Br(*depth));
            }

            Instr::BrIf(depth) => {
                let mut stored = false;
                if let Some(frame) = target_frame(&frames, *depth) {
                    if !frame.is_loop {
                        if let Some((locals, _)) = &frame.result_locals {
                            let cond_local = alloc.alloc(ValType::I32);
                            out.push(Instr::LocalSet(cond_local));
                            emit_store(&mut out, locals);
                            out.push(Instr::LocalGet(cond_local));
                            stored = true;
                        }
                    }
                }
                let _ = stored;
                out.push(Instr::BrIf(*depth));
            }

            Instr::BrTable(depths, default) => {
                rewrite_br_table(&mut out, alloc, &frames, depths, *default)?;
                out.push(instr.clone());
            }

            other => out.push(other.clone()),
        }
    }

    Ok(out)
}

/// `br_table`'s targets (and its default) all share one label type by wasm's
/// own validation rule, so whichever targeted frame happens to need result
/// locals tells us the common arity/types for every other targeted frame.
/// The branch value is popped once into scratch locals, re-read (via
/// `local.get`, non-destructively) into every distinct linearized target's
/// own result locals, then pushed back so the `br_table` itself still sees
/// its expected operands.
fn rewrite_br_table(
    out: &mut Vec<Instr>,
    alloc: &mut LocalAllocator,
    frames: &[Frame],
    depths: &[u32],
    default: u32,
) -> Result<(), Error> {
    let all_depths = depths.iter().copied().chain(std::iter::once(default));

    let tys = all_depths
        .clone()
        .filter_map(|d| target_frame(frames, d))
        .find_map(|f| f.result_locals.as_ref().map(|(_, tys)| tys.clone()));

    let Some(tys) = tys else {
        return Ok(());
    };

    let scratch: Vec<u32> = tys.iter().map(|ty| alloc.alloc(*ty)).collect();
    emit_store(out, &scratch);

    let mut seen_depths: Vec<u32> = Vec::new();
    for d in all_depths {
        if seen_depths.contains(&d) {
            continue;
        }
        seen_depths.push(d);
        if let Some(frame) = target_frame(frames, d) {
            if frame.is_loop {
                continue;
            }
            if let Some((locals, _)) = &frame.result_locals {
                for &local in &scratch {
                    out.push(Instr::LocalGet(local));
                }
                emit_store(out, locals);
            }
        }
    }

    for &local in &scratch {
        out.push(Instr::LocalGet(local));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;

    fn test_alloc() -> LocalAllocator {
        LocalAllocator::new(0, Vec::new())
    }

    #[test]
    fn block_with_result_routes_through_local() {
        let mut module = Module::default();
        let ty = intern_func_type(&mut module, &[], &[ValType::I32]);
        let instrs = vec![
            Instr::Block(BlockTy::FuncType(ty)),
            Instr::I32Const(1),
            Instr::End,
        ];
        let mut alloc = test_alloc();
        let out = linearize(&mut module, &mut alloc, &instrs).unwrap();
        assert!(matches!(out[0], Instr::Block(BlockTy::FuncType(_))));
        assert!(matches!(out.last().unwrap(), Instr::LocalGet(_)));
        assert!(out.iter().any(|i| matches!(i, Instr::LocalSet(_))));
    }

    #[test]
    fn block_without_result_is_untouched() {
        let mut module = Module::default();
        let instrs = vec![Instr::Block(BlockTy::Empty), Instr::Nop, Instr::End];
        let mut alloc = test_alloc();
        let out = linearize(&mut module, &mut alloc, &instrs).unwrap();
        assert_eq!(out, instrs);
    }

    #[test]
    fn br_to_linearized_block_stores_before_branch() {
        let mut module = Module::default();
        let ty = intern_func_type(&mut module, &[], &[ValType::I32]);
        let instrs = vec![
            Instr::Block(BlockTy::FuncType(ty)),
            Instr::I32Const(1),
            Instr::Br(0),
            Instr::End,
        ];
        let mut alloc = test_alloc();
        let out = linearize(&mut module, &mut alloc, &instrs).unwrap();
        let br_pos = out.iter().position(|i| matches!(i, Instr::Br(0))).unwrap();
        assert!(matches!(out[br_pos - 1], Instr::LocalSet(_)));
    }
}
