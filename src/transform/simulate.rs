//! Step 2 of the per-function rewrite (`spec.md` §4.6 steps 2, 4–7): walk the
//! linearized instruction list once, modelling the real Wasm operand stack as
//! a `(local_index, value_type)` sequence, and convert every individual push
//! into a dedicated fresh local.
//!
//! # Zero-residual-stack discipline
//!
//! Between any two instructions that came from the original function body,
//! the *real* operand stack height this pass leaves behind is always zero:
//! every value a plain instruction would push is immediately drained into a
//! fresh local (`local.set`), and re-fetched (`local.get`) immediately before
//! the instruction that consumes it. This is what makes
//! [`super::emit::emit`]'s per-instruction `if (state == Normal)` guards safe
//! to open and close anywhere a control-flow instruction appears — an empty
//! `if` block can never straddle a non-empty operand stack, so a guard
//! boundary is valid no matter where the linearized stream happens to put it.
//!
//! Every other instruction in this module follows from that one discipline:
//! `drop` becomes a pure no-op (the value was never really on the stack to
//! begin with — it already lives in a local from its own materialization);
//! `block`/`loop`/`if` are transparent to the simulated stack (their "params"
//! persist across the frame boundary rather than being consumed); branches to
//! a `block`/`if` need no rematerialization (the linearizer already drained
//! their exit value before the branch), but branches to a `loop` do, because
//! the linearizer deliberately leaves loop back-edges alone (loop labels
//! carry the loop's *parameter* types, which were never routed through a
//! local).
//!
//! Grounded on `crates/wasmi/src/engine/func_builder/value_stack.rs`'s
//! operand-stack bookkeeping (a plain `Vec` tracking what each "stack slot"
//! currently holds), adapted here from "local-or-stack-slot" tracking to
//! "every slot is a local".

use wasmparser::ValType;

use crate::bitset::BitSet;
use crate::error::{Error, UnsupportedError};
use crate::instr::{BlockTy, Instr};
use crate::module::Module;

use super::{CallSite, LocalAllocator};

pub(crate) struct MaterializeResult {
    pub instrs: Vec<Instr>,
    pub call_sites: Vec<CallSite>,
}

/// One open `block`/`loop`/`if` frame. Only a loop's param types matter here
/// (a branch targeting a `block`/`if` needs no rematerialization — see module
/// docs — so its arity is never consulted).
struct SimFrame {
    is_loop: bool,
    param_types: Vec<ValType>,
}

fn block_params(module: &Module, bt: BlockTy) -> Vec<ValType> {
    match bt {
        BlockTy::Empty | BlockTy::Single(_) => Vec::new(),
        BlockTy::FuncType(idx) => module.types[idx as usize].params().to_vec(),
    }
}

fn target_frame(frames: &[SimFrame], depth: u32) -> Option<&SimFrame> {
    let len = frames.len();
    if (depth as usize) < len {
        Some(&frames[len - 1 - depth as usize])
    } else {
        None
    }
}

struct Materializer<'a> {
    module: &'a Module,
    alloc: &'a mut LocalAllocator,
    func_idx: u32,
    async_funcs: &'a BitSet,
    ignore_indirect: bool,
    local_ty: Vec<ValType>,
    sim_stack: Vec<(u32, ValType)>,
    frames: Vec<SimFrame>,
    out: Vec<Instr>,
    call_sites: Vec<CallSite>,
    func_result_types: Vec<ValType>,
}

impl<'a> Materializer<'a> {
    fn alloc_local(&mut self, ty: ValType) -> Result<u32, Error> {
        if crate::valtype::is_reference(ty) {
            return Err(UnsupportedError::ReferenceType {
                func_idx: self.func_idx,
                context: "operand stack",
            }
            .into());
        }
        let idx = self.alloc.alloc(ty);
        debug_assert_eq!(idx as usize, self.local_ty.len());
        self.local_ty.push(ty);
        Ok(idx)
    }

    /// Pops `pops.len()` entries (fetched via `local.get`, in stack order),
    /// emits `instr`, then pushes `pushes.len()` freshly materialized locals
    /// (`local.set`, most-recently-pushed first).
    fn generic(&mut self, instr: Instr, pops: &[ValType], pushes: &[ValType]) -> Result<(), Error> {
        let start = self.sim_stack.len() - pops.len();
        let operands: Vec<(u32, ValType)> = self.sim_stack.split_off(start);
        for &(local, _) in &operands {
            self.out.push(Instr::LocalGet(local));
        }
        self.out.push(instr);

        let mut new_locals = Vec::with_capacity(pushes.len());
        for &ty in pushes.iter().rev() {
            let local = self.alloc_local(ty)?;
            self.out.push(Instr::LocalSet(local));
            new_locals.push((local, ty));
        }
        new_locals.reverse();
        self.sim_stack.extend(new_locals);
        Ok(())
    }

    fn is_async_call(&self, instr: &Instr) -> bool {
        match instr {
            Instr::Call(idx) => self.async_funcs.contains(*idx),
            Instr::CallIndirect { .. } | Instr::CallRef(_) => !self.ignore_indirect,
            _ => false,
        }
    }

    /// Shared handling for `call`/`call_indirect`/`call_ref` (`spec.md` §4.6
    /// step 7, §4.7): pop the callee's params (plus, for indirect/ref calls,
    /// the trailing table-index operand), emit the call, materialize its
    /// results. If this is an async call site, also record a [`CallSite`]:
    /// every other value still resident on the simulated stack underneath
    /// this call's own arguments must be saved too (`extra_locals`), and the
    /// call's own argument locals must be saved as well so rewind can replay
    /// the call exactly (`arg_locals`).
    fn call(
        &mut self,
        call_instr: Instr,
        param_types: Vec<ValType>,
        result_types: Vec<ValType>,
        has_extra_operand: bool,
    ) -> Result<(), Error> {
        let is_async = self.is_async_call(&call_instr);
        let total = param_types.len() + has_extra_operand as usize;
        let start = self.sim_stack.len() - total;
        let arg_locals: Vec<(u32, ValType)> = self.sim_stack.split_off(start);
        for &(local, _) in &arg_locals {
            self.out.push(Instr::LocalGet(local));
        }

        let mut extra_locals = Vec::new();
        if is_async {
            for &(local, ty) in &self.sim_stack {
                if crate::valtype::is_reference(ty) {
                    return Err(UnsupportedError::ReferenceType {
                        func_idx: self.func_idx,
                        context: "operand stack at async call site",
                    }
                    .into());
                }
                extra_locals.push((local, ty));
            }
        }

        let position = self.out.len();
        self.out.push(call_instr.clone());

        let mut result_locals = Vec::with_capacity(result_types.len());
        for &ty in result_types.iter().rev() {
            let local = self.alloc_local(ty)?;
            self.out.push(Instr::LocalSet(local));
            result_locals.push((local, ty));
        }
        result_locals.reverse();
        self.sim_stack.extend(result_locals.iter().copied());

        if is_async {
            self.call_sites.push(CallSite {
                position,
                call_instr,
                param_types,
                result_types,
                extra_locals,
                arg_locals,
                result_locals,
            });
        }

        Ok(())
    }

    fn reject_reference(&self, context: &'static str) -> Error {
        UnsupportedError::ReferenceType { func_idx: self.func_idx, context }.into()
    }

    fn run(mut self, linear: &[Instr]) -> Result<MaterializeResult, Error> {
        for instr in linear {
            if let Some(effect) = crate::stack_effect::lookup(instr) {
                self.generic(instr.clone(), effect.pops, effect.pushes)?;
                continue;
            }

            match instr {
                Instr::Drop => {
                    self.sim_stack.pop().expect("drop operates on a stack value");
                }

                Instr::Select => {
                    let start = self.sim_stack.len() - 3;
                    let operands: Vec<(u32, ValType)> = self.sim_stack.split_off(start);
                    let ty = operands[0].1;
                    for &(local, _) in &operands {
                        self.out.push(Instr::LocalGet(local));
                    }
                    self.out.push(Instr::Select);
                    let local = self.alloc_local(ty)?;
                    self.out.push(Instr::LocalSet(local));
                    self.sim_stack.push((local, ty));
                }
                Instr::TypedSelect(tys) => {
                    let ty = tys[0];
                    let pops = [ty, ty, ValType::I32];
                    self.generic(instr.clone(), &pops, &[ty])?;
                }

                Instr::Block(bt) => {
                    self.frames.push(SimFrame { is_loop: false, param_types: block_params(self.module, *bt) });
                    self.out.push(instr.clone());
                }
                Instr::Loop(bt) => {
                    self.frames.push(SimFrame { is_loop: true, param_types: block_params(self.module, *bt) });
                    self.out.push(instr.clone());
                }
                Instr::If(bt) => {
                    let (cond, _) = self.sim_stack.pop().expect("if operates on an i32 condition");
                    self.out.push(Instr::LocalGet(cond));
                    self.frames.push(SimFrame { is_loop: false, param_types: block_params(self.module, *bt) });
                    self.out.push(instr.clone());
                }
                Instr::Else => {
                    self.out.push(Instr::Else);
                }
                Instr::End => {
                    // The function body's own terminating `end` has no
                    // matching frame (see `linearize`'s handling of the same
                    // instruction). Unlike every other `end`, this one can
                    // leave values resident on the simulated stack — an
                    // implicit, `return`-less exit that falls off the end of
                    // the function carrying its result values with it — so
                    // those must be drained back onto the real stack here,
                    // exactly as an explicit `Instr::Return` would.
                    if self.frames.pop().is_none() {
                        let vals: Vec<(u32, ValType)> = self.sim_stack.split_off(0);
                        for &(local, _) in &vals {
                            self.out.push(Instr::LocalGet(local));
                        }
                    }
                    self.out.push(Instr::End);
                }

                Instr::Br(depth) => {
                    if let Some(frame) = target_frame(&self.frames, *depth) {
                        if frame.is_loop && !frame.param_types.is_empty() {
                            let k = frame.param_types.len();
                            let start = self.sim_stack.len() - k;
                            let vals: Vec<(u32, ValType)> = self.sim_stack.split_off(start);
                            for &(local, _) in &vals {
                                self.out.push(Instr::LocalGet(local));
                            }
                        }
                    }
                    self.out.push(Instr::Br(*depth));
                }
                Instr::BrIf(depth) => {
                    let (cond, _) = self.sim_stack.pop().expect("br_if operates on an i32 condition");
                    let loop_params = target_frame(&self.frames, *depth)
                        .filter(|f| f.is_loop)
                        .map(|f| f.param_types.clone())
                        .unwrap_or_default();
                    if loop_params.is_empty() {
                        self.out.push(Instr::LocalGet(cond));
                        self.out.push(Instr::BrIf(*depth));
                    } else {
                        // `br_if` to a loop carries the loop's param values
                        // only when actually taken; on the not-taken path
                        // they must remain untouched for later code, so a
                        // plain `local.get`-then-`br_if` would leave residual
                        // values on the real stack for the fallthrough case.
                        // Rewritten as `if (cond) { fetch params; br depth+1 }`
                        // so the values only ever reach the real stack on the
                        // path that actually consumes them.
                        let k = loop_params.len();
                        let start = self.sim_stack.len() - k;
                        let vals: Vec<(u32, ValType)> = self.sim_stack[start..].to_vec();
                        self.out.push(Instr::LocalGet(cond));
                        self.out.push(Instr::If(BlockTy::Empty));
                        for &(local, _) in &vals {
                            self.out.push(Instr::LocalGet(local));
                        }
                        self.out.push(Instr::Br(*depth + 1));
                        self.out.push(Instr::End);
                    }
                }
                Instr::BrTable(depths, default) => {
                    let arity = depths
                        .iter()
                        .chain(std::iter::once(default))
                        .filter_map(|&d| target_frame(&self.frames, d))
                        .filter(|f| f.is_loop)
                        .map(|f| f.param_types.len())
                        .max()
                        .unwrap_or(0);
                    if arity > 0 {
                        let start = self.sim_stack.len() - arity;
                        let vals: Vec<(u32, ValType)> = self.sim_stack.split_off(start);
                        for &(local, _) in &vals {
                            self.out.push(Instr::LocalGet(local));
                        }
                    }
                    self.out.push(Instr::BrTable(depths.clone(), *default));
                }
                Instr::Return => {
                    let k = self.func_result_types.len();
                    let start = self.sim_stack.len() - k;
                    let vals: Vec<(u32, ValType)> = self.sim_stack.split_off(start);
                    for &(local, _) in &vals {
                        self.out.push(Instr::LocalGet(local));
                    }
                    self.out.push(Instr::Return);
                }

                Instr::Call(idx) => {
                    let func_type = self
                        .module
                        .func_type(*idx)
                        .expect("call target exists in the module")
                        .clone();
                    let params = func_type.params().to_vec();
                    let results = func_type.results().to_vec();
                    self.call(Instr::Call(*idx), params, results, false)?;
                }
                Instr::CallIndirect { type_index, table_index } => {
                    let ty = self.module.types[*type_index as usize].clone();
                    let params = ty.params().to_vec();
                    let results = ty.results().to_vec();
                    self.call(
                        Instr::CallIndirect { type_index: *type_index, table_index: *table_index },
                        params,
                        results,
                        true,
                    )?;
                }
                Instr::CallRef(type_index) => {
                    // `decode::decode_function_body` already rejects
                    // `call_ref` outright, so this arm is unreachable from
                    // any module this crate actually decodes; kept so the
                    // match stays exhaustive and so a future relaxation of
                    // that decode-time restriction has a sound fallback.
                    let ty = self.module.types[*type_index as usize].clone();
                    let params = ty.params().to_vec();
                    let results = ty.results().to_vec();
                    self.call(Instr::CallRef(*type_index), params, results, true)?;
                }

                Instr::LocalGet(idx) => {
                    let ty = self.local_ty[*idx as usize];
                    self.generic(Instr::LocalGet(*idx), &[], &[ty])?;
                }
                Instr::LocalSet(idx) => {
                    let ty = self.local_ty[*idx as usize];
                    self.generic(Instr::LocalSet(*idx), &[ty], &[])?;
                }
                Instr::LocalTee(idx) => {
                    let ty = self.local_ty[*idx as usize];
                    self.generic(Instr::LocalTee(*idx), &[ty], &[ty])?;
                }
                Instr::GlobalGet(idx) => {
                    let ty = self
                        .module
                        .global_type(*idx)
                        .expect("global.get target exists in the module")
                        .content_type;
                    self.generic(Instr::GlobalGet(*idx), &[], &[ty])?;
                }
                Instr::GlobalSet(idx) => {
                    let ty = self
                        .module
                        .global_type(*idx)
                        .expect("global.set target exists in the module")
                        .content_type;
                    self.generic(Instr::GlobalSet(*idx), &[ty], &[])?;
                }

                Instr::Store { op, memarg } => {
                    let pops = [ValType::I32, op.value_type()];
                    self.generic(Instr::Store { op: *op, memarg: *memarg }, &pops, &[])?;
                }

                Instr::V128Const(_) => {
                    self.generic(instr.clone(), &[], &[ValType::V128])?;
                }

                // Reference-producing or reference-consuming opcodes: always
                // rejected (`spec.md` §3's blanket invariant, see module
                // docs for why this is simpler than checking only at call
                // sites per §4.6 step 7(a)).
                Instr::RefNull(_)
                | Instr::RefFunc(_)
                | Instr::RefIsNull
                | Instr::RefAsNonNull
                | Instr::BrOnNull(_)
                | Instr::BrOnNonNull(_)
                | Instr::TableGet(_)
                | Instr::TableSet(_)
                | Instr::TableGrow(_)
                | Instr::TableFill(_) => {
                    return Err(self.reject_reference("reference-typed operation"));
                }

                other => unreachable!("instruction {other:?} has a fixed stack effect, handled above"),
            }
        }

        Ok(MaterializeResult { instrs: self.out, call_sites: self.call_sites })
    }
}

pub(crate) fn materialize(
    module: &Module,
    alloc: &mut LocalAllocator,
    linear: &[Instr],
    func_idx: u32,
    async_funcs: &BitSet,
    ignore_indirect: bool,
) -> Result<MaterializeResult, Error> {
    let func_type = module
        .func_type(func_idx)
        .expect("caller only transforms functions that exist in the module")
        .clone();

    let mut local_ty: Vec<ValType> = func_type.params().to_vec();
    for &(count, ty) in alloc.declared() {
        for _ in 0..count {
            local_ty.push(ty);
        }
    }

    let materializer = Materializer {
        module,
        alloc,
        func_idx,
        async_funcs,
        ignore_indirect,
        local_ty,
        sim_stack: Vec::new(),
        frames: Vec::new(),
        out: Vec::with_capacity(linear.len()),
        call_sites: Vec::new(),
        func_result_types: func_type.results().to_vec(),
    };

    materializer.run(linear)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::BitSet;
    use crate::instr::SimpleOp;

    fn alloc_for(params: u32) -> LocalAllocator {
        LocalAllocator::new(params, Vec::new())
    }

    #[test]
    fn plain_arithmetic_materializes_every_push() {
        let mut module = Module::default();
        let ty = super::super::intern_func_type(&mut module, &[], &[ValType::I32]);
        module.functions.push(ty);
        module.code.push(crate::module::FunctionBody::Raw(Vec::new()));

        let instrs = vec![Instr::I32Const(1), Instr::I32Const(2), Instr::Simple(SimpleOp::I32Add)];
        let mut alloc = alloc_for(0);
        let async_funcs = BitSet::new();
        let result = materialize(&module, &mut alloc, &instrs, 0, &async_funcs, false).unwrap();

        // Every constant must be drained into its own local before the add
        // consumes both via `local.get`.
        let sets = result.instrs.iter().filter(|i| matches!(i, Instr::LocalSet(_))).count();
        assert_eq!(sets, 3); // two consts + the add's own result
        assert!(result.call_sites.is_empty());
    }

    #[test]
    fn drop_emits_nothing() {
        let mut module = Module::default();
        let ty = super::super::intern_func_type(&mut module, &[], &[]);
        module.functions.push(ty);
        module.code.push(crate::module::FunctionBody::Raw(Vec::new()));

        let instrs = vec![Instr::I32Const(1), Instr::Drop];
        let mut alloc = alloc_for(0);
        let async_funcs = BitSet::new();
        let result = materialize(&module, &mut alloc, &instrs, 0, &async_funcs, false).unwrap();
        assert!(!result.instrs.iter().any(|i| matches!(i, Instr::Drop)));
    }

    #[test]
    fn async_call_site_is_recorded() {
        let mut module = Module::default();
        let callee_ty = super::super::intern_func_type(&mut module, &[ValType::I32], &[]);
        module.functions.push(callee_ty);
        module.code.push(crate::module::FunctionBody::Raw(Vec::new()));
        let caller_ty = super::super::intern_func_type(&mut module, &[], &[]);
        module.functions.push(caller_ty);
        module.code.push(crate::module::FunctionBody::Raw(Vec::new()));

        let instrs = vec![Instr::I32Const(7), Instr::Call(0)];
        let mut alloc = alloc_for(0);
        let async_funcs: BitSet = [0u32].into_iter().collect();
        let result = materialize(&module, &mut alloc, &instrs, 1, &async_funcs, false).unwrap();
        assert_eq!(result.call_sites.len(), 1);
        assert_eq!(result.call_sites[0].arg_locals.len(), 1);
    }

    #[test]
    fn reference_type_local_is_rejected() {
        let mut module = Module::default();
        let ty = super::super::intern_func_type(&mut module, &[], &[]);
        module.functions.push(ty);
        module.code.push(crate::module::FunctionBody::Raw(Vec::new()));

        let instrs = vec![Instr::RefNull(ValType::Ref(wasmparser::RefType::FUNCREF))];
        let mut alloc = alloc_for(0);
        let async_funcs = BitSet::new();
        let err = materialize(&module, &mut alloc, &instrs, 0, &async_funcs, false).unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::Unsupported(_)));
    }
}
