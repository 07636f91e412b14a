//! Builds the five Asyncify state-machine helper function bodies
//! (`spec.md` §4.4): `asyncify_get_state`, `asyncify_start_unwind`,
//! `asyncify_stop_unwind`, `asyncify_start_rewind`, `asyncify_stop_rewind`.
//!
//! These never go through the `Instr`/linearizer/liveness pipeline — they
//! need no control-flow linearization or liveness, just a small, fixed
//! instruction sequence around the state and data globals — so they are
//! hand-assembled directly with `wasm_encoder::Function`/`Instruction`, the
//! way `other_examples/644bf9a3_paritytech-wasm-instrument`'s
//! `instrument_call!` macro hand-assembles a small fixed sequence around a
//! single global.

use wasm_encoder::{BlockType, Function, Instruction, MemArg, ValType};

/// The three runtime states tracked by the state global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Normal = 0,
    Unwinding = 1,
    Rewinding = 2,
}

/// Parameters shared by every helper body.
#[derive(Debug, Clone, Copy)]
pub struct HelperParams {
    pub state_global: u32,
    pub data_global: u32,
    pub memory_index: u32,
    /// `i32` for wasm32, `i64` for wasm64 (`spec.md` §6 `wasm64` option).
    pub ptr_ty: ValType,
}

impl HelperParams {
    fn ptr_size(&self) -> u64 {
        if self.ptr_ty == ValType::I64 {
            8
        } else {
            4
        }
    }
}

/// `asyncify_get_state() -> i32`
pub fn get_state(p: &HelperParams) -> Function {
    let mut f = Function::new([]);
    f.instruction(&Instruction::GlobalGet(p.state_global));
    f.instruction(&Instruction::End);
    f
}

/// `asyncify_start_unwind(ptr) -> ()`. Local 0 is the `ptr` parameter; locals
/// 1/2 (ptr-typed) hold `stack_ptr`/`stack_end` while validating the bound.
pub fn start_unwind(p: &HelperParams) -> Function {
    set_data_and_validate(p, RuntimeState::Normal, RuntimeState::Unwinding)
}

/// `asyncify_start_rewind(ptr) -> ()`, symmetric to [`start_unwind`].
pub fn start_rewind(p: &HelperParams) -> Function {
    set_data_and_validate(p, RuntimeState::Normal, RuntimeState::Rewinding)
}

/// `asyncify_stop_unwind() -> ()`.
pub fn stop_unwind(p: &HelperParams) -> Function {
    revalidate(p, RuntimeState::Unwinding, RuntimeState::Normal)
}

/// `asyncify_stop_rewind() -> ()`, symmetric to [`stop_unwind`].
pub fn stop_rewind(p: &HelperParams) -> Function {
    revalidate(p, RuntimeState::Rewinding, RuntimeState::Normal)
}

/// Shared body for `start_unwind`/`start_rewind`: trap unless in
/// `required`, transition to `next`, store the data pointer, then validate
/// `stack_ptr <= stack_end`.
fn set_data_and_validate(p: &HelperParams, required: RuntimeState, next: RuntimeState) -> Function {
    // locals: 0 = ptr param; 1 = stack_ptr (scratch); 2 = stack_end (scratch)
    let mut f = Function::new([(2, p.ptr_ty)]);

    trap_unless_state(&mut f, p, required);
    set_state(&mut f, p, next);

    // data_global = ptr
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::GlobalSet(p.data_global));

    load_bounds_into_locals(&mut f, p, 1, 2);
    trap_unless_bounds_ok(&mut f, p, 1, 2);

    f.instruction(&Instruction::End);
    f
}

/// Shared body for `stop_unwind`/`stop_rewind`: trap unless in `required`,
/// transition to `next`, then re-validate `stack_ptr <= stack_end`.
fn revalidate(p: &HelperParams, required: RuntimeState, next: RuntimeState) -> Function {
    // locals: 0 = stack_ptr (scratch); 1 = stack_end (scratch)
    let mut f = Function::new([(2, p.ptr_ty)]);

    trap_unless_state(&mut f, p, required);
    set_state(&mut f, p, next);

    load_bounds_into_locals(&mut f, p, 0, 1);
    trap_unless_bounds_ok(&mut f, p, 0, 1);

    f.instruction(&Instruction::End);
    f
}

fn trap_unless_state(f: &mut Function, p: &HelperParams, required: RuntimeState) {
    f.instruction(&Instruction::GlobalGet(p.state_global));
    f.instruction(&Instruction::I32Const(required as i32));
    f.instruction(&Instruction::I32Ne);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::Unreachable);
    f.instruction(&Instruction::End);
}

fn set_state(f: &mut Function, p: &HelperParams, state: RuntimeState) {
    f.instruction(&Instruction::I32Const(state as i32));
    f.instruction(&Instruction::GlobalSet(p.state_global));
}

/// `stack_ptr` lives at offset 0 of the data buffer, `stack_end` at offset
/// `ptr_size` (`spec.md` §3: "two pointer-sized words at the start of the
/// data buffer"). Loads both into the given scratch locals.
fn load_bounds_into_locals(f: &mut Function, p: &HelperParams, ptr_local: u32, end_local: u32) {
    let load = |offset: u64| -> Instruction<'static> {
        let memarg = MemArg {
            offset,
            align: if p.ptr_ty == ValType::I64 { 3 } else { 2 },
            memory_index: p.memory_index,
        };
        if p.ptr_ty == ValType::I64 {
            Instruction::I64Load(memarg)
        } else {
            Instruction::I32Load(memarg)
        }
    };

    f.instruction(&Instruction::GlobalGet(p.data_global));
    f.instruction(&load(0));
    f.instruction(&Instruction::LocalSet(ptr_local));

    f.instruction(&Instruction::GlobalGet(p.data_global));
    f.instruction(&load(p.ptr_size()));
    f.instruction(&Instruction::LocalSet(end_local));
}

/// Traps if `stack_ptr > stack_end` (`spec.md` §3 invariant, §4.4, §9 "Frame
/// bounds trap").
fn trap_unless_bounds_ok(f: &mut Function, p: &HelperParams, ptr_local: u32, end_local: u32) {
    f.instruction(&Instruction::LocalGet(ptr_local));
    f.instruction(&Instruction::LocalGet(end_local));
    if p.ptr_ty == ValType::I64 {
        f.instruction(&Instruction::I64GtU);
    } else {
        f.instruction(&Instruction::I32GtU);
    }
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::Unreachable);
    f.instruction(&Instruction::End);
}

/// Fixed helper export names, in the order `spec.md` §1/§6 lists them.
pub const HELPER_NAMES: [&str; 5] = [
    "asyncify_get_state",
    "asyncify_start_unwind",
    "asyncify_stop_unwind",
    "asyncify_start_rewind",
    "asyncify_stop_rewind",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HelperParams {
        HelperParams {
            state_global: 0,
            data_global: 1,
            memory_index: 0,
            ptr_ty: ValType::I32,
        }
    }

    #[test]
    fn helper_names_are_fixed_and_ordered() {
        assert_eq!(HELPER_NAMES[0], "asyncify_get_state");
        assert_eq!(HELPER_NAMES[4], "asyncify_stop_rewind");
    }

    #[test]
    fn builds_without_panicking() {
        let p = params();
        let _ = get_state(&p);
        let _ = start_unwind(&p);
        let _ = stop_unwind(&p);
        let _ = start_rewind(&p);
        let _ = stop_rewind(&p);
    }
}
