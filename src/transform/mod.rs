//! The per-function Asyncify rewrite (`spec.md` §4.6) — the hardest part of
//! this crate. Split the way `crates/wasmi/src/engine/func_builder/` splits
//! translation into `control_frame`/`control_stack` (frame bookkeeping),
//! `value_stack` (operand tracking) and `translator.rs` (the dispatch loop
//! that drives both): [`linearize`] owns frame bookkeeping and rewrites block
//! exits to go through locals, [`simulate`] owns operand tracking and flattens
//! every transient stack value into a local, and this module's
//! [`transform_function`] is the dispatch loop that drives both stages and
//! then calls [`emit`] to assemble the guarded body.
//!
//! # Pipeline
//!
//! 1. Reject reference-typed parameters or locals outright — Asyncify cannot
//!    spill a reference value to linear memory (`spec.md` §4.6 step 1, §9).
//! 2. [`linearize::linearize`] rewrites every `block`/`loop`/`if` with a
//!    non-empty result type so its exit value(s) travel through dedicated
//!    locals instead of the operand stack, re-published with `local.get`
//!    immediately after the matching `end` (`spec.md` §4.6 step 3).
//! 3. [`simulate::materialize`] walks the linearized body abstractly,
//!    converting every instruction's pushed value into a tracked local (via
//!    `local.tee`, or a stage/restore dance for multi-value pushes), and
//!    records each async call site's parameter/result types together with
//!    whatever operand-stack values are still alive underneath it — the data
//!    [`crate::stack_effect`] hands off to this module (`spec.md` §4.6 steps
//!    2, 4, 5).
//! 4. [`crate::liveness::analyze`] runs over the flattened body to find which
//!    *locals* (as opposed to bare operand-stack values, already covered by
//!    step 3) are still read after each call site (`spec.md` §4.6 step 6).
//! 5. [`emit::emit`] assembles the final guarded body: a rewind prelude that
//!    restores this function's frame when resuming, a per-instruction
//!    `if (state == Normal)` guard around every plain instruction, and a
//!    three-way guard around every async call site (`spec.md` §4.6 steps 7–8).

mod emit;
mod linearize;
mod simulate;

use wasmparser::ValType;

use crate::config::Config;
use crate::error::{ConfigurationError, Error, UnsupportedError};
use crate::instr::Instr;
use crate::liveness::LiveSets;
use crate::module::{FunctionBody, Module};

/// Indices of the two globals every transformed function reads/writes.
#[derive(Debug, Clone, Copy)]
pub struct GlobalIndices {
    pub state_global: u32,
    pub data_global: u32,
}

/// One async call site found by [`simulate::materialize`], positioned in the
/// instruction list returned alongside it.
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Index into the materialized instruction list of the `call`/
    /// `call_indirect`/`call_ref` instruction itself.
    pub position: usize,
    /// The call instruction being expanded, kept verbatim so [`emit::emit`]
    /// doesn't need to re-derive which of `Call`/`CallIndirect`/`CallRef` it
    /// dispatches.
    pub call_instr: Instr,
    pub param_types: Vec<ValType>,
    pub result_types: Vec<ValType>,
    /// Operand-stack values (not ordinary locals) still alive underneath this
    /// call's own arguments — `spec.md` §4.6 step 5's "full stack
    /// simulation" output. Ordered bottom-of-stack first.
    pub extra_locals: Vec<(u32, ValType)>,
    /// This call's own argument locals (plus, for indirect/ref calls, the
    /// trailing table-index/funcref operand), in original stack order. Must
    /// be part of the save/restore set even though ordinary post-call
    /// liveness wouldn't flag them: on rewind, the call is *replayed* by
    /// re-fetching these exact locals, so they must come back from the
    /// frame restore rather than from whatever the locals happened to hold
    /// before `start_rewind` (`spec.md` §3's "operand-stack values at the
    /// call point materialized into synthetic locals").
    pub arg_locals: Vec<(u32, ValType)>,
    /// Freshly allocated locals holding this call's results, one per
    /// `result_types` entry, allocated during simulation itself so later
    /// instructions in the same pass can push them as ordinary stack
    /// entries (`spec.md` §4.6 step 6).
    pub result_locals: Vec<(u32, ValType)>,
}

/// Allocates fresh local indices, appending run-length entries to the
/// locals declared after a function's parameters. Shared by every stage that
/// needs a scratch local: the linearizer's exit locals, the simulator's
/// materialized-value locals, and this module's rewind-prelude scratch
/// locals.
pub(crate) struct LocalAllocator {
    locals: Vec<(u32, ValType)>,
    next_index: u32,
}

impl LocalAllocator {
    fn new(param_count: u32, declared: Vec<(u32, ValType)>) -> Self {
        let next_index = param_count + declared.iter().map(|(count, _)| *count).sum::<u32>();
        Self { locals: declared, next_index }
    }

    pub(crate) fn alloc(&mut self, ty: ValType) -> u32 {
        let index = self.next_index;
        self.locals.push((1, ty));
        self.next_index += 1;
        index
    }

    /// Run-length-encoded locals declared so far (params are not included;
    /// callers that need a flat per-index type table should combine this
    /// with the function's param types). Lets [`simulate::materialize`]
    /// build its own initial local-index -> type lookup without duplicating
    /// this allocator's bookkeeping.
    pub(crate) fn declared(&self) -> &[(u32, ValType)] {
        &self.locals
    }

    fn total_locals(&self) -> u32 {
        self.next_index
    }

    fn into_locals(self) -> Vec<(u32, ValType)> {
        self.locals
    }

    /// Flattens params + every declared/allocated local into one
    /// index-addressable `ValType` table, for [`frame_size`]'s benefit.
    fn local_types(&self, param_types: &[ValType]) -> Vec<ValType> {
        let mut types = param_types.to_vec();
        for (count, ty) in &self.locals {
            for _ in 0..*count {
                types.push(*ty);
            }
        }
        types
    }
}

/// Finds (or adds) a module-level function type with the given params and an
/// empty result list, used by the linearizer to rewrite a block's declared
/// type once its results move to locals (`spec.md` §4.6 step 3). Only
/// allocates a new type when no existing one matches, keeping the type
/// section from growing once per rewritten block.
pub(crate) fn intern_func_type(module: &mut Module, params: &[ValType], results: &[ValType]) -> u32 {
    if let Some(idx) = module
        .types
        .iter()
        .position(|ty| ty.params() == params && ty.results() == results)
    {
        return idx as u32;
    }
    module.types.push(wasmparser::FuncType::new(params.iter().copied(), results.iter().copied()));
    (module.types.len() - 1) as u32
}

/// Transforms one function into the async-aware form described above.
/// `locals`/`instrs` are the function's decoded body (already removed from
/// `module.code` by the caller); `module` is mutated only to intern new
/// block-exit function types.
#[allow(clippy::too_many_arguments)]
pub fn transform_function(
    module: &mut Module,
    func_idx: u32,
    locals: Vec<(u32, ValType)>,
    instrs: Vec<Instr>,
    async_funcs: &crate::bitset::BitSet,
    config: &Config,
    globals: GlobalIndices,
) -> Result<FunctionBody, Error> {
    log::trace!("transforming function {func_idx}");

    let func_type = module
        .func_type(func_idx)
        .expect("caller only transforms functions that exist in the module")
        .clone();

    for (i, param) in func_type.params().iter().enumerate() {
        if crate::valtype::is_reference(*param) {
            return Err(UnsupportedError::ReferenceType { func_idx, context: "parameter" }.into());
        }
        let _ = i;
    }
    for (count, ty) in &locals {
        if crate::valtype::is_reference(*ty) {
            let _ = count;
            return Err(UnsupportedError::ReferenceType { func_idx, context: "local" }.into());
        }
    }

    let param_count = func_type.params().len() as u32;
    let mut alloc = LocalAllocator::new(param_count, locals);

    let linear = linearize::linearize(module, &mut alloc, &instrs)?;

    let simulate::MaterializeResult { instrs: flat, call_sites } = simulate::materialize(
        module,
        &mut alloc,
        &linear,
        func_idx,
        async_funcs,
        config.ignore_indirect(),
    )?;

    if call_sites.is_empty() {
        // No async call site reached this function after all (it is only
        // here because the engine over-approximated via the call graph, or
        // because every call it makes is to a non-async, non-indirect
        // target once reindexing settled). Encode it as an ordinary,
        // unguarded function — still worth running through linearize/
        // simulate so its locals stay consistent with the rest of the
        // pipeline, but no rewind/guard machinery is needed.
        return Ok(FunctionBody::Decoded { locals: alloc.into_locals(), instrs: flat });
    }

    let call_positions: Vec<usize> = call_sites.iter().map(|cs| cs.position).collect();
    let live_sets: LiveSets = crate::liveness::analyze(&flat, &call_positions, alloc.total_locals());

    let local_types = alloc.local_types(func_type.params());
    let frame_size = frame_size(func_idx, &call_sites, &live_sets, &local_types)?;

    let body = emit::emit(emit::EmitInput {
        func_idx,
        result_types: func_type.results().to_vec(),
        instrs: flat,
        call_sites,
        live_sets,
        frame_size,
        local_types,
        globals,
        config,
        alloc: &mut alloc,
    })?;

    Ok(FunctionBody::Decoded { locals: alloc.into_locals(), instrs: body })
}

/// One frame layout per function (`spec.md` §4.6 step 8's "save path"): a
/// fixed-size `[call_index][live_local_0]...` payload whose offsets are
/// assigned once, in increasing local-index order, over the union of every
/// locally-live local across every call site in this function. Save/restore
/// at any individual call site only touches the locals in *its* live set; the
/// other slots are simply left unused for that resume, which is what keeps
/// per-call-site restore a fixed, call-index-independent stack pointer
/// arithmetic (`frame_size` is one number, not one per call site) while still
/// only spilling what that call site's own liveness says is needed.
pub(crate) struct FrameLayout {
    /// Local index -> (byte offset within the frame payload, past the
    /// 4-byte call_index field), in the order they were assigned.
    pub offsets: std::collections::HashMap<u32, u64>,
    pub size: u64,
}

fn frame_size(
    func_idx: u32,
    call_sites: &[CallSite],
    live_sets: &LiveSets,
    local_types: &[ValType],
) -> Result<FrameLayout, Error> {
    let mut locals: Vec<(u32, ValType)> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut note = |idx: u32, ty: ValType, locals: &mut Vec<(u32, ValType)>| {
        if seen.insert(idx) {
            locals.push((idx, ty));
        }
    };

    for cs in call_sites {
        if let Some(live) = live_sets.get(&cs.position) {
            for idx in live.iter() {
                let ty = local_types
                    .get(idx as usize)
                    .copied()
                    .expect("every live local index is a declared param/local");
                note(idx, ty, &mut locals);
            }
        }
        for &(idx, ty) in &cs.extra_locals {
            note(idx, ty, &mut locals);
        }
        for &(idx, ty) in &cs.arg_locals {
            note(idx, ty, &mut locals);
        }
        for &(idx, ty) in &cs.result_locals {
            note(idx, ty, &mut locals);
        }
    }

    locals.sort_by_key(|(idx, _)| *idx);

    let mut offsets = std::collections::HashMap::new();
    let mut offset: u64 = 0;
    for (idx, ty) in locals {
        offsets.insert(idx, offset);
        offset += crate::valtype::byte_size(ty) as u64;
    }

    let size = 4 + offset;
    if size > i32::MAX as u64 {
        return Err(ConfigurationError::FrameSizeOverflow { func_idx, call_site: 0 }.into());
    }

    Ok(FrameLayout { offsets, size })
}
