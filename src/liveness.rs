//! Backward liveness analysis over one function's linear instruction list
//! (`spec.md` §4.2), run once per to-be-transformed function after
//! linearization and before the stack simulator allocates save/result
//! locals. Produces, for each async call site, the set of locals whose value
//! may still be observed after that call returns.
//!
//! Grounded on `crates/wasmi/src/engine/func_builder/locals_registry.rs`'s
//! local-index bookkeeping style (`LocalsRegistry` tracks which original
//! Wasm local indices are in use), generalized here from "register a local"
//! to "track every read and every write of a local".

use crate::bitset::BitSet;
use crate::instr::Instr;

/// Maps an async call-site's position in the instruction list (its index
/// into the slice passed to [`analyze`]) to the set of locals live
/// immediately after it.
pub type LiveSets = std::collections::HashMap<usize, BitSet>;

/// Runs the backward dataflow pass. `call_sites` are the instruction indices
/// the caller has already identified as async call sites (`spec.md` §4.6
/// step 4); `num_locals` bounds the locals considered (params + declared
/// locals, before scratch/result locals are appended — those are unioned in
/// separately by the transformer per step 6).
///
/// # Algorithm
///
/// A single backward pass maintains a `live: BitSet` that, read right to
/// left, is updated by: a local read adds the local to `live`; a local write
/// (`local.set`) removes it; a `local.tee` is a write whose value also flows
/// through the operand stack, so conservatively its local is treated as
/// written (matching `spec.md` §4.2's "tee is a write" rule) without
/// otherwise affecting liveness of the value it tees.
///
/// Before the single backward pass, a pre-pass unions in every locally
/// referenced within a `loop...end` span into the liveness recorded *at* the
/// `loop` header position, approximating back-edges without building an
/// explicit CFG: anything referenced anywhere in the loop body might be live
/// on the next iteration when control returns to the top.
pub fn analyze(instrs: &[Instr], call_sites: &[usize], num_locals: u32) -> LiveSets {
    let loop_body_locals = loop_header_locals(instrs, num_locals);

    let mut live = BitSet::with_capacity(num_locals as usize);
    let mut result = LiveSets::new();
    let call_site_set: BitSet = call_sites.iter().map(|&i| i as u32).collect();

    for (i, instr) in instrs.iter().enumerate().rev() {
        if call_site_set.contains(i as u32) {
            result.insert(i, live.clone());
        }
        match instr {
            Instr::LocalGet(idx) => {
                live.insert(*idx);
            }
            Instr::LocalSet(idx) => {
                live.remove(*idx);
            }
            Instr::LocalTee(idx) => {
                live.remove(*idx);
            }
            Instr::Loop(_) => {
                if let Some(referenced) = loop_body_locals.get(&i) {
                    live.union_with(referenced);
                }
            }
            _ => {}
        }
    }

    result
}

/// For every `Loop` instruction at index `i`, computes the set of locals
/// referenced (read or written) anywhere between it and its matching `End`,
/// keyed by `i`. A single forward pass with an explicit depth stack finds
/// matching ends without building a full control-flow tree.
fn loop_header_locals(
    instrs: &[Instr],
    num_locals: u32,
) -> std::collections::HashMap<usize, BitSet> {
    let mut loop_frame_start: Vec<bool> = Vec::new(); // one entry per open Block/Loop/If frame
    let mut result: std::collections::HashMap<usize, BitSet> = std::collections::HashMap::new();
    let mut active_loops: Vec<usize> = Vec::new(); // stack of currently-open loop header indices

    for (i, instr) in instrs.iter().enumerate() {
        match instr {
            Instr::Block(_) | Instr::If(_) => {
                loop_frame_start.push(false);
            }
            Instr::Loop(_) => {
                loop_frame_start.push(true);
                active_loops.push(i);
                result.insert(i, BitSet::with_capacity(num_locals as usize));
            }
            Instr::End => {
                if let Some(is_loop) = loop_frame_start.pop() {
                    if is_loop {
                        active_loops.pop();
                    }
                }
            }
            Instr::LocalGet(idx) | Instr::LocalSet(idx) | Instr::LocalTee(idx) => {
                for &loop_idx in &active_loops {
                    result.get_mut(&loop_idx).unwrap().insert(*idx);
                }
            }
            _ => {}
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::BlockTy;

    #[test]
    fn live_after_call_includes_later_read() {
        // local.get 0 ; call 0 ; local.get 0 ; drop
        let instrs = vec![
            Instr::LocalGet(0),
            Instr::Call(0),
            Instr::LocalGet(0),
            Instr::Drop,
        ];
        let sets = analyze(&instrs, &[1], 1);
        assert!(sets[&1].contains(0));
    }

    #[test]
    fn write_before_call_kills_liveness_forward() {
        // local.set 0 ; call 0 (nothing after reads local 0)
        let instrs = vec![Instr::I32Const(0), Instr::LocalSet(0), Instr::Call(0)];
        let sets = analyze(&instrs, &[2], 1);
        assert!(!sets[&2].contains(0));
    }

    #[test]
    fn loop_header_unions_in_body_locals() {
        // loop
        //   local.get 0
        //   call 0
        // end
        let instrs = vec![
            Instr::Loop(BlockTy::Empty),
            Instr::LocalGet(0),
            Instr::Call(0),
            Instr::End,
        ];
        let sets = analyze(&instrs, &[2], 1);
        // Local 0 is live after the call: it's read later in the same
        // iteration, and the loop-header union would carry it across
        // iterations even if it weren't.
        assert!(sets[&2].contains(0));
    }
}
