//! Direct-call graph over the function index space and transitive-closure
//! queries used to grow the async-function set (`spec.md` §4.1).
//!
//! Grounded on `other_examples/644bf9a3_paritytech-wasm-instrument`'s
//! `stack_limiter` pass, which walks every function body once to build a
//! per-function-index property (there: stack cost; here: a plain adjacency
//! list) over the same imported-then-defined function index space.

use crate::bitset::BitSet;
use crate::instr::Instr;
use crate::module::Module;

/// Forward adjacency from caller index to the ordered sequence of its direct
/// (`call`) callees. Indirect and `call_ref` calls are deliberately excluded:
/// `spec.md` §4.1 hands those to the engine directly (§4.7), since a callee
/// set for them is not statically known.
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    /// Indexed by function index across the whole module; imported
    /// functions always have an empty callee list.
    callees: Vec<Vec<u32>>,
}

impl CallGraph {
    /// Builds the graph from one pass over every defined function's body.
    pub fn from_module(module: &Module) -> Self {
        let imported = module.imported_func_count();
        let mut callees = vec![Vec::new(); module.func_count() as usize];
        for (i, body) in module.code.iter().enumerate() {
            let func_idx = imported + i as u32;
            if let crate::module::FunctionBody::Decoded { instrs, .. } = body {
                record_calls(instrs, &mut callees[func_idx as usize]);
            }
        }
        Self { callees }
    }

    /// Like [`Self::from_module`], but also scans raw (not-yet-decoded)
    /// bodies by decoding them transiently — used by the engine before any
    /// function has been selected into the async set, since discovery (§4.5
    /// step 7) needs the call graph before it knows which functions will
    /// ultimately be transformed.
    ///
    /// A function whose body fails to decode (tail calls, exceptions,
    /// atomics — opcodes this crate only rejects for functions it actually
    /// transforms, per `spec.md` §4.5 step 8) contributes no callee edges
    /// here rather than aborting discovery outright; such a function still
    /// fails loudly later if it ends up selected into the async set, since
    /// [`super::transform::transform_function`] decodes it again itself.
    /// This is what keeps a module with, say, a `return_call` in some
    /// unrelated, never-async function round-trippable.
    pub fn from_module_full(module: &Module) -> Result<Self, crate::error::Error> {
        let imported = module.imported_func_count();
        let mut callees = vec![Vec::new(); module.func_count() as usize];
        for (i, body) in module.code.iter().enumerate() {
            let func_idx = imported + i as u32;
            match body {
                crate::module::FunctionBody::Decoded { instrs, .. } => {
                    record_calls(instrs, &mut callees[func_idx as usize]);
                }
                crate::module::FunctionBody::Raw(bytes) => {
                    match crate::module::decode_function_body(func_idx, bytes) {
                        Ok(crate::module::FunctionBody::Decoded { instrs, .. }) => {
                            record_calls(&instrs, &mut callees[func_idx as usize]);
                        }
                        Ok(crate::module::FunctionBody::Raw(_)) => unreachable!(
                            "decode_function_body always returns Decoded"
                        ),
                        Err(err) => {
                            log::debug!(
                                "function {func_idx} could not be decoded for call-graph \
                                 purposes ({err}); treating it as having no direct callees"
                            );
                        }
                    }
                }
            }
        }
        Ok(Self { callees })
    }

    /// Whether function `func_idx`'s body contains a `call_indirect`/
    /// `call_ref` instruction, used by async-function discovery (`spec.md`
    /// §4.5 step 7) to grow the async set past what the direct-call graph
    /// can see. Like [`Self::from_module_full`], tolerates a body that fails
    /// to decode by reporting no indirect calls rather than propagating the
    /// error.
    pub fn has_indirect_call(module: &Module, func_idx: u32) -> bool {
        let imported = module.imported_func_count();
        if func_idx < imported {
            return false;
        }
        let Some(body) = module.code.get((func_idx - imported) as usize) else {
            return false;
        };
        let instrs: &[Instr] = match body {
            crate::module::FunctionBody::Decoded { instrs, .. } => instrs,
            crate::module::FunctionBody::Raw(bytes) => {
                return match crate::module::decode_function_body(func_idx, bytes) {
                    Ok(crate::module::FunctionBody::Decoded { instrs, .. }) => {
                        instrs.iter().any(is_indirect_call)
                    }
                    _ => false,
                };
            }
        };
        instrs.iter().any(is_indirect_call)
    }

    pub fn callees_of(&self, func_idx: u32) -> &[u32] {
        self.callees
            .get(func_idx as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Fixed-point worklist: grows `roots` with every function that directly
    /// or transitively calls a member of the set. Monotonic and terminating
    /// because the function index space is finite.
    pub fn transitive_callers(&self, roots: &BitSet) -> BitSet {
        let mut set = roots.clone();
        let mut changed = true;
        while changed {
            changed = false;
            for (caller, callees) in self.callees.iter().enumerate() {
                let caller = caller as u32;
                if set.contains(caller) {
                    continue;
                }
                if callees.iter().any(|callee| set.contains(*callee)) {
                    set.insert(caller);
                    changed = true;
                }
            }
        }
        set
    }

    /// Fixed-point worklist in the forward direction: grows `roots` with
    /// every function reachable by following direct calls.
    pub fn transitive_callees(&self, roots: &BitSet) -> BitSet {
        let mut set = roots.clone();
        let mut worklist: Vec<u32> = set.iter().collect();
        while let Some(func) = worklist.pop() {
            for &callee in self.callees_of(func) {
                if set.insert(callee) {
                    worklist.push(callee);
                }
            }
        }
        set
    }
}

fn record_calls(instrs: &[Instr], out: &mut Vec<u32>) {
    for instr in instrs {
        if let Instr::Call(target) = instr {
            out.push(*target);
        }
    }
}

fn is_indirect_call(instr: &Instr) -> bool {
    matches!(instr, Instr::CallIndirect { .. } | Instr::CallRef(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(callees: Vec<Vec<u32>>) -> CallGraph {
        CallGraph { callees }
    }

    #[test]
    fn transitive_callers_follows_chain() {
        // 0 -> 1 -> 2; root = {2}; expect all three.
        let g = graph(vec![vec![1], vec![2], vec![]]);
        let roots: BitSet = [2u32].into_iter().collect();
        let callers = g.transitive_callers(&roots);
        assert!(callers.contains(0));
        assert!(callers.contains(1));
        assert!(callers.contains(2));
    }

    #[test]
    fn transitive_callers_ignores_unrelated_functions() {
        let g = graph(vec![vec![1], vec![], vec![]]);
        let roots: BitSet = [1u32].into_iter().collect();
        let callers = g.transitive_callers(&roots);
        assert!(callers.contains(0));
        assert!(!callers.contains(2));
    }

    #[test]
    fn transitive_callees_follows_chain() {
        let g = graph(vec![vec![1], vec![2], vec![]]);
        let roots: BitSet = [0u32].into_iter().collect();
        let callees = g.transitive_callees(&roots);
        assert!(callees.contains(0));
        assert!(callees.contains(1));
        assert!(callees.contains(2));
    }
}
