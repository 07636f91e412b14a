//! Asyncify: a binary-to-binary rewriter for core WebAssembly modules.
//!
//! Given a module and a [`Config`] describing which imports are "async",
//! [`transform`] instruments every function that can reach one of those
//! imports so that, at runtime, a host that drives the five exported helper
//! functions (`asyncify_get_state`, `asyncify_start_unwind`,
//! `asyncify_stop_unwind`, `asyncify_start_rewind`, `asyncify_stop_rewind`)
//! can suspend a call into the module, save all live state to linear memory,
//! unwind the Wasm stack, and later resume execution from the exact call
//! site once a value becomes available. See `spec.md` for the full design;
//! this crate implements its core — the function rewriter, call-graph
//! closure, liveness analysis, and module-level orchestration — and
//! delegates the Wasm binary format itself to `wasmparser`/`wasm-encoder`.
//!
//! # Example
//!
//! ```
//! use wasm_asyncify::{transform, Config, ImportMatcher};
//!
//! fn main() -> Result<(), wasm_asyncify::Error> {
//!     let wasm = wat::parse_str(
//!         r#"
//!         (module
//!             (import "env" "sleep" (func $sleep (param i32)))
//!             (func (export "test")
//!                 (call $sleep (i32.const 100)))
//!         )
//!         "#,
//!     )
//!     .unwrap();
//!
//!     let mut config = Config::new();
//!     config.set_import_matcher(ImportMatcher::Exact {
//!         module: "env".into(),
//!         name: "sleep".into(),
//!     });
//!
//!     let instrumented = transform(&wasm, &config)?;
//!     assert!(!instrumented.is_empty());
//!     Ok(())
//! }
//! ```
//!
//! # Crate Features
//!
//! | Feature | Description |
//! |:-:|:--|
//! | `std` | Enables usage of Rust's standard library via `wasmparser`, `bitvec` and `log`. Enabled by default. |

mod bitset;
mod callgraph;
mod config;
mod engine;
mod error;
mod helpers;
mod instr;
mod liveness;
mod matcher;
mod module;
mod stack_effect;
mod transform;
mod valtype;

pub use self::{
    config::Config,
    engine::transform,
    error::{ConfigurationError, Error, ErrorKind, MalformedError, UnsupportedError},
    matcher::{ImportMatcher, NameMatcher},
};
