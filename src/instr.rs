//! An owned, `'static` instruction representation.
//!
//! `wasmparser::Operator<'a>` borrows from the input buffer (branch tables,
//! typed `select` lists) and `wasm_encoder::Instruction<'a>` borrows right
//! back out again for encoding. Neither is a good fit for a `Vec` we build
//! once, mutate (linearize, insert async-call expansions) and re-encode much
//! later, so [`Instr`] owns everything and provides one conversion in from
//! `wasmparser` and one conversion out to `wasm_encoder`.
//!
//! Plain numeric/comparison/conversion opcodes (roughly 90 of them) all share
//! the same shape: a fixed pop/push signature and a 1:1 name match between
//! `wasmparser::Operator` and `wasm_encoder::Instruction`. Rather than writing
//! that correspondence out three times (decode, stack effect, encode) we
//! generate it once from a table, the same trick `wasmparser` itself uses
//! internally via its `for_each_operator!` macro.

use wasmparser::ValType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    pub align: u32,
    pub offset: u64,
    pub memory_index: u32,
}

impl From<wasmparser::MemArg> for MemArg {
    fn from(m: wasmparser::MemArg) -> Self {
        Self {
            align: m.align as u32,
            offset: m.offset,
            memory_index: m.memory,
        }
    }
}

/// A structured block type: either no result, a single value type result, or
/// a reference to a module function type (params and results).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTy {
    Empty,
    Single(ValType),
    FuncType(u32),
}

impl BlockTy {
    pub fn from_wasmparser(bt: wasmparser::BlockType) -> Self {
        match bt {
            wasmparser::BlockType::Empty => Self::Empty,
            wasmparser::BlockType::Type(t) => Self::Single(t),
            wasmparser::BlockType::FuncType(idx) => Self::FuncType(idx),
        }
    }

    pub fn to_encoder(self) -> wasm_encoder::BlockType {
        match self {
            Self::Empty => wasm_encoder::BlockType::Empty,
            Self::Single(t) => wasm_encoder::BlockType::Result(super::valtype::to_encoder(t)),
            Self::FuncType(idx) => wasm_encoder::BlockType::FunctionType(idx),
        }
    }
}

macro_rules! simple_ops {
    ($( $name:ident($wp:ident, $we:ident) : [$($pop:expr),*] -> [$($push:expr),*] ;)*) => {
        /// Plain numeric/comparison/conversion opcodes with a statically
        /// fixed signature and a name shared between `wasmparser` and
        /// `wasm-encoder`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum SimpleOp {
            $($name),*
        }

        impl SimpleOp {
            pub fn from_wasmparser_name(op: &wasmparser::Operator<'_>) -> Option<Self> {
                match op {
                    $(wasmparser::Operator::$wp { .. } => Some(Self::$name),)*
                    _ => None,
                }
            }

            pub fn signature(self) -> (&'static [ValType], &'static [ValType]) {
                match self {
                    $(Self::$name => (&[$($pop),*], &[$($push),*]),)*
                }
            }

            pub fn to_encoder(self) -> wasm_encoder::Instruction<'static> {
                match self {
                    $(Self::$name => wasm_encoder::Instruction::$we,)*
                }
            }
        }
    };
}

use ValType::{F32, F64, I32, I64, V128};

simple_ops! {
    I32Eqz(I32Eqz, I32Eqz): [I32] -> [I32];
    I32Eq(I32Eq, I32Eq): [I32, I32] -> [I32];
    I32Ne(I32Ne, I32Ne): [I32, I32] -> [I32];
    I32LtS(I32LtS, I32LtS): [I32, I32] -> [I32];
    I32LtU(I32LtU, I32LtU): [I32, I32] -> [I32];
    I32GtS(I32GtS, I32GtS): [I32, I32] -> [I32];
    I32GtU(I32GtU, I32GtU): [I32, I32] -> [I32];
    I32LeS(I32LeS, I32LeS): [I32, I32] -> [I32];
    I32LeU(I32LeU, I32LeU): [I32, I32] -> [I32];
    I32GeS(I32GeS, I32GeS): [I32, I32] -> [I32];
    I32GeU(I32GeU, I32GeU): [I32, I32] -> [I32];

    I64Eqz(I64Eqz, I64Eqz): [I64] -> [I32];
    I64Eq(I64Eq, I64Eq): [I64, I64] -> [I32];
    I64Ne(I64Ne, I64Ne): [I64, I64] -> [I32];
    I64LtS(I64LtS, I64LtS): [I64, I64] -> [I32];
    I64LtU(I64LtU, I64LtU): [I64, I64] -> [I32];
    I64GtS(I64GtS, I64GtS): [I64, I64] -> [I32];
    I64GtU(I64GtU, I64GtU): [I64, I64] -> [I32];
    I64LeS(I64LeS, I64LeS): [I64, I64] -> [I32];
    I64LeU(I64LeU, I64LeU): [I64, I64] -> [I32];
    I64GeS(I64GeS, I64GeS): [I64, I64] -> [I32];
    I64GeU(I64GeU, I64GeU): [I64, I64] -> [I32];

    F32Eq(F32Eq, F32Eq): [F32, F32] -> [I32];
    F32Ne(F32Ne, F32Ne): [F32, F32] -> [I32];
    F32Lt(F32Lt, F32Lt): [F32, F32] -> [I32];
    F32Gt(F32Gt, F32Gt): [F32, F32] -> [I32];
    F32Le(F32Le, F32Le): [F32, F32] -> [I32];
    F32Ge(F32Ge, F32Ge): [F32, F32] -> [I32];

    F64Eq(F64Eq, F64Eq): [F64, F64] -> [I32];
    F64Ne(F64Ne, F64Ne): [F64, F64] -> [I32];
    F64Lt(F64Lt, F64Lt): [F64, F64] -> [I32];
    F64Gt(F64Gt, F64Gt): [F64, F64] -> [I32];
    F64Le(F64Le, F64Le): [F64, F64] -> [I32];
    F64Ge(F64Ge, F64Ge): [F64, F64] -> [I32];

    I32Clz(I32Clz, I32Clz): [I32] -> [I32];
    I32Ctz(I32Ctz, I32Ctz): [I32] -> [I32];
    I32Popcnt(I32Popcnt, I32Popcnt): [I32] -> [I32];
    I32Add(I32Add, I32Add): [I32, I32] -> [I32];
    I32Sub(I32Sub, I32Sub): [I32, I32] -> [I32];
    I32Mul(I32Mul, I32Mul): [I32, I32] -> [I32];
    I32DivS(I32DivS, I32DivS): [I32, I32] -> [I32];
    I32DivU(I32DivU, I32DivU): [I32, I32] -> [I32];
    I32RemS(I32RemS, I32RemS): [I32, I32] -> [I32];
    I32RemU(I32RemU, I32RemU): [I32, I32] -> [I32];
    I32And(I32And, I32And): [I32, I32] -> [I32];
    I32Or(I32Or, I32Or): [I32, I32] -> [I32];
    I32Xor(I32Xor, I32Xor): [I32, I32] -> [I32];
    I32Shl(I32Shl, I32Shl): [I32, I32] -> [I32];
    I32ShrS(I32ShrS, I32ShrS): [I32, I32] -> [I32];
    I32ShrU(I32ShrU, I32ShrU): [I32, I32] -> [I32];
    I32Rotl(I32Rotl, I32Rotl): [I32, I32] -> [I32];
    I32Rotr(I32Rotr, I32Rotr): [I32, I32] -> [I32];

    I64Clz(I64Clz, I64Clz): [I64] -> [I64];
    I64Ctz(I64Ctz, I64Ctz): [I64] -> [I64];
    I64Popcnt(I64Popcnt, I64Popcnt): [I64] -> [I64];
    I64Add(I64Add, I64Add): [I64, I64] -> [I64];
    I64Sub(I64Sub, I64Sub): [I64, I64] -> [I64];
    I64Mul(I64Mul, I64Mul): [I64, I64] -> [I64];
    I64DivS(I64DivS, I64DivS): [I64, I64] -> [I64];
    I64DivU(I64DivU, I64DivU): [I64, I64] -> [I64];
    I64RemS(I64RemS, I64RemS): [I64, I64] -> [I64];
    I64RemU(I64RemU, I64RemU): [I64, I64] -> [I64];
    I64And(I64And, I64And): [I64, I64] -> [I64];
    I64Or(I64Or, I64Or): [I64, I64] -> [I64];
    I64Xor(I64Xor, I64Xor): [I64, I64] -> [I64];
    I64Shl(I64Shl, I64Shl): [I64, I64] -> [I64];
    I64ShrS(I64ShrS, I64ShrS): [I64, I64] -> [I64];
    I64ShrU(I64ShrU, I64ShrU): [I64, I64] -> [I64];
    I64Rotl(I64Rotl, I64Rotl): [I64, I64] -> [I64];
    I64Rotr(I64Rotr, I64Rotr): [I64, I64] -> [I64];

    F32Abs(F32Abs, F32Abs): [F32] -> [F32];
    F32Neg(F32Neg, F32Neg): [F32] -> [F32];
    F32Ceil(F32Ceil, F32Ceil): [F32] -> [F32];
    F32Floor(F32Floor, F32Floor): [F32] -> [F32];
    F32Trunc(F32Trunc, F32Trunc): [F32] -> [F32];
    F32Nearest(F32Nearest, F32Nearest): [F32] -> [F32];
    F32Sqrt(F32Sqrt, F32Sqrt): [F32] -> [F32];
    F32Add(F32Add, F32Add): [F32, F32] -> [F32];
    F32Sub(F32Sub, F32Sub): [F32, F32] -> [F32];
    F32Mul(F32Mul, F32Mul): [F32, F32] -> [F32];
    F32Div(F32Div, F32Div): [F32, F32] -> [F32];
    F32Min(F32Min, F32Min): [F32, F32] -> [F32];
    F32Max(F32Max, F32Max): [F32, F32] -> [F32];
    F32Copysign(F32Copysign, F32Copysign): [F32, F32] -> [F32];

    F64Abs(F64Abs, F64Abs): [F64] -> [F64];
    F64Neg(F64Neg, F64Neg): [F64] -> [F64];
    F64Ceil(F64Ceil, F64Ceil): [F64] -> [F64];
    F64Floor(F64Floor, F64Floor): [F64] -> [F64];
    F64Trunc(F64Trunc, F64Trunc): [F64] -> [F64];
    F64Nearest(F64Nearest, F64Nearest): [F64] -> [F64];
    F64Sqrt(F64Sqrt, F64Sqrt): [F64] -> [F64];
    F64Add(F64Add, F64Add): [F64, F64] -> [F64];
    F64Sub(F64Sub, F64Sub): [F64, F64] -> [F64];
    F64Mul(F64Mul, F64Mul): [F64, F64] -> [F64];
    F64Div(F64Div, F64Div): [F64, F64] -> [F64];
    F64Min(F64Min, F64Min): [F64, F64] -> [F64];
    F64Max(F64Max, F64Max): [F64, F64] -> [F64];
    F64Copysign(F64Copysign, F64Copysign): [F64, F64] -> [F64];

    I32WrapI64(I32WrapI64, I32WrapI64): [I64] -> [I32];
    I32TruncF32S(I32TruncF32S, I32TruncF32S): [F32] -> [I32];
    I32TruncF32U(I32TruncF32U, I32TruncF32U): [F32] -> [I32];
    I32TruncF64S(I32TruncF64S, I32TruncF64S): [F64] -> [I32];
    I32TruncF64U(I32TruncF64U, I32TruncF64U): [F64] -> [I32];
    I64ExtendI32S(I64ExtendI32S, I64ExtendI32S): [I32] -> [I64];
    I64ExtendI32U(I64ExtendI32U, I64ExtendI32U): [I32] -> [I64];
    I64TruncF32S(I64TruncF32S, I64TruncF32S): [F32] -> [I64];
    I64TruncF32U(I64TruncF32U, I64TruncF32U): [F32] -> [I64];
    I64TruncF64S(I64TruncF64S, I64TruncF64S): [F64] -> [I64];
    I64TruncF64U(I64TruncF64U, I64TruncF64U): [F64] -> [I64];
    F32ConvertI32S(F32ConvertI32S, F32ConvertI32S): [I32] -> [F32];
    F32ConvertI32U(F32ConvertI32U, F32ConvertI32U): [I32] -> [F32];
    F32ConvertI64S(F32ConvertI64S, F32ConvertI64S): [I64] -> [F32];
    F32ConvertI64U(F32ConvertI64U, F32ConvertI64U): [I64] -> [F32];
    F32DemoteF64(F32DemoteF64, F32DemoteF64): [F64] -> [F32];
    F64ConvertI32S(F64ConvertI32S, F64ConvertI32S): [I32] -> [F64];
    F64ConvertI32U(F64ConvertI32U, F64ConvertI32U): [I32] -> [F64];
    F64ConvertI64S(F64ConvertI64S, F64ConvertI64S): [I64] -> [F64];
    F64ConvertI64U(F64ConvertI64U, F64ConvertI64U): [I64] -> [F64];
    F64PromoteF32(F64PromoteF32, F64PromoteF32): [F32] -> [F64];
    I32ReinterpretF32(I32ReinterpretF32, I32ReinterpretF32): [F32] -> [I32];
    I64ReinterpretF64(I64ReinterpretF64, I64ReinterpretF64): [F64] -> [I64];
    F32ReinterpretI32(F32ReinterpretI32, F32ReinterpretI32): [I32] -> [F32];
    F64ReinterpretI64(F64ReinterpretI64, F64ReinterpretI64): [I64] -> [F64];

    I32Extend8S(I32Extend8S, I32Extend8S): [I32] -> [I32];
    I32Extend16S(I32Extend16S, I32Extend16S): [I32] -> [I32];
    I64Extend8S(I64Extend8S, I64Extend8S): [I64] -> [I64];
    I64Extend16S(I64Extend16S, I64Extend16S): [I64] -> [I64];
    I64Extend32S(I64Extend32S, I64Extend32S): [I64] -> [I64];

    I32TruncSatF32S(I32TruncSatF32S, I32TruncSatF32S): [F32] -> [I32];
    I32TruncSatF32U(I32TruncSatF32U, I32TruncSatF32U): [F32] -> [I32];
    I32TruncSatF64S(I32TruncSatF64S, I32TruncSatF64S): [F64] -> [I32];
    I32TruncSatF64U(I32TruncSatF64U, I32TruncSatF64U): [F64] -> [I32];
    I64TruncSatF32S(I64TruncSatF32S, I64TruncSatF32S): [F32] -> [I64];
    I64TruncSatF32U(I64TruncSatF32U, I64TruncSatF32U): [F32] -> [I64];
    I64TruncSatF64S(I64TruncSatF64S, I64TruncSatF64S): [F64] -> [I64];
    I64TruncSatF64U(I64TruncSatF64U, I64TruncSatF64U): [F64] -> [I64];
}

/// An owned instruction. Control-flow, calls, locals/globals, memory/table
/// accessors and reference-type operators each get their own variant because
/// the transformer inspects them specifically; everything else is a
/// [`SimpleOp`].
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Unreachable,
    Nop,
    Block(BlockTy),
    Loop(BlockTy),
    If(BlockTy),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable(Vec<u32>, u32),
    Return,

    Call(u32),
    CallIndirect { type_index: u32, table_index: u32 },
    CallRef(u32),

    Drop,
    Select,
    TypedSelect(Vec<ValType>),

    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),

    TableGet(u32),
    TableSet(u32),
    TableInit { elem_index: u32, table_index: u32 },
    ElemDrop(u32),
    TableCopy { dst_table: u32, src_table: u32 },
    TableGrow(u32),
    TableSize(u32),
    TableFill(u32),

    RefNull(ValType),
    RefIsNull,
    RefFunc(u32),
    RefAsNonNull,
    BrOnNull(u32),
    BrOnNonNull(u32),

    MemorySize(u32),
    MemoryGrow(u32),
    MemoryInit { data_index: u32, mem_index: u32 },
    DataDrop(u32),
    MemoryCopy { dst_mem: u32, src_mem: u32 },
    MemoryFill(u32),
    Load { op: LoadOp, memarg: MemArg },
    Store { op: StoreOp, memarg: MemArg },

    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    V128Const(i128),

    Simple(SimpleOp),
}

/// Load opcodes; the value type loaded is implicit in the variant and drives
/// [`crate::stack_effect`]'s fixed-effect table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    I32Load,
    I64Load,
    F32Load,
    F64Load,
    I32Load8S,
    I32Load8U,
    I32Load16S,
    I32Load16U,
    I64Load8S,
    I64Load8U,
    I64Load16S,
    I64Load16U,
    I64Load32S,
    I64Load32U,
}

impl LoadOp {
    pub fn value_type(self) -> ValType {
        match self {
            Self::I32Load | Self::I32Load8S | Self::I32Load8U | Self::I32Load16S | Self::I32Load16U => I32,
            Self::I64Load
            | Self::I64Load8S
            | Self::I64Load8U
            | Self::I64Load16S
            | Self::I64Load16U
            | Self::I64Load32S
            | Self::I64Load32U => I64,
            Self::F32Load => F32,
            Self::F64Load => F64,
        }
    }
}

/// Store opcodes; see [`LoadOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    I32Store,
    I64Store,
    F32Store,
    F64Store,
    I32Store8,
    I32Store16,
    I64Store8,
    I64Store16,
    I64Store32,
}

impl StoreOp {
    pub fn value_type(self) -> ValType {
        match self {
            Self::I32Store | Self::I32Store8 | Self::I32Store16 => I32,
            Self::I64Store | Self::I64Store8 | Self::I64Store16 | Self::I64Store32 => I64,
            Self::F32Store => F32,
            Self::F64Store => F64,
        }
    }
}

// Keep `V128` reachable in scope for exhaustiveness without emitting an
// "unused import" warning when the simd feature set changes.
#[allow(dead_code)]
const _: ValType = V128;
