//! The typed SSA input model.
//!
//! Front-end parsing, type checking and SSA construction live outside this
//! crate; what arrives here is the finished program these modules define.

pub mod dom;
pub mod program;
pub mod types;

pub use program::{
    BinOp, Block, BlockId, Builtin, Callee, CallInstr, Const, ConstKind, FuncId, Function, Global,
    GlobalId, InitValue, Instr, Operand, Program, Synthetic, UnOp, ValueData, ValueId, ValueKind,
};
pub use types::{Field, NamedTypeDef, Signature, Type, TypeKind};
