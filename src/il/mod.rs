//! Instruction-level model of a compiled module.
//!
//! - **types**: type signatures carried by operands and local slots
//! - **opcodes**: opcode table with short/long branch pairs
//! - **instruction**: instructions and operands
//! - **list**: arena-backed instruction list with stable handles
//! - **body**: method bodies with explicit exception-handler extents
//! - **module**: types, fields, methods, member references
//! - **emit**: instruction-sequence toolkit used by every weaver
//! - **pattern**: side-effect-free structural predicates for anchor discovery
//! - **optimize**: branch normalisation post-pass
//! - **printer**: disassembler

pub mod body;
pub mod emit;
pub mod instruction;
pub mod list;
pub mod module;
pub mod opcodes;
pub mod optimize;
pub mod pattern;
pub mod printer;
pub mod types;

pub use body::{ExceptionHandler, HandlerKind, MethodBody};
pub use emit::CodeEmitter;
pub use instruction::{Instruction, Operand};
pub use list::{InstrId, InstrList};
pub use module::{
    AttrArg, CustomAttribute, FieldDef, FieldRef, MethodDef, MethodHandle, MethodRef, Module, ParamDef, TypeDef,
};
pub use opcodes::{FlowKind, Op};
pub use types::TypeSig;
