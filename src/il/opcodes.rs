//! Opcode table for the instruction stream.
//!
//! Every opcode knows its mnemonic, its encoded size without variable-length operands,
//! and how it affects control flow. Short/long branch pairs are kept in a lazily built
//! table so the branch normaliser can move between forms in both directions.

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// How an instruction hands control to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Next,
    Call,
    Branch,
    CondBranch,
    Leave,
    Switch,
    Return,
    Throw,
}

macro_rules! opcodes {
    ($($variant:ident => $mnemonic:literal, $size:literal, $flow:ident;)*) => {
        /// Instruction opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Op {
            $($variant,)*
        }

        impl Op {
            pub const ALL: &'static [Op] = &[$(Op::$variant,)*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Op::$variant => $mnemonic,)*
                }
            }

            /// Encoded size, opcode plus fixed-width operand.
            pub fn encoded_size(self) -> u32 {
                match self {
                    $(Op::$variant => $size,)*
                }
            }

            pub fn flow(self) -> FlowKind {
                match self {
                    $(Op::$variant => FlowKind::$flow,)*
                }
            }
        }
    };
}

opcodes! {
    Nop => "nop", 1, Next;
    Dup => "dup", 1, Next;
    Pop => "pop", 1, Next;

    Ldarg0 => "ldarg.0", 1, Next;
    Ldarg1 => "ldarg.1", 1, Next;
    Ldarg2 => "ldarg.2", 1, Next;
    Ldarg3 => "ldarg.3", 1, Next;
    LdargS => "ldarg.s", 2, Next;
    Ldarg => "ldarg", 4, Next;
    LdargaS => "ldarga.s", 2, Next;
    Ldarga => "ldarga", 4, Next;
    StargS => "starg.s", 2, Next;
    Starg => "starg", 4, Next;

    Ldloc0 => "ldloc.0", 1, Next;
    Ldloc1 => "ldloc.1", 1, Next;
    Ldloc2 => "ldloc.2", 1, Next;
    Ldloc3 => "ldloc.3", 1, Next;
    LdlocS => "ldloc.s", 2, Next;
    Ldloc => "ldloc", 4, Next;
    LdlocaS => "ldloca.s", 2, Next;
    Ldloca => "ldloca", 4, Next;
    Stloc0 => "stloc.0", 1, Next;
    Stloc1 => "stloc.1", 1, Next;
    Stloc2 => "stloc.2", 1, Next;
    Stloc3 => "stloc.3", 1, Next;
    StlocS => "stloc.s", 2, Next;
    Stloc => "stloc", 4, Next;

    Ldnull => "ldnull", 1, Next;
    LdcI4M1 => "ldc.i4.m1", 1, Next;
    LdcI40 => "ldc.i4.0", 1, Next;
    LdcI41 => "ldc.i4.1", 1, Next;
    LdcI42 => "ldc.i4.2", 1, Next;
    LdcI43 => "ldc.i4.3", 1, Next;
    LdcI44 => "ldc.i4.4", 1, Next;
    LdcI45 => "ldc.i4.5", 1, Next;
    LdcI46 => "ldc.i4.6", 1, Next;
    LdcI47 => "ldc.i4.7", 1, Next;
    LdcI48 => "ldc.i4.8", 1, Next;
    LdcI4S => "ldc.i4.s", 2, Next;
    LdcI4 => "ldc.i4", 5, Next;
    LdcI8 => "ldc.i8", 9, Next;
    Ldstr => "ldstr", 5, Next;

    Add => "add", 1, Next;
    Sub => "sub", 1, Next;
    Mul => "mul", 1, Next;
    And => "and", 1, Next;
    Or => "or", 1, Next;
    Shl => "shl", 1, Next;
    ShrUn => "shr.un", 1, Next;
    Ceq => "ceq", 2, Next;
    Cgt => "cgt", 2, Next;
    Clt => "clt", 2, Next;
    ConvI4 => "conv.i4", 1, Next;

    BrS => "br.s", 2, Branch;
    Br => "br", 5, Branch;
    BrfalseS => "brfalse.s", 2, CondBranch;
    Brfalse => "brfalse", 5, CondBranch;
    BrtrueS => "brtrue.s", 2, CondBranch;
    Brtrue => "brtrue", 5, CondBranch;
    BeqS => "beq.s", 2, CondBranch;
    Beq => "beq", 5, CondBranch;
    BneUnS => "bne.un.s", 2, CondBranch;
    BneUn => "bne.un", 5, CondBranch;
    BgeS => "bge.s", 2, CondBranch;
    Bge => "bge", 5, CondBranch;
    BgtS => "bgt.s", 2, CondBranch;
    Bgt => "bgt", 5, CondBranch;
    BleS => "ble.s", 2, CondBranch;
    Ble => "ble", 5, CondBranch;
    BltS => "blt.s", 2, CondBranch;
    Blt => "blt", 5, CondBranch;
    LeaveS => "leave.s", 2, Leave;
    Leave => "leave", 5, Leave;
    Switch => "switch", 5, Switch;

    Call => "call", 5, Call;
    Callvirt => "callvirt", 5, Call;
    Newobj => "newobj", 5, Call;

    Ldfld => "ldfld", 5, Next;
    Ldflda => "ldflda", 5, Next;
    Stfld => "stfld", 5, Next;
    Ldsfld => "ldsfld", 5, Next;
    Stsfld => "stsfld", 5, Next;

    Newarr => "newarr", 5, Next;
    Ldlen => "ldlen", 1, Next;
    LdelemRef => "ldelem.ref", 1, Next;
    StelemRef => "stelem.ref", 1, Next;

    Box => "box", 5, Next;
    UnboxAny => "unbox.any", 5, Next;
    Castclass => "castclass", 5, Next;
    Isinst => "isinst", 5, Next;
    Initobj => "initobj", 6, Next;
    Ldobj => "ldobj", 5, Next;
    Stobj => "stobj", 5, Next;
    LdindRef => "ldind.ref", 1, Next;
    StindRef => "stind.ref", 1, Next;
    Ldtoken => "ldtoken", 5, Next;

    Throw => "throw", 1, Throw;
    Rethrow => "rethrow", 2, Throw;
    Endfinally => "endfinally", 1, Return;
    Ret => "ret", 1, Return;
}

/// Short branch -> long branch.
static SHORT_TO_LONG: Lazy<HashMap<Op, Op>> = Lazy::new(|| {
    [
        (Op::BrS, Op::Br),
        (Op::BrfalseS, Op::Brfalse),
        (Op::BrtrueS, Op::Brtrue),
        (Op::BeqS, Op::Beq),
        (Op::BneUnS, Op::BneUn),
        (Op::BgeS, Op::Bge),
        (Op::BgtS, Op::Bgt),
        (Op::BleS, Op::Ble),
        (Op::BltS, Op::Blt),
        (Op::LeaveS, Op::Leave),
    ]
    .into_iter()
    .collect()
});

static LONG_TO_SHORT: Lazy<HashMap<Op, Op>> =
    Lazy::new(|| SHORT_TO_LONG.iter().map(|(short, long)| (*long, *short)).collect());

static BY_MNEMONIC: Lazy<HashMap<&'static str, Op>> =
    Lazy::new(|| Op::ALL.iter().map(|op| (op.mnemonic(), *op)).collect());

impl Op {
    pub fn from_mnemonic(mnemonic: &str) -> Option<Op> {
        BY_MNEMONIC.get(mnemonic).copied()
    }

    /// Whether the operand of this opcode is a single branch target.
    pub fn is_branch(self) -> bool {
        matches!(self.flow(), FlowKind::Branch | FlowKind::CondBranch | FlowKind::Leave)
    }

    pub fn is_short_branch(self) -> bool {
        SHORT_TO_LONG.contains_key(&self)
    }

    pub fn is_leave(self) -> bool {
        matches!(self, Op::Leave | Op::LeaveS)
    }

    pub fn long_form(self) -> Op {
        SHORT_TO_LONG.get(&self).copied().unwrap_or(self)
    }

    pub fn short_form(self) -> Op {
        LONG_TO_SHORT.get(&self).copied().unwrap_or(self)
    }

    /// Local slot encoded in the opcode itself (`ldloc.2`, `stloc.0`, ...).
    pub fn local_macro_index(self) -> Option<u16> {
        match self {
            Op::Ldloc0 | Op::Stloc0 => Some(0),
            Op::Ldloc1 | Op::Stloc1 => Some(1),
            Op::Ldloc2 | Op::Stloc2 => Some(2),
            Op::Ldloc3 | Op::Stloc3 => Some(3),
            _ => None,
        }
    }

    /// Argument slot encoded in the opcode itself.
    pub fn arg_macro_index(self) -> Option<u16> {
        match self {
            Op::Ldarg0 => Some(0),
            Op::Ldarg1 => Some(1),
            Op::Ldarg2 => Some(2),
            Op::Ldarg3 => Some(3),
            _ => None,
        }
    }

    /// Constant encoded in the opcode itself.
    pub fn ldc_macro_value(self) -> Option<i32> {
        match self {
            Op::LdcI4M1 => Some(-1),
            Op::LdcI40 => Some(0),
            Op::LdcI41 => Some(1),
            Op::LdcI42 => Some(2),
            Op::LdcI43 => Some(3),
            Op::LdcI44 => Some(4),
            Op::LdcI45 => Some(5),
            Op::LdcI46 => Some(6),
            Op::LdcI47 => Some(7),
            Op::LdcI48 => Some(8),
            _ => None,
        }
    }

    pub fn is_ldloc(self) -> bool {
        matches!(self, Op::Ldloc0 | Op::Ldloc1 | Op::Ldloc2 | Op::Ldloc3 | Op::LdlocS | Op::Ldloc)
    }

    pub fn is_stloc(self) -> bool {
        matches!(self, Op::Stloc0 | Op::Stloc1 | Op::Stloc2 | Op::Stloc3 | Op::StlocS | Op::Stloc)
    }

    pub fn is_ldloca(self) -> bool {
        matches!(self, Op::LdlocaS | Op::Ldloca)
    }

    pub fn is_ldarg(self) -> bool {
        matches!(self, Op::Ldarg0 | Op::Ldarg1 | Op::Ldarg2 | Op::Ldarg3 | Op::LdargS | Op::Ldarg)
    }

    pub fn is_ldarga(self) -> bool {
        matches!(self, Op::LdargaS | Op::Ldarga)
    }

    pub fn is_starg(self) -> bool {
        matches!(self, Op::StargS | Op::Starg)
    }

    pub fn is_ldc_i4(self) -> bool {
        self.ldc_macro_value().is_some() || matches!(self, Op::LdcI4S | Op::LdcI4)
    }

    /// Whether execution can fall through to the next instruction.
    pub fn falls_through(self) -> bool {
        !matches!(
            self.flow(),
            FlowKind::Branch | FlowKind::Leave | FlowKind::Return | FlowKind::Throw
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl Serialize for Op {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.mnemonic())
    }
}

impl<'de> Deserialize<'de> for Op {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mnemonic = String::deserialize(deserializer)?;
        Op::from_mnemonic(&mnemonic)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown opcode '{}'", mnemonic)))
    }
}
