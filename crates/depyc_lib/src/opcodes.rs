//! Versioned opcode tables and the instruction cursor.
//!
//! CPython renumbered and renamed opcodes repeatedly across the 1.x-3.x
//! lines, so the numeric tables are split into release families. The
//! mnemonic enum is shared; a byte only means something relative to a
//! `Version`.

use byteorder::{ByteOrder, LittleEndian};

use crate::{DepycError, Version};
use crate::ast::{BinOp, SliceKind, UnaryOp};

/// Opcodes at or above this value carry an operand in every supported
/// release (two bytes little-endian before 3.6, one byte after).
pub const HAVE_ARGUMENT: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    StopCode,
    PopTop,
    RotTwo,
    RotThree,
    RotFour,
    DupTop,
    DupTopTwo,
    Nop,
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryConvert,
    UnaryCall,
    UnaryInvert,
    BinaryPower,
    BinaryMultiply,
    BinaryDivide,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    BinarySubscr,
    BinaryCall,
    BinaryFloorDivide,
    BinaryTrueDivide,
    InplaceFloorDivide,
    InplaceTrueDivide,
    Slice0,
    Slice1,
    Slice2,
    Slice3,
    StoreSlice0,
    StoreSlice1,
    StoreSlice2,
    StoreSlice3,
    DeleteSlice0,
    DeleteSlice1,
    DeleteSlice2,
    DeleteSlice3,
    StoreMap,
    InplaceAdd,
    InplaceSubtract,
    InplaceMultiply,
    InplaceDivide,
    InplaceModulo,
    StoreSubscr,
    DeleteSubscr,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,
    InplacePower,
    GetIter,
    PrintExpr,
    PrintItem,
    PrintNewline,
    PrintItemTo,
    PrintNewlineTo,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceXor,
    InplaceOr,
    BreakLoop,
    WithCleanup,
    LoadLocals,
    LoadBuildClass,
    YieldFrom,
    ReturnValue,
    ImportStar,
    ExecStmt,
    YieldValue,
    PopBlock,
    EndFinally,
    PopExcept,
    BuildClass,
    BuildFunction,
    RaiseException,
    StoreName,
    DeleteName,
    UnpackSequence,
    UnpackTuple,
    UnpackList,
    UnpackArg,
    UnpackEx,
    ForIter,
    ForLoop,
    ListAppend,
    StoreAttr,
    DeleteAttr,
    StoreGlobal,
    DeleteGlobal,
    DupTopx,
    LoadConst,
    LoadName,
    BuildTuple,
    BuildList,
    BuildSet,
    BuildMap,
    LoadAttr,
    CompareOp,
    ImportName,
    ImportFrom,
    JumpForward,
    JumpIfFalse,
    JumpIfTrue,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,
    JumpAbsolute,
    PopJumpIfFalse,
    PopJumpIfTrue,
    LoadGlobal,
    ContinueLoop,
    SetupLoop,
    SetupExcept,
    SetupFinally,
    LoadFast,
    StoreFast,
    DeleteFast,
    SetLineno,
    RaiseVarargs,
    CallFunction,
    MakeFunction,
    BuildSlice,
    MakeClosure,
    LoadClosure,
    LoadDeref,
    StoreDeref,
    CallFunctionVar,
    CallFunctionKw,
    CallFunctionVarKw,
    SetupWith,
    ExtendedArg,
    SetAdd,
    MapAdd,
}

impl Opcode {
    /// The CPython mnemonic, used for diagnostics and the disassembly
    /// listing.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::StopCode => "STOP_CODE",
            Opcode::PopTop => "POP_TOP",
            Opcode::RotTwo => "ROT_TWO",
            Opcode::RotThree => "ROT_THREE",
            Opcode::RotFour => "ROT_FOUR",
            Opcode::DupTop => "DUP_TOP",
            Opcode::DupTopTwo => "DUP_TOP_TWO",
            Opcode::Nop => "NOP",
            Opcode::UnaryPositive => "UNARY_POSITIVE",
            Opcode::UnaryNegative => "UNARY_NEGATIVE",
            Opcode::UnaryNot => "UNARY_NOT",
            Opcode::UnaryConvert => "UNARY_CONVERT",
            Opcode::UnaryCall => "UNARY_CALL",
            Opcode::UnaryInvert => "UNARY_INVERT",
            Opcode::BinaryPower => "BINARY_POWER",
            Opcode::BinaryMultiply => "BINARY_MULTIPLY",
            Opcode::BinaryDivide => "BINARY_DIVIDE",
            Opcode::BinaryModulo => "BINARY_MODULO",
            Opcode::BinaryAdd => "BINARY_ADD",
            Opcode::BinarySubtract => "BINARY_SUBTRACT",
            Opcode::BinarySubscr => "BINARY_SUBSCR",
            Opcode::BinaryCall => "BINARY_CALL",
            Opcode::BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            Opcode::BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            Opcode::InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
            Opcode::InplaceTrueDivide => "INPLACE_TRUE_DIVIDE",
            Opcode::Slice0 => "SLICE+0",
            Opcode::Slice1 => "SLICE+1",
            Opcode::Slice2 => "SLICE+2",
            Opcode::Slice3 => "SLICE+3",
            Opcode::StoreSlice0 => "STORE_SLICE+0",
            Opcode::StoreSlice1 => "STORE_SLICE+1",
            Opcode::StoreSlice2 => "STORE_SLICE+2",
            Opcode::StoreSlice3 => "STORE_SLICE+3",
            Opcode::DeleteSlice0 => "DELETE_SLICE+0",
            Opcode::DeleteSlice1 => "DELETE_SLICE+1",
            Opcode::DeleteSlice2 => "DELETE_SLICE+2",
            Opcode::DeleteSlice3 => "DELETE_SLICE+3",
            Opcode::StoreMap => "STORE_MAP",
            Opcode::InplaceAdd => "INPLACE_ADD",
            Opcode::InplaceSubtract => "INPLACE_SUBTRACT",
            Opcode::InplaceMultiply => "INPLACE_MULTIPLY",
            Opcode::InplaceDivide => "INPLACE_DIVIDE",
            Opcode::InplaceModulo => "INPLACE_MODULO",
            Opcode::StoreSubscr => "STORE_SUBSCR",
            Opcode::DeleteSubscr => "DELETE_SUBSCR",
            Opcode::BinaryLshift => "BINARY_LSHIFT",
            Opcode::BinaryRshift => "BINARY_RSHIFT",
            Opcode::BinaryAnd => "BINARY_AND",
            Opcode::BinaryXor => "BINARY_XOR",
            Opcode::BinaryOr => "BINARY_OR",
            Opcode::InplacePower => "INPLACE_POWER",
            Opcode::GetIter => "GET_ITER",
            Opcode::PrintExpr => "PRINT_EXPR",
            Opcode::PrintItem => "PRINT_ITEM",
            Opcode::PrintNewline => "PRINT_NEWLINE",
            Opcode::PrintItemTo => "PRINT_ITEM_TO",
            Opcode::PrintNewlineTo => "PRINT_NEWLINE_TO",
            Opcode::InplaceLshift => "INPLACE_LSHIFT",
            Opcode::InplaceRshift => "INPLACE_RSHIFT",
            Opcode::InplaceAnd => "INPLACE_AND",
            Opcode::InplaceXor => "INPLACE_XOR",
            Opcode::InplaceOr => "INPLACE_OR",
            Opcode::BreakLoop => "BREAK_LOOP",
            Opcode::WithCleanup => "WITH_CLEANUP",
            Opcode::LoadLocals => "LOAD_LOCALS",
            Opcode::LoadBuildClass => "LOAD_BUILD_CLASS",
            Opcode::YieldFrom => "YIELD_FROM",
            Opcode::ReturnValue => "RETURN_VALUE",
            Opcode::ImportStar => "IMPORT_STAR",
            Opcode::ExecStmt => "EXEC_STMT",
            Opcode::YieldValue => "YIELD_VALUE",
            Opcode::PopBlock => "POP_BLOCK",
            Opcode::EndFinally => "END_FINALLY",
            Opcode::PopExcept => "POP_EXCEPT",
            Opcode::BuildClass => "BUILD_CLASS",
            Opcode::BuildFunction => "BUILD_FUNCTION",
            Opcode::RaiseException => "RAISE_EXCEPTION",
            Opcode::StoreName => "STORE_NAME",
            Opcode::DeleteName => "DELETE_NAME",
            Opcode::UnpackSequence => "UNPACK_SEQUENCE",
            Opcode::UnpackTuple => "UNPACK_TUPLE",
            Opcode::UnpackList => "UNPACK_LIST",
            Opcode::UnpackArg => "UNPACK_ARG",
            Opcode::UnpackEx => "UNPACK_EX",
            Opcode::ForIter => "FOR_ITER",
            Opcode::ForLoop => "FOR_LOOP",
            Opcode::ListAppend => "LIST_APPEND",
            Opcode::StoreAttr => "STORE_ATTR",
            Opcode::DeleteAttr => "DELETE_ATTR",
            Opcode::StoreGlobal => "STORE_GLOBAL",
            Opcode::DeleteGlobal => "DELETE_GLOBAL",
            Opcode::DupTopx => "DUP_TOPX",
            Opcode::LoadConst => "LOAD_CONST",
            Opcode::LoadName => "LOAD_NAME",
            Opcode::BuildTuple => "BUILD_TUPLE",
            Opcode::BuildList => "BUILD_LIST",
            Opcode::BuildSet => "BUILD_SET",
            Opcode::BuildMap => "BUILD_MAP",
            Opcode::LoadAttr => "LOAD_ATTR",
            Opcode::CompareOp => "COMPARE_OP",
            Opcode::ImportName => "IMPORT_NAME",
            Opcode::ImportFrom => "IMPORT_FROM",
            Opcode::JumpForward => "JUMP_FORWARD",
            Opcode::JumpIfFalse => "JUMP_IF_FALSE",
            Opcode::JumpIfTrue => "JUMP_IF_TRUE",
            Opcode::JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            Opcode::JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            Opcode::JumpAbsolute => "JUMP_ABSOLUTE",
            Opcode::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Opcode::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Opcode::LoadGlobal => "LOAD_GLOBAL",
            Opcode::ContinueLoop => "CONTINUE_LOOP",
            Opcode::SetupLoop => "SETUP_LOOP",
            Opcode::SetupExcept => "SETUP_EXCEPT",
            Opcode::SetupFinally => "SETUP_FINALLY",
            Opcode::LoadFast => "LOAD_FAST",
            Opcode::StoreFast => "STORE_FAST",
            Opcode::DeleteFast => "DELETE_FAST",
            Opcode::SetLineno => "SET_LINENO",
            Opcode::RaiseVarargs => "RAISE_VARARGS",
            Opcode::CallFunction => "CALL_FUNCTION",
            Opcode::MakeFunction => "MAKE_FUNCTION",
            Opcode::BuildSlice => "BUILD_SLICE",
            Opcode::MakeClosure => "MAKE_CLOSURE",
            Opcode::LoadClosure => "LOAD_CLOSURE",
            Opcode::LoadDeref => "LOAD_DEREF",
            Opcode::StoreDeref => "STORE_DEREF",
            Opcode::CallFunctionVar => "CALL_FUNCTION_VAR",
            Opcode::CallFunctionKw => "CALL_FUNCTION_KW",
            Opcode::CallFunctionVarKw => "CALL_FUNCTION_VAR_KW",
            Opcode::SetupWith => "SETUP_WITH",
            Opcode::ExtendedArg => "EXTENDED_ARG",
            Opcode::SetAdd => "SET_ADD",
            Opcode::MapAdd => "MAP_ADD",
        }
    }

    /// Expression-building binary opcodes and the operator they synthesise.
    pub fn binary_op(self) -> Option<BinOp> {
        match self {
            Opcode::BinaryAdd => Some(BinOp::Add),
            Opcode::BinaryAnd => Some(BinOp::And),
            Opcode::BinaryDivide => Some(BinOp::Divide),
            Opcode::BinaryTrueDivide => Some(BinOp::TrueDivide),
            Opcode::BinaryFloorDivide => Some(BinOp::Floor),
            Opcode::BinaryLshift => Some(BinOp::LShift),
            Opcode::BinaryModulo => Some(BinOp::Modulo),
            Opcode::BinaryMultiply => Some(BinOp::Multiply),
            Opcode::BinaryOr => Some(BinOp::Or),
            Opcode::BinaryPower => Some(BinOp::Power),
            Opcode::BinaryRshift => Some(BinOp::RShift),
            Opcode::BinarySubtract => Some(BinOp::Subtract),
            Opcode::BinaryXor => Some(BinOp::Xor),
            Opcode::InplaceAdd => Some(BinOp::IpAdd),
            Opcode::InplaceAnd => Some(BinOp::IpAnd),
            Opcode::InplaceDivide => Some(BinOp::IpDivide),
            Opcode::InplaceTrueDivide => Some(BinOp::IpTrueDivide),
            Opcode::InplaceFloorDivide => Some(BinOp::IpFloor),
            Opcode::InplaceLshift => Some(BinOp::IpLShift),
            Opcode::InplaceModulo => Some(BinOp::IpModulo),
            Opcode::InplaceMultiply => Some(BinOp::IpMultiply),
            Opcode::InplaceOr => Some(BinOp::IpOr),
            Opcode::InplacePower => Some(BinOp::IpPower),
            Opcode::InplaceRshift => Some(BinOp::IpRShift),
            Opcode::InplaceSubtract => Some(BinOp::IpSubtract),
            Opcode::InplaceXor => Some(BinOp::IpXor),
            _ => None,
        }
    }

    pub fn unary_op(self) -> Option<UnaryOp> {
        match self {
            Opcode::UnaryPositive => Some(UnaryOp::Positive),
            Opcode::UnaryNegative => Some(UnaryOp::Negative),
            Opcode::UnaryInvert => Some(UnaryOp::Invert),
            Opcode::UnaryNot => Some(UnaryOp::Not),
            _ => None,
        }
    }

    pub fn load_slice(self) -> Option<SliceKind> {
        match self {
            Opcode::Slice0 => Some(SliceKind::Slice0),
            Opcode::Slice1 => Some(SliceKind::Slice1),
            Opcode::Slice2 => Some(SliceKind::Slice2),
            Opcode::Slice3 => Some(SliceKind::Slice3),
            _ => None,
        }
    }

    pub fn store_slice(self) -> Option<SliceKind> {
        match self {
            Opcode::StoreSlice0 => Some(SliceKind::Slice0),
            Opcode::StoreSlice1 => Some(SliceKind::Slice1),
            Opcode::StoreSlice2 => Some(SliceKind::Slice2),
            Opcode::StoreSlice3 => Some(SliceKind::Slice3),
            _ => None,
        }
    }

    pub fn delete_slice(self) -> Option<SliceKind> {
        match self {
            Opcode::DeleteSlice0 => Some(SliceKind::Slice0),
            Opcode::DeleteSlice1 => Some(SliceKind::Slice1),
            Opcode::DeleteSlice2 => Some(SliceKind::Slice2),
            Opcode::DeleteSlice3 => Some(SliceKind::Slice3),
            _ => None,
        }
    }

    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::JumpIfFalse
                | Opcode::JumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
        )
    }
}

/// Numeric opcode mapping for one interpreter version.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeTable {
    version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Py1,
    Py2Early,
    Py27,
    Py3,
}

impl OpcodeTable {
    pub fn new(version: Version) -> OpcodeTable {
        OpcodeTable { version }
    }

    fn family(&self) -> Family {
        match (self.version.major, self.version.minor) {
            (1, _) => Family::Py1,
            (2, 0..=6) => Family::Py2Early,
            (2, _) => Family::Py27,
            _ => Family::Py3,
        }
    }

    /// Instructions are byte pairs from 3.6 on; before that an operand is
    /// two extra bytes and only present above `HAVE_ARGUMENT`.
    pub fn wordcode(&self) -> bool {
        self.version.at_least(3, 6)
    }

    pub fn has_operand(&self, byte: u8) -> bool {
        byte >= HAVE_ARGUMENT
    }

    pub fn lookup(&self, byte: u8) -> Option<Opcode> {
        match self.family() {
            Family::Py1 => lookup_py1(byte),
            Family::Py2Early => lookup_py2_early(byte),
            Family::Py27 => lookup_py27(byte),
            Family::Py3 => lookup_py3(byte),
        }
    }

    /// Reverse mapping. Linear over the byte space; only diagnostics and
    /// tests go through here.
    pub fn encode(&self, op: Opcode) -> Option<u8> {
        (0..=u8::MAX).find(|&b| self.lookup(b) == Some(op))
    }
}

fn lookup_shared_low(byte: u8) -> Option<Opcode> {
    // Values stable from 1.x all the way to the 2.x line.
    Some(match byte {
        0 => Opcode::StopCode,
        1 => Opcode::PopTop,
        2 => Opcode::RotTwo,
        3 => Opcode::RotThree,
        4 => Opcode::DupTop,
        10 => Opcode::UnaryPositive,
        11 => Opcode::UnaryNegative,
        12 => Opcode::UnaryNot,
        13 => Opcode::UnaryConvert,
        15 => Opcode::UnaryInvert,
        19 => Opcode::BinaryPower,
        20 => Opcode::BinaryMultiply,
        21 => Opcode::BinaryDivide,
        22 => Opcode::BinaryModulo,
        23 => Opcode::BinaryAdd,
        24 => Opcode::BinarySubtract,
        25 => Opcode::BinarySubscr,
        30 => Opcode::Slice0,
        31 => Opcode::Slice1,
        32 => Opcode::Slice2,
        33 => Opcode::Slice3,
        40 => Opcode::StoreSlice0,
        41 => Opcode::StoreSlice1,
        42 => Opcode::StoreSlice2,
        43 => Opcode::StoreSlice3,
        50 => Opcode::DeleteSlice0,
        51 => Opcode::DeleteSlice1,
        52 => Opcode::DeleteSlice2,
        53 => Opcode::DeleteSlice3,
        60 => Opcode::StoreSubscr,
        61 => Opcode::DeleteSubscr,
        62 => Opcode::BinaryLshift,
        63 => Opcode::BinaryRshift,
        64 => Opcode::BinaryAnd,
        65 => Opcode::BinaryXor,
        66 => Opcode::BinaryOr,
        70 => Opcode::PrintExpr,
        71 => Opcode::PrintItem,
        72 => Opcode::PrintNewline,
        80 => Opcode::BreakLoop,
        82 => Opcode::LoadLocals,
        83 => Opcode::ReturnValue,
        85 => Opcode::ExecStmt,
        87 => Opcode::PopBlock,
        88 => Opcode::EndFinally,
        89 => Opcode::BuildClass,
        90 => Opcode::StoreName,
        91 => Opcode::DeleteName,
        95 => Opcode::StoreAttr,
        96 => Opcode::DeleteAttr,
        97 => Opcode::StoreGlobal,
        98 => Opcode::DeleteGlobal,
        100 => Opcode::LoadConst,
        101 => Opcode::LoadName,
        102 => Opcode::BuildTuple,
        103 => Opcode::BuildList,
        110 => Opcode::JumpForward,
        113 => Opcode::JumpAbsolute,
        120 => Opcode::SetupLoop,
        121 => Opcode::SetupExcept,
        122 => Opcode::SetupFinally,
        124 => Opcode::LoadFast,
        125 => Opcode::StoreFast,
        126 => Opcode::DeleteFast,
        130 => Opcode::RaiseVarargs,
        131 => Opcode::CallFunction,
        132 => Opcode::MakeFunction,
        133 => Opcode::BuildSlice,
        _ => return None,
    })
}

fn lookup_py1(byte: u8) -> Option<Opcode> {
    if let Some(op) = lookup_shared_low(byte) {
        return Some(op);
    }
    Some(match byte {
        14 => Opcode::UnaryCall,
        26 => Opcode::BinaryCall,
        81 => Opcode::RaiseException,
        86 => Opcode::BuildFunction,
        92 => Opcode::UnpackTuple,
        93 => Opcode::UnpackList,
        94 => Opcode::UnpackArg,
        104 => Opcode::BuildMap,
        105 => Opcode::LoadAttr,
        106 => Opcode::CompareOp,
        107 => Opcode::ImportName,
        108 => Opcode::ImportFrom,
        111 => Opcode::JumpIfFalse,
        112 => Opcode::JumpIfTrue,
        114 => Opcode::ForLoop,
        116 => Opcode::LoadGlobal,
        127 => Opcode::SetLineno,
        _ => return None,
    })
}

fn lookup_py2_early(byte: u8) -> Option<Opcode> {
    if let Some(op) = lookup_shared_low(byte) {
        return Some(op);
    }
    Some(match byte {
        5 => Opcode::RotFour,
        9 => Opcode::Nop,
        18 => Opcode::ListAppend,
        26 => Opcode::BinaryFloorDivide,
        27 => Opcode::BinaryTrueDivide,
        28 => Opcode::InplaceFloorDivide,
        29 => Opcode::InplaceTrueDivide,
        54 => Opcode::StoreMap,
        55 => Opcode::InplaceAdd,
        56 => Opcode::InplaceSubtract,
        57 => Opcode::InplaceMultiply,
        58 => Opcode::InplaceDivide,
        59 => Opcode::InplaceModulo,
        67 => Opcode::InplacePower,
        68 => Opcode::GetIter,
        73 => Opcode::PrintItemTo,
        74 => Opcode::PrintNewlineTo,
        75 => Opcode::InplaceLshift,
        76 => Opcode::InplaceRshift,
        77 => Opcode::InplaceAnd,
        78 => Opcode::InplaceXor,
        79 => Opcode::InplaceOr,
        81 => Opcode::WithCleanup,
        84 => Opcode::ImportStar,
        86 => Opcode::YieldValue,
        92 => Opcode::UnpackSequence,
        93 => Opcode::ForIter,
        99 => Opcode::DupTopx,
        104 => Opcode::BuildMap,
        105 => Opcode::LoadAttr,
        106 => Opcode::CompareOp,
        107 => Opcode::ImportName,
        108 => Opcode::ImportFrom,
        111 => Opcode::JumpIfFalse,
        112 => Opcode::JumpIfTrue,
        114 => Opcode::ForLoop,
        116 => Opcode::LoadGlobal,
        119 => Opcode::ContinueLoop,
        127 => Opcode::SetLineno,
        134 => Opcode::MakeClosure,
        135 => Opcode::LoadClosure,
        136 => Opcode::LoadDeref,
        137 => Opcode::StoreDeref,
        140 => Opcode::CallFunctionVar,
        141 => Opcode::CallFunctionKw,
        142 => Opcode::CallFunctionVarKw,
        143 => Opcode::ExtendedArg,
        _ => return None,
    })
}

fn lookup_py27(byte: u8) -> Option<Opcode> {
    if let Some(op) = lookup_shared_low(byte) {
        return Some(op);
    }
    Some(match byte {
        5 => Opcode::RotFour,
        9 => Opcode::Nop,
        26 => Opcode::BinaryFloorDivide,
        27 => Opcode::BinaryTrueDivide,
        28 => Opcode::InplaceFloorDivide,
        29 => Opcode::InplaceTrueDivide,
        54 => Opcode::StoreMap,
        55 => Opcode::InplaceAdd,
        56 => Opcode::InplaceSubtract,
        57 => Opcode::InplaceMultiply,
        58 => Opcode::InplaceDivide,
        59 => Opcode::InplaceModulo,
        67 => Opcode::InplacePower,
        68 => Opcode::GetIter,
        73 => Opcode::PrintItemTo,
        74 => Opcode::PrintNewlineTo,
        75 => Opcode::InplaceLshift,
        76 => Opcode::InplaceRshift,
        77 => Opcode::InplaceAnd,
        78 => Opcode::InplaceXor,
        79 => Opcode::InplaceOr,
        81 => Opcode::WithCleanup,
        84 => Opcode::ImportStar,
        86 => Opcode::YieldValue,
        92 => Opcode::UnpackSequence,
        93 => Opcode::ForIter,
        94 => Opcode::ListAppend,
        99 => Opcode::DupTopx,
        104 => Opcode::BuildSet,
        105 => Opcode::BuildMap,
        106 => Opcode::LoadAttr,
        107 => Opcode::CompareOp,
        108 => Opcode::ImportName,
        109 => Opcode::ImportFrom,
        111 => Opcode::JumpIfFalseOrPop,
        112 => Opcode::JumpIfTrueOrPop,
        114 => Opcode::PopJumpIfFalse,
        115 => Opcode::PopJumpIfTrue,
        116 => Opcode::LoadGlobal,
        119 => Opcode::ContinueLoop,
        134 => Opcode::MakeClosure,
        135 => Opcode::LoadClosure,
        136 => Opcode::LoadDeref,
        137 => Opcode::StoreDeref,
        140 => Opcode::CallFunctionVar,
        141 => Opcode::CallFunctionKw,
        142 => Opcode::CallFunctionVarKw,
        143 => Opcode::SetupWith,
        145 => Opcode::ExtendedArg,
        146 => Opcode::SetAdd,
        147 => Opcode::MapAdd,
        _ => return None,
    })
}

fn lookup_py3(byte: u8) -> Option<Opcode> {
    Some(match byte {
        1 => Opcode::PopTop,
        2 => Opcode::RotTwo,
        3 => Opcode::RotThree,
        4 => Opcode::DupTop,
        5 => Opcode::DupTopTwo,
        9 => Opcode::Nop,
        10 => Opcode::UnaryPositive,
        11 => Opcode::UnaryNegative,
        12 => Opcode::UnaryNot,
        15 => Opcode::UnaryInvert,
        19 => Opcode::BinaryPower,
        20 => Opcode::BinaryMultiply,
        22 => Opcode::BinaryModulo,
        23 => Opcode::BinaryAdd,
        24 => Opcode::BinarySubtract,
        25 => Opcode::BinarySubscr,
        26 => Opcode::BinaryFloorDivide,
        27 => Opcode::BinaryTrueDivide,
        28 => Opcode::InplaceFloorDivide,
        29 => Opcode::InplaceTrueDivide,
        54 => Opcode::StoreMap,
        55 => Opcode::InplaceAdd,
        56 => Opcode::InplaceSubtract,
        57 => Opcode::InplaceMultiply,
        59 => Opcode::InplaceModulo,
        60 => Opcode::StoreSubscr,
        61 => Opcode::DeleteSubscr,
        62 => Opcode::BinaryLshift,
        63 => Opcode::BinaryRshift,
        64 => Opcode::BinaryAnd,
        65 => Opcode::BinaryXor,
        66 => Opcode::BinaryOr,
        67 => Opcode::InplacePower,
        68 => Opcode::GetIter,
        70 => Opcode::PrintExpr,
        71 => Opcode::LoadBuildClass,
        72 => Opcode::YieldFrom,
        80 => Opcode::BreakLoop,
        81 => Opcode::WithCleanup,
        83 => Opcode::ReturnValue,
        84 => Opcode::ImportStar,
        86 => Opcode::YieldValue,
        87 => Opcode::PopBlock,
        88 => Opcode::EndFinally,
        89 => Opcode::PopExcept,
        90 => Opcode::StoreName,
        91 => Opcode::DeleteName,
        92 => Opcode::UnpackSequence,
        93 => Opcode::ForIter,
        94 => Opcode::UnpackEx,
        95 => Opcode::StoreAttr,
        96 => Opcode::DeleteAttr,
        97 => Opcode::StoreGlobal,
        98 => Opcode::DeleteGlobal,
        100 => Opcode::LoadConst,
        101 => Opcode::LoadName,
        102 => Opcode::BuildTuple,
        103 => Opcode::BuildList,
        104 => Opcode::BuildSet,
        105 => Opcode::BuildMap,
        106 => Opcode::LoadAttr,
        107 => Opcode::CompareOp,
        108 => Opcode::ImportName,
        109 => Opcode::ImportFrom,
        110 => Opcode::JumpForward,
        111 => Opcode::JumpIfFalseOrPop,
        112 => Opcode::JumpIfTrueOrPop,
        113 => Opcode::JumpAbsolute,
        114 => Opcode::PopJumpIfFalse,
        115 => Opcode::PopJumpIfTrue,
        116 => Opcode::LoadGlobal,
        119 => Opcode::ContinueLoop,
        120 => Opcode::SetupLoop,
        121 => Opcode::SetupExcept,
        122 => Opcode::SetupFinally,
        124 => Opcode::LoadFast,
        125 => Opcode::StoreFast,
        126 => Opcode::DeleteFast,
        130 => Opcode::RaiseVarargs,
        131 => Opcode::CallFunction,
        132 => Opcode::MakeFunction,
        133 => Opcode::BuildSlice,
        134 => Opcode::MakeClosure,
        135 => Opcode::LoadClosure,
        136 => Opcode::LoadDeref,
        137 => Opcode::StoreDeref,
        140 => Opcode::CallFunctionVar,
        141 => Opcode::CallFunctionKw,
        142 => Opcode::CallFunctionVarKw,
        143 => Opcode::SetupWith,
        144 => Opcode::ExtendedArg,
        145 => Opcode::ListAppend,
        146 => Opcode::SetAdd,
        147 => Opcode::MapAdd,
        _ => return None,
    })
}

/// One decoded instruction. `offset` is where the instruction starts,
/// `next` is the offset of the following instruction and therefore the
/// base for relative jumps.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub opcode: Opcode,
    pub operand: u32,
    pub has_arg: bool,
    pub offset: u32,
    pub next: u32,
}

/// Position-aware decoder over one code object's instruction bytes.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    table: OpcodeTable,
    version: Version,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8], version: Version) -> Cursor<'a> {
        Cursor {
            buf,
            pos: 0,
            table: OpcodeTable::new(version),
            version,
        }
    }

    pub fn at_eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn next(&mut self) -> Result<Instr, DepycError> {
        let mut extended: u32 = 0;
        loop {
            let offset = self.pos as u32;
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(DepycError::TruncatedInstruction { pos: offset })?;
            let opcode = self.table.lookup(byte).ok_or(DepycError::UnknownOpcode {
                opcode: byte,
                version: self.version,
            })?;

            let operand;
            if self.table.wordcode() {
                let arg = *self
                    .buf
                    .get(self.pos + 1)
                    .ok_or(DepycError::TruncatedInstruction { pos: offset })?;
                self.pos += 2;
                operand = (extended << 8) | arg as u32;
            } else if self.table.has_operand(byte) {
                if self.pos + 3 > self.buf.len() {
                    return Err(DepycError::TruncatedInstruction { pos: offset });
                }
                let arg = LittleEndian::read_u16(&self.buf[self.pos + 1..self.pos + 3]);
                self.pos += 3;
                operand = (extended << 16) | arg as u32;
            } else {
                self.pos += 1;
                operand = 0;
            }

            if opcode == Opcode::ExtendedArg {
                extended = operand;
                continue;
            }

            return Ok(Instr {
                opcode,
                operand,
                has_arg: byte >= HAVE_ARGUMENT,
                offset,
                next: self.pos as u32,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_roundtrip_through_encode() {
        for version in [
            Version::new(1, 5),
            Version::new(2, 5),
            Version::new(2, 7),
            Version::new(3, 4),
        ] {
            let table = OpcodeTable::new(version);
            for byte in 0..=u8::MAX {
                if let Some(op) = table.lookup(byte) {
                    assert_eq!(table.encode(op), Some(byte), "{:?} in {}", op, version);
                }
            }
        }
    }

    #[test]
    fn jump_variants_differ_between_26_and_27() {
        let early = OpcodeTable::new(Version::new(2, 6));
        let late = OpcodeTable::new(Version::new(2, 7));
        let byte = early.encode(Opcode::JumpIfFalse).unwrap();
        assert_eq!(late.lookup(byte), Some(Opcode::JumpIfFalseOrPop));
        assert!(late.encode(Opcode::PopJumpIfFalse).is_some());
        assert!(early.encode(Opcode::PopJumpIfFalse).is_none());
    }

    #[test]
    fn cursor_decodes_short_operands_before_36() {
        let version = Version::new(2, 7);
        let table = OpcodeTable::new(version);
        let mut buf = vec![table.encode(Opcode::LoadConst).unwrap(), 0x34, 0x12];
        buf.push(table.encode(Opcode::ReturnValue).unwrap());

        let mut cursor = Cursor::new(&buf, version);
        let first = cursor.next().unwrap();
        assert_eq!(first.opcode, Opcode::LoadConst);
        assert_eq!(first.operand, 0x1234);
        assert_eq!(first.offset, 0);
        assert_eq!(first.next, 3);

        let second = cursor.next().unwrap();
        assert_eq!(second.opcode, Opcode::ReturnValue);
        assert_eq!(second.next, 4);
        assert!(cursor.at_eof());
    }

    #[test]
    fn cursor_decodes_wordcode_from_36() {
        let version = Version::new(3, 6);
        let table = OpcodeTable::new(version);
        let ext = table.encode(Opcode::ExtendedArg).unwrap();
        let load = table.encode(Opcode::LoadConst).unwrap();
        let buf = vec![ext, 0x01, load, 0x02];

        let mut cursor = Cursor::new(&buf, version);
        let instr = cursor.next().unwrap();
        assert_eq!(instr.opcode, Opcode::LoadConst);
        assert_eq!(instr.operand, 0x0102);
        assert_eq!(instr.next, 4);
    }

    #[test]
    fn cursor_rejects_truncated_operand() {
        let version = Version::new(2, 7);
        let table = OpcodeTable::new(version);
        let buf = vec![table.encode(Opcode::LoadConst).unwrap(), 0x01];
        let mut cursor = Cursor::new(&buf, version);
        assert!(matches!(
            cursor.next(),
            Err(DepycError::TruncatedInstruction { pos: 0 })
        ));
    }

    #[test]
    fn cursor_rejects_unknown_opcode() {
        let version = Version::new(1, 5);
        // 147 (MAP_ADD) only exists from 2.7 on.
        let buf = vec![147];
        let mut cursor = Cursor::new(&buf, version);
        assert!(matches!(
            cursor.next(),
            Err(DepycError::UnknownOpcode { opcode: 147, .. })
        ));
    }
}
