
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Pseudo,
    Disasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    D9,
    D10,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::D9 => write!(f, "D9"),
            Dialect::D10 => write!(f, "D10"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    pub dialect: Dialect,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Pseudo,
            dialect: Dialect::D10,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecmbError {
    #[error("container truncated: {0}")]
    TruncatedContainer(&'static str),

    #[error("event table is not terminated before the end of the file")]
    UnterminatedEventTable,

    #[error("implausible {what} count: {count}")]
    SuspiciousCount { what: &'static str, count: u32 },

    #[error("scene {position} header carries index {header}")]
    SceneIndexMismatch { header: u32, position: u32 },

    #[error("scene declares {args} arguments but only {vars} variables")]
    ArgsExceedVars { args: u32, vars: u32 },

    #[error("invalid opcode: 0x{0:02x}")]
    InvalidOpcode(u8),

    #[error("opcode 0x{opcode:02x} is not valid in dialect {dialect}")]
    WrongDialect { opcode: u8, dialect: Dialect },

    #[error("truncated operand at offset {location} (need {needed} bytes, {remaining} left)")]
    TruncatedOperand {
        location: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("script ended without a trailing return")]
    MissingReturn,

    #[error("string pool offset out of range: {0}")]
    BadStringOffset(u32),

    #[error("variable index {index} out of range ({limit} available)")]
    BadVariableIndex { index: i32, limit: usize },

    #[error("scene index {index} out of range ({limit} scenes)")]
    BadSceneIndex { index: i32, limit: usize },

    #[error("'{mnemonic}' expects {wanted} pushed value(s) on the stack")]
    StackShape { mnemonic: &'static str, wanted: usize },

    #[error("opcode 0x{0:02x} has no statement lowering")]
    UnsupportedOpcode(u8),
}

pub mod op {
    pub const NOP: u8 = 0x00;

    // Memory addressing
    pub const VAL8: u8 = 0x01;
    pub const VAL16: u8 = 0x02;
    pub const VALX8: u8 = 0x03;
    pub const VALX16: u8 = 0x04;
    pub const VALY8: u8 = 0x05;
    pub const VALY16: u8 = 0x06;
    pub const REF8: u8 = 0x07;
    pub const REF16: u8 = 0x08;
    pub const REFX8: u8 = 0x09;
    pub const REFX16: u8 = 0x0A;
    pub const REFY8: u8 = 0x0B;
    pub const REFY16: u8 = 0x0C;
    pub const GVAL8: u8 = 0x0D;
    pub const GVAL16: u8 = 0x0E;
    pub const GVALX8: u8 = 0x0F;
    pub const GVALX16: u8 = 0x10;
    pub const GVALY8: u8 = 0x11;
    pub const GVALY16: u8 = 0x12;
    pub const GREF8: u8 = 0x13;
    pub const GREF16: u8 = 0x14;
    pub const GREFX8: u8 = 0x15;
    pub const GREFX16: u8 = 0x16;
    pub const GREFY8: u8 = 0x17;
    pub const GREFY16: u8 = 0x18;

    // Constant loading
    pub const NUMBER8: u8 = 0x19;
    pub const NUMBER16: u8 = 0x1A;
    pub const NUMBER32: u8 = 0x1B;
    pub const STRING8: u8 = 0x1C;
    pub const STRING16: u8 = 0x1D;
    pub const STRING32: u8 = 0x1E;

    // Operations
    pub const DEREF: u8 = 0x1F;
    pub const DISC: u8 = 0x20;
    pub const STORE: u8 = 0x21;
    pub const ADD: u8 = 0x22;
    pub const SUB: u8 = 0x23;
    pub const MUL: u8 = 0x24;
    pub const DIV: u8 = 0x25;
    pub const MOD: u8 = 0x26;
    pub const NEG: u8 = 0x27;
    pub const MVN: u8 = 0x28;
    pub const NOT: u8 = 0x29;
    pub const ORR: u8 = 0x2A;
    pub const AND: u8 = 0x2B;
    pub const XOR: u8 = 0x2C;
    pub const LSL: u8 = 0x2D;
    pub const LSR: u8 = 0x2E;
    pub const EQ: u8 = 0x2F;
    pub const NE: u8 = 0x30;
    pub const LT: u8 = 0x31;
    pub const LE: u8 = 0x32;
    pub const GT: u8 = 0x33;
    pub const GE: u8 = 0x34;
    pub const EQSTR: u8 = 0x35;
    pub const NESTR: u8 = 0x36;

    // Jumps and calls
    pub const CALL: u8 = 0x37;
    pub const CALLEXT: u8 = 0x38;
    pub const RETURN: u8 = 0x39;
    pub const B: u8 = 0x3A;
    pub const BY: u8 = 0x3B;
    pub const BKY: u8 = 0x3C;
    pub const BN: u8 = 0x3D;
    pub const BKN: u8 = 0x3E;
    pub const YIELD: u8 = 0x3F;

    // Debug (dummied)
    pub const UNK40: u8 = 0x40;
    pub const PRINTF: u8 = 0x41;

    // D10 only
    pub const INC: u8 = 0x42;
    pub const DEC: u8 = 0x43;
    pub const DUP: u8 = 0x44;
    pub const RETN: u8 = 0x45;
    pub const RETY: u8 = 0x46;
    pub const ASSIGN: u8 = 0x47;

    // Synthetic opcodes produced by short-circuit lowering, never read
    // from input bytes.
    pub const LAND: u8 = 0x48;
    pub const LORR: u8 = 0x49;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidIn {
    Both,
    D9Only,
    D10Only,
    Never,
}

impl ValidIn {
    pub fn allows(self, dialect: Dialect) -> bool {
        match self {
            ValidIn::Both => true,
            ValidIn::D9Only => dialect == Dialect::D9,
            ValidIn::D10Only => dialect == Dialect::D10,
            ValidIn::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub mnemonic: &'static str,
    pub operand_size: u8,
    pub is_jump: bool,
    pub valid_in: ValidIn,
}

pub static OPCODE_INFO: &[OpInfo] = &[
    OpInfo { mnemonic: "nop",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x00

    // Memory addressing
    OpInfo { mnemonic: "val",    operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x01
    OpInfo { mnemonic: "val",    operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x02
    OpInfo { mnemonic: "valx",   operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x03
    OpInfo { mnemonic: "valx",   operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x04
    OpInfo { mnemonic: "valy",   operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x05
    OpInfo { mnemonic: "valy",   operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x06
    OpInfo { mnemonic: "ref",    operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x07
    OpInfo { mnemonic: "ref",    operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x08
    OpInfo { mnemonic: "refx",   operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x09
    OpInfo { mnemonic: "refx",   operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x0A
    OpInfo { mnemonic: "refy",   operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x0B
    OpInfo { mnemonic: "refy",   operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x0C
    OpInfo { mnemonic: "gval",   operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x0D
    OpInfo { mnemonic: "gval",   operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x0E
    OpInfo { mnemonic: "gvalx",  operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x0F
    OpInfo { mnemonic: "gvalx",  operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x10
    OpInfo { mnemonic: "gvaly",  operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x11
    OpInfo { mnemonic: "gvaly",  operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x12
    OpInfo { mnemonic: "gref",   operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x13
    OpInfo { mnemonic: "gref",   operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x14
    OpInfo { mnemonic: "grefx",  operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x15
    OpInfo { mnemonic: "grefx",  operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x16
    OpInfo { mnemonic: "grefy",  operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x17
    OpInfo { mnemonic: "grefy",  operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x18

    // Constant loading
    OpInfo { mnemonic: "number", operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x19
    OpInfo { mnemonic: "number", operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x1A
    OpInfo { mnemonic: "number", operand_size: 4, is_jump: false, valid_in: ValidIn::Both }, // 0x1B
    OpInfo { mnemonic: "string", operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x1C
    OpInfo { mnemonic: "string", operand_size: 2, is_jump: false, valid_in: ValidIn::Both }, // 0x1D
    OpInfo { mnemonic: "string", operand_size: 4, is_jump: false, valid_in: ValidIn::Both }, // 0x1E

    // Operations
    OpInfo { mnemonic: "deref",  operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x1F
    OpInfo { mnemonic: "disc",   operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x20
    OpInfo { mnemonic: "store",  operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x21
    OpInfo { mnemonic: "add",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x22
    OpInfo { mnemonic: "sub",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x23
    OpInfo { mnemonic: "mul",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x24
    OpInfo { mnemonic: "div",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x25
    OpInfo { mnemonic: "mod",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x26
    OpInfo { mnemonic: "neg",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x27
    OpInfo { mnemonic: "mvn",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x28
    OpInfo { mnemonic: "not",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x29
    OpInfo { mnemonic: "orr",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x2A
    OpInfo { mnemonic: "and",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x2B
    OpInfo { mnemonic: "xor",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x2C
    OpInfo { mnemonic: "lsl",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x2D
    OpInfo { mnemonic: "lsr",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x2E
    OpInfo { mnemonic: "eq",     operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x2F
    OpInfo { mnemonic: "ne",     operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x30
    OpInfo { mnemonic: "lt?",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x31
    OpInfo { mnemonic: "le",     operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x32
    OpInfo { mnemonic: "gt?",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x33
    OpInfo { mnemonic: "ge?",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x34
    OpInfo { mnemonic: "eqstr",  operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x35
    OpInfo { mnemonic: "nestr",  operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x36

    // Jumps and calls
    OpInfo { mnemonic: "call.",  operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x37
    OpInfo { mnemonic: "call",   operand_size: 3, is_jump: false, valid_in: ValidIn::Both }, // 0x38
    OpInfo { mnemonic: "ret",    operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x39
    OpInfo { mnemonic: "b",      operand_size: 2, is_jump: true,  valid_in: ValidIn::Both }, // 0x3A
    OpInfo { mnemonic: "by",     operand_size: 2, is_jump: true,  valid_in: ValidIn::Both }, // 0x3B
    OpInfo { mnemonic: "bky",    operand_size: 2, is_jump: true,  valid_in: ValidIn::Both }, // 0x3C
    OpInfo { mnemonic: "bn",     operand_size: 2, is_jump: true,  valid_in: ValidIn::Both }, // 0x3D
    OpInfo { mnemonic: "bkn",    operand_size: 2, is_jump: true,  valid_in: ValidIn::Both }, // 0x3E
    OpInfo { mnemonic: "yield",  operand_size: 0, is_jump: false, valid_in: ValidIn::Both }, // 0x3F

    // Debug (dummied)
    OpInfo { mnemonic: "unk",    operand_size: 4, is_jump: false, valid_in: ValidIn::Both }, // 0x40
    OpInfo { mnemonic: "printf", operand_size: 1, is_jump: false, valid_in: ValidIn::Both }, // 0x41

    // D10 only
    OpInfo { mnemonic: "inc",    operand_size: 0, is_jump: false, valid_in: ValidIn::D10Only }, // 0x42
    OpInfo { mnemonic: "dec",    operand_size: 0, is_jump: false, valid_in: ValidIn::D10Only }, // 0x43
    OpInfo { mnemonic: "dup",    operand_size: 0, is_jump: false, valid_in: ValidIn::D10Only }, // 0x44
    OpInfo { mnemonic: "retn",   operand_size: 0, is_jump: false, valid_in: ValidIn::D10Only }, // 0x45
    OpInfo { mnemonic: "rety",   operand_size: 0, is_jump: false, valid_in: ValidIn::D10Only }, // 0x46
    OpInfo { mnemonic: "assign", operand_size: 0, is_jump: false, valid_in: ValidIn::D10Only }, // 0x47

    // Synthetic
    OpInfo { mnemonic: "scand",  operand_size: 0, is_jump: false, valid_in: ValidIn::Never }, // 0x48
    OpInfo { mnemonic: "scorr",  operand_size: 0, is_jump: false, valid_in: ValidIn::Never }, // 0x49
];

pub fn opcode_info(opcode: u8) -> Option<&'static OpInfo> {
    OPCODE_INFO.get(opcode as usize)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ins {
    pub location: usize,
    pub opcode: u8,
    pub operand: i32,
}

impl Ins {
    // The decoder only emits table-backed opcodes and the lowering pass
    // only rewrites to the synthetic entries, so the index stays in range.
    pub fn info(&self) -> &'static OpInfo {
        &OPCODE_INFO[self.opcode as usize]
    }

    pub fn is_jump(&self) -> bool {
        self.info().is_jump
    }

    pub fn is_jump_keep(&self) -> bool {
        matches!(self.opcode, op::BKY | op::BKN)
    }

    pub fn is_end(&self) -> bool {
        matches!(self.opcode, op::RETURN | op::RETN | op::RETY)
    }
}

fn read_int_be(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

pub fn decode_script(data: &[u8], dialect: Dialect) -> Result<Vec<Ins>, DecmbError> {
    let mut out = Vec::new();
    let mut i = 0usize;
    let mut last_jump = 0usize;

    while i < data.len() {
        let location = i;
        let opcode = data[i];
        i += 1;

        let info = opcode_info(opcode).ok_or(DecmbError::InvalidOpcode(opcode))?;
        if !info.valid_in.allows(dialect) {
            return Err(match info.valid_in {
                ValidIn::Never => DecmbError::InvalidOpcode(opcode),
                _ => DecmbError::WrongDialect { opcode, dialect },
            });
        }

        let size = usize::from(info.operand_size);
        let mut operand = 0i32;

        if size > 0 {
            let remaining = data.len() - i;
            if remaining < size {
                return Err(DecmbError::TruncatedOperand {
                    location,
                    needed: size,
                    remaining,
                });
            }

            operand = sign_extend(read_int_be(&data[i..i + size]), 8 * size as u32);
            i += size;

            // In D10 only, the internal call takes a variable-length
            // operand: a set top bit on the first byte pulls in a second.
            if dialect == Dialect::D10 && opcode == op::CALL && operand & 0x80 != 0 {
                if i >= data.len() {
                    return Err(DecmbError::TruncatedOperand {
                        location,
                        needed: 1,
                        remaining: 0,
                    });
                }

                operand = ((operand & 0x7F) << 8) | i32::from(data[i]);
                i += 1;
            }
        }

        if info.is_jump {
            // Branch offsets are relative to the start of their operand
            // bytes; rewrite to the absolute target.
            operand = i as i32 + operand - size as i32;
            last_jump = last_jump.max(operand.max(0) as usize);
        }

        let ended = matches!(opcode, op::RETURN | op::RETN | op::RETY) && i > last_jump;

        out.push(Ins {
            location,
            opcode,
            operand,
        });

        if ended {
            // Scripts may carry trailing data past the last reachable
            // return.
            break;
        }
    }

    if !out.last().map_or(false, Ins::is_end) {
        return Err(DecmbError::MissingReturn);
    }

    Ok(out)
}

pub fn slice_script(script: &[Ins], ignore_bk: bool) -> BTreeMap<usize, &[Ins]> {
    let mut points: BTreeSet<usize> = BTreeSet::new();

    for ins in script {
        if ignore_bk && ins.is_jump_keep() {
            continue;
        }

        if ins.is_jump() {
            // A jump cuts just after itself and just before its target.
            points.insert(ins.location + 1 + usize::from(ins.info().operand_size));
            points.insert(ins.operand.max(0) as usize);
        }

        if ins.is_end() {
            points.insert(ins.location + 1);
        }
    }

    let mut slices: BTreeMap<usize, &[Ins]> = BTreeMap::new();
    let mut points = points.into_iter();
    let mut start = 0usize;

    while start < script.len() {
        let end = match points.next() {
            Some(offset) => script[start..]
                .iter()
                .position(|ins| ins.location >= offset)
                .map_or(script.len(), |p| start + p),
            None => script.len(),
        };

        slices.insert(script[start].location, &script[start..end]);
        start = end;
    }

    slices
}

/// Rewrites branch-and-keep chains into the synthetic `scand`/`scorr`
/// operators, e.g.
///
/// ```text
/// 0 val 0
/// 2 bkn 7
/// 5 val 1
/// 7 bn ...
/// ```
///
/// becomes
///
/// ```text
/// 0 val 0
/// 5 val 1
/// 2 scand
/// 7 bn ...
/// ```
///
/// Locations are kept; past this point they are only used as keys.
pub fn lower_short_circuits(slice: &mut [Ins]) {
    let mut i = 0;

    while i < slice.len() {
        let opcode = slice[i].opcode;
        i += 1;

        if opcode != op::BKN && opcode != op::BKY {
            continue;
        }

        // Bubble the branch-and-keep forward until it sits right before
        // its target, where it degenerates into a plain binary operator.
        let target = slice[i - 1].operand.max(0) as usize;
        let mut j = i;

        while j < slice.len() && slice[j].location != target {
            slice.swap(j - 1, j);
            j += 1;
        }

        slice[j - 1].opcode = if opcode == op::BKN { op::LAND } else { op::LORR };
        slice[j - 1].operand = 0;

        i += 1;
    }
}

pub fn lowered_slice(slice: &[Ins]) -> Vec<Ins> {
    let mut result = slice.to_vec();
    lower_short_circuits(&mut result);
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
    Deref,
    AddrOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Or,
    And,
    Xor,
    Lsl,
    Lsr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    EqStr,
    NeStr,
    LogicalAnd,
    LogicalOr,
}

impl BinOp {
    // Trailing '?' marks comparisons whose exact semantics in the
    // original interpreter are unconfirmed.
    fn spelling(self) -> &'static str {
        match self {
            BinOp::Assign => " = ",
            BinOp::Add => " + ",
            BinOp::Sub => " - ",
            BinOp::Mul => " * ",
            BinOp::Div => " / ",
            BinOp::Mod => " % ",
            BinOp::Or => " | ",
            BinOp::And => " & ",
            BinOp::Xor => " ^ ",
            BinOp::Lsl => " << ",
            BinOp::Lsr => " >> ",
            BinOp::Eq => " == ",
            BinOp::Ne => " != ",
            BinOp::Lt => " <? ",
            BinOp::Le => " <= ",
            BinOp::Gt => " >? ",
            BinOp::Ge => " >=? ",
            BinOp::EqStr => " <=> ",
            BinOp::NeStr => " <!> ",
            BinOp::LogicalAnd => " && ",
            BinOp::LogicalOr => " || ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Int(i32),
    Str(String),
    Name(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn unary(op: UnOp, inner: Expr) -> Expr {
        Expr::Unary(op, Box::new(inner))
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(value) => write!(f, "{value}"),
            Expr::Str(value) => write!(f, "\"{value}\""),
            Expr::Name(name) => write!(f, "{name}"),
            Expr::Unary(UnOp::Deref, inner) => write!(f, "[{inner}]"),
            Expr::Unary(UnOp::AddrOf, inner) => write!(f, "&{inner}"),
            Expr::Unary(UnOp::Neg, inner) => write!(f, "-{inner}"),
            Expr::Unary(UnOp::Not, inner) => write!(f, "!{inner}"),
            Expr::Unary(UnOp::BitNot, inner) => write!(f, "~{inner}"),
            // Assignments write through an address, hence the brackets.
            Expr::Binary(BinOp::Assign, lhs, rhs) => write!(f, "[{lhs}] = {rhs}"),
            Expr::Binary(op, lhs, rhs) => write!(f, "{lhs}{}{rhs}", op.spelling()),
            Expr::Call(name, args) => {
                write!(f, "{name}(")?;

                for (i, arg) in args.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }

                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Push(Expr),
    Expr(Expr),
    Goto(Expr),
    GotoIf(Expr, Expr),
    Yield,
    Return(Expr),
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Push(expr) => write!(f, "push {expr};"),
            Stmt::Expr(expr) => write!(f, "{expr};"),
            Stmt::Goto(target) => write!(f, "goto {target};"),
            Stmt::GotoIf(target, cond) => write!(f, "goto {target} if {cond};"),
            Stmt::Yield => write!(f, "yield;"),
            Stmt::Return(expr) => write!(f, "return {expr};"),
        }
    }
}

fn label_expr(target: i32) -> Expr {
    Expr::Name(format!("label_{target}"))
}

pub mod scene_kind {
    pub const FUNCTION: u8 = 0;
    pub const TURN3: u8 = 3;
    pub const AREA: u8 = 4;
    pub const TURN6: u8 = 6;
}

pub fn kind_name(kind: u8) -> &'static str {
    match kind {
        scene_kind::FUNCTION => "function",
        scene_kind::TURN3 => "turn3",
        scene_kind::AREA => "area",
        scene_kind::TURN6 => "turn6",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub index: u32,
    pub kind: u8,
    pub name: String,
    pub arg_count: usize,
    pub parameters: Vec<u16>,
    pub var_names: Vec<String>,
    pub script_offset: usize,
    pub is_global: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub scenes: Vec<Scene>,
    pub string_pool: Vec<u8>,
    pub global_names: Vec<String>,
}

impl Container {
    pub fn cstr(&self, offset: u32) -> Result<String, DecmbError> {
        let start = offset as usize;
        if start >= self.string_pool.len() {
            return Err(DecmbError::BadStringOffset(offset));
        }

        let tail = &self.string_pool[start..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());

        Ok(String::from_utf8_lossy(&tail[..end]).to_string())
    }
}

const GLOBAL_COUNT_LIMIT: u32 = 1000;
const LOCAL_COUNT_LIMIT: u32 = 1000;
const PARAM_COUNT_LIMIT: u32 = 20;

fn read_name(data: &[u8], at: usize) -> Result<String, DecmbError> {
    let tail = data
        .get(at..)
        .ok_or(DecmbError::TruncatedContainer("scene name"))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecmbError::TruncatedContainer("scene name"))?;

    Ok(String::from_utf8_lossy(&tail[..end]).to_string())
}

fn read_scene(data: &[u8], at: usize, position: u32) -> Result<Scene, DecmbError> {
    if at + 0x14 > data.len() {
        return Err(DecmbError::TruncatedContainer("scene header"));
    }

    let name_off = LittleEndian::read_u32(&data[at..]) as usize;
    let script_off = LittleEndian::read_u32(&data[at + 0x04..]) as usize;
    let kind = data[at + 0x0C];
    let arg_count = u32::from(data[at + 0x0D]);
    let param_count = u32::from(data[at + 0x0E]);
    let index = u32::from(LittleEndian::read_u16(&data[at + 0x10..]));
    let var_count = u32::from(LittleEndian::read_u16(&data[at + 0x12..]));

    if param_count > PARAM_COUNT_LIMIT {
        return Err(DecmbError::SuspiciousCount {
            what: "scene parameter",
            count: param_count,
        });
    }

    if var_count > LOCAL_COUNT_LIMIT {
        return Err(DecmbError::SuspiciousCount {
            what: "scene variable",
            count: var_count,
        });
    }

    if arg_count > var_count {
        return Err(DecmbError::ArgsExceedVars {
            args: arg_count,
            vars: var_count,
        });
    }

    if at + 0x14 + 2 * param_count as usize > data.len() {
        return Err(DecmbError::TruncatedContainer("scene parameters"));
    }

    if index != position {
        return Err(DecmbError::SceneIndexMismatch {
            header: index,
            position,
        });
    }

    let name = if name_off == 0 {
        format!("unk_{index}")
    } else {
        read_name(data, name_off)?
    };

    let parameters = (0..param_count as usize)
        .map(|p| LittleEndian::read_u16(&data[at + 0x14 + 2 * p..]))
        .collect();

    let args = arg_count as usize;
    let var_names = (0..var_count as usize)
        .map(|v| {
            if v < args {
                format!("arg_{v}")
            } else {
                format!("var_{}", v - args)
            }
        })
        .collect();

    Ok(Scene {
        index,
        kind,
        name,
        arg_count: args,
        parameters,
        var_names,
        script_offset: script_off,
        is_global: name_off != 0,
    })
}

pub fn read_container(data: &[u8]) -> Result<Container, DecmbError> {
    if data.len() < 0x2C {
        return Err(DecmbError::TruncatedContainer("header"));
    }

    let global_count = u32::from(LittleEndian::read_u16(&data[0x22..]));
    let off_strings = LittleEndian::read_u32(&data[0x24..]) as usize;
    let off_events = LittleEndian::read_u32(&data[0x28..]) as usize;

    if off_strings >= data.len() {
        return Err(DecmbError::TruncatedContainer("string pool offset"));
    }

    if off_events >= data.len() {
        return Err(DecmbError::TruncatedContainer("event table offset"));
    }

    if global_count > GLOBAL_COUNT_LIMIT {
        return Err(DecmbError::SuspiciousCount {
            what: "global variable",
            count: global_count,
        });
    }

    // The string pool runs up to the event table, or to the end of the
    // file when it is laid out after the table.
    let pool_end = if off_strings > off_events {
        data.len()
    } else {
        off_events
    };
    let string_pool = data[off_strings..pool_end].to_vec();

    // Global names are not stored in the file; they get positional ones.
    let global_names = (0..global_count).map(|i| format!("glob_{i}")).collect();

    let mut scenes = Vec::new();
    let mut position = 0u32;

    loop {
        let entry = off_events + 4 * position as usize;
        if entry + 4 > data.len() {
            return Err(DecmbError::UnterminatedEventTable);
        }

        let scene_off = LittleEndian::read_u32(&data[entry..]) as usize;
        if scene_off == 0 {
            break;
        }

        scenes.push(read_scene(data, scene_off, position)?);
        position += 1;
    }

    Ok(Container {
        scenes,
        string_pool,
        global_names,
    })
}

// The statement list doubles as the evaluation stack: the trailing run
// of `Push` statements is the stack, so a "pop" takes the last `Push`.
struct StmtBuilder<'a> {
    cmb: &'a Container,
    scene: &'a Scene,
    out: Vec<Stmt>,
}

impl StmtBuilder<'_> {
    fn top_push(&self, mnemonic: &'static str) -> Result<&Expr, DecmbError> {
        match self.out.last() {
            Some(Stmt::Push(expr)) => Ok(expr),
            _ => Err(DecmbError::StackShape { mnemonic, wanted: 1 }),
        }
    }

    fn pop_push(&mut self, mnemonic: &'static str, wanted: usize) -> Result<Expr, DecmbError> {
        match self.out.pop() {
            Some(Stmt::Push(expr)) => Ok(expr),
            _ => Err(DecmbError::StackShape { mnemonic, wanted }),
        }
    }

    fn unop(&mut self, mnemonic: &'static str, op: UnOp) -> Result<(), DecmbError> {
        let inner = self.pop_push(mnemonic, 1)?;
        self.out.push(Stmt::Push(Expr::unary(op, inner)));
        Ok(())
    }

    fn binop(&mut self, mnemonic: &'static str, op: BinOp) -> Result<(), DecmbError> {
        let rhs = self.pop_push(mnemonic, 2)?;
        let lhs = self.pop_push(mnemonic, 2)?;
        self.out.push(Stmt::Push(Expr::binary(op, lhs, rhs)));
        Ok(())
    }

    fn call(&mut self, mnemonic: &'static str, name: &str, argc: usize) -> Result<(), DecmbError> {
        let len = self.out.len();
        if len < argc || self.out[len - argc..].iter().any(|s| !matches!(s, Stmt::Push(_))) {
            return Err(DecmbError::StackShape {
                mnemonic,
                wanted: argc,
            });
        }

        let mut args = Vec::with_capacity(argc);
        for stmt in self.out.split_off(len - argc) {
            if let Stmt::Push(expr) = stmt {
                args.push(expr);
            }
        }

        self.out.push(Stmt::Push(Expr::Call(name.to_string(), args)));
        Ok(())
    }

    fn local(&self, index: i32) -> Result<Expr, DecmbError> {
        name_at(&self.scene.var_names, index)
    }

    fn global(&self, index: i32) -> Result<Expr, DecmbError> {
        name_at(&self.cmb.global_names, index)
    }

    fn step(&mut self, ins: &Ins) -> Result<(), DecmbError> {
        match ins.opcode {
            op::NOP | op::UNK40 => {}

            // push varname
            op::VAL8 | op::VAL16 => {
                let name = self.local(ins.operand)?;
                self.out.push(Stmt::Push(name));
            }

            // push a => push [&varname + a]
            op::VALX8 | op::VALX16 => {
                let name = self.local(ins.operand)?;
                let index = self.pop_push("valx", 1)?;
                self.out.push(Stmt::Push(Expr::unary(
                    UnOp::Deref,
                    Expr::binary(BinOp::Add, Expr::unary(UnOp::AddrOf, name), index),
                )));
            }

            // push &varname
            op::REF8 | op::REF16 => {
                let name = self.local(ins.operand)?;
                self.out.push(Stmt::Push(Expr::unary(UnOp::AddrOf, name)));
            }

            // push a => push &varname + a
            op::REFX8 | op::REFX16 => {
                let name = self.local(ins.operand)?;
                let index = self.pop_push("refx", 1)?;
                self.out.push(Stmt::Push(Expr::binary(
                    BinOp::Add,
                    Expr::unary(UnOp::AddrOf, name),
                    index,
                )));
            }

            op::GVAL8 | op::GVAL16 => {
                let name = self.global(ins.operand)?;
                self.out.push(Stmt::Push(name));
            }

            op::GVALX8 | op::GVALX16 => {
                let name = self.global(ins.operand)?;
                let index = self.pop_push("gvalx", 1)?;
                self.out.push(Stmt::Push(Expr::unary(
                    UnOp::Deref,
                    Expr::binary(BinOp::Add, Expr::unary(UnOp::AddrOf, name), index),
                )));
            }

            op::GREF8 | op::GREF16 => {
                let name = self.global(ins.operand)?;
                self.out.push(Stmt::Push(Expr::unary(UnOp::AddrOf, name)));
            }

            op::GREFX8 | op::GREFX16 => {
                let name = self.global(ins.operand)?;
                let index = self.pop_push("grefx", 1)?;
                self.out.push(Stmt::Push(Expr::binary(
                    BinOp::Add,
                    Expr::unary(UnOp::AddrOf, name),
                    index,
                )));
            }

            op::NUMBER8 | op::NUMBER16 | op::NUMBER32 => {
                self.out.push(Stmt::Push(Expr::Int(ins.operand)));
            }

            op::STRING8 | op::STRING16 | op::STRING32 => {
                let value = self.cmb.cstr(ins.operand as u32)?;
                self.out.push(Stmt::Push(Expr::Str(value)));
            }

            // push a => push a, [a]
            op::DEREF => {
                let copy = self.top_push("deref")?.clone();
                self.out.push(Stmt::Push(Expr::unary(UnOp::Deref, copy)));
            }

            // push a => a
            op::DISC => {
                let expr = self.pop_push("disc", 1)?;
                self.out.push(Stmt::Expr(expr));
            }

            // push a, b => push [a] = b
            op::STORE => self.binop("store", BinOp::Assign)?,

            op::ADD => self.binop("add", BinOp::Add)?,
            op::SUB => self.binop("sub", BinOp::Sub)?,
            op::MUL => self.binop("mul", BinOp::Mul)?,
            op::DIV => self.binop("div", BinOp::Div)?,
            op::MOD => self.binop("mod", BinOp::Mod)?,
            op::ORR => self.binop("orr", BinOp::Or)?,
            op::AND => self.binop("and", BinOp::And)?,
            op::XOR => self.binop("xor", BinOp::Xor)?,
            op::LSL => self.binop("lsl", BinOp::Lsl)?,
            op::LSR => self.binop("lsr", BinOp::Lsr)?,
            op::EQ => self.binop("eq", BinOp::Eq)?,
            op::NE => self.binop("ne", BinOp::Ne)?,
            op::LT => self.binop("lt", BinOp::Lt)?,
            op::LE => self.binop("le", BinOp::Le)?,
            op::GT => self.binop("gt", BinOp::Gt)?,
            op::GE => self.binop("ge", BinOp::Ge)?,
            op::EQSTR => self.binop("eqstr", BinOp::EqStr)?,
            op::NESTR => self.binop("nestr", BinOp::NeStr)?,

            op::NEG => self.unop("neg", UnOp::Neg)?,
            op::NOT => self.unop("not", UnOp::Not)?,
            op::MVN => self.unop("mvn", UnOp::BitNot)?,

            // push ... => push scene(...)
            op::CALL => {
                let (name, argc) = {
                    let scene = usize::try_from(ins.operand)
                        .ok()
                        .and_then(|i| self.cmb.scenes.get(i))
                        .ok_or(DecmbError::BadSceneIndex {
                            index: ins.operand,
                            limit: self.cmb.scenes.len(),
                        })?;

                    (scene.name.clone(), scene.arg_count)
                };

                self.call("call.", &name, argc)?;
            }

            // push ... => push func(...), name and argc packed into the
            // operand as (pool_offset << 8) | argc
            op::CALLEXT => {
                let name = self.cmb.cstr((ins.operand >> 8) as u32)?;
                self.call("call", &name, (ins.operand & 0xFF) as usize)?;
            }

            // push a => return a
            op::RETURN => {
                let expr = self.pop_push("ret", 1)?;
                self.out.push(Stmt::Return(expr));
            }

            op::B => {
                self.out.push(Stmt::Goto(label_expr(ins.operand)));
            }

            // push a => goto off if !a
            op::BN => {
                let cond = self.pop_push("bn", 1)?;
                self.out.push(Stmt::GotoIf(
                    label_expr(ins.operand),
                    Expr::unary(UnOp::Not, cond),
                ));
            }

            // push a => goto off if a
            op::BY => {
                let cond = self.pop_push("by", 1)?;
                self.out.push(Stmt::GotoIf(label_expr(ins.operand), cond));
            }

            op::YIELD => self.out.push(Stmt::Yield),

            op::PRINTF => {
                self.call("printf", "__printf", ins.operand as usize)?;
                let expr = self.pop_push("printf", 1)?;
                self.out.push(Stmt::Expr(expr));
            }

            // push a => push a, a
            op::DUP => {
                let copy = self.top_push("dup")?.clone();
                self.out.push(Stmt::Push(copy));
            }

            op::RETN => self.out.push(Stmt::Return(Expr::Int(0))),
            op::RETY => self.out.push(Stmt::Return(Expr::Int(1))),

            // push a, b => [a] = b
            op::ASSIGN => {
                self.binop("assign", BinOp::Assign)?;
                let expr = self.pop_push("assign", 1)?;
                self.out.push(Stmt::Expr(expr));
            }

            op::LAND => self.binop("scand", BinOp::LogicalAnd)?,
            op::LORR => self.binop("scorr", BinOp::LogicalOr)?,

            other => return Err(DecmbError::UnsupportedOpcode(other)),
        }

        Ok(())
    }
}

fn name_at(names: &[String], index: i32) -> Result<Expr, DecmbError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| names.get(i))
        .map(|name| Expr::Name(name.clone()))
        .ok_or(DecmbError::BadVariableIndex {
            index,
            limit: names.len(),
        })
}

pub fn make_statements(
    cmb: &Container,
    scene: &Scene,
    slice: &[Ins],
) -> Result<Vec<Stmt>, DecmbError> {
    let mut builder = StmtBuilder {
        cmb,
        scene,
        out: Vec::with_capacity(slice.len()),
    };

    for ins in slice {
        builder.step(ins)?;
    }

    Ok(builder.out)
}

pub fn collect_labels(slices: &BTreeMap<usize, &[Ins]>) -> BTreeMap<usize, String> {
    let mut labels = BTreeMap::new();

    for slice in slices.values() {
        for ins in *slice {
            if ins.is_jump() && !ins.is_jump_keep() {
                let target = ins.operand.max(0) as usize;
                labels.insert(target, format!("label_{target}"));
            }
        }
    }

    labels
}

fn scene_body<'a>(data: &'a [u8], scene: &Scene) -> Result<&'a [u8], DecmbError> {
    data.get(scene.script_offset..)
        .ok_or(DecmbError::TruncatedContainer("scene script"))
}

fn emit_scene(
    cmb: &Container,
    scene: &Scene,
    data: &[u8],
    dialect: Dialect,
    out: &mut String,
) -> Result<(), DecmbError> {
    out.push_str(&format!("EVENT {}(", scene.name));

    for i in 0..scene.arg_count {
        if i != 0 {
            out.push_str(", ");
        }
        out.push_str(&scene.var_names[i]);
    }

    out.push(')');

    if scene.is_global {
        out.push_str(" global");
    }

    out.push_str("\n{\n");

    let script = decode_script(scene_body(data, scene)?, dialect)?;
    let slices = slice_script(&script, true);
    let labels = collect_labels(&slices);

    for (&offset, slice) in &slices {
        if slice.is_empty() {
            continue;
        }

        if offset != 0 {
            out.push('\n');
        }

        if let Some(label) = labels.get(&offset) {
            out.push_str(&format!("{label}:\n"));
        }

        for stmt in make_statements(cmb, scene, &lowered_slice(slice))? {
            out.push_str(&format!("  {stmt}\n"));
        }
    }

    out.push_str("}\n\n");
    Ok(())
}

fn disasm_scene(
    cmb: &Container,
    scene: &Scene,
    data: &[u8],
    dialect: Dialect,
    out: &mut String,
) -> Result<(), DecmbError> {
    out.push_str(&format!(
        "event {} (kind={}, args={}, vars={})\n",
        scene.name,
        kind_name(scene.kind),
        scene.arg_count,
        scene.var_names.len()
    ));

    let script = decode_script(scene_body(data, scene)?, dialect)?;

    for ins in &script {
        let info = ins.info();

        if info.operand_size == 0 {
            out.push_str(&format!("{:05} {}", ins.location, info.mnemonic));
        } else {
            out.push_str(&format!(
                "{:05} {:<8} {}",
                ins.location, info.mnemonic, ins.operand
            ));

            match ins.opcode {
                op::VAL8..=op::REFY16 => {
                    if let Ok(Expr::Name(name)) = name_at(&scene.var_names, ins.operand) {
                        out.push_str(&format!(" ; {name}"));
                    }
                }
                op::GVAL8..=op::GREFY16 => {
                    if let Ok(Expr::Name(name)) = name_at(&cmb.global_names, ins.operand) {
                        out.push_str(&format!(" ; {name}"));
                    }
                }
                op::STRING8 | op::STRING16 | op::STRING32 => {
                    if let Ok(value) = cmb.cstr(ins.operand as u32) {
                        out.push_str(&format!(" ; \"{value}\""));
                    }
                }
                op::CALL => {
                    if let Some(target) = usize::try_from(ins.operand)
                        .ok()
                        .and_then(|i| cmb.scenes.get(i))
                    {
                        out.push_str(&format!(" ; {}", target.name));
                    }
                }
                op::CALLEXT => {
                    if let Ok(name) = cmb.cstr((ins.operand >> 8) as u32) {
                        out.push_str(&format!(" ; {} ({} args)", name, ins.operand & 0xFF));
                    }
                }
                _ => {}
            }
        }

        out.push('\n');
    }

    out.push('\n');
    Ok(())
}

pub fn decompile_with_options(
    data: &[u8],
    options: DecompileOptions,
) -> Result<String, DecmbError> {
    let cmb = read_container(data)?;
    let mut out = String::new();

    for name in &cmb.global_names {
        out.push_str(&format!("VARIABLE {name};\n"));
    }

    if !cmb.global_names.is_empty() {
        out.push('\n');
    }

    for scene in &cmb.scenes {
        let result = match options.mode {
            DecompileMode::Pseudo => emit_scene(&cmb, scene, data, options.dialect, &mut out),
            DecompileMode::Disasm => disasm_scene(&cmb, scene, data, options.dialect, &mut out),
        };

        // A malformed scene does not contaminate the others; close its
        // block and keep going.
        if let Err(e) = result {
            match options.mode {
                DecompileMode::Pseudo => {
                    out.push_str(&format!("FAILED {}: {e}\n}}\n\n", scene.name));
                }
                DecompileMode::Disasm => {
                    out.push_str(&format!("FAILED {}: {e}\n\n", scene.name));
                }
            }
        }
    }

    Ok(out)
}

pub fn decompile(data: &[u8]) -> Result<String, DecmbError> {
    decompile_with_options(data, DecompileOptions::default())
}
