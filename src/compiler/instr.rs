use crate::compiler::error::CodegenError;
use crate::compiler::opcode::OpCode;

/// Bit widths of the packed instruction word. The opcode occupies the low
/// 7 bits; everything else is shape-dependent. `C` is 7 bits rather than 9
/// so that the `A,B,C` shape fits exactly in 32 bits (7+9+9+7) — this also
/// makes `CALL_MAXARGS` (127) exactly the max representable `C` value,
/// which is why it works as a sentinel.
pub const OP_BITS: u32 = 7;
pub const A_BITS: u32 = 9;
pub const B_BITS: u32 = 9;
pub const C_BITS: u32 = 7;
pub const BX_BITS: u32 = 16;
pub const AX_BITS: u32 = 25;

pub const MAXARG_A: u16 = (1 << A_BITS) - 1;
pub const MAXARG_B: u16 = (1 << B_BITS) - 1;
pub const MAXARG_C: u16 = (1 << C_BITS) - 1;
pub const MAXARG_BX: u16 = u16::MAX;
/// Largest magnitude representable in the signed 16-bit `sBx` field.
pub const MAXARG_SBX: i32 = (1 << (BX_BITS - 1)) - 1;
pub const MAXARG_AX: u32 = (1 << AX_BITS) - 1;

/// One 32-bit instruction word, held in decoded form. `encode`/`decode`
/// round-trip bit-exactly to the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    A { op: OpCode, a: u16 },
    Ab { op: OpCode, a: u16, b: u16 },
    Abc { op: OpCode, a: u16, b: u16, c: u16 },
    ABx { op: OpCode, a: u16, bx: u16 },
    AsBx { op: OpCode, a: u16, sbx: i32 },
    Ax { op: OpCode, ax: u32 },
}

impl Instruction {
    pub fn opcode(&self) -> OpCode {
        match *self {
            Instruction::A { op, .. }
            | Instruction::Ab { op, .. }
            | Instruction::Abc { op, .. }
            | Instruction::ABx { op, .. }
            | Instruction::AsBx { op, .. }
            | Instruction::Ax { op, .. } => op,
        }
    }

    /// Register operand `A`, where the shape has one. Used pervasively by
    /// the peephole optimizer to inspect the previous instruction.
    pub fn a(&self) -> Option<u16> {
        match *self {
            Instruction::A { a, .. }
            | Instruction::Ab { a, .. }
            | Instruction::Abc { a, .. }
            | Instruction::ABx { a, .. }
            | Instruction::AsBx { a, .. } => Some(a),
            Instruction::Ax { .. } => None,
        }
    }

    pub fn b(&self) -> Option<u16> {
        match *self {
            Instruction::Ab { b, .. } | Instruction::Abc { b, .. } => Some(b),
            _ => None,
        }
    }

    pub fn c(&self) -> Option<u16> {
        match *self {
            Instruction::Abc { c, .. } => Some(c),
            _ => None,
        }
    }

    pub fn encode(&self) -> u32 {
        let op = u8::from(self.opcode()) as u32;
        let word = match *self {
            Instruction::A { a, .. } => (a as u32) << OP_BITS,
            Instruction::Ab { a, b, .. } => ((a as u32) << OP_BITS) | ((b as u32) << (OP_BITS + A_BITS)),
            Instruction::Abc { a, b, c, .. } => {
                ((a as u32) << OP_BITS)
                    | ((b as u32) << (OP_BITS + A_BITS))
                    | ((c as u32) << (OP_BITS + A_BITS + B_BITS))
            }
            Instruction::ABx { a, bx, .. } => ((a as u32) << OP_BITS) | ((bx as u32) << (OP_BITS + A_BITS)),
            Instruction::AsBx { a, sbx, .. } => {
                let biased = (sbx + MAXARG_SBX + 1) as u32;
                ((a as u32) << OP_BITS) | (biased << (OP_BITS + A_BITS))
            }
            Instruction::Ax { ax, .. } => ax << OP_BITS,
        };
        word | op
    }

    pub fn decode(word: u32) -> Result<Instruction, CodegenError> {
        let op = (word & ((1 << OP_BITS) - 1)) as u8;
        let op = OpCode::try_from(op).map_err(|_| CodegenError::MalformedInstructionWord { word })?;
        Ok(Self::decode_for(op, word))
    }

    fn decode_for(op: OpCode, word: u32) -> Instruction {
        let shape = shape_of(op);
        let rest = word >> OP_BITS;
        match shape {
            Shape::A => Instruction::A {
                op,
                a: (rest & MAXARG_A as u32) as u16,
            },
            Shape::Ab => {
                let a = (rest & MAXARG_A as u32) as u16;
                let b = ((rest >> A_BITS) & MAXARG_B as u32) as u16;
                Instruction::Ab { op, a, b }
            }
            Shape::Abc => {
                let a = (rest & MAXARG_A as u32) as u16;
                let b = ((rest >> A_BITS) & MAXARG_B as u32) as u16;
                let c = ((rest >> (A_BITS + B_BITS)) & MAXARG_C as u32) as u16;
                Instruction::Abc { op, a, b, c }
            }
            Shape::ABx => {
                let a = (rest & MAXARG_A as u32) as u16;
                let bx = ((rest >> A_BITS) & MAXARG_BX as u32) as u16;
                Instruction::ABx { op, a, bx }
            }
            Shape::AsBx => {
                let a = (rest & MAXARG_A as u32) as u16;
                let biased = (rest >> A_BITS) & MAXARG_BX as u32;
                let sbx = biased as i32 - (MAXARG_SBX + 1);
                Instruction::AsBx { op, a, sbx }
            }
            Shape::Ax => Instruction::Ax {
                op,
                ax: rest & MAXARG_AX,
            },
        }
    }
}

enum Shape {
    A,
    Ab,
    Abc,
    ABx,
    AsBx,
    Ax,
}

/// Maps each opcode to its encoding shape. `JMP`/`JMPIF`/`JMPNOT`/`ONERR` use
/// `AsBx` (the `A` register is the test operand for the conditional forms,
/// unused for `JMP`/`ONERR`, whose `sBx` is the forward-patch target like any
/// other jump); `ENTER` and `SUPER`/`ARGARY`/`BLKPUSH`'s packed arity word use
/// `Ax`. `RETURN`/`BREAK` use `Abc` so their `C` operand can carry a
/// `ReturnKind` (`B` unused).
fn shape_of(op: OpCode) -> Shape {
    use OpCode::*;
    match op {
        LoadNil | LoadT | LoadF | LoadSelf | Stop | Err => Shape::A,
        Move | GetGlobal | SetGlobal | GetIv | SetIv | GetCv | SetCv | GetConst | SetConst
        | GetSpecial | AryPush | AryCat | StrCat | Raise | PopErr | EPop | TailCall => Shape::Ab,
        AddI | SubI | Lt | Le | Gt | Ge | Eq | Add | Sub | Mul | Div | Aref | Apost | Hash
        | Range | Send | SendB | Super | Call | Class | Module | SClass | Method | OClass
        | TClass | Exec | Array | Rescue | Return | Break => Shape::Abc,
        LoadI | LoadL | LoadSym | GetMcnst | SetMcnst | GetUpvar | SetUpvar | StringLit
        | Lambda => Shape::ABx,
        Jmp | JmpIf | JmpNot | OnErr => Shape::AsBx,
        Enter | ArgAry | BlkPush | EPush => Shape::Ax,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_abc_shape() {
        let instr = Instruction::Abc {
            op: OpCode::Send,
            a: 3,
            b: 42,
            c: 2,
        };
        let word = instr.encode();
        assert_eq!(Instruction::decode(word).unwrap(), instr);
    }

    #[test]
    fn round_trips_asbx_negative_offset() {
        let instr = Instruction::AsBx {
            op: OpCode::Jmp,
            a: 0,
            sbx: -17,
        };
        let word = instr.encode();
        assert_eq!(Instruction::decode(word).unwrap(), instr);
    }

    #[test]
    fn round_trips_ax_shape() {
        let instr = Instruction::Ax {
            op: OpCode::Enter,
            ax: 0x40000,
        };
        let word = instr.encode();
        assert_eq!(Instruction::decode(word).unwrap(), instr);
    }

    #[test]
    fn call_maxargs_fits_c_field() {
        assert_eq!(crate::compiler::opcode::CALL_MAXARGS, MAXARG_C);
    }
}
