use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::{Display, EnumIter};

/// The closed instruction set emitted by the lowering pipeline. Grouped the
/// way the source groups its opcodes by category; ordering within a group
/// carries no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, TryFromPrimitive, IntoPrimitive, Display)]
#[repr(u8)]
pub enum OpCode {
    // -- data movement --
    Move,
    LoadI,
    LoadL,
    LoadSym,
    LoadNil,
    LoadT,
    LoadF,
    LoadSelf,

    // -- variable access --
    GetGlobal,
    SetGlobal,
    GetIv,
    SetIv,
    GetCv,
    SetCv,
    GetConst,
    SetConst,
    GetMcnst,
    SetMcnst,
    GetUpvar,
    SetUpvar,
    GetSpecial,

    // -- arithmetic / comparison --
    Add,
    Sub,
    Mul,
    Div,
    AddI,
    SubI,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,

    // -- aggregates --
    Array,
    Aref,
    Apost,
    AryPush,
    AryCat,
    Hash,
    Range,
    StrCat,
    StringLit,

    // -- calls --
    Send,
    SendB,
    Super,
    TailCall,
    Call,
    BlkPush,
    ArgAry,

    // -- definitions --
    Class,
    Module,
    SClass,
    OClass,
    TClass,
    Method,
    Exec,
    Lambda,

    // -- control --
    Jmp,
    JmpIf,
    JmpNot,
    Enter,
    Return,
    Break,

    // -- exception regions --
    OnErr,
    Rescue,
    Raise,
    PopErr,
    EPush,
    EPop,
    Err,
    Stop,
}

/// Which non-local return mode a `RETURN`/`BREAK` instruction carries in its
/// `C` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, TryFromPrimitive, IntoPrimitive, Display)]
#[repr(u8)]
pub enum ReturnKind {
    Normal,
    Break,
    /// Non-local return from a block back to its enclosing method.
    Return,
}

/// The fixed-width sentinel meaning "arguments are packed into a single
/// array on top of the stack" rather than passed as `n` flat registers.
/// Chosen to equal the instruction format's 7-bit `C` field's maximum value
/// (see `Instruction`/`MAXARG_C`), so it is never confusable with a real
/// argument count.
pub const CALL_MAXARGS: u16 = 127;
