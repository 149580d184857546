use strum_macros::{Display, EnumIter};

/// Binary operators that `gen_call` may fuse into a dedicated opcode
/// (`ADD`/`SUB`/`MUL`/`DIV`/`LT`/`LE`/`GT`/`GE`/`EQ`) instead of a generic
/// `SEND`, when the receiver/argument shapes allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, Display)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl BinaryOperator {
    /// The method name this operator sends when it cannot be fused, e.g.
    /// because the receiver isn't known to respond to the fast-path opcode.
    pub fn method_name(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Lt => "<",
            BinaryOperator::Le => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::Ge => ">=",
            BinaryOperator::Eq => "==",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, Display)]
pub enum UnaryOperator {
    Plus,
    Minus,
    Not,
    BitwiseNot,
}

/// `x op= y` operators, including the short-circuiting `||=`/`&&=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, Display)]
pub enum AssignOperator {
    Binary(BinaryOperator),
    LogicalOr,
    LogicalAnd,
}
