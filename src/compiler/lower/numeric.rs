//! Numeric literal lowering (`INT`/`FLOAT`/unary `-`, SPEC_FULL.md §4.9).

use crate::compiler::error::CodegenError;
use crate::compiler::instr::{Instruction, MAXARG_SBX};
use crate::compiler::literal::Literal;
use crate::compiler::opcode::OpCode;
use crate::compiler::scope::LexicalScope;
use crate::compiler::Mode;

use super::{emit, LowerCtx};
use crate::ast::{Node, NodeKind};

/// Parses an integer literal written in the given base, stripping the `_`
/// digit-group separators the lexer leaves in place. `base` is one of
/// 2/8/10/16, matching the prefix the parser already stripped.
fn parse_int(text: &str, base: u32) -> Option<i64> {
    let cleaned: String = text.chars().filter(|&c| c != '_').collect();
    i64::from_str_radix(&cleaned, base).ok()
}

pub(crate) fn lower_int(
    scope: &mut LexicalScope,
    text: &str,
    base: u32,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    if mode == Mode::Noval {
        return Ok(());
    }
    let Some(value) = parse_int(text, base) else {
        // Overflowed i64 (or malformed): reparse as a float literal, the
        // same fallback the source takes for oversized integer literals.
        let cleaned: String = text.chars().filter(|&c| c != '_').collect();
        let parsed: f64 = cleaned
            .parse()
            .map_err(|_| CodegenError::MalformedIntegerLiteral { text: text.to_owned() })?;
        let off = scope.unit.pool.intern(Literal::Float(parsed));
        let a = scope.unit.regs.push()?;
        emit(scope, ctx, Instruction::ABx { op: OpCode::LoadL, a, bx: off as u16 }, line);
        return Ok(());
    };

    let a = scope.unit.regs.push()?;
    if value.unsigned_abs() <= MAXARG_SBX as u64 {
        emit(
            scope,
            ctx,
            Instruction::ABx {
                op: OpCode::LoadI,
                a,
                bx: value as u16,
            },
            line,
        );
    } else {
        let off = scope.unit.pool.intern(Literal::Int(value));
        emit(scope, ctx, Instruction::ABx { op: OpCode::LoadL, a, bx: off as u16 }, line);
    }
    Ok(())
}

pub(crate) fn lower_float(
    scope: &mut LexicalScope,
    text: &str,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    if mode == Mode::Noval {
        return Ok(());
    }
    let cleaned: String = text.chars().filter(|&c| c != '_').collect();
    let value: f64 = cleaned
        .parse()
        .map_err(|_| CodegenError::MalformedFloatLiteral { text: text.to_owned() })?;
    let off = scope.unit.pool.intern(Literal::Float(value));
    let a = scope.unit.regs.push()?;
    emit(scope, ctx, Instruction::ABx { op: OpCode::LoadL, a, bx: off as u16 }, line);
    Ok(())
}

pub(crate) fn lower_negate(
    scope: &mut LexicalScope,
    inner: &Node,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    match &inner.kind {
        NodeKind::Int { text, base } => {
            let negated = format!("-{text}");
            lower_int(scope, &negated, *base, mode, ctx, line)
        }
        NodeKind::Float(text) => {
            let negated = format!("-{text}");
            lower_float(scope, &negated, mode, ctx, line)
        }
        _ => {
            // Generic fallback: `-expr` desugars to a unary `-@` send,
            // delegating to the same call-lowering path a binary operator
            // send would use.
            let call = crate::ast::CallNode {
                recv: Some(Box::new(inner.clone())),
                name: "-@".to_owned(),
                args: Vec::new(),
                block: None,
                safe_nav: false,
            };
            super::gen_call(scope, &call, 0, mode, ctx, line)
        }
    }
}
