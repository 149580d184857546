//! Multiple-assignment lowering (`MASGN`, SPEC_FULL.md §4.3).

use crate::ast::{MasgnRhs, MasgnTargets, Node};
use crate::compiler::error::CodegenError;
use crate::compiler::instr::Instruction;
use crate::compiler::opcode::OpCode;
use crate::compiler::scope::LexicalScope;
use crate::compiler::Mode;

use super::{codegen, emit, gen_assignment, LowerCtx};

pub(crate) fn lower_masgn(
    scope: &mut LexicalScope,
    lhs: &MasgnTargets,
    rhs: &MasgnRhs,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    match rhs {
        MasgnRhs::FixedArray(nodes) => lower_masgn_fixed(scope, lhs, nodes, mode, ctx, line),
        MasgnRhs::Variable(node) => lower_masgn_variable(scope, lhs, node, mode, ctx, line),
    }
}

/// `a, b, *c = 1, 2, 3, 4`: the RHS is a literal array with no splat
/// elements, so each target can be assigned straight from the register the
/// corresponding element was lowered into, without building an array first.
fn lower_masgn_fixed(
    scope: &mut LexicalScope,
    lhs: &MasgnTargets,
    nodes: &[Node],
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    // Reserved ahead of the element registers (as `lower_hash` reserves its
    // destination first) so it survives popping them back off, the way a
    // VAL-mode result must.
    let val_dest = if mode == Mode::Val { Some(scope.unit.regs.push()?) } else { None };

    let base = scope.unit.regs.cursp();
    for node in nodes {
        codegen(scope, node, Mode::Val, ctx)?;
    }

    let pre_len = lhs.pre.len();
    let post_len = lhs.post.len();
    for (i, target) in lhs.pre.iter().enumerate() {
        gen_assignment(scope, ctx, target, base + i as u16, line)?;
    }
    match &lhs.rest {
        Some(rest_opt) => {
            let rest_start = base + pre_len as u16;
            let rest_len = nodes.len().saturating_sub(pre_len + post_len) as u16;
            if let Some(rest_lhs) = rest_opt {
                let arr_reg = scope.unit.regs.push()?;
                emit(scope, ctx, Instruction::Abc { op: OpCode::Array, a: arr_reg, b: rest_start, c: rest_len }, line);
                gen_assignment(scope, ctx, rest_lhs, arr_reg, line)?;
                scope.unit.regs.pop();
            }
            for (i, target) in lhs.post.iter().enumerate() {
                let reg = rest_start + rest_len + i as u16;
                gen_assignment(scope, ctx, target, reg, line)?;
            }
        }
        None => {
            for (i, target) in lhs.post.iter().enumerate() {
                gen_assignment(scope, ctx, target, base + pre_len as u16 + i as u16, line)?;
            }
        }
    }

    if let Some(dest) = val_dest {
        emit(scope, ctx, Instruction::Abc { op: OpCode::Array, a: dest, b: base, c: nodes.len() as u16 }, line);
    }
    scope.unit.regs.pop_n(nodes.len() as u16);
    Ok(())
}

/// `a, b, *c = expr`: the RHS isn't statically known to be splat-free, so
/// it's lowered as one value and split at runtime via `AREF`/`APOST`.
fn lower_masgn_variable(
    scope: &mut LexicalScope,
    lhs: &MasgnTargets,
    rhs: &Node,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    codegen(scope, rhs, Mode::Val, ctx)?;
    let rhs_reg = scope.unit.regs.cursp() - 1;
    assign_masgn_from_array(scope, ctx, lhs, rhs_reg, line)?;
    if mode == Mode::Noval {
        scope.unit.regs.pop();
    }
    Ok(())
}

/// Splits `array_reg` across `targets`: `AREF array_reg, i` for each
/// pre-target, then (if there's a rest or post target) `APOST` — which
/// leaves the rest slice at `array_reg` and the post values at
/// `array_reg + 1 ..= array_reg + post.len()` — and assigns those.
/// Shared with `for`-loop variable destructuring (SPEC_FULL.md §4.7).
pub(crate) fn assign_masgn_from_array(
    scope: &mut LexicalScope,
    ctx: &mut LowerCtx,
    targets: &MasgnTargets,
    array_reg: u16,
    line: u32,
) -> Result<(), CodegenError> {
    for (i, target) in targets.pre.iter().enumerate() {
        let reg = scope.unit.regs.push()?;
        emit(scope, ctx, Instruction::Abc { op: OpCode::Aref, a: reg, b: array_reg, c: i as u16 }, line);
        gen_assignment(scope, ctx, target, reg, line)?;
        scope.unit.regs.pop();
    }

    if targets.rest.is_some() || !targets.post.is_empty() {
        let pre_len = targets.pre.len() as u16;
        let post_len = targets.post.len() as u16;
        emit(scope, ctx, Instruction::Abc { op: OpCode::Apost, a: array_reg, b: pre_len, c: post_len }, line);
        if let Some(Some(rest_lhs)) = &targets.rest {
            gen_assignment(scope, ctx, rest_lhs, array_reg, line)?;
        }
        for (i, target) in targets.post.iter().enumerate() {
            let reg = array_reg + 1 + i as u16;
            gen_assignment(scope, ctx, target, reg, line)?;
        }
    }
    Ok(())
}
