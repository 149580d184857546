//! Method-call lowering: `gen_call`, `super`/`zsuper`, `yield`, and block
//! literals (SPEC_FULL.md §4.2, §4.5).

use crate::ast::{ArgItem, BinaryOperator, CallNode, Node, NodeKind, ParamList};
use crate::compiler::aspec::Ainfo;
use crate::compiler::error::CodegenError;
use crate::compiler::instr::Instruction;
use crate::compiler::jump::JumpPatcher;
use crate::compiler::opcode::{OpCode, CALL_MAXARGS};
use crate::compiler::scope::LexicalScope;
use crate::compiler::Mode;

use super::{codegen, compile_method_body, emit, gen_values, LowerCtx};

fn binop_for(name: &str) -> Option<BinaryOperator> {
    use BinaryOperator::*;
    Some(match name {
        "+" => Add,
        "-" => Sub,
        "*" => Mul,
        "/" => Div,
        "<" => Lt,
        "<=" => Le,
        ">" => Gt,
        ">=" => Ge,
        "==" => Eq,
        _ => return None,
    })
}

/// Emits the fused fast-path opcode for `bin`, following the convention
/// `R(a_reg) = R(a_reg) op R(a_reg + 1)` shared by all nine fused binops.
pub(crate) fn emit_binop(scope: &mut LexicalScope, ctx: &mut LowerCtx, bin: BinaryOperator, a_reg: u16, line: u32) {
    use BinaryOperator::*;
    let op = match bin {
        Add => OpCode::Add,
        Sub => OpCode::Sub,
        Mul => OpCode::Mul,
        Div => OpCode::Div,
        Lt => OpCode::Lt,
        Le => OpCode::Le,
        Gt => OpCode::Gt,
        Ge => OpCode::Ge,
        Eq => OpCode::Eq,
    };
    emit(scope, ctx, Instruction::Abc { op, a: a_reg, b: 0, c: 0 }, line);
}

/// Compiles a block literal's body into a child procedure and leaves a
/// `LAMBDA` at a freshly pushed register, returning it.
fn push_block_lambda(scope: &mut LexicalScope, node: &Node, ctx: &mut LowerCtx, line: u32) -> Result<u16, CodegenError> {
    let NodeKind::BlockLit { params, body } = &node.kind else {
        // Parser invariant: `CallNode.block`/`For`'s implicit block always
        // carries a `BlockLit` node.
        return Err(CodegenError::UnknownAssignmentTarget);
    };
    let (child_idx, _aspec) = compile_method_body(scope, params, body, false, ctx)?;
    let dest = scope.unit.regs.push()?;
    emit(scope, ctx, Instruction::ABx { op: OpCode::Lambda, a: dest, bx: child_idx }, line);
    Ok(dest)
}

/// `BlockLit` reached directly by `codegen` (not through a call's `.block`
/// slot) just evaluates to the lambda value itself.
pub(crate) fn lower_block_literal_standalone(
    scope: &mut LexicalScope,
    params: &ParamList,
    body: &Node,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let (child_idx, _aspec) = compile_method_body(scope, params, body, false, ctx)?;
    if mode == Mode::Noval {
        return Ok(());
    }
    let dest = scope.unit.regs.push()?;
    emit(scope, ctx, Instruction::ABx { op: OpCode::Lambda, a: dest, bx: child_idx }, line);
    Ok(())
}

/// Lowers a method call. `extra_arg_reg`, when non-zero, names a register
/// already holding a value to append as the call's final argument — used
/// by attribute-assignment (`recv.name = value`), which reuses `gen_call`'s
/// own argument-splicing machinery instead of synthesizing a fake AST node
/// for the assigned value (SPEC_FULL.md §4.1 `gen_assignment`/`Lhs::Attr`).
/// Register `0` is always `self`, so it doubles as the "no extra arg"
/// sentinel.
pub(crate) fn gen_call(
    scope: &mut LexicalScope,
    call: &CallNode,
    extra_arg_reg: u16,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let recv_reg = match &call.recv {
        Some(recv) => {
            codegen(scope, recv, Mode::Val, ctx)?;
            scope.unit.regs.cursp() - 1
        }
        None => {
            let a = scope.unit.regs.push()?;
            emit(scope, ctx, Instruction::A { op: OpCode::LoadSelf, a }, line);
            a
        }
    };

    let safe_patch = if call.safe_nav {
        Some(JumpPatcher::emit_placeholder(&mut scope.unit, OpCode::JmpNot, recv_reg, line))
    } else {
        None
    };

    // Fuse `a OP b` into a dedicated fast-path opcode when there's no
    // splat/block/safe-nav/spliced-in value complicating the shape.
    if extra_arg_reg == 0 && call.block.is_none() && !call.safe_nav && call.args.len() == 1 {
        if let (Some(bin), ArgItem::Plain(arg)) = (binop_for(&call.name), &call.args[0]) {
            codegen(scope, arg, Mode::Val, ctx)?;
            emit_binop(scope, ctx, bin, recv_reg, line);
            scope.unit.regs.pop();
            if mode == Mode::Noval {
                scope.unit.regs.pop();
            }
            return Ok(());
        }
    }

    let n = gen_values(scope, &call.args, ctx, line)?;

    let argc: u16 = if extra_arg_reg != 0 {
        match n {
            -1 => {
                let arr_reg = scope.unit.regs.cursp() - 1;
                emit(scope, ctx, Instruction::Ab { op: OpCode::AryPush, a: arr_reg, b: extra_arg_reg }, line);
                CALL_MAXARGS
            }
            n if (n as u16) < CALL_MAXARGS => {
                let dest = scope.unit.regs.push()?;
                emit(scope, ctx, Instruction::Ab { op: OpCode::Move, a: dest, b: extra_arg_reg }, line);
                n as u16 + 1
            }
            _ => unreachable!("gen_values never returns a flat count >= CALL_MAXARGS"),
        }
    } else if n < 0 {
        CALL_MAXARGS
    } else {
        n as u16
    };

    let has_block = call.block.is_some();
    if let Some(block_node) = &call.block {
        push_block_lambda(scope, block_node, ctx, line)?;
    }

    let sym = ctx.interner.intern(&call.name);
    let sym_idx = scope.unit.symtab.new_msym(sym)?;
    let op = if has_block { OpCode::SendB } else { OpCode::Send };
    emit(scope, ctx, Instruction::Abc { op, a: recv_reg, b: sym_idx, c: argc }, line);

    let extra = scope.unit.regs.cursp() - (recv_reg + 1);
    scope.unit.regs.pop_n(extra);

    if let Some(p) = safe_patch {
        let target = scope.unit.buffer.pc();
        JumpPatcher::dispatch(&mut scope.unit, p, target)?;
    }
    if mode == Mode::Noval {
        scope.unit.regs.pop();
    }
    Ok(())
}

pub(crate) fn lower_super(
    scope: &mut LexicalScope,
    args: &[ArgItem],
    block: Option<&Node>,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let dest = scope.unit.regs.push()?;
    let n = gen_values(scope, args, ctx, line)?;
    let argc = if n < 0 { CALL_MAXARGS } else { n as u16 };
    if let Some(block_node) = block {
        push_block_lambda(scope, block_node, ctx, line)?;
    }
    emit(scope, ctx, Instruction::Abc { op: OpCode::Super, a: dest, b: 0, c: argc }, line);
    let extra = scope.unit.regs.cursp() - (dest + 1);
    scope.unit.regs.pop_n(extra);
    if mode == Mode::Noval {
        scope.unit.regs.pop();
    }
    Ok(())
}

/// `super` with no explicit arglist: forwards the enclosing method's own
/// parameters, recovered via `ARGARY` from its `aspec` (SPEC_FULL.md §4.5).
pub(crate) fn lower_zsuper(
    scope: &mut LexicalScope,
    block: Option<&Node>,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let aspec = scope.nearest_method_aspec();
    let ainfo = Ainfo::from_aspec(aspec);
    let dest = scope.unit.regs.push()?;
    let packed = ainfo.pack_with_dest(dest);
    emit(scope, ctx, Instruction::Ax { op: OpCode::ArgAry, ax: packed }, line);
    if let Some(block_node) = block {
        push_block_lambda(scope, block_node, ctx, line)?;
    }
    // `ARGARY` already left the forwarded arguments packed as a single
    // array at `dest`; `CALL_MAXARGS` tells `SUPER` to treat it that way.
    emit(scope, ctx, Instruction::Abc { op: OpCode::Super, a: dest, b: 0, c: CALL_MAXARGS }, line);
    let extra = scope.unit.regs.cursp() - (dest + 1);
    scope.unit.regs.pop_n(extra);
    if mode == Mode::Noval {
        scope.unit.regs.pop();
    }
    Ok(())
}

/// `yield`: recovers the enclosing method's captured block via `BLKPUSH`
/// (packed from its `ainfo`, the same derivation `ZSUPER`'s `ARGARY` uses)
/// and sends it `:call` (SPEC_FULL.md §4.1 `YIELD` row).
pub(crate) fn lower_yield(
    scope: &mut LexicalScope,
    args: &[ArgItem],
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let aspec = scope.nearest_method_aspec();
    let ainfo = Ainfo::from_aspec(aspec);
    let dest = scope.unit.regs.push()?;
    let packed = ainfo.pack_with_dest(dest);
    emit(scope, ctx, Instruction::Ax { op: OpCode::BlkPush, ax: packed }, line);
    let n = gen_values(scope, args, ctx, line)?;
    let argc = if n < 0 { CALL_MAXARGS } else { n as u16 };
    let sym = ctx.interner.intern("call");
    let sym_idx = scope.unit.symtab.new_msym(sym)?;
    emit(scope, ctx, Instruction::Abc { op: OpCode::Send, a: dest, b: sym_idx, c: argc }, line);
    let extra = scope.unit.regs.cursp() - (dest + 1);
    scope.unit.regs.pop_n(extra);
    if mode == Mode::Noval {
        scope.unit.regs.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binop_for_recognizes_all_nine_fused_operators() {
        for name in ["+", "-", "*", "/", "<", "<=", ">", ">=", "=="] {
            assert!(binop_for(name).is_some(), "{name} should be fusable");
        }
        assert!(binop_for("<=>").is_none());
    }
}
