//! Non-local control transfer (`return`/`next`/`break`/`redo`/`retry`,
//! SPEC_FULL.md §4.6) and compound assignment (`OP_ASGN`, SPEC_FULL.md §4.1).

use crate::ast::{AssignOperator, CallNode, Lhs, Node, NodeKind};
use crate::compiler::error::{CodegenError, ControlTransferKind};
use crate::compiler::instr::Instruction;
use crate::compiler::jump::JumpPatcher;
use crate::compiler::loop_stack::LoopKind;
use crate::compiler::opcode::{OpCode, ReturnKind};
use crate::compiler::scope::LexicalScope;
use crate::compiler::Mode;

use super::call::emit_binop;
use super::{codegen, emit, gen_assignment, LowerCtx};

fn eval_value_or_nil(
    scope: &mut LexicalScope,
    value: Option<&Node>,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<u16, CodegenError> {
    match value {
        Some(v) => {
            codegen(scope, v, Mode::Val, ctx)?;
            Ok(scope.unit.regs.cursp() - 1)
        }
        None => {
            let a = scope.unit.regs.push()?;
            emit(scope, ctx, Instruction::A { op: OpCode::LoadNil, a }, line);
            Ok(a)
        }
    }
}

/// Emits `EPOP` to unwind every `ensure` block entered since `from_level`.
fn unwind_ensures(scope: &mut LexicalScope, ctx: &mut LowerCtx, from_level: u32, line: u32) {
    let levels = scope.unit.ensure_level.saturating_sub(from_level);
    if levels > 0 {
        emit(scope, ctx, Instruction::Ab { op: OpCode::EPop, a: 0, b: levels as u16 }, line);
    }
}

fn unwind_rescues(scope: &mut LexicalScope, ctx: &mut LowerCtx, begins: u32, line: u32) {
    if begins > 0 {
        emit(scope, ctx, Instruction::Ab { op: OpCode::PopErr, a: 0, b: begins as u16 }, line);
    }
}

pub(crate) fn lower_return(
    scope: &mut LexicalScope,
    value: Option<&Node>,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let a = eval_value_or_nil(scope, value, ctx, line)?;
    let kind = if scope.unit.mscope { ReturnKind::Normal } else { ReturnKind::Return };
    emit(scope, ctx, Instruction::Abc { op: OpCode::Return, a, b: 0, c: u8::from(kind) as u16 }, line);
    Ok(())
}

pub(crate) fn lower_next(
    scope: &mut LexicalScope,
    value: Option<&Node>,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let (idx, begins) = scope
        .unit
        .loop_stack
        .nearest_breakable_with_begin_count()
        .ok_or(CodegenError::UnexpectedControlTransfer { kind: ControlTransferKind::Next })?;
    let frame = scope.unit.loop_stack.frame_at(idx).cloned().expect("index just returned is valid");

    let val_reg = eval_value_or_nil(scope, value, ctx, line)?;
    match frame.kind {
        LoopKind::Normal => {
            scope.unit.regs.pop();
            unwind_rescues(scope, ctx, begins, line);
            unwind_ensures(scope, ctx, frame.ensure_level_at_entry, line);
            let jmp = JumpPatcher::emit_placeholder(&mut scope.unit, OpCode::Jmp, 0, line);
            JumpPatcher::dispatch(&mut scope.unit, jmp, frame.pc1)?;
        }
        LoopKind::Block | LoopKind::For => {
            if val_reg != frame.acc_register {
                emit(scope, ctx, Instruction::Ab { op: OpCode::Move, a: frame.acc_register, b: val_reg }, line);
            }
            scope.unit.regs.pop();
            unwind_rescues(scope, ctx, begins, line);
            unwind_ensures(scope, ctx, frame.ensure_level_at_entry, line);
            emit(
                scope,
                ctx,
                Instruction::Abc { op: OpCode::Return, a: frame.acc_register, b: 0, c: u8::from(ReturnKind::Normal) as u16 },
                line,
            );
        }
        LoopKind::Begin | LoopKind::Rescue => unreachable!("nearest_breakable_with_begin_count skips these"),
    }
    Ok(())
}

pub(crate) fn lower_break(
    scope: &mut LexicalScope,
    value: Option<&Node>,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let (idx, begins) = scope
        .unit
        .loop_stack
        .nearest_breakable_with_begin_count()
        .ok_or(CodegenError::UnexpectedControlTransfer { kind: ControlTransferKind::Break })?;
    let frame = scope.unit.loop_stack.frame_at(idx).cloned().expect("index just returned is valid");

    let val_reg = eval_value_or_nil(scope, value, ctx, line)?;
    match frame.kind {
        LoopKind::Normal => {
            if val_reg != frame.acc_register {
                emit(scope, ctx, Instruction::Ab { op: OpCode::Move, a: frame.acc_register, b: val_reg }, line);
            }
            scope.unit.regs.pop();
            unwind_rescues(scope, ctx, begins, line);
            unwind_ensures(scope, ctx, frame.ensure_level_at_entry, line);
            let head = JumpPatcher::emit_chained(&mut scope.unit, OpCode::Jmp, 0, frame.pc3, line);
            scope.unit.loop_stack.set_pc3(idx, Some(head));
        }
        LoopKind::Block | LoopKind::For => {
            if val_reg != frame.acc_register {
                emit(scope, ctx, Instruction::Ab { op: OpCode::Move, a: frame.acc_register, b: val_reg }, line);
            }
            scope.unit.regs.pop();
            unwind_rescues(scope, ctx, begins, line);
            unwind_ensures(scope, ctx, frame.ensure_level_at_entry, line);
            emit(
                scope,
                ctx,
                Instruction::Abc { op: OpCode::Return, a: frame.acc_register, b: 0, c: u8::from(ReturnKind::Break) as u16 },
                line,
            );
        }
        LoopKind::Begin | LoopKind::Rescue => unreachable!("nearest_breakable_with_begin_count skips these"),
    }
    Ok(())
}

pub(crate) fn lower_redo(scope: &mut LexicalScope, ctx: &mut LowerCtx, line: u32) -> Result<(), CodegenError> {
    let frame = scope
        .unit
        .loop_stack
        .top()
        .cloned()
        .ok_or(CodegenError::UnexpectedControlTransfer { kind: ControlTransferKind::Redo })?;
    unwind_ensures(scope, ctx, frame.ensure_level_at_entry, line);
    let jmp = JumpPatcher::emit_placeholder(&mut scope.unit, OpCode::Jmp, 0, line);
    JumpPatcher::dispatch(&mut scope.unit, jmp, frame.pc2)?;
    Ok(())
}

pub(crate) fn lower_retry(scope: &mut LexicalScope, ctx: &mut LowerCtx, line: u32) -> Result<(), CodegenError> {
    let (idx, begins) = scope
        .unit
        .loop_stack
        .nearest_rescue_with_begin_count()
        .ok_or(CodegenError::UnexpectedControlTransfer { kind: ControlTransferKind::Retry })?;
    let frame = scope.unit.loop_stack.frame_at(idx).cloned().expect("index just returned is valid");
    unwind_rescues(scope, ctx, begins, line);
    unwind_ensures(scope, ctx, frame.ensure_level_at_entry, line);
    let jmp = JumpPatcher::emit_placeholder(&mut scope.unit, OpCode::Jmp, 0, line);
    JumpPatcher::dispatch(&mut scope.unit, jmp, frame.pc1)?;
    Ok(())
}

/// Reconstructs a read-expression for `lhs`, used by `OP_ASGN` to fetch the
/// current value before combining it with the RHS. For `Lhs::Attr` this
/// builds a getter `CALL`; the receiver is evaluated again by the setter
/// `gen_assignment` emits afterwards, which is only observable if the
/// receiver expression has side effects (SPEC_FULL.md §9, open question).
fn read_node_for_lhs(lhs: &Lhs, line: u32) -> Node {
    match lhs {
        Lhs::LVar(name) => Node::new(NodeKind::LVar(name.clone()), line, 0),
        Lhs::GVar(name) => Node::new(NodeKind::GVar(name.clone()), line, 0),
        Lhs::IVar(name) => Node::new(NodeKind::IVar(name.clone()), line, 0),
        Lhs::CVar(name) => Node::new(NodeKind::CVar(name.clone()), line, 0),
        Lhs::Const(name) => Node::new(NodeKind::Const(name.clone()), line, 0),
        Lhs::Colon2 { base, name } => Node::new(NodeKind::Colon2 { base: base.clone(), name: name.clone() }, line, 0),
        Lhs::Colon3(name) => Node::new(NodeKind::Colon3(name.clone()), line, 0),
        Lhs::Attr { recv, name, args, safe_nav } => Node::new(
            NodeKind::Call(CallNode {
                recv: Some(recv.clone()),
                name: name.clone(),
                args: args.clone(),
                block: None,
                safe_nav: *safe_nav,
            }),
            line,
            0,
        ),
        Lhs::Splat(inner) => match inner {
            Some(l) => read_node_for_lhs(l, line),
            None => Node::new(NodeKind::Nil, line, 0),
        },
    }
}

pub(crate) fn lower_op_asgn(
    scope: &mut LexicalScope,
    lhs: &Lhs,
    op: AssignOperator,
    rhs: &Node,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    match op {
        AssignOperator::Binary(bin) => lower_op_asgn_binary(scope, lhs, bin, rhs, mode, ctx, line),
        AssignOperator::LogicalOr => lower_op_asgn_short_circuit(scope, lhs, rhs, mode, ctx, line, false),
        AssignOperator::LogicalAnd => lower_op_asgn_short_circuit(scope, lhs, rhs, mode, ctx, line, true),
    }
}

fn lower_op_asgn_binary(
    scope: &mut LexicalScope,
    lhs: &Lhs,
    bin: crate::ast::BinaryOperator,
    rhs: &Node,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let read_node = read_node_for_lhs(lhs, line);
    codegen(scope, &read_node, Mode::Val, ctx)?;
    let cur_reg = scope.unit.regs.cursp() - 1;
    codegen(scope, rhs, Mode::Val, ctx)?;
    emit_binop(scope, ctx, bin, cur_reg, line);
    scope.unit.regs.pop();
    gen_assignment(scope, ctx, lhs, cur_reg, line)?;
    if mode == Mode::Noval {
        scope.unit.regs.pop();
    }
    Ok(())
}

/// `x ||= y` / `x &&= y`: reads the current value (through a one-clause
/// `ONERR`/`POPERR` guard for `Const`/`Colon2`/`Colon3`/`CVar` targets,
/// since reading an undefined one can raise — SPEC_FULL.md §4.1), tests
/// it, and only evaluates + assigns `y` when the test takes the
/// short-circuit branch.
fn lower_op_asgn_short_circuit(
    scope: &mut LexicalScope,
    lhs: &Lhs,
    rhs: &Node,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
    is_and: bool,
) -> Result<(), CodegenError> {
    let needs_guard = matches!(lhs, Lhs::Const(_) | Lhs::Colon2 { .. } | Lhs::Colon3(_) | Lhs::CVar(_));
    let read_node = read_node_for_lhs(lhs, line);

    if needs_guard {
        let onerr = JumpPatcher::emit_placeholder(&mut scope.unit, OpCode::OnErr, 0, line);
        codegen(scope, &read_node, Mode::Val, ctx)?;
        emit(scope, ctx, Instruction::Ab { op: OpCode::PopErr, a: 0, b: 1 }, line);
        let skip_handler = JumpPatcher::emit_placeholder(&mut scope.unit, OpCode::Jmp, 0, line);
        let handler = scope.unit.buffer.pc();
        JumpPatcher::dispatch(&mut scope.unit, onerr, handler)?;
        let a = scope.unit.regs.push()?;
        emit(scope, ctx, Instruction::A { op: OpCode::LoadNil, a }, line);
        let after = scope.unit.buffer.pc();
        JumpPatcher::dispatch(&mut scope.unit, skip_handler, after)?;
    } else {
        codegen(scope, &read_node, Mode::Val, ctx)?;
    }

    let cur_reg = scope.unit.regs.cursp() - 1;
    let test_op = if is_and { OpCode::JmpNot } else { OpCode::JmpIf };
    let skip_rhs = JumpPatcher::emit_placeholder(&mut scope.unit, test_op, cur_reg, line);

    codegen(scope, rhs, Mode::Val, ctx)?;
    let rhs_reg = scope.unit.regs.cursp() - 1;
    if rhs_reg != cur_reg {
        emit(scope, ctx, Instruction::Ab { op: OpCode::Move, a: cur_reg, b: rhs_reg }, line);
    }
    scope.unit.regs.pop();
    gen_assignment(scope, ctx, lhs, cur_reg, line)?;

    let end = scope.unit.buffer.pc();
    JumpPatcher::dispatch(&mut scope.unit, skip_rhs, end)?;

    if mode == Mode::Noval {
        scope.unit.regs.pop();
    }
    Ok(())
}
