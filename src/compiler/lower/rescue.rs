//! `begin`/`rescue`/`else` lowering (SPEC_FULL.md §4.4).
//!
//! One `ONERR` pushes a single exception-handler entry that the runtime
//! jumps to on any raise inside the guarded body. On the success path it's
//! popped by a single `POPERR`; on the failure path, each rescue clause's
//! class test runs in turn and the matching (or, on no match, re-raising)
//! handler pops its own copy before running. `retry` re-enters at the
//! `ONERR` itself via an outer `Rescue`-kind `loop_stack` frame, kept alive
//! for the whole construct. While lowering the guarded body (where the
//! registration is genuinely still live), an inner `Begin` frame is also
//! pushed so `break`/`next` passing through from an enclosing loop counts
//! it via `nearest_breakable_with_begin_count`; it's popped again before
//! handler bodies are lowered, since each handler's own `POPERR` already
//! removed the registration by then — `retry`'s `begins` count must come
//! out to zero from inside a handler, not double-pop (`loop_stack.rs`'s
//! `nearest_rescue_with_begin_count`).

use crate::ast::{Lhs, Node, RescueClause};
use crate::compiler::error::CodegenError;
use crate::compiler::instr::Instruction;
use crate::compiler::jump::JumpPatcher;
use crate::compiler::loop_stack::{LoopFrame, LoopKind};
use crate::compiler::opcode::OpCode;
use crate::compiler::scope::LexicalScope;
use crate::compiler::Mode;

use super::{codegen, emit, gen_assignment, LowerCtx};

/// `GETSPECIAL` slot for the exception currently being handled, the sibling
/// of `call.rs`'s `SPECIAL_BLOCK` slot.
const SPECIAL_EXC: u16 = 1;

fn store_result(scope: &mut LexicalScope, ctx: &mut LowerCtx, dest: Option<u16>, line: u32) {
    if let Some(dest) = dest {
        let v = scope.unit.regs.cursp() - 1;
        if v != dest {
            emit(scope, ctx, Instruction::Ab { op: OpCode::Move, a: dest, b: v }, line);
        }
        scope.unit.regs.pop();
    }
}

pub(crate) fn lower_rescue(
    scope: &mut LexicalScope,
    body: &Node,
    handlers: &[RescueClause],
    else_branch: Option<&Node>,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    let result_reg = if mode == Mode::Val { Some(scope.unit.regs.push()?) } else { None };
    let body_mode = if result_reg.is_some() { Mode::Val } else { Mode::Noval };

    let onerr = JumpPatcher::emit_placeholder(&mut scope.unit, OpCode::OnErr, 0, line);

    scope.unit.loop_stack.push(LoopFrame {
        kind: LoopKind::Rescue,
        pc1: onerr,
        pc2: onerr,
        pc3: None,
        acc_register: result_reg.unwrap_or(0),
        ensure_level_at_entry: scope.unit.ensure_level,
    });
    let begin_level = scope.unit.buffer.pc();
    scope.unit.loop_stack.push(LoopFrame {
        kind: LoopKind::Begin,
        pc1: begin_level,
        pc2: begin_level,
        pc3: None,
        acc_register: result_reg.unwrap_or(0),
        ensure_level_at_entry: scope.unit.ensure_level,
    });

    codegen(scope, body, body_mode, ctx)?;
    store_result(scope, ctx, result_reg, line);
    if let Some(else_node) = else_branch {
        codegen(scope, else_node, body_mode, ctx)?;
        store_result(scope, ctx, result_reg, line);
    }
    emit(scope, ctx, Instruction::Ab { op: OpCode::PopErr, a: 0, b: 1 }, line);
    let skip_handlers = JumpPatcher::emit_placeholder(&mut scope.unit, OpCode::Jmp, 0, line);

    // The guarded body's `ONERR` registration is now popped (success path,
    // just above); only the `Rescue` frame stays live while lowering
    // handler bodies below, since each handler pops its own copy of the
    // registration itself right before running (`retry`'s `begins` count
    // must come out to zero while inside a handler, not double-pop).
    scope.unit.loop_stack.pop();

    let mut end_chain: Option<usize> = None;
    let mut next_clause_patch: Option<usize> = None;
    let mut last_no_match: Option<usize> = None;
    let handler_entry = scope.unit.buffer.pc();
    JumpPatcher::dispatch(&mut scope.unit, onerr, handler_entry)?;

    let exc_reg = scope.unit.regs.push()?;
    emit(scope, ctx, Instruction::Ab { op: OpCode::GetSpecial, a: exc_reg, b: SPECIAL_EXC }, line);

    for (i, clause) in handlers.iter().enumerate() {
        if let Some(p) = next_clause_patch.take() {
            let here = scope.unit.buffer.pc();
            JumpPatcher::dispatch(&mut scope.unit, p, here)?;
        }
        let is_last = i + 1 == handlers.len();

        let mut match_chain: Option<usize> = None;
        let classes: &[crate::ast::ArgItem] = &clause.classes;
        for class_item in classes {
            let class_node = match class_item {
                crate::ast::ArgItem::Plain(n) | crate::ast::ArgItem::Splat(n) | crate::ast::ArgItem::BlockPass(n) => n,
            };
            codegen(scope, class_node, Mode::Val, ctx)?;
            let class_reg = scope.unit.regs.cursp() - 1;
            let test_reg = scope.unit.regs.push()?;
            emit(scope, ctx, Instruction::Abc { op: OpCode::Rescue, a: test_reg, b: exc_reg, c: class_reg }, line);
            scope.unit.regs.pop_n(2);
            let jmp = JumpPatcher::emit_chained(&mut scope.unit, OpCode::JmpIf, test_reg, match_chain, line);
            match_chain = Some(jmp);
        }
        // An empty class list means a bare `rescue` clause, matching
        // `StandardError` unconditionally: fall straight through into the
        // body without any test.
        if !classes.is_empty() {
            let no_match = JumpPatcher::emit_placeholder(&mut scope.unit, OpCode::Jmp, 0, line);
            let body_label = scope.unit.buffer.pc();
            JumpPatcher::dispatch_linked(&mut scope.unit, match_chain, body_label)?;
            if is_last {
                last_no_match = Some(no_match);
            } else {
                next_clause_patch = Some(no_match);
            }
        }

        emit(scope, ctx, Instruction::Ab { op: OpCode::PopErr, a: 0, b: 1 }, line);
        if let Some(exc_var) = &clause.exc_var {
            gen_assignment(scope, ctx, exc_var, exc_reg, line)?;
        }
        codegen(scope, &clause.body, body_mode, ctx)?;
        store_result(scope, ctx, result_reg, line);

        if !is_last {
            let j = JumpPatcher::emit_chained(&mut scope.unit, OpCode::Jmp, 0, end_chain, line);
            end_chain = Some(j);
        }
        // The last clause falls straight through to `end` with no `Jmp`.
    }
    if handlers.is_empty() || last_no_match.is_some() {
        if let Some(p) = last_no_match {
            let reraise = scope.unit.buffer.pc();
            JumpPatcher::dispatch(&mut scope.unit, p, reraise)?;
        }
        emit(scope, ctx, Instruction::Ab { op: OpCode::Raise, a: exc_reg, b: 0 }, line);
    }
    scope.unit.regs.pop();

    let end = scope.unit.buffer.pc();
    JumpPatcher::dispatch(&mut scope.unit, skip_handlers, end)?;
    JumpPatcher::dispatch_linked(&mut scope.unit, end_chain, end)?;

    scope.unit.loop_stack.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeKind;
    use crate::compiler::scope::ScopeUnit;
    use crate::compiler::symbol::{Symbol, SymbolInterner};

    struct NoopInterner;
    impl SymbolInterner for NoopInterner {
        fn intern(&mut self, _name: &str) -> Symbol {
            Symbol(0)
        }
        fn sym2name(&self, _sym: Symbol) -> Option<String> {
            None
        }
    }

    #[test]
    fn bare_rescue_with_no_handlers_reraises() {
        let unit = ScopeUnit::new(true, None);
        let mut scope = LexicalScope::root(unit);
        let mut interner = NoopInterner;
        let mut ctx = LowerCtx { interner: &mut interner, optimize: false, filename: None };
        let body = Node::new(NodeKind::Nil, 1, 0);
        let result = lower_rescue(&mut scope, &body, &[], None, Mode::Noval, &mut ctx, 1);
        assert!(result.is_ok());
        assert!(scope.unit.buffer.iter().any(|i| matches!(i, Instruction::Ab { op: OpCode::Raise, .. })));
    }
}
