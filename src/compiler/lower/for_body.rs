//! `for`-loop lowering (SPEC_FULL.md §4.7): desugars to `iter.each` with a
//! block whose body destructures the yielded value into the loop variables.

use crate::ast::{Lhs, MasgnTargets, Node};
use crate::compiler::error::CodegenError;
use crate::compiler::instr::Instruction;
use crate::compiler::jump::JumpPatcher;
use crate::compiler::loop_stack::{LoopFrame, LoopKind};
use crate::compiler::opcode::OpCode;
use crate::compiler::scope::{LexicalScope, ScopeUnit};
use crate::compiler::Mode;

use super::{codegen, emit, emit_implicit_return, ends_in_return, gen_assignment, LowerCtx};

/// Bit pattern mruby's `for`-loop compiler emits verbatim for its implicit
/// block's `ENTER`: a single required argument that auto-splats into the
/// declared parameter registers when the yielded value is itself an array
/// (SPEC_FULL.md §4.7, `aspec.rs`'s `for_loop_enter_literal_fits_ax_field`).
const FOR_ENTER: u32 = 0x40000;

/// Reserves the register a loop variable's yielded value lands in. `LVar`
/// targets get it for free via `declare_local` (matching how
/// `compile_method_body` handles required parameters — no separate
/// assignment instruction needed, since the calling convention places the
/// value there directly); every other `Lhs` kind still needs a register
/// reserved to keep the arity consistent, followed by an explicit store.
fn declare_loop_var(unit: &mut ScopeUnit, lhs: &Lhs) -> Result<u16, CodegenError> {
    match lhs {
        Lhs::LVar(name) => Ok(unit.declare_local(name)),
        _ => unit.regs.push(),
    }
}

fn assign_loop_vars(child: &mut LexicalScope, ctx: &mut LowerCtx, vars: &MasgnTargets, line: u32) -> Result<(), CodegenError> {
    for target in &vars.pre {
        let reg = declare_loop_var(&mut child.unit, target)?;
        if !matches!(target, Lhs::LVar(_)) {
            gen_assignment(child, ctx, target, reg, line)?;
        }
    }
    if let Some(rest_opt) = &vars.rest {
        match rest_opt {
            Some(rest_lhs) => {
                let reg = declare_loop_var(&mut child.unit, rest_lhs)?;
                if !matches!(rest_lhs, Lhs::LVar(_)) {
                    gen_assignment(child, ctx, rest_lhs, reg, line)?;
                }
            }
            None => {
                // Bare `*` rest target: reserve the register, discard it.
                child.unit.regs.push()?;
            }
        }
    }
    for target in &vars.post {
        let reg = declare_loop_var(&mut child.unit, target)?;
        if !matches!(target, Lhs::LVar(_)) {
            gen_assignment(child, ctx, target, reg, line)?;
        }
    }
    Ok(())
}

pub(crate) fn lower_for(
    scope: &mut LexicalScope,
    vars: &MasgnTargets,
    iter: &Node,
    body: &Node,
    mode: Mode,
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<(), CodegenError> {
    codegen(scope, iter, Mode::Val, ctx)?;
    let iter_reg = scope.unit.regs.cursp() - 1;

    let mut unit = ScopeUnit::new(false, ctx.filename.clone());
    unit.buffer.push(Instruction::Ax { op: OpCode::Enter, ax: FOR_ENTER }, line);

    let child_idx = {
        let mut child = LexicalScope::child(unit, scope);
        assign_loop_vars(&mut child, ctx, vars, line)?;

        let body_label = child.unit.buffer.pc();
        child.unit.loop_stack.push(LoopFrame {
            kind: LoopKind::For,
            pc1: body_label,
            pc2: body_label,
            pc3: None,
            acc_register: child.unit.regs.cursp(),
            ensure_level_at_entry: child.unit.ensure_level,
        });
        codegen(&mut child, body, Mode::Noval, ctx)?;
        let frame = child.unit.loop_stack.pop().expect("frame pushed above");
        if let Some(head) = frame.pc3 {
            let end = child.unit.buffer.pc();
            JumpPatcher::dispatch_linked(&mut child.unit, Some(head), end)?;
        }
        if !ends_in_return(&child.unit) {
            emit_implicit_return(&mut child, ctx);
        }
        let proc = child.unit.finish();
        scope.unit.children.push(proc);
        (scope.unit.children.len() - 1) as u16
    };

    let block_dest = scope.unit.regs.push()?;
    emit(scope, ctx, Instruction::ABx { op: OpCode::Lambda, a: block_dest, bx: child_idx }, line);
    let sym = ctx.interner.intern("each");
    let sym_idx = scope.unit.symtab.new_msym(sym)?;
    emit(scope, ctx, Instruction::Abc { op: OpCode::SendB, a: iter_reg, b: sym_idx, c: 0 }, line);
    scope.unit.regs.pop();
    if mode == Mode::Noval {
        scope.unit.regs.pop();
    }
    Ok(())
}
