use crate::compiler::error::CodegenError;
use crate::compiler::instr::{Instruction, MAXARG_SBX};
use crate::compiler::opcode::OpCode;
use crate::compiler::scope::ScopeUnit;

/// Sentinel `sBx` value marking the end of a forward-jump chain.
const CHAIN_END: i32 = 0;

/// Resolves forward-reference jumps. Each unresolved jump's `sBx` field
/// holds either `0` (chain terminator) or the PC of the previous jump in
/// the same chain, forming a singly-linked list threaded through the
/// instruction stream itself — no separate bookkeeping structure is
/// needed to track "jumps still waiting for a target".
pub struct JumpPatcher;

impl JumpPatcher {
    /// Emits a placeholder jump (`sBx = 0`) and returns its PC, to be
    /// passed to `dispatch` once the target is known.
    pub fn emit_placeholder(scope: &mut ScopeUnit, op: OpCode, a: u16, line: u32) -> usize {
        scope.buffer.push(
            Instruction::AsBx {
                op,
                a,
                sbx: CHAIN_END,
            },
            line,
        )
    }

    /// Chains a new placeholder jump onto an existing list headed at
    /// `head` (or starts a new singleton list if `head` is `None`),
    /// returning the new head.
    pub fn emit_chained(
        scope: &mut ScopeUnit,
        op: OpCode,
        a: u16,
        head: Option<usize>,
        line: u32,
    ) -> usize {
        let link = head.map(|pc| (pc as i32) - (scope.buffer.pc() as i32) - 1).unwrap_or(CHAIN_END);
        scope.buffer.push(Instruction::AsBx { op, a, sbx: link }, line)
    }

    /// Patches the single jump at `pc` so it targets `target`.
    pub fn dispatch(scope: &mut ScopeUnit, pc: usize, target: usize) -> Result<(), CodegenError> {
        let instr = *scope
            .buffer
            .get(pc)
            .ok_or(CodegenError::DispatchOnNonJump { pc })?;
        let Instruction::AsBx { op, a, .. } = instr else {
            return Err(CodegenError::DispatchOnNonJump { pc });
        };
        let offset = (target as i64) - (pc as i64) - 1;
        if offset.unsigned_abs() as i32 > MAXARG_SBX {
            return Err(CodegenError::RegisterOverflow {
                limit: MAXARG_SBX as u16,
            });
        }
        scope.buffer.set(
            pc,
            Instruction::AsBx {
                op,
                a,
                sbx: offset as i32,
            },
        );
        scope.lastlabel = Some(target);
        Ok(())
    }

    /// Walks a chain (threaded in reverse-of-emission order through
    /// `sBx`) starting at `head`, patching every link to `target`.
    pub fn dispatch_linked(
        scope: &mut ScopeUnit,
        head: Option<usize>,
        target: usize,
    ) -> Result<(), CodegenError> {
        let mut cursor = head;
        while let Some(pc) = cursor {
            let instr = *scope
                .buffer
                .get(pc)
                .ok_or(CodegenError::DispatchOnNonJump { pc })?;
            let Instruction::AsBx { sbx, .. } = instr else {
                return Err(CodegenError::DispatchOnNonJump { pc });
            };
            let next = if sbx == CHAIN_END {
                None
            } else {
                Some(((pc as i64) + (sbx as i64) + 1) as usize)
            };
            Self::dispatch(scope, pc, target)?;
            cursor = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::scope::ScopeUnit;

    #[test]
    fn dispatch_resolves_forward_jump_within_bounds() {
        let mut scope = ScopeUnit::new(true, None);
        let jmp_pc = JumpPatcher::emit_placeholder(&mut scope, OpCode::Jmp, 0, 1);
        scope.buffer.push(
            Instruction::A {
                op: OpCode::LoadNil,
                a: 1,
            },
            2,
        );
        let target = scope.buffer.pc();
        JumpPatcher::dispatch(&mut scope, jmp_pc, target).unwrap();
        let Instruction::AsBx { sbx, .. } = *scope.buffer.get(jmp_pc).unwrap() else {
            panic!("expected AsBx");
        };
        assert_eq!(sbx, 0);
    }

    #[test]
    fn dispatch_linked_resolves_every_jump_in_chain() {
        let mut scope = ScopeUnit::new(true, None);
        let mut head = None;
        head = Some(JumpPatcher::emit_chained(&mut scope, OpCode::Jmp, 0, head, 1));
        head = Some(JumpPatcher::emit_chained(&mut scope, OpCode::Jmp, 0, head, 1));
        let third = JumpPatcher::emit_chained(&mut scope, OpCode::Jmp, 0, head, 1);

        let target = scope.buffer.pc() + 5;
        JumpPatcher::dispatch_linked(&mut scope, Some(third), target).unwrap();

        for pc in 0..scope.buffer.len() {
            let Instruction::AsBx { a: _, sbx, .. } = *scope.buffer.get(pc).unwrap() else {
                panic!("expected AsBx");
            };
            let resolved = (pc as i64) + (sbx as i64) + 1;
            assert_eq!(resolved as usize, target);
        }
    }
}
