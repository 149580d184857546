use crate::compiler::instr::Instruction;
use crate::compiler::opcode::OpCode;
use crate::compiler::scope::ScopeUnit;
use log::debug;

/// The outcome of a peephole rule match.
enum PeepResult {
    /// Replace the previous instruction in place; the new instruction is
    /// not appended.
    RewritePrev(Instruction),
    /// Drop the new instruction, leave the previous one untouched.
    ElideNew,
    /// Drop both the previous and the new instruction.
    ElideBoth,
}

/// Whether `reg` lives in the temp region (`reg >= nlocals + 1`, since
/// register 0 is `self` and `1..=nlocals` are named locals). Several rules
/// only fire on temp registers because rewriting a named local's home
/// register could change what a later `GETUPVAR`/debugger sees.
fn is_temp(scope: &ScopeUnit, reg: u16) -> bool {
    reg as usize > scope.locals.len()
}

/// Emits `instr` onto `scope`'s buffer, consulting the peephole optimizer
/// first when `optimize` is set. Returns the PC the caller should treat as
/// "the instruction I just emitted" (which may be an earlier PC if a rule
/// rewrote the previous instruction instead of appending).
pub fn emit(scope: &mut ScopeUnit, optimize: bool, instr: Instruction, line: u32) -> usize {
    // Rule 1: `MOVE a,a` is always a no-op, independent of context.
    if let Instruction::Ab {
        op: OpCode::Move,
        a,
        b,
    } = instr
    {
        if a == b {
            debug!("peephole: eliding MOVE {a},{a}");
            return scope.buffer.pc().saturating_sub(1);
        }
    }

    let pc = scope.buffer.pc();
    let gated = optimize && pc > 0 && scope.lastlabel != Some(pc);
    if gated {
        if let Some(&prev) = scope.buffer.last() {
            if let Some(result) = try_peep(scope, prev, instr) {
                return apply(scope, result, line);
            }
        }
    }
    scope.buffer.push(instr, line)
}

fn apply(scope: &mut ScopeUnit, result: PeepResult, line: u32) -> usize {
    match result {
        PeepResult::RewritePrev(mut rewritten) => {
            let mut pc = scope.buffer.pc() - 1;
            scope.buffer.set(pc, rewritten);
            // Rules 4 and 14 ask for recursion so further folding can
            // cascade; bounded to avoid runaway chains on pathological
            // input.
            for _ in 0..8 {
                if pc == 0 {
                    break;
                }
                let Some(&earlier) = scope.buffer.get(pc - 1) else {
                    break;
                };
                match try_peep(scope, earlier, rewritten) {
                    Some(PeepResult::RewritePrev(next)) => {
                        scope.buffer.set(pc - 1, next);
                        scope.buffer.pop();
                        pc -= 1;
                        rewritten = next;
                    }
                    _ => break,
                }
            }
            pc
        }
        PeepResult::ElideNew => scope.buffer.pc().saturating_sub(1),
        PeepResult::ElideBoth => {
            scope.buffer.pop();
            let _ = line;
            scope.buffer.pc().saturating_sub(1)
        }
    }
}

/// The closed 17-rule ruleset (SPEC_FULL.md §4.5), matched on the pair of
/// (previous, candidate) instructions.
fn try_peep(scope: &ScopeUnit, prev: Instruction, new: Instruction) -> Option<PeepResult> {
    use Instruction::*;
    use OpCode::*;

    match (prev, new) {
        // 2: MOVE a,b after MOVE a,x (same dest) -> overwrite prior.
        (
            Ab { op: Move, a: pa, .. },
            Ab { op: Move, a: na, b: nb },
        ) if pa == na => Some(PeepResult::RewritePrev(Ab {
            op: Move,
            a: na,
            b: nb,
        })),

        // 3: MOVE a,b after MOVE b,a (swap to no-op) -> elide both.
        (
            Ab { op: Move, a: pa, b: pb },
            Ab { op: Move, a: na, b: nb },
        ) if pa == nb && pb == na => Some(PeepResult::ElideBoth),

        // 4: MOVE a,b after MOVE b,c with b in temp region -> MOVE a,c.
        (
            Ab { op: Move, a: pa, b: pb },
            Ab { op: Move, a: na, b: nb },
        ) if nb == pa && is_temp(scope, pa) => Some(PeepResult::RewritePrev(Ab {
            op: Move,
            a: na,
            b: pb,
        })),

        // 5: MOVE a,b after LOADI b,k in temp region -> LOADI a,k.
        (ABx { op: LoadI, a: pa, bx }, Ab { op: Move, a: na, b: nb })
            if nb == pa && is_temp(scope, pa) =>
        {
            Some(PeepResult::RewritePrev(ABx {
                op: LoadI,
                a: na,
                bx,
            }))
        }

        // 6: MOVE a,b after ARRAY/HASH/RANGE/AREF/GETUPVAR b,... in temp
        // region -> rewrite destination to a.
        (Abc { op, a: pa, b: pb, c: pc }, Ab { op: Move, a: na, b: nb })
            if nb == pa
                && is_temp(scope, pa)
                && matches!(op, Array | Hash | Range | Aref) =>
        {
            Some(PeepResult::RewritePrev(Abc {
                op,
                a: na,
                b: pb,
                c: pc,
            }))
        }
        (ABx { op: GetUpvar, a: pa, bx }, Ab { op: Move, a: na, b: nb })
            if nb == pa && is_temp(scope, pa) =>
        {
            Some(PeepResult::RewritePrev(ABx {
                op: GetUpvar,
                a: na,
                bx,
            }))
        }

        // 7: MOVE a,b after LOADSYM/GETGLOBAL/GETIV/GETCV/GETCONST/
        // GETSPECIAL/LOADL/STRING b,x -> same substitution.
        (ABx { op, a: pa, bx }, Ab { op: Move, a: na, b: nb })
            if nb == pa
                && matches!(
                    op,
                    LoadSym | GetMcnst | LoadL | StringLit
                ) =>
        {
            Some(PeepResult::RewritePrev(ABx { op, a: na, bx }))
        }
        (Ab { op, a: pa, b: pb }, Ab { op: Move, a: na, b: nb })
            if nb == pa
                && matches!(
                    op,
                    GetGlobal | GetIv | GetCv | GetConst | GetSpecial
                ) =>
        {
            Some(PeepResult::RewritePrev(Ab { op, a: na, b: pb }))
        }

        // 8: same pattern for SCLASS and nullary loads.
        (A { op, a: pa }, Ab { op: Move, a: na, b: nb })
            if nb == pa && matches!(op, LoadNil | LoadT | LoadF | LoadSelf | OClass) =>
        {
            Some(PeepResult::RewritePrev(A { op, a: na }))
        }

        // 9: SETIV/CV/CONST/MCNST/GLOBAL a,k after MOVE a,b -> SETxx b,k.
        (Ab { op: Move, a: pa, b: pb }, Ab { op, a: na, b: nb })
            if pa == na
                && matches!(
                    op,
                    SetIv | SetCv | SetConst | SetMcnst | SetGlobal
                ) =>
        {
            Some(PeepResult::RewritePrev(Ab { op, a: pb, b: nb }))
        }

        // 10: SETUPVAR a,b,c after MOVE a,x -> SETUPVAR x,b,c.
        (Ab { op: Move, a: pa, b: pb }, ABx { op: SetUpvar, a: na, bx })
            if pa == na =>
        {
            Some(PeepResult::RewritePrev(ABx {
                op: SetUpvar,
                a: pb,
                bx,
            }))
        }

        // 11: EPOP m after EPOP n -> EPOP m+n. Same for POPERR.
        (Ab { op: EPop, a: pa, b: pb }, Ab { op: EPop, a: na, b: nb }) if pa == na => {
            Some(PeepResult::RewritePrev(Ab {
                op: EPop,
                a: pa,
                b: pb + nb,
            }))
        }
        (Ab { op: PopErr, a: pa, b: pb }, Ab { op: PopErr, a: na, b: nb }) if pa == na => {
            Some(PeepResult::RewritePrev(Ab {
                op: PopErr,
                a: pa,
                b: pb + nb,
            }))
        }

        // 12: RETURN after RETURN -> elide second.
        (Abc { op: Return, .. }, Abc { op: Return, .. }) => Some(PeepResult::ElideNew),

        // 13: RETURN a after MOVE a,b (b in temp) -> RETURN b.
        (Ab { op: Move, a: pa, b: pb }, Abc { op: Return, a: na, c: nc, .. })
            if pa == na && is_temp(scope, pb) =>
        {
            Some(PeepResult::RewritePrev(Abc {
                op: Return,
                a: pb,
                b: 0,
                c: nc,
            }))
        }

        // 14: RETURN a after any SETxx -> fold the store's source
        // register into the RETURN.
        (Ab { op: set_op, a: pa, b: pb }, Abc { op: Return, a: na, c: nc, .. })
            if pa == na
                && matches!(
                    set_op,
                    SetIv | SetCv | SetConst | SetMcnst | SetGlobal
                ) =>
        {
            Some(PeepResult::RewritePrev(Abc {
                op: Return,
                a: pb,
                b: 0,
                c: nc,
            }))
        }

        // 15: ADD/SUB ra, idx, 1 after LOADI tmp, k (|k| <= 127) -> ADDI/SUBI.
        // The fused binop's second operand is implicit at `na + 1` (see
        // `emit_binop`, which always emits `b: 0, c: 0`), not `c` itself.
        (ABx { op: LoadI, a: pa, bx }, Abc { op, a: na, b: nb, c: .. })
            if pa == na + 1
                && is_temp(scope, pa)
                && matches!(op, Add | Sub)
                && (bx as i32) <= 127 =>
        {
            let folded = if op == Add { AddI } else { SubI };
            let k = if op == Add { bx } else { (-(bx as i32)) as u16 };
            Some(PeepResult::RewritePrev(Abc {
                op: folded,
                a: na,
                b: nb,
                c: k,
            }))
        }

        // 16: STRCAT a,b after STRING b,"" -> elide. After LOADNIL b -> elide.
        (ABx { op: StringLit, a: pa, .. }, Ab { op: StrCat, a: na, b: nb })
            if nb == pa =>
        {
            Some(PeepResult::ElideBoth)
        }
        (A { op: LoadNil, a: pa }, Ab { op: StrCat, a: na, b: nb }) if nb == pa => {
            Some(PeepResult::ElideBoth)
        }

        // 17: JMPIF/JMPNOT a,off after MOVE a,b -> test register b directly.
        (Ab { op: Move, a: pa, b: pb }, AsBx { op, a: na, sbx })
            if pa == na && matches!(op, JmpIf | JmpNot) =>
        {
            Some(PeepResult::RewritePrev(AsBx { op, a: pb, sbx }))
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::opcode::OpCode;
    use crate::compiler::scope::ScopeUnit;

    #[test]
    fn rule1_elides_move_to_self() {
        let mut scope = ScopeUnit::new(true, None);
        emit(
            &mut scope,
            true,
            Instruction::Ab {
                op: OpCode::Move,
                a: 3,
                b: 3,
            },
            1,
        );
        assert_eq!(scope.buffer.len(), 0);
    }

    #[test]
    fn rule5_folds_loadi_then_move_in_temp_region() {
        let mut scope = ScopeUnit::new(true, None);
        scope.declare_local("x"); // locals occupy register 1, temp starts at 2
        emit(
            &mut scope,
            true,
            Instruction::ABx {
                op: OpCode::LoadI,
                a: 2,
                bx: 42,
            },
            1,
        );
        emit(
            &mut scope,
            true,
            Instruction::Ab {
                op: OpCode::Move,
                a: 1,
                b: 2,
            },
            1,
        );
        assert_eq!(scope.buffer.len(), 1);
        assert_eq!(
            *scope.buffer.get(0).unwrap(),
            Instruction::ABx {
                op: OpCode::LoadI,
                a: 1,
                bx: 42,
            }
        );
    }

    #[test]
    fn rule15_folds_loadi_into_addi_at_binop_implicit_operand() {
        let mut scope = ScopeUnit::new(true, None);
        scope.declare_local("x"); // locals occupy register 1, temp starts at 2
        // receiver copy lands at reg 2; `emit_binop` always emits its
        // implicit second operand at `a + 1`, so the LOADI feeding `+ 1`
        // sits at reg 3, not in the binop's unused `C` field.
        emit(
            &mut scope,
            true,
            Instruction::ABx {
                op: OpCode::LoadI,
                a: 3,
                bx: 1,
            },
            1,
        );
        emit(
            &mut scope,
            true,
            Instruction::Abc {
                op: OpCode::Add,
                a: 2,
                b: 0,
                c: 0,
            },
            1,
        );
        assert_eq!(scope.buffer.len(), 1);
        assert_eq!(
            *scope.buffer.get(0).unwrap(),
            Instruction::Abc {
                op: OpCode::AddI,
                a: 2,
                b: 0,
                c: 1,
            }
        );
    }

    #[test]
    fn lastlabel_gate_blocks_rewrite_across_jump_target() {
        let mut scope = ScopeUnit::new(true, None);
        scope.declare_local("x");
        emit(
            &mut scope,
            true,
            Instruction::ABx {
                op: OpCode::LoadI,
                a: 2,
                bx: 42,
            },
            1,
        );
        scope.lastlabel = Some(scope.buffer.pc());
        emit(
            &mut scope,
            true,
            Instruction::Ab {
                op: OpCode::Move,
                a: 1,
                b: 2,
            },
            1,
        );
        assert_eq!(scope.buffer.len(), 2);
    }

    #[test]
    fn disabling_optimize_never_produces_fewer_instructions() {
        let mut enabled = ScopeUnit::new(true, None);
        enabled.declare_local("x");
        let mut disabled = ScopeUnit::new(true, None);
        disabled.declare_local("x");

        let seq = [
            Instruction::ABx {
                op: OpCode::LoadI,
                a: 2,
                bx: 42,
            },
            Instruction::Ab {
                op: OpCode::Move,
                a: 1,
                b: 2,
            },
        ];
        for instr in seq {
            emit(&mut enabled, true, instr, 1);
        }
        for instr in seq {
            emit(&mut disabled, false, instr, 1);
        }
        assert!(disabled.buffer.len() >= enabled.buffer.len());
    }
}
