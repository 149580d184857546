//! Argument-list lowering (`gen_values`, SPEC_FULL.md §4.4).

use crate::ast::{ArgItem, Node, NodeKind};
use crate::compiler::error::CodegenError;
use crate::compiler::instr::Instruction;
use crate::compiler::opcode::OpCode;
use crate::compiler::scope::LexicalScope;
use crate::compiler::Mode;

use super::{codegen, emit, LowerCtx};

/// Past this many flat positional arguments, `SEND`'s 7-bit `C` field can no
/// longer hold a plain count and lowering must fold them into one array.
const FLAT_ARG_LIMIT: usize = 127;

fn arg_node(item: &ArgItem) -> &Node {
    match item {
        ArgItem::Plain(n) | ArgItem::Splat(n) | ArgItem::BlockPass(n) => n,
    }
}

/// Lowers `items` in `VAL` mode, left to right. Returns `Ok(n)` (`n < 128`)
/// when every item was pushed flat onto the register stack; returns
/// `Ok(-1)` once a splat is seen or the flat count would exceed 127, in
/// which case the arguments are folded into a single array left at
/// `cursp() - 1` instead (SPEC_FULL.md §4.4).
pub(crate) fn gen_values(
    scope: &mut LexicalScope,
    items: &[ArgItem],
    ctx: &mut LowerCtx,
    line: u32,
) -> Result<i32, CodegenError> {
    if items.is_empty() {
        return Ok(0);
    }

    // A leading splat of an array literal lowers as if the literal's
    // elements had been written inline, avoiding a double-wrap.
    if let ArgItem::Splat(inner) = &items[0] {
        if let NodeKind::Array(inner_items) = &inner.kind {
            let mut combined = inner_items.clone();
            combined.extend(items[1..].iter().cloned());
            return gen_values(scope, &combined, ctx, line);
        }
    }

    let splat_idx = items.iter().position(|it| matches!(it, ArgItem::Splat(_)));
    let flat_len = splat_idx.unwrap_or(items.len());

    if splat_idx.is_none() && flat_len <= FLAT_ARG_LIMIT {
        for item in items {
            codegen(scope, arg_node(item), Mode::Val, ctx)?;
        }
        return Ok(items.len() as i32);
    }

    let prefix_len = flat_len.min(FLAT_ARG_LIMIT);
    let dest = scope.unit.regs.push()?;
    for item in &items[..prefix_len] {
        codegen(scope, arg_node(item), Mode::Val, ctx)?;
    }
    let n = prefix_len as u16;
    let first = dest + 1;
    emit(scope, ctx, Instruction::Abc { op: OpCode::Array, a: dest, b: first, c: n }, line);
    scope.unit.regs.pop_n(n);

    for item in &items[prefix_len..] {
        match item {
            ArgItem::Splat(node) => {
                codegen(scope, node, Mode::Val, ctx)?;
                let src = scope.unit.regs.cursp() - 1;
                emit(scope, ctx, Instruction::Ab { op: OpCode::AryCat, a: dest, b: src }, line);
                scope.unit.regs.pop();
            }
            ArgItem::Plain(node) | ArgItem::BlockPass(node) => {
                codegen(scope, node, Mode::Val, ctx)?;
                let src = scope.unit.regs.cursp() - 1;
                emit(scope, ctx, Instruction::Ab { op: OpCode::AryPush, a: dest, b: src }, line);
                scope.unit.regs.pop();
            }
        }
    }
    Ok(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::scope::ScopeUnit;
    use crate::compiler::symbol::{Symbol, SymbolInterner};

    struct FakeInterner;
    impl SymbolInterner for FakeInterner {
        fn intern(&mut self, _name: &str) -> Symbol {
            Symbol(0)
        }
        fn sym2name(&self, _sym: Symbol) -> Option<String> {
            None
        }
    }

    fn int_node(v: i64) -> Node {
        Node::new(NodeKind::Int { text: v.to_string(), base: 10 }, 1, 0)
    }

    #[test]
    fn flat_args_return_count_without_building_an_array() {
        let unit = ScopeUnit::new(true, None);
        let mut scope = LexicalScope::root(unit);
        let mut interner = FakeInterner;
        let mut ctx = LowerCtx {
            interner: &mut interner,
            optimize: true,
            filename: None,
        };
        let items = vec![ArgItem::Plain(int_node(1)), ArgItem::Plain(int_node(2))];
        let n = gen_values(&mut scope, &items, &mut ctx, 1).unwrap();
        assert_eq!(n, 2);
        assert_eq!(scope.unit.regs.cursp(), 3); // self + 2 pushed args
    }

    #[test]
    fn splat_argument_triggers_array_building_mode() {
        let unit = ScopeUnit::new(true, None);
        let mut scope = LexicalScope::root(unit);
        let mut interner = FakeInterner;
        let mut ctx = LowerCtx {
            interner: &mut interner,
            optimize: true,
            filename: None,
        };
        let items = vec![
            ArgItem::Plain(int_node(1)),
            ArgItem::Splat(int_node(2)),
        ];
        let n = gen_values(&mut scope, &items, &mut ctx, 1).unwrap();
        assert_eq!(n, -1);
        assert_eq!(scope.unit.regs.cursp(), 2); // self + the single array reg
    }
}
