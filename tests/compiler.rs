//! End-to-end lowering scenarios (SPEC_FULL.md §8): build small ASTs by
//! hand (standing in for the external parser) and check the resulting
//! `IrProcedure`'s instruction stream and bookkeeping.

use indoc::indoc;
use rubyc_core::ast::{
    ArgItem, AssignOperator, BinaryOperator, CallNode, Lhs, MasgnRhs, MasgnTargets, Node, NodeKind,
    ParamList, RescueClause, WhenClause,
};
use rubyc_core::compiler::opcode::OpCode;
use rubyc_core::compiler::{CompilerOptions, ParserState, Symbol};
use rubyc_core::{generate, IrProcedure, SymbolInterner};

struct FakeInterner {
    names: Vec<String>,
}

impl FakeInterner {
    fn new() -> Self {
        FakeInterner { names: Vec::new() }
    }
}

impl SymbolInterner for FakeInterner {
    fn intern(&mut self, name: &str) -> Symbol {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return Symbol(idx as u32);
        }
        self.names.push(name.to_owned());
        Symbol((self.names.len() - 1) as u32)
    }

    fn sym2name(&self, sym: Symbol) -> Option<String> {
        self.names.get(sym.0 as usize).cloned()
    }
}

fn n(kind: NodeKind) -> Node {
    Node::new(kind, 1, 0)
}

fn compile(root: Node) -> IrProcedure {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut interner = FakeInterner::new();
    let parser_state = ParserState {
        root,
        options: CompilerOptions::default().with_filename("test.rb"),
    };
    generate(&mut interner, &parser_state).expect("lowering should succeed")
}

fn ops(proc_: &IrProcedure) -> Vec<OpCode> {
    proc_.iseq.iter().map(|i| i.opcode()).collect()
}

/// `def add(a, b); a + b; end` — the body fuses into `ADD` rather than a
/// generic `SEND`, and the method itself lowers to a `METHOD` entry in the
/// top-level procedure.
#[test]
fn method_with_fused_binop_body() {
    let params = ParamList {
        required: vec!["a".into(), "b".into()],
        ..ParamList::empty()
    };
    let body = n(NodeKind::Call(CallNode {
        recv: Some(Box::new(n(NodeKind::LVar("a".into())))),
        name: "+".into(),
        args: vec![ArgItem::Plain(n(NodeKind::LVar("b".into())))],
        block: None,
        safe_nav: false,
    }));
    let def = n(NodeKind::Def {
        name: "add".into(),
        params,
        body: Box::new(body),
    });
    let proc_ = compile(n(NodeKind::Begin(vec![def])));
    assert_eq!(proc_.reps.len(), 1);
    let method = &proc_.reps[0];
    assert!(ops(method).contains(&OpCode::Add));
    assert!(!ops(method).contains(&OpCode::Send));
}

/// `[1, *rest, 3]` forces the array-building path (`AryCat`/`AryPush`)
/// rather than the flat-count fast path, since a splat is present.
#[test]
fn array_literal_with_splat_builds_incrementally() {
    let items = vec![
        ArgItem::Plain(n(NodeKind::Int { text: "1".into(), base: 10 })),
        ArgItem::Splat(n(NodeKind::LVar("rest".into()))),
        ArgItem::Plain(n(NodeKind::Int { text: "3".into(), base: 10 })),
    ];
    let asgn = n(NodeKind::Asgn {
        lhs: Box::new(Lhs::LVar("rest".into())),
        rhs: Box::new(n(NodeKind::Array(vec![]))),
    });
    let array_expr = n(NodeKind::Array(items));
    let proc_ = compile(n(NodeKind::Begin(vec![asgn, array_expr])));
    assert!(ops(&proc_).contains(&OpCode::AryCat) || ops(&proc_).contains(&OpCode::AryPush));
}

/// `a, *b, c = 1, 2, 3, 4` (fixed-array RHS): each element lowers directly,
/// no runtime `AREF`/`APOST` needed since the RHS shape is known statically.
#[test]
fn masgn_with_fixed_array_rhs_skips_runtime_split() {
    let lhs = MasgnTargets {
        pre: vec![Lhs::LVar("a".into())],
        rest: Some(Some(Lhs::LVar("b".into()))),
        post: vec![Lhs::LVar("c".into())],
    };
    let rhs = MasgnRhs::FixedArray(vec![
        n(NodeKind::Int { text: "1".into(), base: 10 }),
        n(NodeKind::Int { text: "2".into(), base: 10 }),
        n(NodeKind::Int { text: "3".into(), base: 10 }),
        n(NodeKind::Int { text: "4".into(), base: 10 }),
    ]);
    let masgn = n(NodeKind::Masgn { lhs, rhs });
    let proc_ = compile(masgn);
    assert!(!ops(&proc_).contains(&OpCode::Aref));
    assert!(!ops(&proc_).contains(&OpCode::Apost));
    assert!(ops(&proc_).contains(&OpCode::Array));
}

/// `a, *b = expr` (variable RHS): must split the runtime array via
/// `AREF`/`APOST`.
#[test]
fn masgn_with_variable_rhs_uses_aref_and_apost() {
    let lhs = MasgnTargets {
        pre: vec![Lhs::LVar("a".into())],
        rest: Some(Some(Lhs::LVar("b".into()))),
        post: vec![],
    };
    let rhs = MasgnRhs::Variable(Box::new(n(NodeKind::LVar("expr".into()))));
    let outer = n(NodeKind::Begin(vec![
        n(NodeKind::Asgn {
            lhs: Box::new(Lhs::LVar("expr".into())),
            rhs: Box::new(n(NodeKind::Array(vec![]))),
        }),
        n(NodeKind::Masgn { lhs, rhs }),
    ]));
    let proc_ = compile(outer);
    assert!(ops(&proc_).contains(&OpCode::Aref));
    assert!(ops(&proc_).contains(&OpCode::Apost));
}

/// `for x in items; x; end` desugars to `items.each { |x| x }`: a `Lambda`
/// plus a `SendB` of `:each`, with an `Enter` at the top of the block body.
#[test]
fn for_loop_desugars_to_each_with_block() {
    let vars = MasgnTargets { pre: vec![Lhs::LVar("x".into())], rest: None, post: vec![] };
    let iter = n(NodeKind::LVar("items".into()));
    let body = n(NodeKind::LVar("x".into()));
    let for_node = n(NodeKind::For { vars, iter: Box::new(iter), body: Box::new(body) });
    let outer = n(NodeKind::Begin(vec![
        n(NodeKind::Asgn {
            lhs: Box::new(Lhs::LVar("items".into())),
            rhs: Box::new(n(NodeKind::Array(vec![]))),
        }),
        for_node,
    ]));
    let proc_ = compile(outer);
    assert!(ops(&proc_).contains(&OpCode::Lambda));
    assert!(ops(&proc_).contains(&OpCode::SendB));
    assert_eq!(proc_.reps.len(), 1);
    assert_eq!(proc_.reps[0].iseq[0].opcode(), OpCode::Enter);
}

/// `while cond; break val; end` threads the break value into the loop's
/// shared accumulator register before jumping past the loop.
#[test]
fn while_loop_with_break_value() {
    let cond = n(NodeKind::True);
    let body = n(NodeKind::Break(Some(Box::new(n(NodeKind::Int { text: "7".into(), base: 10 })))));
    let while_node = n(NodeKind::While { cond: Box::new(cond), body: Box::new(body), negate: false });
    let proc_ = compile(while_node);
    assert!(ops(&proc_).contains(&OpCode::Jmp));
}

/// `begin; risky; rescue TypeError => e; handle; rescue => e; other; end`:
/// two handler clauses, each testing its own class list, with `retry`
/// support wired through the `ONERR` frame.
#[test]
fn rescue_with_two_handlers_and_retry() {
    let body = n(NodeKind::Call(CallNode {
        recv: None,
        name: "risky".into(),
        args: vec![],
        block: None,
        safe_nav: false,
    }));
    let handler1 = RescueClause {
        classes: vec![ArgItem::Plain(n(NodeKind::Const("TypeError".into())))],
        exc_var: Some(Lhs::LVar("e".into())),
        body: n(NodeKind::Retry),
    };
    let handler2 = RescueClause {
        classes: vec![],
        exc_var: Some(Lhs::LVar("e".into())),
        body: n(NodeKind::Call(CallNode {
            recv: None,
            name: "other".into(),
            args: vec![],
            block: None,
            safe_nav: false,
        })),
    };
    let rescue_node = n(NodeKind::Rescue {
        body: Box::new(body),
        handlers: vec![handler1, handler2],
        else_branch: None,
    });
    let proc_ = compile(rescue_node);
    assert!(ops(&proc_).contains(&OpCode::OnErr));
    assert!(ops(&proc_).contains(&OpCode::Rescue));
    assert!(ops(&proc_).contains(&OpCode::PopErr));
    // Bare last handler never matched on class, no reraise needed.
    let raise_count = ops(&proc_).iter().filter(|&&op| op == OpCode::Raise).count();
    assert_eq!(raise_count, 0);
}

/// `begin; risky; rescue => e; handled; end` with no `else`: a single bare
/// handler always matches, so there's no runtime class test at all.
#[test]
fn bare_rescue_clause_has_no_class_test() {
    let body = n(NodeKind::Call(CallNode {
        recv: None,
        name: "risky".into(),
        args: vec![],
        block: None,
        safe_nav: false,
    }));
    let handler = RescueClause {
        classes: vec![],
        exc_var: Some(Lhs::LVar("e".into())),
        body: n(NodeKind::LVar("e".into())),
    };
    let rescue_node = n(NodeKind::Rescue {
        body: Box::new(body),
        handlers: vec![handler],
        else_branch: None,
    });
    let proc_ = compile(rescue_node);
    assert!(!ops(&proc_).contains(&OpCode::Rescue));
    assert!(ops(&proc_).contains(&OpCode::OnErr));
}

/// `@x ||= 1`: the short-circuit `OP_ASGN` path against an instance
/// variable, which never raises on read, so no `ONERR` guard is needed
/// (that guard is reserved for `Const`/`Colon2`/`Colon3`/`CVar` targets).
#[test]
fn ivar_or_asgn_skips_onerr_guard() {
    let op_asgn = n(NodeKind::OpAsgn {
        lhs: Box::new(Lhs::IVar("x".into())),
        op: AssignOperator::LogicalOr,
        rhs: Box::new(n(NodeKind::Int { text: "1".into(), base: 10 })),
    });
    let proc_ = compile(op_asgn);
    assert!(!ops(&proc_).contains(&OpCode::OnErr));
    assert!(ops(&proc_).contains(&OpCode::GetIv));
    assert!(ops(&proc_).contains(&OpCode::SetIv));
}

/// `FOO ||= 1`: the `Const` target does need the guard, since reading an
/// undefined constant can raise.
#[test]
fn const_or_asgn_uses_onerr_guard() {
    let op_asgn = n(NodeKind::OpAsgn {
        lhs: Box::new(Lhs::Const("FOO".into())),
        op: AssignOperator::LogicalOr,
        rhs: Box::new(n(NodeKind::Int { text: "1".into(), base: 10 })),
    });
    let proc_ = compile(op_asgn);
    assert!(ops(&proc_).contains(&OpCode::OnErr));
}

/// `x += 1` compound assignment fuses into `ADD` just like a normal binop
/// call would.
#[test]
fn op_asgn_binary_fuses_add() {
    let outer = n(NodeKind::Begin(vec![
        n(NodeKind::Asgn {
            lhs: Box::new(Lhs::LVar("x".into())),
            rhs: Box::new(n(NodeKind::Int { text: "0".into(), base: 10 })),
        }),
        n(NodeKind::OpAsgn {
            lhs: Box::new(Lhs::LVar("x".into())),
            op: AssignOperator::Binary(BinaryOperator::Add),
            rhs: Box::new(n(NodeKind::Int { text: "1".into(), base: 10 })),
        }),
    ]));
    let proc_ = compile(outer);
    assert!(ops(&proc_).contains(&OpCode::Add));
}

/// `def run; yield 1; end` lowers `yield` as `BLKPUSH` (recovering the
/// captured block from the method's own `aspec`) plus a `SEND` of `:call`.
#[test]
fn yield_lowers_via_blkpush_and_send() {
    let body = n(NodeKind::Yield {
        args: vec![ArgItem::Plain(n(NodeKind::Int { text: "1".into(), base: 10 }))],
    });
    let def = n(NodeKind::Def {
        name: "run".into(),
        params: ParamList::empty(),
        body: Box::new(body),
    });
    let proc_ = compile(def);
    let method = &proc_.reps[0];
    assert!(ops(method).contains(&OpCode::BlkPush));
    assert!(ops(method).contains(&OpCode::Send));
}

/// `def initialize; super; end` with no arglist recovers the forwarded
/// arguments via `ARGARY` off the method's own `aspec`.
#[test]
fn zsuper_uses_argary() {
    let params = ParamList { required: vec!["a".into()], ..ParamList::empty() };
    let def = n(NodeKind::Def {
        name: "initialize".into(),
        params,
        body: Box::new(n(NodeKind::ZSuper { block: None })),
    });
    let proc_ = compile(def);
    let method = &proc_.reps[0];
    assert!(ops(method).contains(&OpCode::ArgAry));
    assert!(ops(method).contains(&OpCode::Super));
}

/// `case x; when 1, 2 then :a; when 3 then :b; else :c; end` compiles
/// every `when` pattern as an `===`-style comparison against the subject.
#[test]
fn case_with_multiple_patterns_per_when() {
    let subject = n(NodeKind::LVar("x".into()));
    let when1 = WhenClause {
        patterns: vec![
            ArgItem::Plain(n(NodeKind::Int { text: "1".into(), base: 10 })),
            ArgItem::Plain(n(NodeKind::Int { text: "2".into(), base: 10 })),
        ],
        body: n(NodeKind::Symbols(vec![n(NodeKind::Str("a".into()))])),
    };
    let when2 = WhenClause {
        patterns: vec![ArgItem::Plain(n(NodeKind::Int { text: "3".into(), base: 10 }))],
        body: n(NodeKind::Symbols(vec![n(NodeKind::Str("b".into()))])),
    };
    let case_node = n(NodeKind::Case {
        subject: Some(Box::new(subject)),
        whens: vec![when1, when2],
        else_branch: Some(Box::new(n(NodeKind::Symbols(vec![n(NodeKind::Str("c".into()))])))),
    });
    let outer = n(NodeKind::Begin(vec![
        n(NodeKind::Asgn {
            lhs: Box::new(Lhs::LVar("x".into())),
            rhs: Box::new(n(NodeKind::Int { text: "1".into(), base: 10 })),
        }),
        case_node,
    ]));
    let proc_ = compile(outer);
    assert!(proc_.nregs > 0);
}

/// `1.upto(3) { |i| i }` compiles the block literal into a child procedure
/// referenced by `LAMBDA`, sent as part of a `SENDB`.
#[test]
fn call_with_block_literal_emits_sendb_and_lambda() {
    let block = n(NodeKind::BlockLit {
        params: ParamList { required: vec!["i".into()], ..ParamList::empty() },
        body: Box::new(n(NodeKind::LVar("i".into()))),
    });
    let call = n(NodeKind::Call(CallNode {
        recv: Some(Box::new(n(NodeKind::Int { text: "1".into(), base: 10 }))),
        name: "upto".into(),
        args: vec![ArgItem::Plain(n(NodeKind::Int { text: "3".into(), base: 10 }))],
        block: Some(Box::new(block)),
        safe_nav: false,
    }));
    let proc_ = compile(call);
    assert!(ops(&proc_).contains(&OpCode::SendB));
    assert!(ops(&proc_).contains(&OpCode::Lambda));
    assert_eq!(proc_.reps.len(), 1);
}

/// `recv&.foo` only runs the call when the receiver isn't falsy.
#[test]
fn safe_navigation_guards_the_call() {
    let call = n(NodeKind::Call(CallNode {
        recv: Some(Box::new(n(NodeKind::Nil))),
        name: "foo".into(),
        args: vec![],
        block: None,
        safe_nav: true,
    }));
    let proc_ = compile(call);
    assert!(ops(&proc_).contains(&OpCode::JmpNot));
    assert!(ops(&proc_).contains(&OpCode::Send));
}

/// Sanity check against the method-symbol table cap (SPEC_FULL.md §3, §8
/// boundary): 256 distinct call-sites compile, a 257th doesn't.
#[test]
fn method_symbol_table_boundary_surfaces_as_codegen_error() {
    let calls: Vec<Node> = (0..257)
        .map(|i| {
            n(NodeKind::Call(CallNode {
                recv: None,
                name: format!("m{i}"),
                args: vec![],
                block: None,
                safe_nav: false,
            }))
        })
        .collect();
    let root = n(NodeKind::Begin(calls));
    let mut interner = FakeInterner::new();
    let parser_state = ParserState {
        root,
        options: CompilerOptions::default(),
    };
    let result = generate(&mut interner, &parser_state);
    assert!(result.is_err());
}

#[test]
fn doc_example_fibonacci_like_method_compiles() {
    // Mirrors the kind of small, realistic method this crate expects to
    // lower (not executed — there is no VM here, only codegen):
    let _ruby_source = indoc! {"
        def fib(n)
          return n if n < 2
          fib(n - 1) + fib(n - 2)
        end
    "};
    let params = ParamList { required: vec!["n".into()], ..ParamList::empty() };
    let guard = n(NodeKind::If {
        cond: Box::new(n(NodeKind::Call(CallNode {
            recv: Some(Box::new(n(NodeKind::LVar("n".into())))),
            name: "<".into(),
            args: vec![ArgItem::Plain(n(NodeKind::Int { text: "2".into(), base: 10 }))],
            block: None,
            safe_nav: false,
        }))),
        then_branch: Box::new(n(NodeKind::Return(Some(Box::new(n(NodeKind::LVar("n".into()))))))),
        else_branch: None,
    });
    let recurse = |delta: &str| {
        n(NodeKind::Call(CallNode {
            recv: None,
            name: "fib".into(),
            args: vec![ArgItem::Plain(n(NodeKind::Call(CallNode {
                recv: Some(Box::new(n(NodeKind::LVar("n".into())))),
                name: "-".into(),
                args: vec![ArgItem::Plain(n(NodeKind::Int { text: delta.into(), base: 10 }))],
                block: None,
                safe_nav: false,
            })))],
            block: None,
            safe_nav: false,
        }))
    };
    let sum = n(NodeKind::Call(CallNode {
        recv: Some(Box::new(recurse("1"))),
        name: "+".into(),
        args: vec![ArgItem::Plain(recurse("2"))],
        block: None,
        safe_nav: false,
    }));
    let body = n(NodeKind::Begin(vec![guard, sum]));
    let def = n(NodeKind::Def { name: "fib".into(), params, body: Box::new(body) });
    let proc_ = compile(def);
    let method = &proc_.reps[0];
    assert!(ops(method).contains(&OpCode::Return));
    assert!(ops(method).contains(&OpCode::Lt));
    assert!(ops(method).contains(&OpCode::Sub));
}

/// `/foo#{bar}/i` (SPEC_FULL.md §4.1 `REGX`/`DREGX` row) materializes as
/// `Regexp.compile(pattern, flags)`: a `GETCONST` for the receiver, the
/// interpolated pattern concatenated via `STRCAT`, and a `SEND :compile`.
#[test]
fn interpolated_regex_literal_calls_regexp_compile() {
    let node = n(NodeKind::Regx {
        parts: vec![n(NodeKind::Str("foo".into())), n(NodeKind::LVar("bar".into()))],
        flags: Some("i".into()),
    });
    let proc_ = compile(n(NodeKind::Begin(vec![
        n(NodeKind::Asgn {
            lhs: Box::new(Lhs::LVar("bar".into())),
            rhs: Box::new(n(NodeKind::Str("x".into()))),
        }),
        node,
    ])));
    assert!(ops(&proc_).contains(&OpCode::GetConst));
    assert!(ops(&proc_).contains(&OpCode::StrCat));
    assert!(ops(&proc_).contains(&OpCode::Send));
}

/// `:foo` (SPEC_FULL.md §3 `LOADSYM`) lowers directly to a single
/// `LOADSYM`, with no `ADD`/`SEND` scaffolding the way `%i[...]` needs.
#[test]
fn bare_symbol_literal_emits_loadsym() {
    let proc_ = compile(n(NodeKind::Sym("foo".into())));
    assert_eq!(ops(&proc_), vec![OpCode::LoadSym, OpCode::Return]);
}

/// `x = (if flag; 5; end)` — `VAL`-mode `IF` with no `else` (SPEC_FULL.md
/// §4.1): the `then` branch must `JMP` past the synthesized `nil` arm, and
/// both arms must write the *same* register, so the assigned value is `5`
/// when `flag` is true and `nil` when it's false, never the reverse.
#[test]
fn if_without_else_in_val_mode_shares_the_then_branch_register() {
    let cond = n(NodeKind::Call(CallNode {
        recv: None,
        name: "flag".into(),
        args: vec![],
        block: None,
        safe_nav: false,
    }));
    let if_node = n(NodeKind::If {
        cond: Box::new(cond),
        then_branch: Box::new(n(NodeKind::Int { text: "5".into(), base: 10 })),
        else_branch: None,
    });
    let asgn = n(NodeKind::Asgn {
        lhs: Box::new(Lhs::LVar("x".into())),
        rhs: Box::new(if_node),
    });
    let proc_ = compile(asgn);

    // The `then` arm must jump past the `nil` arm instead of falling
    // through into it.
    assert!(ops(&proc_).contains(&OpCode::Jmp));

    let load_i = proc_
        .iseq
        .iter()
        .find(|i| i.opcode() == OpCode::LoadI)
        .expect("then branch lowers `5` via LOADI");
    let load_nil = proc_
        .iseq
        .iter()
        .find(|i| i.opcode() == OpCode::LoadNil)
        .expect("else-less arm synthesizes a LOADNIL");
    assert_eq!(
        load_i.a(),
        load_nil.a(),
        "then-branch value and synthesized nil must land in the same register"
    );
}

/// `a + 1` (SPEC_FULL.md §8 concrete scenario 4 / peephole rule 15): the
/// `LOADI` feeding the fused binop's *implicit* second operand (at
/// `a_reg + 1`) must fold into `ADDI`, not stay a separate `LOADI` + `ADD`.
#[test]
fn small_integer_addend_fuses_into_addi() {
    let call = n(NodeKind::Call(CallNode {
        recv: Some(Box::new(n(NodeKind::LVar("a".into())))),
        name: "+".into(),
        args: vec![ArgItem::Plain(n(NodeKind::Int { text: "1".into(), base: 10 }))],
        block: None,
        safe_nav: false,
    }));
    let outer = n(NodeKind::Begin(vec![
        n(NodeKind::Asgn {
            lhs: Box::new(Lhs::LVar("a".into())),
            rhs: Box::new(n(NodeKind::Int { text: "0".into(), base: 10 })),
        }),
        call,
    ]));
    let proc_ = compile(outer);
    assert!(ops(&proc_).contains(&OpCode::AddI));
    assert!(!ops(&proc_).contains(&OpCode::Add));
}
