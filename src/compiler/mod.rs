//! Code-generation core: lowers a parsed AST to register-machine IR.
//!
//! Entry point is [`generate`]; everything else in this module tree is an
//! implementation detail it drives.

pub mod aspec;
pub mod buffer;
pub mod error;
pub mod instr;
pub mod jump;
pub mod literal;
pub mod lower;
pub mod loop_stack;
pub mod opcode;
pub mod peephole;
pub mod register;
pub mod scope;
pub mod symbol;

pub use error::CodegenError;
pub use scope::{IrProcedure, LexicalScope, ScopeUnit};
pub use symbol::{Symbol, SymbolInterner};

use crate::ast::Node;

/// Caller-requested result disposition for a lowered expression: `Val`
/// leaves exactly one value on the register stack above the stack pointer
/// observed on entry; `Noval` leaves the stack pointer unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Val,
    Noval,
}

/// Compile-time configuration, mirroring the source's
/// `parser_state.no_optimize` flag plus a home for the filename used in
/// error diagnostics and debug info.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub optimize: bool,
    pub filename: Option<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            optimize: true,
            filename: None,
        }
    }
}

impl CompilerOptions {
    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// What the front-end parser hands to `generate`: the root AST and the
/// options governing this compile. The source's filename table (indexed
/// by `filename_index`) is collapsed here into a single `CompilerOptions::filename`,
/// since this crate's AST carries no multi-file `filename_index` of its
/// own (out of scope per SPEC_FULL.md §1 — heredoc/filename bookkeeping is
/// the parser's job).
#[derive(Debug, Clone)]
pub struct ParserState {
    pub root: Node,
    pub options: CompilerOptions,
}

/// Lowers `parser_state.root` to an `IrProcedure`, using `interner` for
/// symbol interning. Mirrors the source's `generate(runtime, parser_state)`
/// entry point; on any error the partially-built tree is simply dropped
/// (ordinary `Result` propagation stands in for the source's arena-release
/// long-jump, SPEC_FULL.md §9).
pub fn generate(
    interner: &mut dyn SymbolInterner,
    parser_state: &ParserState,
) -> Result<IrProcedure, CodegenError> {
    let mut ctx = lower::LowerCtx {
        interner,
        optimize: parser_state.options.optimize,
        filename: parser_state.options.filename.clone(),
    };
    let unit = ScopeUnit::new(true, ctx.filename.clone());
    let mut root = LexicalScope::root(unit);
    lower::codegen(&mut root, &parser_state.root, Mode::Val, &mut ctx)?;
    if !lower::ends_in_return(&root.unit) {
        lower::emit_implicit_return(&mut root, &mut ctx);
    }
    Ok(root.unit.finish())
}
