use crate::compiler::aspec::Aspec;
use crate::compiler::buffer::InstructionBuffer;
use crate::compiler::instr::Instruction;
use crate::compiler::literal::{Literal, LiteralPool};
use crate::compiler::loop_stack::LoopStack;
use crate::compiler::register::RegisterStack;
use crate::compiler::symbol::{Symbol, SymbolTable};

/// The compiled output of one `ScopeUnit`: instructions, parallel debug
/// line table, literal pool, both symbol windows, nested sub-procedures,
/// and the register/local bookkeeping the runtime needs to allocate a
/// frame. Child procedures only reference their parent implicitly, via
/// `reps` ownership — there is no back-pointer once compilation finishes.
#[derive(Debug, Clone)]
pub struct IrProcedure {
    pub iseq: Vec<Instruction>,
    pub lines: Vec<u32>,
    pub pool: Vec<Literal>,
    pub method_syms: Vec<Symbol>,
    pub general_syms: Vec<Symbol>,
    pub reps: Vec<IrProcedure>,
    pub locals: Vec<String>,
    pub nlocals: u16,
    pub nregs: u16,
    pub aspec: Aspec,
    pub mscope: bool,
    pub filename: Option<String>,
}

/// Compilation context producing exactly one `IrProcedure`. Owns an
/// `InstructionBuffer`, `LiteralPool`, `SymbolTable`, `RegisterStack`, the
/// local-variable list, and completed child units; `lastlabel`/`ensure_level`
/// and the loop stack drive the peephole gate and unwinding lowering.
#[derive(Debug, Clone)]
pub struct ScopeUnit {
    pub buffer: InstructionBuffer,
    pub pool: LiteralPool,
    pub symtab: SymbolTable,
    pub regs: RegisterStack,
    pub locals: Vec<String>,
    pub children: Vec<IrProcedure>,
    pub loop_stack: LoopStack,
    pub ensure_level: u32,
    /// PC of the most recent jump-resolution target; peephole only fires
    /// when the buffer's current pc differs from this.
    pub lastlabel: Option<usize>,
    /// `true` for method scopes (as opposed to blocks), used by `ZSUPER`
    /// and `YIELD` to find the enclosing method's `ainfo`.
    pub mscope: bool,
    pub aspec: Aspec,
    pub filename: Option<String>,
}

impl ScopeUnit {
    pub fn new(mscope: bool, filename: Option<String>) -> Self {
        let mut regs = RegisterStack::new();
        // r0 is always `self`.
        let _ = regs.push();
        ScopeUnit {
            buffer: InstructionBuffer::new(),
            pool: LiteralPool::new(),
            symtab: SymbolTable::new(),
            regs,
            locals: Vec::new(),
            children: Vec::new(),
            loop_stack: LoopStack::new(),
            ensure_level: 0,
            lastlabel: None,
            mscope,
            aspec: Aspec::new(),
            filename,
        }
    }

    /// Declares a new local variable, reserving its register (locals occupy
    /// registers `1..=nlocals`, since `r0` is `self`).
    pub fn declare_local(&mut self, name: &str) -> u16 {
        if let Some(reg) = self.local_register(name) {
            return reg;
        }
        self.locals.push(name.to_owned());
        self.regs.push_n(1).expect("local register allocation");
        self.locals.len() as u16
    }

    /// Register of a local already declared in *this* scope, if any.
    pub fn local_register(&self, name: &str) -> Option<u16> {
        self.locals
            .iter()
            .position(|n| n == name)
            .map(|idx| (idx + 1) as u16)
    }

    /// `scope_finish`: shrinks bookkeeping to exact size and produces the
    /// `IrProcedure`, consuming this unit. Called once per scope, at the
    /// end of its body.
    pub fn finish(self) -> IrProcedure {
        let (iseq, lines) = self.buffer.into_parts();
        IrProcedure {
            iseq,
            lines,
            pool: self.pool.into_entries(),
            method_syms: self.symtab.method_syms().to_vec(),
            general_syms: self.symtab.general_syms().to_vec(),
            reps: self.children,
            locals: self.locals.clone(),
            nlocals: self.locals.len() as u16,
            nregs: self.regs.nregs(),
            aspec: self.aspec,
            mscope: self.mscope,
            filename: self.filename,
        }
    }
}

/// Borrowed lexical-parent chain used to resolve upvars at compile time.
/// A borrowed reference rather than an owning link: child scopes never
/// outlive their parents during a single compile, so there is no need for
/// `Rc`/arena bookkeeping here (SPEC_FULL.md §9, "Upvar capture").
pub struct LexicalScope<'p> {
    pub unit: ScopeUnit,
    pub parent: Option<&'p LexicalScope<'p>>,
}

impl<'p> LexicalScope<'p> {
    pub fn root(unit: ScopeUnit) -> Self {
        LexicalScope { unit, parent: None }
    }

    pub fn child(unit: ScopeUnit, parent: &'p LexicalScope<'p>) -> Self {
        LexicalScope {
            unit,
            parent: Some(parent),
        }
    }

    /// Resolves `name` to `(register, depth)` where `depth` is the number
    /// of lexical levels walked (`0` means a plain local in the current
    /// scope, handled by `MOVE` rather than `GETUPVAR`). Returns `None` if
    /// the name isn't declared anywhere in the chain.
    pub fn resolve(&self, name: &str) -> Option<(u16, u16)> {
        if let Some(reg) = self.unit.local_register(name) {
            return Some((reg, 0));
        }
        let mut depth = 1u16;
        let mut scope = self.parent;
        while let Some(s) = scope {
            if let Some(reg) = s.unit.local_register(name) {
                return Some((reg, depth));
            }
            depth += 1;
            scope = s.parent;
        }
        None
    }

    /// Walks up to the nearest enclosing method scope (`mscope == true`),
    /// used by `ZSUPER`/`YIELD` to find the `ainfo` governing the call.
    pub fn nearest_method_aspec(&self) -> Aspec {
        if self.unit.mscope {
            return self.unit.aspec;
        }
        let mut scope = self.parent;
        while let Some(s) = scope {
            if s.unit.mscope {
                return s.unit.aspec;
            }
            scope = s.parent;
        }
        self.unit.aspec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_local_in_current_scope_at_depth_zero() {
        let mut unit = ScopeUnit::new(true, None);
        unit.declare_local("x");
        let scope = LexicalScope::root(unit);
        assert_eq!(scope.resolve("x"), Some((1, 0)));
    }

    #[test]
    fn resolves_upvar_through_parent_chain() {
        let mut parent_unit = ScopeUnit::new(true, None);
        parent_unit.declare_local("x");
        let parent = LexicalScope::root(parent_unit);

        let child_unit = ScopeUnit::new(false, None);
        let child = LexicalScope::child(child_unit, &parent);

        assert_eq!(child.resolve("x"), Some((1, 1)));
        assert_eq!(child.resolve("missing"), None);
    }

    #[test]
    fn locals_occupy_registers_after_self() {
        let mut unit = ScopeUnit::new(true, None);
        let r1 = unit.declare_local("a");
        let r2 = unit.declare_local("b");
        assert_eq!(r1, 1);
        assert_eq!(r2, 2);
        assert_eq!(unit.regs.nregs(), 3);
    }
}
