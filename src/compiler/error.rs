use thiserror::Error;

/// The three error kinds from SPEC_FULL.md §7, expressed as a flat enum
/// rather than nested kind structs: the source has no structured error
/// object at all, so there is no existing shape to preserve beyond the
/// kind grouping itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("codegen error: register stack exhausted (limit {limit})")]
    RegisterOverflow { limit: u16 },

    #[error("codegen error: method symbol table is full (max 256 entries)")]
    MethodSymbolTableFull,

    #[error("codegen error: literal pool allocation failed")]
    PoolAllocFailed,

    #[error("codegen error: {kind} used without an enclosing construct")]
    UnexpectedControlTransfer { kind: ControlTransferKind },

    #[error("codegen error: unknown assignment target")]
    UnknownAssignmentTarget,

    #[error("codegen error: malformed integer literal {text:?}")]
    MalformedIntegerLiteral { text: String },

    #[error("codegen error: malformed float literal {text:?}")]
    MalformedFloatLiteral { text: String },

    #[error("codegen error: dispatch invoked on non-jump instruction at pc {pc}")]
    DispatchOnNonJump { pc: usize },

    #[error("codegen error: malformed instruction word {word:#010x}")]
    MalformedInstructionWord { word: u32 },
}

impl CodegenError {
    /// Renders the §6 wire diagnostic `codegen error:<file>:<line>: <msg>`
    /// when location information is available, degrading to the bare
    /// `Display` text otherwise.
    pub fn diagnostic(&self, filename: Option<&str>, line: Option<u32>) -> String {
        match (filename, line) {
            (Some(file), Some(line)) => {
                format!("codegen error:{file}:{line}: {}", self.message())
            }
            _ => self.to_string(),
        }
    }

    /// The error text without the `codegen error: ` prefix, for embedding
    /// into the file:line wire format without doubling the prefix.
    fn message(&self) -> String {
        self.to_string()
            .strip_prefix("codegen error: ")
            .map(str::to_owned)
            .unwrap_or_else(|| self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTransferKind {
    Next,
    Break,
    Redo,
    Retry,
}

impl std::fmt::Display for ControlTransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlTransferKind::Next => "next",
            ControlTransferKind::Break => "break",
            ControlTransferKind::Redo => "redo",
            ControlTransferKind::Retry => "retry",
        };
        write!(f, "{s}")
    }
}
