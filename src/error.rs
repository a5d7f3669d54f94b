// Nova Error Handling Module
// Runtime failures surface as language-level exception instances; this module
// holds the host-facing mirror of those exceptions with stack traces

use colored::Colorize;
use std::fmt;

/// Language exception kinds. Every variant maps to a runtime exception class;
/// `Runtime` is the root `Exception` class itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Runtime,
    Type,
    Name,
    Field,
    Method,
    Import,
    StackOverflow,
    IndexOutOfBound,
    Assert,
    InvalidArg,
    NotImplemented,
    Syntax,
    Interrupt,
}

impl ErrorKind {
    /// The runtime class implementing this kind.
    pub fn class_name(self) -> &'static str {
        match self {
            ErrorKind::Runtime => "Exception",
            ErrorKind::Type => "TypeException",
            ErrorKind::Name => "NameException",
            ErrorKind::Field => "FieldException",
            ErrorKind::Method => "MethodException",
            ErrorKind::Import => "ImportException",
            ErrorKind::StackOverflow => "StackOverflowException",
            ErrorKind::IndexOutOfBound => "IndexOutOfBoundException",
            ErrorKind::Assert => "AssertException",
            ErrorKind::InvalidArg => "InvalidArgException",
            ErrorKind::NotImplemented => "NotImplementedException",
            ErrorKind::Syntax => "SyntaxException",
            ErrorKind::Interrupt => "ProgramInterrupt",
        }
    }

    pub fn from_class_name(name: &str) -> Option<ErrorKind> {
        Some(match name {
            "Exception" => ErrorKind::Runtime,
            "TypeException" => ErrorKind::Type,
            "NameException" => ErrorKind::Name,
            "FieldException" => ErrorKind::Field,
            "MethodException" => ErrorKind::Method,
            "ImportException" => ErrorKind::Import,
            "StackOverflowException" => ErrorKind::StackOverflow,
            "IndexOutOfBoundException" => ErrorKind::IndexOutOfBound,
            "AssertException" => ErrorKind::Assert,
            "InvalidArgException" => ErrorKind::InvalidArg,
            "NotImplementedException" => ErrorKind::NotImplemented,
            "SyntaxException" => ErrorKind::Syntax,
            "ProgramInterrupt" => ErrorKind::Interrupt,
            _ => return None,
        })
    }

    pub const ALL: [ErrorKind; 13] = [
        ErrorKind::Runtime,
        ErrorKind::Type,
        ErrorKind::Name,
        ErrorKind::Field,
        ErrorKind::Method,
        ErrorKind::Import,
        ErrorKind::StackOverflow,
        ErrorKind::IndexOutOfBound,
        ErrorKind::Assert,
        ErrorKind::InvalidArg,
        ErrorKind::NotImplemented,
        ErrorKind::Syntax,
        ErrorKind::Interrupt,
    ];
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class_name())
    }
}

/// One record of an unwound call frame, innermost first.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub module: String,
    pub function: String,
    pub line: u32,
    pub depth: usize,
}

impl StackFrame {
    pub fn new(
        module: impl Into<String>,
        function: impl Into<String>,
        line: u32,
        depth: usize,
    ) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            line,
            depth,
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "    [line {}] {}.{}()",
            self.line, self.module, self.function
        )
    }
}

/// Callback invoked for user-visible failures: (kind, module, line, message).
pub type ErrorCallback = Box<dyn FnMut(ErrorKind, &str, u32, &str)>;

/// Host-facing error, materialized from an unhandled runtime exception.
#[derive(Debug, Clone)]
pub struct NovaError {
    pub kind: ErrorKind,
    pub message: String,
    pub module: String,
    pub line: u32,
    pub stack_trace: Vec<StackFrame>,
}

impl NovaError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        module: impl Into<String>,
        line: u32,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            module: module.into(),
            line,
            stack_trace: Vec::new(),
        }
    }

    pub fn with_stack_trace(mut self, trace: Vec<StackFrame>) -> Self {
        self.stack_trace = trace;
        self
    }

    /// Format the error for display:
    /// `File <module> [line N]: <Kind>: <msg>` followed by the stack trace.
    pub fn format(&self) -> String {
        let mut output = String::new();

        let header = format!(
            "File {} [line {}]: {}: {}",
            self.module,
            self.line,
            self.kind.to_string().red().bold(),
            self.message.white().bold()
        );
        output.push_str(&header);
        output.push('\n');

        if !self.stack_trace.is_empty() {
            output.push_str(&format!("{}:\n", "Stack trace".yellow().bold()));
            for frame in &self.stack_trace {
                output.push_str(&format!("{}\n", frame));
            }
        }

        output
    }
}

impl fmt::Display for NovaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl std::error::Error for NovaError {}

/// Result type for Nova host operations.
pub type NovaResult<T> = Result<T, NovaError>;
