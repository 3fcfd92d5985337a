//! Diagnostic reporting infrastructure.
//!
//! Diagnostics carry a source span, an optional error code, labels and
//! suggestions, and are rendered with `ariadne`.
//!
//! # Error Codes
//!
//! The effect backend owns the `E0400-E0499` range:
//!
//! - **E0400-E0409**: Registry errors (duplicate effects and operations)
//! - **E0410-E0419**: Handler clause and resumption errors
//! - **E0420-E0429**: Host boundary errors
//! - **E0430-E0439**: Codegen dependency errors
//! - **E0440-E0449**: Resolution errors in the typed input
//! - **E0450-E0459**: Backend selection errors
//! - **E0499**: Internal compiler errors

use ariadne::{Color, Config, Label, Report, ReportKind, Source};

use crate::span::Span;

/// Compiler error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // ============================================================
    // Registry (E0400-E0409)
    // ============================================================
    /// Two operations of one effect share a canonical signature.
    DuplicateOperation = 401,
    /// An effect name was registered twice.
    DuplicateEffect = 402,

    // ============================================================
    // Clauses (E0410-E0419)
    // ============================================================
    /// A captured continuation is used outside the clause that received it.
    EscapedResume = 410,
    /// A `tail` clause has a path that neither resumes nor tails.
    MissingTailResumption = 411,
    /// A `tail` operation is resumed in non-tail position.
    NonTailResumption = 412,
    /// An effectful call or perform in a context whose row does not allow it.
    EffectNotInRow = 413,
    /// `resume`/`tail` outside a handler clause.
    ResumeOutsideClause = 414,

    // ============================================================
    // Host boundary (E0420-E0429)
    // ============================================================
    /// An exported signature or host-bound operation cannot be marshaled.
    HostBoundaryPayloadViolation = 420,

    // ============================================================
    // Codegen dependencies (E0430-E0439)
    // ============================================================
    /// No provider for a required intrinsic.
    MissingCodegenDependency = 430,
    /// More than one provider for a required intrinsic.
    AmbiguousCodegenDependency = 431,

    // ============================================================
    // Resolution (E0440-E0449)
    // ============================================================
    /// Reference to an undeclared effect or operation.
    UnknownOperation = 440,
    /// Call to an undeclared function.
    UnknownFunction = 441,
    /// Reference to an unbound local.
    UnknownLocal = 442,
    /// Arity or type mismatch in the typed input.
    TypeMismatch = 443,

    // ============================================================
    // Backend selection (E0450-E0459)
    // ============================================================
    /// Stack switching was requested but cannot be used.
    StackSwitchingUnavailable = 450,

    /// Internal compiler error.
    Internal = 499,
}

impl ErrorCode {
    /// The formatted code, e.g. `"E0411"`.
    pub fn as_str(&self) -> String {
        format!("E{:04}", *self as u16)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::DuplicateOperation => "duplicate operation",
            ErrorCode::DuplicateEffect => "duplicate effect declaration",
            ErrorCode::EscapedResume => "escaped resume",
            ErrorCode::MissingTailResumption => "missing tail resumption",
            ErrorCode::NonTailResumption => "non-tail resumption of a tail operation",
            ErrorCode::EffectNotInRow => "effect not permitted by the enclosing effect row",
            ErrorCode::ResumeOutsideClause => "resumption outside a handler clause",
            ErrorCode::HostBoundaryPayloadViolation => "host boundary payload violation",
            ErrorCode::MissingCodegenDependency => "missing codegen dependency",
            ErrorCode::AmbiguousCodegenDependency => "ambiguous codegen dependency",
            ErrorCode::UnknownOperation => "unknown effect operation",
            ErrorCode::UnknownFunction => "unknown function",
            ErrorCode::UnknownLocal => "unknown local",
            ErrorCode::TypeMismatch => "type mismatch",
            ErrorCode::StackSwitchingUnavailable => "stack switching unavailable",
            ErrorCode::Internal => "internal compiler error",
        }
    }

    pub fn help(&self) -> Option<&'static str> {
        match self {
            ErrorCode::EscapedResume => {
                Some("a continuation may only be resumed inside the clause that received it")
            }
            ErrorCode::MissingTailResumption => {
                Some("end every path of a `tail` clause with `tail k(value)` or `resume k(value)`")
            }
            ErrorCode::NonTailResumption => {
                Some("declare the operation `resume` if the clause needs to continue after resuming")
            }
            ErrorCode::HostBoundaryPayloadViolation => {
                Some("host payloads may only contain unit, bool, int, float, str, bytes, and tuples of those")
            }
            ErrorCode::AmbiguousCodegenDependency => Some("keep exactly one provider for the intrinsic"),
            ErrorCode::StackSwitchingUnavailable => {
                Some("enable backend fallback or select the trampoline backend")
            }
            _ => None,
        }
    }
}

/// The kind of diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Error,
    Warning,
    Note,
    Help,
}

impl DiagnosticKind {
    fn to_report_kind(self) -> ReportKind<'static> {
        match self {
            DiagnosticKind::Error => ReportKind::Error,
            DiagnosticKind::Warning => ReportKind::Warning,
            DiagnosticKind::Note => ReportKind::Advice,
            DiagnosticKind::Help => ReportKind::Advice,
        }
    }

    fn color(self) -> Color {
        match self {
            DiagnosticKind::Error => Color::Red,
            DiagnosticKind::Warning => Color::Yellow,
            DiagnosticKind::Note => Color::Cyan,
            DiagnosticKind::Help => Color::Green,
        }
    }
}

/// A compiler diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub code: Option<ErrorCode>,
    pub message: String,
    /// The primary span where the error occurred.
    pub span: Span,
    /// Additional labels pointing to relevant code.
    pub labels: Vec<DiagnosticLabel>,
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Set the error code, adding its help message if it has one.
    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        if let Some(help) = code.help() {
            self.suggestions.push(help.to_string());
        }
        self
    }

    /// An error with the code's description as its message.
    pub fn from_error_code(code: ErrorCode, span: Span) -> Self {
        Self::error(code.description(), span).with_error_code(code)
    }

    /// An error with a code and a custom message.
    pub fn coded(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self::error(message, span).with_error_code(code)
    }

    /// Add a note to help explain the error.
    pub fn with_note(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::secondary(span, message));
        self
    }

    pub fn with_primary_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::primary(span, message));
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == DiagnosticKind::Error
    }

    /// One-line rendering: `error[E0411]: message`.
    pub fn summary(&self) -> String {
        let kind = match self.kind {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
            DiagnosticKind::Help => "help",
        };
        match self.code {
            Some(code) => format!("{}[{}]: {}", kind, code.as_str(), self.message),
            None => format!("{}: {}", kind, self.message),
        }
    }
}

/// Whether any diagnostic in `diagnostics` is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

/// A secondary label in a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticLabel {
    pub span: Span,
    pub message: String,
    pub primary: bool,
}

impl DiagnosticLabel {
    pub fn primary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: true,
        }
    }

    pub fn secondary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: false,
        }
    }
}

/// Renders diagnostics against their source text.
pub struct DiagnosticEmitter<'a> {
    filename: &'a str,
    source: &'a str,
}

impl<'a> DiagnosticEmitter<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self { filename, source }
    }

    fn report(&self, diagnostic: &Diagnostic, color: bool) -> Report<'a, (&'a str, std::ops::Range<usize>)> {
        let end = self.source.len();
        let clamp = |span: Span| span.start.min(end)..span.end.min(end).max(span.start.min(end));

        let message = match diagnostic.code {
            Some(code) => format!("[{}] {}", code.as_str(), diagnostic.message),
            None => diagnostic.message.clone(),
        };
        let mut builder = Report::build(
            diagnostic.kind.to_report_kind(),
            self.filename,
            diagnostic.span.start.min(end),
        )
        .with_config(Config::default().with_color(color))
        .with_message(message)
        .with_label(
            Label::new((self.filename, clamp(diagnostic.span)))
                .with_color(diagnostic.kind.color())
                .with_message(&diagnostic.message),
        );

        for label in &diagnostic.labels {
            let color = if label.primary { diagnostic.kind.color() } else { Color::Blue };
            builder = builder.with_label(
                Label::new((self.filename, clamp(label.span)))
                    .with_color(color)
                    .with_message(&label.message),
            );
        }

        if !diagnostic.suggestions.is_empty() {
            builder = builder.with_help(diagnostic.suggestions.join("\n"));
        }
        builder.finish()
    }

    /// Print a diagnostic to stderr.
    pub fn emit(&self, diagnostic: &Diagnostic) -> std::io::Result<()> {
        self.report(diagnostic, true)
            .eprint((self.filename, Source::from(self.source)))
    }

    /// Render a diagnostic to a string, without colors.
    pub fn render(&self, diagnostic: &Diagnostic) -> String {
        let mut out = Vec::new();
        let rendered = self
            .report(diagnostic, false)
            .write((self.filename, Source::from(self.source)), &mut out);
        match rendered {
            Ok(()) => String::from_utf8_lossy(&out).into_owned(),
            Err(_) => diagnostic.summary(),
        }
    }
}
