// File: src/errors.rs
//
// Error reporting for the Vesper programming language.
// The pipeline stages hand structured errors to a `Reporter`; the
// terminal implementation pretty-prints them with source excerpts,
// the collecting implementation backs tests and the REPL.

use crate::lexer::Token;
use crate::source::{SourceMap, Span};
use colored::Colorize;
use std::cell::RefCell;
use std::rc::Rc;

/// One line of a runtime stack trace, innermost frame first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function: String,
    /// Zero-based source line of the active instruction.
    pub line: u32,
}

/// The error sink the whole pipeline reports through. The core never
/// formats terminal output itself.
pub trait Reporter {
    fn scanner_error(&mut self, map: &SourceMap, span: Span, message: &str);
    fn parser_error(&mut self, map: &SourceMap, token: &Token, message: &str);
    fn compiler_error(&mut self, map: &SourceMap, span: Span, message: &str);
    /// Fatal VM errors: stack overflow, corrupted bytecode.
    fn vm_error(&mut self, message: &str);
    fn uncaught_exception(&mut self, message: &str, trace: &[TraceFrame]);
}

/// Renders to stderr in the usual compiler style: colored kind, a
/// `-->` location line, the offending source line with a caret.
#[derive(Debug, Default)]
pub struct TerminalReporter {
    pub errors: usize,
}

impl TerminalReporter {
    pub fn new() -> Self {
        TerminalReporter::default()
    }

    pub fn had_error(&self) -> bool {
        self.errors > 0
    }

    fn print_at(&mut self, map: &SourceMap, span: Span, kind: &str, message: &str) {
        self.errors += 1;
        let line = map.line_of(span.start);
        let column = span.start.saturating_sub(
            map.line_starts.get(line).copied().unwrap_or(0),
        );

        eprintln!("{}: {}", kind.red().bold(), message.bold());
        let location = format!("  --> {}:{}:{}", map.filename, line + 1, column + 1);
        eprintln!("{}", location.bright_blue());

        let text = map.line_text(line);
        if !text.trim().is_empty() {
            eprintln!("   {}", "|".bright_blue());
            eprintln!("{} {} {}", format!("{:3}", line + 1).bright_blue(), "|".bright_blue(), text);
            eprintln!(
                "   {} {}{}",
                "|".bright_blue(),
                " ".repeat(column),
                "^".red().bold()
            );
        }
    }
}

impl Reporter for TerminalReporter {
    fn scanner_error(&mut self, map: &SourceMap, span: Span, message: &str) {
        self.print_at(map, span, "Syntax Error", message);
    }

    fn parser_error(&mut self, map: &SourceMap, token: &Token, message: &str) {
        self.print_at(map, token.span, "Parse Error", message);
    }

    fn compiler_error(&mut self, map: &SourceMap, span: Span, message: &str) {
        self.print_at(map, span, "Compile Error", message);
    }

    fn vm_error(&mut self, message: &str) {
        self.errors += 1;
        eprintln!("{}: {}", "Fatal Error".red().bold(), message.bold());
    }

    fn uncaught_exception(&mut self, message: &str, trace: &[TraceFrame]) {
        self.errors += 1;
        eprintln!("{}: {}", "Uncaught Exception".red().bold(), message.bold());
        for frame in trace {
            let name = if frame.function.is_empty() { "<anonymous>" } else { &frame.function };
            eprintln!("  {} {} (line {})", "at".bright_blue(), name, frame.line + 1);
        }
    }
}

/// Accumulates plain-text messages; used by unit tests and by the REPL
/// to decide whether a line is complete. Clones share the same buffer,
/// so a test can keep a handle while the VM owns a boxed copy.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    messages: Rc<RefCell<Vec<String>>>,
    traces: Rc<RefCell<Vec<Vec<TraceFrame>>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        CollectingReporter::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }

    pub fn traces(&self) -> Vec<Vec<TraceFrame>> {
        self.traces.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.borrow().is_empty()
    }

    pub fn any_contains(&self, needle: &str) -> bool {
        self.messages.borrow().iter().any(|m| m.contains(needle))
    }
}

impl Reporter for CollectingReporter {
    fn scanner_error(&mut self, _map: &SourceMap, _span: Span, message: &str) {
        self.messages.borrow_mut().push(format!("scanner: {}", message));
    }

    fn parser_error(&mut self, _map: &SourceMap, _token: &Token, message: &str) {
        self.messages.borrow_mut().push(format!("parser: {}", message));
    }

    fn compiler_error(&mut self, _map: &SourceMap, _span: Span, message: &str) {
        self.messages.borrow_mut().push(format!("compiler: {}", message));
    }

    fn vm_error(&mut self, message: &str) {
        self.messages.borrow_mut().push(format!("vm: {}", message));
    }

    fn uncaught_exception(&mut self, message: &str, trace: &[TraceFrame]) {
        self.messages.borrow_mut().push(format!("uncaught: {}", message));
        self.traces.borrow_mut().push(trace.to_vec());
    }
}
