// File: src/repl.rs
//
// Interactive REPL for the Vesper programming language.
// Lines accumulate while the parser only fails at end-of-input, so
// multi-line constructs can be typed naturally. All lines share one
// heap, VM, and module, so globals persist across entries.

use crate::compiler::Compiler;
use crate::errors::TerminalReporter;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::source::SourceMap;
use crate::vm::Vm;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tracing::debug;

pub struct Repl {
    editor: DefaultEditor,
    vm: Vm,
}

impl Repl {
    pub fn new() -> rustyline::Result<Self> {
        let mut vm = Vm::new();
        vm.set_base_dir(std::env::current_dir().unwrap_or_default());
        Ok(Repl { editor: DefaultEditor::new()?, vm })
    }

    pub fn run(&mut self) -> rustyline::Result<()> {
        debug!("starting repl");

        // One module for the whole session; registering it as a native
        // module keeps it rooted.
        let module = self.vm.heap.alloc_module();
        self.vm.register_repl_module(module);

        let mut source = String::new();
        loop {
            let prompt = if source.is_empty() { ">>> " } else { "... " };
            let line = match self.editor.readline(prompt) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => {
                    source.clear();
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err),
            };

            source.push_str(&line);
            source.push('\n');

            let mut map = SourceMap::new(
                source.clone(),
                "<repl>".to_string(),
                std::env::current_dir().unwrap_or_default(),
            );
            let mut reporter = TerminalReporter::new();

            let lexed = Lexer::new(&map.source.clone()).scan(&mut map, &mut reporter);
            if lexed.had_error {
                source.clear();
                continue;
            }

            let outcome = Parser::with_mode(&lexed.tokens, &map, true).parse(&mut reporter);
            if outcome.error_at_eof {
                // Incomplete input: keep accumulating.
                continue;
            }
            if outcome.had_error {
                source.clear();
                continue;
            }

            let _ = self.editor.add_history_entry(source.trim_end());

            let compiled = Compiler::compile_into_module(
                &outcome.ast,
                &map,
                &mut self.vm.heap,
                &mut reporter,
                module,
            );
            if compiled.had_error {
                source.clear();
                continue;
            }

            self.vm.execute(compiled.function);
            source.clear();
        }

        Ok(())
    }
}
