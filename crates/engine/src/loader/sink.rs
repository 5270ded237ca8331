use parking_lot::Mutex;
use std::sync::Arc;

use crate::parser::Diagnostic;

const MAX_UNMATCHED_SAMPLES: usize = 20;
const MAX_RULE_ERRORS: usize = 50;
const SAMPLE_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Default)]
struct SinkState {
    unmatched: Vec<Diagnostic>,
    unmatched_total: usize,
    rule_errors: Vec<Diagnostic>,
    rule_errors_total: usize,
}

/// Runtime feedback channel handed to `with_diagnostics` parsers.
///
/// Keeps a bounded sample of unmatched lines and rule failures so a parser
/// author can see why a file did not parse. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticSink {
    state: Arc<Mutex<SinkState>>,
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(SAMPLE_PREVIEW_CHARS).collect();
    if text.chars().count() > SAMPLE_PREVIEW_CHARS {
        out.push('…');
    }
    out
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unmatched(&self, line: usize, text: &str) {
        let mut state = self.state.lock();
        state.unmatched_total += 1;
        if state.unmatched.len() < MAX_UNMATCHED_SAMPLES {
            state
                .unmatched
                .push(Diagnostic::warning(line, 1, format!("no rule matched: {}", preview(text))));
        }
    }

    pub fn rule_error(&self, line: usize, rule: &str, message: impl AsRef<str>) {
        let mut state = self.state.lock();
        state.rule_errors_total += 1;
        if state.rule_errors.len() < MAX_RULE_ERRORS {
            state
                .rule_errors
                .push(Diagnostic::warning(line, 1, format!("rule `{}`: {}", rule, message.as_ref())));
        }
    }

    pub fn unmatched_count(&self) -> usize {
        self.state.lock().unmatched_total
    }

    pub fn rule_error_count(&self) -> usize {
        self.state.lock().rule_errors_total
    }

    /// Retained diagnostics, rule errors first.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let state = self.state.lock();
        state.rule_errors.iter().chain(state.unmatched.iter()).cloned().collect()
    }

    pub fn clear(&self) {
        *self.state.lock() = SinkState::default();
    }
}
