/// Extension loader for user-submitted parsers
///
/// A custom parser is a TOML manifest compiled into a [`RuleProgram`] of
/// bounded regular expressions and field mappings. The loader vets the
/// source, caches compiled programs per parser name and instantiates
/// [`CustomParser`]s without letting a bad manifest reach the host.
///
/// # Architecture
///
/// - `manifest.rs`: Serde shape of the manifest and source positions
/// - `compiler.rs`: Compile + structural checks producing diagnostics
/// - `custom.rs`: The interpreted parser
/// - `sink.rs`: Runtime diagnostics for `with_diagnostics` parsers
/// - `cache.rs`: Compiled program cache keyed by parser name

pub mod manifest;
pub mod compiler;
pub mod custom;
pub mod sink;
pub mod cache;

pub use cache::{CacheStats, ProgramCache};
pub use compiler::{compile, Compilation, ConstructorShape, RuleProgram};
pub use custom::CustomParser;
pub use sink::DiagnosticSink;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::parser::{Diagnostic, LogParser, ParserContext, ValidationResult};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Parser source has {count} error(s); first: {first}")]
    Compile { count: usize, first: String, diagnostics: Vec<Diagnostic> },

    #[error("Parser unavailable: {0}")]
    Unavailable(String),
}

impl LoadError {
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            LoadError::Compile { diagnostics, .. } => diagnostics,
            LoadError::Unavailable(_) => &[],
        }
    }
}

#[derive(Debug)]
pub struct ExtensionLoader {
    cache: ProgramCache,
    ctx: ParserContext,
}

impl ExtensionLoader {
    pub fn new(ctx: ParserContext) -> Self {
        Self { cache: ProgramCache::new(), ctx }
    }

    /// Compile without instantiating. Never panics.
    pub fn validate(&self, source: &str) -> ValidationResult {
        let compilation = compile(source);
        let mut result = ValidationResult::from_diagnostics(compilation.diagnostics);
        if let Some(program) = compilation.program {
            result.suggest("name", &program.name);
            result.suggest("rules", program.rules.len());
            result.suggest("detect", program.detect.is_some());
            result.suggest(
                "constructor",
                match &program.constructor {
                    ConstructorShape::Default => "default".to_string(),
                    ConstructorShape::WithDiagnostics => "with_diagnostics".to_string(),
                    ConstructorShape::Unknown(other) => other.clone(),
                },
            );
        }
        result
    }

    /// Compiled program for `name`, from cache when the source is unchanged.
    pub fn compile_cached(&self, name: &str, source: &str) -> Result<Arc<RuleProgram>, LoadError> {
        let fp = compiler::fingerprint(source);
        if let Some(program) = self.cache.get(name, fp) {
            return Ok(program);
        }

        let compilation = compile(source);
        let Some(program) = compilation.program else {
            let errors: Vec<Diagnostic> = compilation.errors().cloned().collect();
            let first = errors.first().map(|d| d.to_string()).unwrap_or_default();
            return Err(LoadError::Compile {
                count: errors.len(),
                first,
                diagnostics: compilation.diagnostics,
            });
        };

        let program = Arc::new(program);
        self.cache.insert(name, Arc::clone(&program));
        debug!(parser = name, rules = program.rules.len(), "Compiled custom parser");
        Ok(program)
    }

    /// Instantiate the parser registered as `name`.
    ///
    /// Compile errors, an unknown constructor shape or a panic during
    /// construction all yield `None`.
    pub fn load(&self, name: &str, source: &str) -> Option<Arc<dyn LogParser>> {
        match self.try_load(name, source) {
            Ok(parser) => Some(parser),
            Err(e) => {
                warn!(parser = name, error = %e, "Custom parser unavailable");
                None
            }
        }
    }

    pub fn try_load(&self, name: &str, source: &str) -> Result<Arc<dyn LogParser>, LoadError> {
        let program = self.compile_cached(name, source)?;
        let ctx = self.ctx.clone();

        let built = catch_unwind(AssertUnwindSafe(|| -> Result<Arc<dyn LogParser>, LoadError> {
            match &program.constructor {
                ConstructorShape::Default => Ok(Arc::new(CustomParser::new(name, Arc::clone(&program), ctx))),
                ConstructorShape::WithDiagnostics => Ok(Arc::new(CustomParser::with_diagnostics(
                    name,
                    Arc::clone(&program),
                    ctx,
                    DiagnosticSink::new(),
                ))),
                ConstructorShape::Unknown(shape) => {
                    Err(LoadError::Unavailable(format!("unknown constructor `{}`", shape)))
                }
            }
        }));

        match built {
            Ok(result) => result,
            Err(_) => {
                self.cache.invalidate(name);
                Err(LoadError::Unavailable("panic during construction".into()))
            }
        }
    }

    pub fn invalidate(&self, name: &str) -> bool {
        self.cache.invalidate(name)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn context(&self) -> &ParserContext {
        &self.ctx
    }
}
