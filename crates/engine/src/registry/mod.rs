/// Parser registry and factory
///
/// Holds a descriptor for every parser (built-in and custom), instantiates
/// parsers on demand and picks the one that understands a given file.

pub mod descriptor;
pub mod store;

pub use descriptor::{NewParser, ParserDescriptor, ParserUpdate, CUSTOM_PRIORITY};
pub use store::{DescriptorStore, MemoryDescriptorStore, StoreError};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::loader::{compile, ExtensionLoader, LoadError};
use crate::parser::formats::builtin_parsers;
use crate::parser::metrics::ParsingMetrics;
use crate::parser::{
    detection_sample, extension_matches, guarded_parse, Diagnostic, LogParser, ParserContext,
    ValidationResult, DETECTION_SAMPLE_BYTES,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Parser not found: {0}")]
    NotFound(String),

    #[error("Parser already registered: {0}")]
    DuplicateName(String),

    #[error("Parser source rejected: {first}")]
    InvalidSource { first: String, diagnostics: Vec<Diagnostic> },

    #[error("Built-in parser cannot be modified: {0}")]
    BuiltinImmutable(String),

    #[error("Manifest renames parser `{expected}` to `{found}`")]
    NameMismatch { expected: String, found: String },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    fn invalid(diagnostics: Vec<Diagnostic>) -> Self {
        let first = diagnostics
            .iter()
            .find(|d| d.is_error())
            .map(|d| d.to_string())
            .unwrap_or_default();
        RegistryError::InvalidSource { first, diagnostics }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Outcome of parser selection. Absence of a parser is not an error.
pub enum Selection {
    Found {
        parser: Arc<dyn LogParser>,
        name: String,
        via_preference: bool,
    },
    NotFound,
}

impl Selection {
    pub fn name(&self) -> Option<&str> {
        match self {
            Selection::Found { name, .. } => Some(name.as_str()),
            Selection::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Selection::Found { .. })
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Found { name, via_preference, .. } => f
                .debug_struct("Found")
                .field("name", name)
                .field("via_preference", via_preference)
                .finish(),
            Selection::NotFound => f.write_str("NotFound"),
        }
    }
}

/// Result of running a registered parser over a sample.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TestRunReport {
    /// Parsing succeeded, produced events, and the detector accepted the sample
    pub passed: bool,
    pub event_count: usize,
    pub elapsed: Duration,
    pub diagnostic: Option<String>,
    /// Whether the parser's detector accepts the sample
    pub probe_accepted: bool,
}

pub struct Registry {
    store: Arc<dyn DescriptorStore>,
    loader: ExtensionLoader,
    builtins: HashMap<String, Arc<dyn LogParser>>,
    metrics: Arc<ParsingMetrics>,
}

impl Registry {
    pub fn new(ctx: ParserContext) -> Self {
        Self::with_store(Arc::new(MemoryDescriptorStore::new()), ctx)
    }

    /// Seed built-ins into `store`. Descriptors already present are kept as is.
    pub fn with_store(store: Arc<dyn DescriptorStore>, ctx: ParserContext) -> Self {
        let now = ctx.now();
        let mut builtins = HashMap::new();
        for builtin in builtin_parsers(&ctx) {
            let info = builtin.parser.info();
            let descriptor = ParserDescriptor::builtin(&info, builtin.priority, now);
            match store.insert_if_absent(descriptor) {
                Ok(true) => debug!(parser = %info.name, priority = builtin.priority, "Seeded built-in parser"),
                Ok(false) => {}
                Err(e) => warn!(parser = %info.name, error = %e, "Failed to seed built-in parser"),
            }
            builtins.insert(info.name, builtin.parser);
        }

        Self {
            store,
            loader: ExtensionLoader::new(ctx),
            builtins,
            metrics: Arc::new(ParsingMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<ParsingMetrics> {
        &self.metrics
    }

    pub fn loader(&self) -> &ExtensionLoader {
        &self.loader
    }

    /// Pick the parser for a file.
    ///
    /// An enabled `preferred` parser whose probe accepts wins outright.
    /// Otherwise enabled parsers declaring the file's extension are probed
    /// in ascending priority order (ties by name).
    pub fn select(&self, filename: &str, sample: &str, preferred: Option<&str>) -> Selection {
        let sample = detection_sample(sample, DETECTION_SAMPLE_BYTES);

        if let Some(preferred) = preferred {
            let accepted = self
                .store
                .get(preferred)
                .filter(|d| d.enabled)
                .and_then(|d| self.instantiate(&d))
                .filter(|parser| parser.probe(filename, sample));
            if let Some(parser) = accepted {
                self.metrics.record_selection(true, true);
                return Selection::Found {
                    parser,
                    name: preferred.to_string(),
                    via_preference: true,
                };
            }
            debug!(parser = preferred, file = filename, "Preferred parser declined, scanning by priority");
        }

        let mut candidates: Vec<ParserDescriptor> = self
            .store
            .list()
            .into_iter()
            .filter(|d| d.enabled && extension_matches(&d.extensions, filename))
            .collect();
        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        for descriptor in candidates {
            let Some(parser) = self.instantiate(&descriptor) else { continue };
            if parser.probe(filename, sample) {
                self.metrics.record_selection(true, false);
                self.touch(&descriptor.name);
                debug!(parser = %descriptor.name, file = filename, "Parser selected");
                return Selection::Found {
                    parser,
                    name: descriptor.name,
                    via_preference: false,
                };
            }
        }

        self.metrics.record_selection(false, false);
        Selection::NotFound
    }

    /// Best-effort usage bookkeeping; failures are logged and dropped.
    fn touch(&self, name: &str) {
        let store = Arc::clone(&self.store);
        let name = name.to_string();
        let at = self.loader.context().now();
        let update = move || {
            if let Err(e) = store.record_usage(&name, at) {
                warn!(parser = %name, error = %e, "Failed to record parser usage");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { update() });
            }
            Err(_) => update(),
        }
    }

    fn instantiate(&self, descriptor: &ParserDescriptor) -> Option<Arc<dyn LogParser>> {
        if descriptor.builtin {
            return self.builtins.get(&descriptor.name).cloned();
        }
        let source = descriptor.source.as_deref()?;
        self.loader.load(&descriptor.name, source)
    }

    /// Instantiated parser by name, regardless of its enabled flag.
    pub fn parser(&self, name: &str) -> Option<Arc<dyn LogParser>> {
        self.store.get(name).and_then(|d| self.instantiate(&d))
    }

    pub fn get(&self, name: &str) -> Option<ParserDescriptor> {
        self.store.get(name)
    }

    /// All descriptors in selection order
    pub fn list(&self) -> Vec<ParserDescriptor> {
        let mut all = self.store.list();
        all.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        all
    }

    pub fn register(&self, request: NewParser) -> RegistryResult<ParserDescriptor> {
        let compilation = compile(&request.source);
        let Some(program) = compilation.program else {
            return Err(RegistryError::invalid(compilation.diagnostics));
        };
        if self.store.get(&program.name).is_some() {
            return Err(RegistryError::DuplicateName(program.name));
        }

        let descriptor = ParserDescriptor::custom(&program, request, self.loader.context().now());
        if !self.store.insert_if_absent(descriptor.clone())? {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }
        self.loader.invalidate(&descriptor.name);

        info!(
            parser = %descriptor.name,
            priority = descriptor.priority,
            rules = program.rules.len(),
            warnings = compilation.diagnostics.len(),
            "Registered custom parser"
        );
        Ok(descriptor)
    }

    pub fn update(&self, name: &str, update: ParserUpdate) -> RegistryResult<ParserDescriptor> {
        let mut descriptor = self
            .store
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if let Some(source) = update.source {
            if descriptor.builtin {
                return Err(RegistryError::BuiltinImmutable(name.to_string()));
            }
            let compilation = compile(&source);
            let Some(program) = compilation.program else {
                return Err(RegistryError::invalid(compilation.diagnostics));
            };
            if program.name != name {
                return Err(RegistryError::NameMismatch {
                    expected: name.to_string(),
                    found: program.name,
                });
            }
            descriptor.apply_program(&program);
            descriptor.source = Some(source);
        }
        if let Some(priority) = update.priority {
            descriptor.priority = priority;
        }
        if let Some(enabled) = update.enabled {
            descriptor.enabled = enabled;
        }
        if let Some(config) = update.config {
            descriptor.config = config;
        }
        descriptor.updated_at = self.loader.context().now();

        self.store.put(descriptor.clone())?;
        self.loader.invalidate(name);
        info!(parser = name, "Updated parser");
        Ok(descriptor)
    }

    pub fn remove(&self, name: &str) -> RegistryResult<ParserDescriptor> {
        let descriptor = self
            .store
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if descriptor.builtin {
            return Err(RegistryError::BuiltinImmutable(name.to_string()));
        }
        self.store.remove(name)?;
        self.loader.invalidate(name);
        info!(parser = name, "Removed custom parser");
        Ok(descriptor)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> RegistryResult<ParserDescriptor> {
        self.update(name, ParserUpdate { enabled: Some(enabled), ..ParserUpdate::default() })
    }

    /// Compile a manifest without registering it.
    pub fn validate_code(&self, source: &str) -> ValidationResult {
        self.loader.validate(source)
    }

    /// Run a registered parser over `sample` with panic containment.
    pub fn test_run(&self, name: &str, sample: &str) -> RegistryResult<TestRunReport> {
        let descriptor = self
            .store
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let parser = match descriptor.source.as_deref() {
            Some(source) => self.loader.try_load(name, source)?,
            None => self
                .builtins
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?,
        };

        let detection = parser.detect(detection_sample(sample, DETECTION_SAMPLE_BYTES));
        let probe_accepted = detection.meets(parser.threshold_percent());
        let result = guarded_parse(parser.as_ref(), "test-run", sample, &CancellationToken::new());

        let diagnostic = match (&result.error_message, result.event_count) {
            (Some(message), _) => Some(message.clone()),
            (None, 0) => Some("parser produced no events".to_string()),
            (None, _) if !probe_accepted => Some(format!(
                "detector matched {}% of sampled lines, below the {}% threshold",
                detection.percentage(),
                parser.threshold_percent()
            )),
            _ => None,
        };

        Ok(TestRunReport {
            passed: result.success() && result.event_count > 0 && probe_accepted,
            event_count: result.event_count,
            elapsed: result.elapsed,
            diagnostic,
            probe_accepted,
        })
    }
}
