//! Two-phase vetting of parser manifests.
//!
//! Phase one compiles: TOML shape, regular expressions, timestamp formats.
//! Any failure is an error diagnostic and blocks instantiation. Phase two is
//! structural and only warns: it checks that the program can actually probe
//! and parse.

use chrono::format::{Item, StrftimeItems};
use regex::{Regex, RegexBuilder};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use super::manifest::*;
use crate::parser::{Diagnostic, Severity};

/// Compiled size ceiling for any user regex.
pub const REGEX_SIZE_LIMIT: usize = 1 << 20;
pub const REGEX_NEST_LIMIT: u32 = 64;

/// How the loader should build the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructorShape {
    /// No diagnostic sink
    Default,
    /// Receives a [`DiagnosticSink`](super::DiagnosticSink)
    WithDiagnostics,
    Unknown(String),
}

impl ConstructorShape {
    fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "default" | "new" => ConstructorShape::Default,
            "with_diagnostics" | "diagnostics" => ConstructorShape::WithDiagnostics,
            _ => ConstructorShape::Unknown(name.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledDetect {
    pub regex: Regex,
    pub threshold_percent: u32,
    pub sample_lines: usize,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub regex: Regex,
    pub timestamp_format: Option<String>,
    pub level: Option<Severity>,
    pub source: Option<String>,
}

/// An executable custom parser: anchored regexes plus field mappings.
#[derive(Debug, Clone)]
pub struct RuleProgram {
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: Option<String>,
    pub constructor: ConstructorShape,
    pub extensions: Vec<String>,
    pub priority: Option<i32>,
    pub detect: Option<CompiledDetect>,
    pub rules: Vec<CompiledRule>,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub fingerprint: u64,
}

/// Outcome of compiling a manifest: a program only when no error was found.
#[derive(Debug)]
pub struct Compilation {
    pub program: Option<RuleProgram>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Compilation {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }
}

pub fn fingerprint(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

struct Compiler<'s> {
    source: &'s str,
    diagnostics: Vec<Diagnostic>,
}

impl<'s> Compiler<'s> {
    fn error_at(&mut self, offset: usize, message: impl Into<String>) {
        let (line, column) = position(self.source, offset);
        self.diagnostics.push(Diagnostic::error(line, column, message));
    }

    fn warn_at(&mut self, offset: usize, message: impl Into<String>) {
        let (line, column) = position(self.source, offset);
        self.diagnostics.push(Diagnostic::warning(line, column, message));
    }

    fn warn_line(&mut self, (line, column): (usize, usize), message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::warning(line, column, message));
    }

    fn regex(&mut self, pattern: &toml::Spanned<String>, case_insensitive: bool, what: &str) -> Option<Regex> {
        match RegexBuilder::new(pattern.get_ref())
            .case_insensitive(case_insensitive)
            .size_limit(REGEX_SIZE_LIMIT)
            .nest_limit(REGEX_NEST_LIMIT)
            .build()
        {
            Ok(regex) => Some(regex),
            Err(e) => {
                let detail = e.to_string().lines().last().unwrap_or("invalid pattern").trim().to_string();
                self.error_at(pattern.span().start, format!("{} pattern does not compile: {}", what, detail));
                None
            }
        }
    }

    /// Keys not in `known` under the table found at `table_start`.
    fn unknown_keys(&mut self, table: Option<&toml::Table>, known: &[&str], table_name: &str, table_start: usize) {
        let Some(table) = table else { return };
        for key in table.keys().filter(|k| !known.contains(&k.as_str())) {
            let at = locate_key(self.source, key, table_start);
            self.warn_line(at, format!("unknown key `{}` in [{}] is ignored", key, table_name));
        }
    }

    fn check_unknown_keys(&mut self, raw: &toml::Table) {
        for key in raw.keys().filter(|k| !TOP_LEVEL_KEYS.contains(&k.as_str())) {
            let at = locate_key(self.source, key, 0);
            self.warn_line(at, format!("unknown top-level key `{}` is ignored", key));
        }
        self.unknown_keys(
            raw.get("parser").and_then(|v| v.as_table()),
            PARSER_KEYS,
            "parser",
            table_offset(self.source, "parser", 0),
        );
        self.unknown_keys(
            raw.get("detect").and_then(|v| v.as_table()),
            DETECT_KEYS,
            "detect",
            table_offset(self.source, "detect", 0),
        );
        if let Some(rules) = raw.get("rules").and_then(|v| v.as_array()) {
            for (i, rule) in rules.iter().enumerate() {
                self.unknown_keys(rule.as_table(), RULE_KEYS, "rules", table_offset(self.source, "rules", i));
            }
        }
    }

    fn detect(&mut self, section: &DetectSection) -> Option<CompiledDetect> {
        let regex = self.regex(&section.pattern, section.case_insensitive, "detect")?;

        let threshold = match &section.threshold {
            Some(t) if *t.get_ref() > 0.0 && *t.get_ref() <= 1.0 => *t.get_ref(),
            Some(t) => {
                self.warn_at(
                    t.span().start,
                    format!("threshold {} is outside (0, 1]; using {}", t.get_ref(), DEFAULT_THRESHOLD),
                );
                DEFAULT_THRESHOLD
            }
            None => DEFAULT_THRESHOLD,
        };

        let sample_lines = match section.sample_lines {
            Some(0) => {
                let at = locate_key(self.source, "sample_lines", table_offset(self.source, "detect", 0));
                self.warn_line(at, format!("sample_lines must be positive; using {}", DEFAULT_SAMPLE_LINES));
                DEFAULT_SAMPLE_LINES
            }
            Some(n) => n,
            None => DEFAULT_SAMPLE_LINES,
        };

        Some(CompiledDetect {
            regex,
            threshold_percent: (threshold * 100.0).round() as u32,
            sample_lines,
        })
    }

    fn rule(&mut self, index: usize, section: &RuleSection) -> Option<CompiledRule> {
        let name = section.name.clone().unwrap_or_else(|| format!("rule_{}", index + 1));
        let regex = self.regex(&section.pattern, section.case_insensitive, &format!("rule `{}`", name));

        if let Some(format) = &section.timestamp_format {
            let broken = StrftimeItems::new(format.get_ref()).any(|item| matches!(item, Item::Error));
            if broken {
                self.error_at(
                    format.span().start,
                    format!("rule `{}` has an invalid timestamp_format `{}`", name, format.get_ref()),
                );
            }
        }

        let level = match &section.level {
            Some(level) => match Severity::from_text(level.get_ref()) {
                Some(severity) => Some(severity),
                None => {
                    self.warn_at(
                        level.span().start,
                        format!("rule `{}` has unknown level `{}`; events keep their captured level", name, level.get_ref()),
                    );
                    None
                }
            },
            None => None,
        };

        Some(CompiledRule {
            name,
            regex: regex?,
            timestamp_format: section.timestamp_format.as_ref().map(|f| f.get_ref().clone()),
            level,
            source: section.source.clone(),
        })
    }

    /// Phase two: can this program probe and parse? Warnings only.
    fn structure(&mut self, program: &RuleProgram) {
        let parser_at = table_offset(self.source, "parser", 0);
        if program.detect.is_none() {
            self.warn_at(
                parser_at,
                "no [detect] section; detection falls back to matching rules against the sample",
            );
        }
        if program.rules.is_empty() {
            self.warn_at(parser_at, "no [[rules]]; every line will be kept as an unmatched event");
        }
        for (i, rule) in program.rules.iter().enumerate() {
            let named = rule.regex.capture_names().flatten().count();
            if named == 0 {
                let at = table_offset(self.source, "rules", i);
                self.warn_at(at, format!("rule `{}` captures no named group; only the whole line is kept", rule.name));
            }
        }
        if program.extensions.is_empty() {
            let at = locate_key(self.source, "name", parser_at);
            self.warn_line(at, "no extensions declared; the parser will be offered every file");
        }
        if let ConstructorShape::Unknown(shape) = &program.constructor {
            let at = locate_key(self.source, "constructor", parser_at);
            self.warn_line(
                at,
                format!("constructor `{}` is not supported (use `default` or `with_diagnostics`)", shape),
            );
        }
    }
}

/// Compile a parser manifest.
pub fn compile(source: &str) -> Compilation {
    let mut compiler = Compiler { source, diagnostics: Vec::new() };

    let manifest: Manifest = match toml::from_str(source) {
        Ok(m) => m,
        Err(e) => {
            let offset = e.span().map(|s| s.start).unwrap_or(0);
            compiler.error_at(offset, e.message().to_string());
            return Compilation { program: None, diagnostics: compiler.diagnostics };
        }
    };
    if let Ok(raw) = toml::from_str::<toml::Table>(source) {
        compiler.check_unknown_keys(&raw);
    }

    let name = manifest.parser.name.get_ref().trim().to_string();
    if name.is_empty() {
        compiler.error_at(manifest.parser.name.span().start, "parser name must not be empty");
    }

    let detect = manifest.detect.as_ref().and_then(|d| compiler.detect(d));

    let mut rules = Vec::with_capacity(manifest.rules.len());
    for (i, section) in manifest.rules.iter().enumerate() {
        if let Some(rule) = compiler.rule(i, section) {
            rules.push(rule);
        }
    }

    let fields = manifest
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(serde_json::Value::Null)))
        .collect();

    let program = RuleProgram {
        name,
        description: manifest.parser.description.clone(),
        version: manifest.parser.version.clone(),
        author: manifest.parser.author.clone(),
        constructor: ConstructorShape::from_name(manifest.parser.constructor.get_ref()),
        extensions: manifest.parser.extensions.clone(),
        priority: manifest.parser.priority,
        detect,
        rules,
        fields,
        fingerprint: fingerprint(source),
    };

    if compiler.diagnostics.iter().any(Diagnostic::is_error) {
        return Compilation { program: None, diagnostics: compiler.diagnostics };
    }

    compiler.structure(&program);
    Compilation { program: Some(program), diagnostics: compiler.diagnostics }
}
