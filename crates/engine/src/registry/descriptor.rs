use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::loader::RuleProgram;
use crate::parser::ParserInfo;

/// Default selection priority for user-registered parsers
pub const CUSTOM_PRIORITY: i32 = 50;

/// Registry bookkeeping for one parser, built-in or custom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserDescriptor {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: Option<String>,
    pub extensions: Vec<String>,
    /// Lower runs first during selection
    pub priority: i32,
    pub enabled: bool,
    pub builtin: bool,
    /// Manifest text; `None` for built-ins
    pub source: Option<String>,
    pub config: BTreeMap<String, String>,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParserDescriptor {
    pub fn builtin(info: &ParserInfo, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: info.name.clone(),
            description: info.description.clone(),
            version: info.version.clone(),
            author: None,
            extensions: info.extensions.clone(),
            priority,
            enabled: true,
            builtin: true,
            source: None,
            config: BTreeMap::new(),
            usage_count: 0,
            last_used: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn custom(program: &RuleProgram, request: NewParser, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: program.name.clone(),
            description: program.description.clone(),
            version: program.version.clone(),
            author: program.author.clone(),
            extensions: selection_extensions(program),
            priority: request.priority.or(program.priority).unwrap_or(CUSTOM_PRIORITY),
            enabled: request.enabled,
            builtin: false,
            source: Some(request.source),
            config: request.config,
            usage_count: 0,
            last_used: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh fields derived from a recompiled manifest.
    pub(crate) fn apply_program(&mut self, program: &RuleProgram) {
        self.description = program.description.clone();
        self.version = program.version.clone();
        self.author = program.author.clone();
        self.extensions = selection_extensions(program);
    }
}

/// A manifest that declares no extensions accepts any file.
fn selection_extensions(program: &RuleProgram) -> Vec<String> {
    if program.extensions.is_empty() {
        vec!["*".to_string()]
    } else {
        program.extensions.clone()
    }
}

/// Registration request for a custom parser. The name comes from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewParser {
    pub source: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Overrides `[parser].priority`
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

fn enabled_by_default() -> bool {
    true
}

impl NewParser {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            enabled: true,
            priority: None,
            config: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserUpdate {
    pub source: Option<String>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
    pub config: Option<BTreeMap<String, String>>,
}
