use std::fmt;
use std::sync::Arc;
use chrono::{DateTime, Utc};

/// Source of "now" for ingestion-time defaults.
///
/// Parsers never call `Utc::now()` directly so tests can pin the clock and
/// compare two parses of the same input field for field.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Shared settings handed to every parser at construction.
#[derive(Debug, Clone)]
pub struct ParserContext {
    pub clock: Arc<dyn Clock>,
    /// Hard cap on events produced by a single parse
    pub max_events: usize,
    pub max_line_size: usize,
}

impl ParserContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            max_events: super::DEFAULT_MAX_EVENTS,
            max_line_size: super::MAX_LINE_SIZE,
        }
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for ParserContext {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
