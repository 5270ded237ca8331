/// Individual evidence format parsers and detectors

pub mod csv;
pub mod json;
pub mod syslog;
pub mod text;
pub mod windows;

use std::sync::Arc;

use super::context::ParserContext;
use super::traits::LogParser;

// Re-export parser implementations
pub use self::csv::CsvParser;
pub use self::json::JsonParser;
pub use self::syslog::SyslogParser;
pub use self::text::TextParser;
pub use self::windows::WindowsEventParser;

/// A statically built parser plus its seeded selection priority.
pub struct Builtin {
    pub parser: Arc<dyn LogParser>,
    pub priority: i32,
}

/// Built-ins in priority order (lower runs first).
pub fn builtin_parsers(ctx: &ParserContext) -> Vec<Builtin> {
    vec![
        Builtin { parser: Arc::new(WindowsEventParser::new(ctx.clone())), priority: 10 },
        Builtin { parser: Arc::new(SyslogParser::new(ctx.clone())), priority: 20 },
        Builtin { parser: Arc::new(JsonParser::new(ctx.clone())), priority: 30 },
        Builtin { parser: Arc::new(CsvParser::new(ctx.clone())), priority: 40 },
        Builtin { parser: Arc::new(TextParser::new(ctx.clone())), priority: 100 },
    ]
}
