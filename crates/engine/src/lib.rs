// Parsing core of the evidence intake engine.

// Parser framework and built-in formats
pub mod parser;

// User-submitted parsers
pub mod loader;

// Selection and lifecycle
pub mod registry;
