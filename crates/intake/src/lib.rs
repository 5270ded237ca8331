// Evidence intake: validation, parsing and staged analysis of submitted files.

// Core infrastructure
pub mod boot;
pub mod config;
pub mod error;
pub mod state;

// Intake stages
pub mod validate;
pub mod scan;
pub mod quarantine;
pub mod chunked;
pub mod progress;
pub mod pipeline;

// Downstream services
pub mod collab;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
