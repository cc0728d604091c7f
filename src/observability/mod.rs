//! Observability for the AMQP transport
//!
//! Structured logging setup and span macros. Connection health itself is
//! computed by [`crate::transport::amqp::health`].

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{connection_span, transport_span};
