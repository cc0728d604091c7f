//! Testing utilities and mock implementations
//!
//! This module provides an in-memory broker and resolver for exercising the
//! transport without a running RabbitMQ.

pub mod mocks;

pub use mocks::*;
