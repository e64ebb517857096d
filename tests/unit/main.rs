//! Unit tests for configuration and error types

mod config_test;
mod error_test;
