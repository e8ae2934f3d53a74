//! Tests for the scenario flow interpreter
//!
//! Organized by feature area

mod flow_tests;
mod helpers;
