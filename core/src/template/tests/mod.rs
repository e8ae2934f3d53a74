//! Tests for template parsing and resolution
