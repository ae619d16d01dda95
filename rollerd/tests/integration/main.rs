//! Integration tests driving the built `rollerd` binary.

mod cli_tests;
