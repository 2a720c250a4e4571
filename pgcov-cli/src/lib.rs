//! Command-line front end for `pgcov`: argument parsing, logging setup and the
//! collect-then-report run loop behind the `pgcov-html` binary.

pub mod app;
