//! Output formatting module
//!
//! Renders suite runs for the terminal and for files.

mod formatter;

pub use formatter::{write_run_to_file, OutputFormat, ResultFormatter};
