//! Output sinks for the `print` builtin.

use std::fmt::Write as _;

/// Where `print` sends its lines.
pub trait PrintWriter {
    fn write_line(&mut self, line: &str);
}

/// Prints to the process's stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_line(&mut self, line: &str) {
        println!("{line}");
    }
}

/// Collects printed lines into a buffer; used by tests and embedders.
#[derive(Debug, Default)]
pub struct CollectPrint {
    buffer: String,
}

impl CollectPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.buffer
    }
}

impl PrintWriter for CollectPrint {
    fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.buffer, "{line}");
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_line(&mut self, _line: &str) {}
}
