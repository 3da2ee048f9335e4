//! Output formatting for CLI commands.

use serde_json::Value;

/// Carries the global `--json` / `--quiet` flags into every command.
pub struct OutputContext {
    pub json: bool,
    pub quiet: bool,
}

impl OutputContext {
    #[must_use]
    pub fn new(json: bool, quiet: bool) -> Self {
        Self { json, quiet }
    }

    /// Print a human line unless suppressed or in JSON mode.
    pub fn line(&self, message: impl AsRef<str>) {
        if !self.quiet && !self.json {
            println!("{}", message.as_ref());
        }
    }

    /// Print the machine-readable payload when `--json` was given.
    pub fn value(&self, value: &Value) {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            );
        }
    }
}
