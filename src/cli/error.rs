//! User-friendly error formatting for CLI startup failures.

use colored::Colorize;

use crate::error::GatewayError;

/// Format a startup error for CLI display.
#[must_use]
pub fn format_error(error: &GatewayError) -> String {
    match error {
        GatewayError::Configuration { message, .. } => {
            format!(
                "{} Configuration error\n  {}\n\n{}\n  {}",
                "✗".red().bold(),
                message,
                "Suggestion:".yellow(),
                "Run with --help to see all available options"
            )
        }
        GatewayError::Io(err) => {
            format!(
                "{} I/O error\n  {}\n\n{}\n  {}",
                "✗".red().bold(),
                err,
                "Suggestion:".yellow(),
                "Check file permissions, disk space, and that the port is free"
            )
        }
        _ => format!("{} {}", "✗".red().bold(), error),
    }
}

/// Display a startup error to stderr and return the process exit code.
#[must_use]
pub fn display_error(error: &GatewayError) -> i32 {
    eprintln!("{}", format_error(error));
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_configuration_errors_with_a_suggestion() {
        let error = GatewayError::configuration("port 3333 already in use");
        let formatted = format_error(&error);
        assert!(formatted.contains("Configuration error"));
        assert!(formatted.contains("port 3333 already in use"));
    }
}
