//! Command-line arguments for the docflow binary.

use clap::Parser;

/// Asynchronous document anonymization pipeline.
#[derive(Parser, Debug)]
#[command(name = "docflow", version, about)]
pub struct Cli {
    /// Default log level when RUST_LOG is not set.
    #[arg(long, default_value = "info", env = "DOCFLOW_LOG_LEVEL")]
    pub log_level: String,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let cli = Cli::parse_from(["docflow"]);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_log_level_flag() {
        let cli = Cli::parse_from(["docflow", "--log-level", "debug"]);
        assert_eq!(cli.log_level, "debug");
    }
}
