//! Command output
//!
//! One [`Formatter`] is chosen per invocation from [`OutputFormat`]; every
//! command writes through it instead of switching on the format itself.

mod check;
mod formatters;

pub use check::{CheckResult, CheckStatus};
pub use formatters::{CsvFormatter, Formatter, NagiosFormatter, OptFormatter, TextFormatter};

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Csv,
    Nagios,
    /// `--key=value` line, the inter-node wire format
    Optformat,
}

impl OutputFormat {
    pub fn formatter(&self) -> Box<dyn Formatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
            OutputFormat::Nagios => Box::new(NagiosFormatter),
            OutputFormat::Optformat => Box::new(OptFormatter),
        }
    }
}
