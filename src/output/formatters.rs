//! Formatter strategies

use std::io::{self, Write};

use super::check::CheckResult;
use crate::error::ClusterError;
use crate::remote::OptWriter;

/// Writes command output in one format. Chosen once per invocation.
pub trait Formatter {
    /// A single check verdict.
    fn emit_check(&mut self, out: &mut dyn Write, check: &CheckResult) -> io::Result<()>;

    /// A key/value record (status replies, daemon state).
    fn emit_fields(&mut self, out: &mut dyn Write, fields: &[(&str, String)]) -> io::Result<()>;

    /// Rows of a listing.
    fn emit_table(
        &mut self,
        out: &mut dyn Write,
        headers: &[&str],
        rows: &[Vec<String>],
    ) -> io::Result<()>;

    /// Result of a state-changing action. `complete` is false for an
    /// incomplete outcome.
    fn emit_action(&mut self, out: &mut dyn Write, complete: bool, message: &str) -> io::Result<()>;

    /// A failed command. Human formats rely on the log instead.
    fn emit_error(&mut self, _out: &mut dyn Write, _err: &ClusterError) -> io::Result<()> {
        Ok(())
    }
}

/// Plain text for operators.
#[derive(Debug, Default)]
pub struct TextFormatter;

impl Formatter for TextFormatter {
    fn emit_check(&mut self, out: &mut dyn Write, check: &CheckResult) -> io::Result<()> {
        writeln!(out, "{}: {} ({})", check.name, check.status, check.message)?;
        for (key, value) in &check.details {
            writeln!(out, "  {}: {}", key, value)?;
        }
        Ok(())
    }

    fn emit_fields(&mut self, out: &mut dyn Write, fields: &[(&str, String)]) -> io::Result<()> {
        let width = fields.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in fields {
            writeln!(out, "{:width$} : {}", key, value, width = width)?;
        }
        Ok(())
    }

    fn emit_table(
        &mut self,
        out: &mut dyn Write,
        headers: &[&str],
        rows: &[Vec<String>],
    ) -> io::Result<()> {
        let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for row in rows {
            for (i, cell) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(cell.len());
                }
            }
        }

        let render = |cells: Vec<&str>| -> String {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!(" {:w$} ", c, w = *w))
                .collect::<Vec<_>>()
                .join("|")
                .trim_end()
                .to_string()
        };

        writeln!(out, "{}", render(headers.to_vec()))?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(w + 2)).collect();
        writeln!(out, "{}", rule.join("+"))?;
        for row in rows {
            writeln!(out, "{}", render(row.iter().map(String::as_str).collect()))?;
        }
        Ok(())
    }

    fn emit_action(&mut self, out: &mut dyn Write, complete: bool, message: &str) -> io::Result<()> {
        if complete {
            writeln!(out, "{}", message)
        } else {
            writeln!(out, "INCOMPLETE: {}", message)
        }
    }
}

/// Comma-separated values; one record per line.
#[derive(Debug, Default)]
pub struct CsvFormatter;

impl CsvFormatter {
    fn quote(value: &str) -> String {
        if value.contains([',', '"', '\n']) {
            format!("\"{}\"", value.replace('"', "\"\""))
        } else {
            value.to_string()
        }
    }

    fn line(cells: &[&str]) -> String {
        cells
            .iter()
            .map(|c| Self::quote(c))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Formatter for CsvFormatter {
    fn emit_check(&mut self, out: &mut dyn Write, check: &CheckResult) -> io::Result<()> {
        writeln!(
            out,
            "{}",
            Self::line(&[
                check.name.as_str(),
                check.status.as_str(),
                check.message.as_str(),
            ])
        )
    }

    fn emit_fields(&mut self, out: &mut dyn Write, fields: &[(&str, String)]) -> io::Result<()> {
        for (key, value) in fields {
            writeln!(out, "{}", Self::line(&[*key, value.as_str()]))?;
        }
        Ok(())
    }

    fn emit_table(
        &mut self,
        out: &mut dyn Write,
        headers: &[&str],
        rows: &[Vec<String>],
    ) -> io::Result<()> {
        writeln!(out, "{}", Self::line(headers))?;
        for row in rows {
            let cells: Vec<&str> = row.iter().map(String::as_str).collect();
            writeln!(out, "{}", Self::line(&cells))?;
        }
        Ok(())
    }

    fn emit_action(&mut self, out: &mut dyn Write, complete: bool, message: &str) -> io::Result<()> {
        let status = if complete { "OK" } else { "INCOMPLETE" };
        writeln!(out, "{}", Self::line(&[status, message]))
    }
}

/// Nagios plugin output: `WALWARDEN_<CHECK> <STATUS>: message | perfdata`.
#[derive(Debug, Default)]
pub struct NagiosFormatter;

impl Formatter for NagiosFormatter {
    fn emit_check(&mut self, out: &mut dyn Write, check: &CheckResult) -> io::Result<()> {
        let service = format!("WALWARDEN_{}", check.name.to_uppercase().replace('-', "_"));
        let perfdata: Vec<String> = check
            .details
            .iter()
            .filter(|(_, v)| v.parse::<f64>().is_ok())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if perfdata.is_empty() {
            writeln!(out, "{} {}: {}", service, check.status, check.message)
        } else {
            writeln!(
                out,
                "{} {}: {} | {}",
                service,
                check.status,
                check.message,
                perfdata.join(" ")
            )
        }
    }

    fn emit_fields(&mut self, out: &mut dyn Write, fields: &[(&str, String)]) -> io::Result<()> {
        TextFormatter.emit_fields(out, fields)
    }

    fn emit_table(
        &mut self,
        out: &mut dyn Write,
        headers: &[&str],
        rows: &[Vec<String>],
    ) -> io::Result<()> {
        TextFormatter.emit_table(out, headers, rows)
    }

    fn emit_action(&mut self, out: &mut dyn Write, complete: bool, message: &str) -> io::Result<()> {
        TextFormatter.emit_action(out, complete, message)
    }
}

/// `--key=value` line format consumed by the Remote Command Channel.
#[derive(Debug, Default)]
pub struct OptFormatter;

impl Formatter for OptFormatter {
    fn emit_check(&mut self, out: &mut dyn Write, check: &CheckResult) -> io::Result<()> {
        let mut w = OptWriter::new();
        match &check.status_token {
            Some((key, value)) => w.push(key, value),
            None => w.push("status", check.status.as_str()),
        }
        for (key, value) in &check.details {
            w.push(key, value);
        }
        writeln!(out, "{}", w.render())
    }

    fn emit_fields(&mut self, out: &mut dyn Write, fields: &[(&str, String)]) -> io::Result<()> {
        let mut w = OptWriter::new();
        for (key, value) in fields {
            w.push(key, value);
        }
        writeln!(out, "{}", w.render())
    }

    fn emit_table(
        &mut self,
        out: &mut dyn Write,
        headers: &[&str],
        rows: &[Vec<String>],
    ) -> io::Result<()> {
        for row in rows {
            let mut w = OptWriter::new();
            for (key, value) in headers.iter().zip(row) {
                w.push(key, value);
            }
            writeln!(out, "{}", w.render())?;
        }
        Ok(())
    }

    fn emit_action(&mut self, out: &mut dyn Write, complete: bool, message: &str) -> io::Result<()> {
        let mut w = OptWriter::new();
        w.push("status", if complete { "OK" } else { "INCOMPLETE" });
        w.push("message", message);
        writeln!(out, "{}", w.render())
    }

    fn emit_error(&mut self, out: &mut dyn Write, err: &ClusterError) -> io::Result<()> {
        let mut w = OptWriter::new();
        w.push("status", "ERROR");
        w.push("error-class", err.class().as_str());
        w.push("message", err);
        writeln!(out, "{}", w.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::CheckStatus;

    fn render(f: &mut dyn Formatter, check: &CheckResult) -> String {
        let mut buf = Vec::new();
        f.emit_check(&mut buf, check).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn lag_check() -> CheckResult {
        CheckResult::new("replication-lag", CheckStatus::Warning, "lag is 400 seconds")
            .detail("lag", 400)
    }

    #[test]
    fn test_optformat_check() {
        assert_eq!(render(&mut OptFormatter, &lag_check()), "--status=WARNING --lag=400\n");
        let dd = CheckResult::new("data-directory", CheckStatus::Critical, "mismatch")
            .with_status_token("configured-data-directory", "MISMATCH");
        assert_eq!(
            render(&mut OptFormatter, &dd),
            "--configured-data-directory=MISMATCH\n"
        );
    }

    #[test]
    fn test_nagios_check_perfdata() {
        assert_eq!(
            render(&mut NagiosFormatter, &lag_check()),
            "WALWARDEN_REPLICATION_LAG WARNING: lag is 400 seconds | lag=400\n"
        );
    }

    #[test]
    fn test_csv_quotes() {
        let check = CheckResult::new("downstream", CheckStatus::Critical, "missing: db2, db3");
        assert_eq!(
            render(&mut CsvFormatter, &check),
            "downstream,CRITICAL,\"missing: db2, db3\"\n"
        );
    }

    #[test]
    fn test_text_table() {
        let mut buf = Vec::new();
        TextFormatter
            .emit_table(
                &mut buf,
                &["id", "name"],
                &[vec!["1".to_string(), "db1".to_string()]],
            )
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], " id | name");
        assert_eq!(lines[2], " 1  | db1");
    }

    #[test]
    fn test_optformat_error() {
        let mut buf = Vec::new();
        OptFormatter
            .emit_error(&mut buf, &ClusterError::fatal("server did not stop"))
            .unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "--status=ERROR --error-class=FATAL --message=server_did_not_stop\n"
        );
    }
}
