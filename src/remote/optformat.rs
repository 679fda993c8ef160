//! `--key=value` line format
//!
//! The wire format between cooperating instances: one line of
//! space-separated `--key=value` tokens. Values never contain spaces; the
//! writer replaces them with underscores.

use std::str::FromStr;

use crate::error::{ClusterError, ClusterResult};

/// Parsed reply tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptReply {
    tokens: Vec<(String, String)>,
}

impl OptReply {
    /// Parse a reply. Empty output means the host could not be reached.
    pub fn parse(host: &str, output: &str) -> ClusterResult<Self> {
        let line = output
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("--"))
            .ok_or_else(|| ClusterError::remote(host, "no reply received"))?;

        let mut tokens = Vec::new();
        for token in line.split_whitespace() {
            let body = token
                .strip_prefix("--")
                .ok_or_else(|| ClusterError::Protocol(format!("unexpected token \"{}\"", token)))?;
            let (key, value) = body.split_once('=').unwrap_or((body, ""));
            if key.is_empty() {
                return Err(ClusterError::Protocol(format!("empty key in \"{}\"", token)));
            }
            tokens.push((key.to_string(), value.to_string()));
        }
        Ok(Self { tokens })
    }

    /// Tokens in reply order.
    pub fn tokens(&self) -> &[(String, String)] {
        &self.tokens
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value for `key`, which must be present.
    pub fn require(&self, key: &str) -> ClusterResult<&str> {
        self.get(key)
            .ok_or_else(|| ClusterError::Protocol(format!("reply lacks --{}", key)))
    }

    /// Value for `key` parsed as `T`.
    pub fn parse_value<T>(&self, key: &str) -> ClusterResult<T>
    where
        T: FromStr,
    {
        let raw = self.require(key)?;
        raw.parse()
            .map_err(|_| ClusterError::Protocol(format!("invalid value for --{}: \"{}\"", key, raw)))
    }

    /// Value for `key` parsed as a boolean (`true`/`false`).
    pub fn flag(&self, key: &str) -> ClusterResult<bool> {
        match self.require(key)? {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(ClusterError::Protocol(format!(
                "invalid boolean for --{}: \"{}\"",
                key, other
            ))),
        }
    }
}

/// Accumulates tokens and renders one reply line.
#[derive(Debug, Default)]
pub struct OptWriter {
    tokens: Vec<(String, String)>,
}

impl OptWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token.
    pub fn push(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string().replace(char::is_whitespace, "_");
        self.tokens.push((key.to_string(), value));
    }

    /// Whether nothing was pushed.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Render as a single line (without newline).
    pub fn render(&self) -> String {
        self.tokens
            .iter()
            .map(|(k, v)| format!("--{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;

    #[test]
    fn test_parse_shutdown_reply() {
        let reply =
            OptReply::parse("db1", "--state=SHUTDOWN --last-checkpoint-lsn=0/5000028\n").unwrap();
        assert_eq!(reply.get("state"), Some("SHUTDOWN"));
        let lsn: Lsn = reply.parse_value("last-checkpoint-lsn").unwrap();
        assert_eq!(lsn.to_string(), "0/5000028");
    }

    #[test]
    fn test_empty_output_is_unreachable() {
        let err = OptReply::parse("db1", "").unwrap_err();
        assert!(matches!(err, ClusterError::Remote { .. }));
        let err = OptReply::parse("db1", "   \n").unwrap_err();
        assert!(matches!(err, ClusterError::Remote { .. }));
    }

    #[test]
    fn test_skips_leading_noise_lines() {
        let reply = OptReply::parse("db1", "Last login: today\n--paused=true\n").unwrap();
        assert!(reply.flag("paused").unwrap());
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(OptReply::parse("db1", "--status=OK junk").is_err());
        assert!(OptReply::parse("db1", "--=x").is_err());
        let reply = OptReply::parse("db1", "--paused=maybe").unwrap();
        assert!(reply.flag("paused").is_err());
        assert!(reply.require("term").is_err());
    }

    #[test]
    fn test_writer_preserves_order_and_escapes_spaces() {
        let mut w = OptWriter::new();
        w.push("status", "OK");
        w.push("detail", "two words");
        assert_eq!(w.render(), "--status=OK --detail=two_words");
    }
}
