//! Line-oriented rule file reader used by the interface, route and NAT tables.

use crate::error::NetError;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Whitespace-separated fields of one rule, with its 1-based line number.
pub(crate) struct RuleLine<'a> {
    pub line: usize,
    pub fields: Vec<&'a str>,
}

impl RuleLine<'_> {
    pub fn error(&self, reason: impl Into<String>) -> NetError {
        NetError::InvalidRule {
            line: self.line,
            reason: reason.into(),
        }
    }

    /// Require between `min` and `max` fields.
    pub fn expect_fields(&self, min: usize, max: usize) -> Result<(), NetError> {
        let n = self.fields.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(self.error(format!("expected {expected} fields, found {n}")));
        }
        Ok(())
    }

    pub fn ip(&self, index: usize, what: &str) -> Result<Ipv4Addr, NetError> {
        self.parse(index, what)
    }

    pub fn parse<T: FromStr>(&self, index: usize, what: &str) -> Result<T, NetError> {
        let field = self.fields[index];
        field
            .parse()
            .map_err(|_| self.error(format!("invalid {what} '{field}'")))
    }
}

/// Split rule text into lines, skipping blanks and `#` comments.
pub(crate) fn lines(text: &str) -> impl Iterator<Item = RuleLine<'_>> {
    text.lines().enumerate().filter_map(|(index, raw)| {
        let content = raw.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            return None;
        }
        Some(RuleLine {
            line: index + 1,
            fields: content.split_whitespace().collect(),
        })
    })
}
