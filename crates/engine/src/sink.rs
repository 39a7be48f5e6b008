//! External record sink forwarding.

use crate::config::ToolCommand;
use crate::launcher::CommandLine;
use regex::Regex;
use std::sync::LazyLock;
use tqbundle_common::{Error, Result};
use url::Url;

const MASK: &str = "****";

/// Query parameters whose values are credentials.
static SENSITIVE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(pass(word)?|pwd|secret|token|api[_-]?key|access[_-]?key|auth(orization)?)$")
        .unwrap()
});

/// Forwarding request as received: a URI plus an explicit opt-in.
#[derive(Debug, Clone, Default)]
pub struct SinkDirective {
    pub uri: Option<String>,
    pub forward: bool,
}

impl SinkDirective {
    pub fn new(uri: Option<String>, forward: bool) -> Self {
        Self { uri, forward }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Both a non-empty URI and the opt-in are present.
    pub fn is_requested(&self) -> bool {
        self.forward && self.uri.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// Parsed target, or `None` when forwarding was not requested.
    pub fn target(&self) -> Result<Option<SinkTarget>> {
        if !self.is_requested() {
            return Ok(None);
        }
        let raw = self.uri.as_deref().unwrap_or_default();
        SinkTarget::parse(raw).map(Some)
    }
}

/// A validated sink URI.
#[derive(Debug, Clone)]
pub struct SinkTarget {
    raw: String,
    url: Url,
}

impl SinkTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let url = Url::parse(raw)
            .map_err(|e| Error::SinkForwardingFailed(format!("Invalid sink URI: {}", e)))?;
        if url.cannot_be_a_base() {
            return Err(Error::SinkForwardingFailed(format!(
                "Invalid sink URI: scheme {:?} has no endpoint",
                url.scheme()
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            url,
        })
    }

    /// URI with password and credential parameters masked.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some(MASK));
        }
        if url.query().is_some() {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| {
                    let value = if SENSITIVE_KEY.is_match(&k) {
                        MASK.to_string()
                    } else {
                        v.into_owned()
                    };
                    (k.into_owned(), value)
                })
                .collect();
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        url.to_string()
    }

    /// Replace the raw URI wherever it appears in `text`.
    pub fn redact_text(&self, text: &str) -> String {
        text.replace(&self.raw, &self.redacted())
    }

    /// Render `cmd` for logs and audit with the URI masked in each argument.
    pub fn redacted_command(&self, cmd: &CommandLine) -> String {
        let redacted = self.redacted();
        CommandLine::new(cmd.program.clone())
            .args(cmd.args.iter().map(|arg| arg.replace(&self.raw, &redacted)))
            .display()
    }

    /// Sink writer command reading records on stdin.
    pub fn writer_command(&self, writer: &ToolCommand) -> CommandLine {
        writer.command_line().arg("-w").arg(self.raw.clone())
    }
}
