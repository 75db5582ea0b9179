//! Guard patterns and command triggers.
//!
//! A guard is a regular expression that must match the *whole* message text
//! for a transition to fire. Patterns are compiled when the flow is built, so
//! a malformed pattern is reported by the builder and never at dispatch time.
//!
//! Full-match semantics are obtained by wrapping the source in an anchored
//! non-capturing group, so `Boy|Girl` accepts `"Boy"` but not `"Boyish"`.
//! Patterns that already carry `^...$` anchors behave the same either way.

use crate::error::CoreError;
use regex::Regex;
use std::fmt;

/// A compiled, full-match guard pattern.
#[derive(Clone)]
pub struct GuardPattern {
    source: String,
    regex: Regex,
}

impl GuardPattern {
    /// Compiles a guard from its source pattern.
    pub fn new(source: &str) -> Result<Self, CoreError> {
        if source.is_empty() {
            return Err(CoreError::InvalidGuard {
                pattern: String::new(),
                reason: "empty guard pattern".to_string(),
            });
        }

        let anchored = format!("^(?:{})$", source);
        let regex = Regex::new(&anchored).map_err(|e| CoreError::InvalidGuard {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// Returns true if the pattern matches the entire text.
    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Returns the pattern as written by the flow author.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for GuardPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GuardPattern").field(&self.source).finish()
    }
}

impl PartialEq for GuardPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for GuardPattern {}

/// A slash command such as `/start` or `/cancel`.
///
/// Matches when the first whitespace-separated token of the text is
/// `/name` or `/name@botname`. Trailing arguments are allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let name = name.trim_start_matches('/').to_string();
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if `text` invokes this command.
    pub fn matches(&self, text: &str) -> bool {
        let Some(token) = text.split_whitespace().next() else {
            return false;
        };
        let Some(invoked) = token.strip_prefix('/') else {
            return false;
        };
        let invoked = match invoked.split_once('@') {
            Some((cmd, bot)) if !bot.is_empty() => cmd,
            Some(_) => return false,
            None => invoked,
        };
        invoked == self.name
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.name)
    }
}
