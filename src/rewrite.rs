//! Response body rewriting
use serde::{Deserialize, Serialize};

/// What a matching rule does to the response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewriteAction {
  /// Replace every occurrence of `pattern` with `replacement`.
  StringReplace {
    /// literal text to look for
    pattern: String,
    /// text written in its place
    replacement: String,
  },
  /// Insert `text` before the body.
  PrependAtHead {
    /// inserted text
    text: String,
  },
  /// Append `text` after the body.
  AppendAtTail {
    /// appended text
    text: String,
  },
}

impl RewriteAction {
  /// Apply the action to a decoded body.
  pub fn apply(&self, body: &[u8]) -> Vec<u8> {
    match self {
      RewriteAction::StringReplace {
        pattern,
        replacement,
      } => replace_all(body, pattern.as_bytes(), replacement.as_bytes()),
      RewriteAction::PrependAtHead { text } => {
        let mut out = Vec::with_capacity(text.len() + body.len());
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(body);
        out
      }
      RewriteAction::AppendAtTail { text } => {
        let mut out = Vec::with_capacity(text.len() + body.len());
        out.extend_from_slice(body);
        out.extend_from_slice(text.as_bytes());
        out
      }
    }
  }
}

fn replace_all(body: &[u8], pattern: &[u8], replacement: &[u8]) -> Vec<u8> {
  if pattern.is_empty() || pattern.len() > body.len() {
    return body.to_vec();
  }
  let mut out = Vec::with_capacity(body.len());
  let mut i = 0;
  while i < body.len() {
    if body[i..].starts_with(pattern) {
      out.extend_from_slice(replacement);
      i += pattern.len();
    } else {
      out.push(body[i]);
      i += 1;
    }
  }
  out
}

/// A response rewrite keyed by a URL substring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
  /// substring the request URL must contain
  pub url_match: String,
  /// body transformation
  pub action: RewriteAction,
  /// disabled rules never match
  #[serde(default = "enabled_by_default")]
  pub enabled: bool,
}

fn enabled_by_default() -> bool {
  true
}

impl RewriteRule {
  /// New enabled rule.
  pub fn new(url_match: impl Into<String>, action: RewriteAction) -> Self {
    RewriteRule {
      url_match: url_match.into(),
      action,
      enabled: true,
    }
  }

  /// Whether the rule applies to `url`.
  pub fn matches(&self, url: &str) -> bool {
    self.enabled && url.contains(&self.url_match)
  }

  /// Apply the rule's action.
  pub fn apply(&self, body: &[u8]) -> Vec<u8> {
    self.action.apply(body)
  }
}

/// The active rule set. The first matching enabled rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteRules {
  pub(crate) enabled: bool,
  pub(crate) rules: Vec<RewriteRule>,
}

impl RewriteRules {
  pub(crate) fn new(enabled: bool, rules: Vec<RewriteRule>) -> Self {
    RewriteRules { enabled, rules }
  }

  /// Rule to apply for `url`, if rewriting is on.
  pub fn first_match(&self, url: &str) -> Option<&RewriteRule> {
    if !self.enabled {
      return None;
    }
    self.rules.iter().find(|rule| rule.matches(url))
  }
}
