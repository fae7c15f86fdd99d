//! PII detection and redaction.
//!
//! [`PiiSanitizer::sanitize`] produces a redacted copy of an event:
//!
//! - `key=value` / `key: value` idioms for API keys and passwords have their value redacted
//!   while the key and separator are kept. These run before everything else.
//! - Strings are scanned against the enabled [`PatternKind`]s and any custom patterns; each
//!   match becomes the redaction token.
//! - Object keys that name a sensitive field (case-insensitive) have their whole value
//!   replaced, whatever its type, without descending into it.
//! - Arrays are mapped element-wise; numbers, booleans and nulls pass through.
//!
//! The transform keeps the shape of its input (same keys, same array lengths and order) and
//! is idempotent: sanitizing sanitized output changes nothing. A replacement can expose a new
//! match (a token creates a word boundary), so strings are rescanned until they stop changing.
//! A pattern that matches the redaction token itself is rejected at construction.

use crate::config::PiiConfig;
use crate::event::TelemetryEvent;
use once_cell::sync::Lazy;
use regex::{Captures, NoExpand, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

/// Rescans of one string before giving up on a fixpoint.
const MAX_PASSES: usize = 8;

/// Built-in kinds of sensitive substring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatternKind {
    /// Provider API keys and bearer tokens (`sk-…`, `AKIA…`, `ghp_…`, `Bearer …`).
    ApiKey,
    Email,
    /// 16-digit card numbers, optionally grouped by spaces or dashes.
    CreditCard,
    /// US social security numbers (`123-45-6789`).
    Ssn,
    /// North-American style phone numbers with optional country code.
    Phone,
}

impl PatternKind {
    /// Every kind, in the order they are applied.
    pub const ALL: [PatternKind; 5] = [
        PatternKind::ApiKey,
        PatternKind::Email,
        PatternKind::CreditCard,
        PatternKind::Ssn,
        PatternKind::Phone,
    ];

    fn regex(self) -> &'static Regex {
        match self {
            PatternKind::ApiKey => &API_KEY,
            PatternKind::Email => &EMAIL,
            PatternKind::CreditCard => &CREDIT_CARD,
            PatternKind::Ssn => &SSN,
            PatternKind::Phone => &PHONE,
        }
    }
}

static API_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\b(?:sk|pk|rk)-(?:[A-Za-z]+-)?[A-Za-z0-9_-]{16,}",
        r"|\bAKIA[0-9A-Z]{16}\b",
        r"|\bgh[pousr]_[A-Za-z0-9]{36,}\b",
        r"|\bBearer\s+[A-Za-z0-9._~+/-]{8,}=*",
    ))
    .expect("static api key pattern")
});

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static email pattern")
});

static CREDIT_CARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b").expect("static credit card pattern")
});

static SSN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("static ssn pattern"));

static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+\d{1,3}[-.\s]?)?(?:\(\d{3}\)\s?|\b\d{3}[-.\s]?)\d{3}[-.\s]?\d{4}\b")
        .expect("static phone pattern")
});

// Group 1 is the key plus separator, which survives redaction.
static API_KEY_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b((?:api[_-]?key|access[_-]?token|auth[_-]?token|secret[_-]?key|client[_-]?secret)\s*[:=]\s*)["']?[^\s"',;&]+["']?"#,
    )
    .expect("static api key assignment pattern")
});

static PASSWORD_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b((?:password|passwd|pwd)\s*[:=]\s*)["']?[^\s"',;&]+["']?"#)
        .expect("static password assignment pattern")
});

/// Errors building a sanitizer.
#[derive(Debug, Error)]
pub enum SanitizerError {
    #[error("invalid custom PII pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("pattern `{pattern}` matches the redaction token `{token}`")]
    PatternMatchesToken { pattern: String, token: String },
}

/// Pattern-based PII redactor.
#[derive(Debug, Clone)]
pub struct PiiSanitizer {
    enabled: bool,
    token: String,
    kinds: Vec<PatternKind>,
    custom: Vec<Regex>,
    sensitive_fields: HashSet<String>,
}

impl PiiSanitizer {
    /// Build from configuration, compiling custom patterns.
    pub fn new(config: &PiiConfig) -> Result<Self, SanitizerError> {
        let token = config.redaction_token.clone();

        let kinds: Vec<PatternKind> =
            PatternKind::ALL.into_iter().filter(|k| config.patterns.contains(k)).collect();
        for kind in &kinds {
            if kind.regex().is_match(&token) {
                return Err(SanitizerError::PatternMatchesToken {
                    pattern: format!("{kind:?}"),
                    token,
                });
            }
        }

        let mut custom = Vec::with_capacity(config.custom_patterns.len());
        for pattern in &config.custom_patterns {
            let regex = Regex::new(pattern).map_err(|source| SanitizerError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            if regex.is_match(&token) {
                return Err(SanitizerError::PatternMatchesToken { pattern: pattern.clone(), token });
            }
            custom.push(regex);
        }

        Ok(Self {
            enabled: config.enabled,
            token,
            kinds,
            custom,
            sensitive_fields: config.sensitive_fields.iter().map(|f| f.to_lowercase()).collect(),
        })
    }

    /// A sanitizer that returns events unchanged.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            kinds: Vec::new(),
            custom: Vec::new(),
            sensitive_fields: HashSet::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn redaction_token(&self) -> &str {
        &self.token
    }

    /// Redacted copy of `event`. Only `label`, `metadata` and `context` are inspected.
    pub fn sanitize(&self, event: &TelemetryEvent) -> TelemetryEvent {
        if !self.enabled {
            return event.clone();
        }
        TelemetryEvent {
            label: event.label.as_deref().map(|l| self.sanitize_str(l)),
            metadata: self.sanitize_map(&event.metadata),
            context: self.sanitize_map(&event.context),
            ..event.clone()
        }
    }

    /// Redacted copy of an arbitrary JSON value.
    pub fn sanitize_value(&self, value: &Value) -> Value {
        if !self.enabled {
            return value.clone();
        }
        self.walk(value)
    }

    /// Redact sensitive substrings in one string.
    pub fn sanitize_str(&self, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }
        let mut out = text.to_string();
        for _ in 0..MAX_PASSES {
            let next = self.redact_pass(&out);
            if next == out {
                return out;
            }
            out = next;
        }
        tracing::debug!(passes = MAX_PASSES, "redaction did not settle");
        out
    }

    fn redact_pass(&self, text: &str) -> String {
        let mut out = self.redact_assignment(text.to_string(), &API_KEY_ASSIGNMENT);
        out = self.redact_assignment(out, &PASSWORD_ASSIGNMENT);
        for kind in &self.kinds {
            out = self.redact_matches(out, kind.regex());
        }
        for regex in &self.custom {
            out = self.redact_matches(out, regex);
        }
        out
    }

    /// Whether `name` is a sensitive field name.
    pub fn is_sensitive_field(&self, name: &str) -> bool {
        self.sensitive_fields.contains(&name.to_lowercase())
    }

    /// Enabled built-in kinds that occur in `text`.
    pub fn detect(&self, text: &str) -> Vec<PatternKind> {
        self.kinds.iter().copied().filter(|k| k.regex().is_match(text)).collect()
    }

    fn sanitize_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let value = if self.is_sensitive_field(key) {
                    Value::String(self.token.clone())
                } else {
                    self.walk(value)
                };
                (key.clone(), value)
            })
            .collect()
    }

    fn walk(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize_str(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.walk(v)).collect()),
            Value::Object(map) => Value::Object(self.sanitize_map(map)),
            other => other.clone(),
        }
    }

    fn redact_matches(&self, text: String, regex: &Regex) -> String {
        if !regex.is_match(&text) {
            return text;
        }
        regex.replace_all(&text, NoExpand(&self.token)).into_owned()
    }

    fn redact_assignment(&self, text: String, regex: &Regex) -> String {
        if !regex.is_match(&text) {
            return text;
        }
        regex
            .replace_all(&text, |caps: &Captures<'_>| {
                let prefix = caps.get(1).map_or("", |m| m.as_str());
                let value_start = caps.get(1).map_or(0, |m| m.end());
                // Already redacted; tokens containing spaces would otherwise grow on every pass.
                // Only the token is skipped, whatever the match swallowed after it is rescanned.
                if text[value_start..].starts_with(self.token.as_str()) {
                    let token_end = value_start + self.token.len();
                    let match_end = caps.get(0).map_or(token_end, |m| m.end());
                    if match_end <= token_end {
                        return caps[0].to_string();
                    }
                    let rest = self.redact_assignment(text[token_end..match_end].to_string(), regex);
                    return format!("{prefix}{}{rest}", self.token);
                }
                format!("{prefix}{}", self.token)
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    fn sanitizer() -> PiiSanitizer {
        PiiSanitizer::new(&PiiConfig::default()).expect("default config")
    }

    fn event(metadata: Value) -> TelemetryEvent {
        let mut raw = TelemetryEvent::builder("s1", EventType::Custom, "agent", "tool_call")
            .label("contact jane.doe@example.com")
            .build();
        raw.metadata = metadata.as_object().cloned().unwrap_or_default();
        raw.stamp(|| "e1".into(), 1)
    }

    #[test]
    fn redacts_builtin_kinds() {
        let s = sanitizer();
        assert_eq!(s.sanitize_str("mail bob@corp.io now"), "mail [REDACTED] now");
        assert_eq!(s.sanitize_str("ssn 123-45-6789"), "ssn [REDACTED]");
        assert_eq!(s.sanitize_str("card 4111 1111 1111 1111."), "card [REDACTED].");
        assert_eq!(s.sanitize_str("call (555) 123-4567"), "call [REDACTED]");
        assert_eq!(s.sanitize_str("call +1 555-123-4567"), "call [REDACTED]");
        assert_eq!(
            s.sanitize_str("key sk-ant-REDACTED"),
            "key [REDACTED]"
        );
        assert_eq!(s.sanitize_str("Bearer abcdefgh.ijkl"), "[REDACTED]");
    }

    #[test]
    fn assignment_idioms_keep_the_key() {
        let s = sanitizer();
        assert_eq!(s.sanitize_str("api_key=abc123XYZ&x=1"), "api_key=[REDACTED]&x=1");
        assert_eq!(s.sanitize_str("password: \"hunter2\""), "password: [REDACTED]");
        assert_eq!(s.sanitize_str("PWD=letmein"), "PWD=[REDACTED]");
    }

    #[test]
    fn leaves_clean_text_alone() {
        let s = sanitizer();
        assert_eq!(s.sanitize_str("build finished in 42 ms"), "build finished in 42 ms");
        assert!(s.detect("nothing to see").is_empty());
        assert_eq!(s.detect("a@b.co and 123-45-6789"), vec![PatternKind::Email, PatternKind::Ssn]);
    }

    #[test]
    fn sensitive_fields_are_replaced_wholesale() {
        let s = sanitizer();
        let out = s.sanitize(&event(json!({
            "Password": { "nested": "value" },
            "token": 12345,
            "user": { "apiKey": ["a", "b"], "name": "Ann" }
        })));
        assert_eq!(out.metadata["Password"], json!("[REDACTED]"));
        assert_eq!(out.metadata["token"], json!("[REDACTED]"));
        assert_eq!(out.metadata["user"]["apiKey"], json!("[REDACTED]"));
        assert_eq!(out.metadata["user"]["name"], json!("Ann"));
        assert_eq!(out.label.as_deref(), Some("contact [REDACTED]"));
    }

    #[test]
    fn preserves_structure_and_non_string_leaves() {
        let s = sanitizer();
        let input = event(json!({
            "emails": ["a@x.io", "plain", 7, null, true],
            "depth": { "one": { "two": "call 555.123.4567" } },
            "ratio": 0.5
        }));
        let out = s.sanitize(&input);
        let keys_in: Vec<_> = input.metadata.keys().collect();
        let keys_out: Vec<_> = out.metadata.keys().collect();
        assert_eq!(keys_in, keys_out);
        assert_eq!(out.metadata["emails"], json!(["[REDACTED]", "plain", 7, null, true]));
        assert_eq!(out.metadata["depth"]["one"]["two"], json!("call [REDACTED]"));
        assert_eq!(out.metadata["ratio"], json!(0.5));
        assert_eq!(out.id, input.id);
        assert_eq!(out.category, input.category);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let s = sanitizer();
        let input = event(json!({
            "msg": "password=hunter2 api-key: sk-live-0123456789abcdefXYZ from a@b.com",
            "list": ["4111-1111-1111-1111", { "secret": "x" }],
        }));
        let once = s.sanitize(&input);
        let twice = s.sanitize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn idempotent_with_spaced_token() {
        let config = PiiConfig { redaction_token: "<pii removed>".into(), ..PiiConfig::default() };
        let s = PiiSanitizer::new(&config).unwrap();
        let once = s.sanitize_str("password=hunter2 next");
        assert_eq!(once, "password=<pii removed> next");
        assert_eq!(s.sanitize_str(&once), once);
    }

    #[test]
    fn custom_patterns_apply_after_builtins() {
        let config = PiiConfig {
            custom_patterns: vec![r"ACCT-\d{6}".into()],
            ..PiiConfig::default()
        };
        let s = PiiSanitizer::new(&config).unwrap();
        assert_eq!(s.sanitize_str("acct ACCT-123456 ok"), "acct [REDACTED] ok");
    }

    #[test]
    fn secrets_exposed_by_a_replacement_are_caught_in_one_call() {
        let config = PiiConfig {
            custom_patterns: vec![r"ACCT-\d{6}".into()],
            ..PiiConfig::default()
        };
        let s = PiiSanitizer::new(&config).unwrap();
        let cases = [
            ("ACCT-123456password=hunter2", "[REDACTED]password=[REDACTED]"),
            ("ACCT-123456sk-abcdefghijklmnopqrstu", "[REDACTED][REDACTED]"),
            ("ACCT-123456123-45-6789", "[REDACTED][REDACTED]"),
        ];
        for (input, expected) in cases {
            let once = s.sanitize_str(input);
            assert_eq!(once, expected, "input: {input}");
            assert_eq!(s.sanitize_str(&once), once, "input: {input}");
        }
    }

    #[test]
    fn assignment_after_a_token_is_still_redacted() {
        let s = sanitizer();
        let once = s.sanitize_str("password=[REDACTED]password=hunter2");
        assert!(!once.contains("hunter2"), "leaked: {once}");
        assert_eq!(s.sanitize_str(&once), once);

        let noisy = "Bearer  password=[REDACTED][REDACTED]password='ghp_@";
        let once = s.sanitize_str(noisy);
        assert_eq!(s.sanitize_str(&once), once);
    }

    #[test]
    fn rejects_invalid_and_token_matching_patterns() {
        let bad = PiiConfig { custom_patterns: vec!["(".into()], ..PiiConfig::default() };
        assert!(matches!(PiiSanitizer::new(&bad), Err(SanitizerError::InvalidPattern { .. })));

        let greedy = PiiConfig { custom_patterns: vec!["RED".into()], ..PiiConfig::default() };
        assert!(matches!(
            PiiSanitizer::new(&greedy),
            Err(SanitizerError::PatternMatchesToken { .. })
        ));
    }

    #[test]
    fn respects_selected_kinds_and_disabled_flag() {
        let only_email = PiiConfig { patterns: vec![PatternKind::Email], ..PiiConfig::default() };
        let s = PiiSanitizer::new(&only_email).unwrap();
        assert_eq!(s.sanitize_str("a@b.io 123-45-6789"), "[REDACTED] 123-45-6789");

        let off = PiiConfig { enabled: false, ..PiiConfig::default() };
        let s = PiiSanitizer::new(&off).unwrap();
        let input = event(json!({ "password": "x" }));
        assert_eq!(s.sanitize(&input), input);
        assert_eq!(PiiSanitizer::disabled().sanitize(&input), input);
    }
}
