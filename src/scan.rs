// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Secret detection and redaction.
//!
//! The scanner checks raw bytes against an ordered pattern table and reports
//! where secrets live, never what they are. Findings only carry byte offsets,
//! so they are safe to log.
//!
//! Redaction swaps each finding's span for [`REDACTION_MARKER`]. Lines are
//! never dropped, which keeps the rest of the file byte-identical and lets the
//! vault splice originals back in by offset.

pub mod policy;

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    ops::Range,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Fixed replacement for redacted spans.
pub const REDACTION_MARKER: &str = "***REDACTED***";

const BINARY_SNIFF_LEN: usize = 8192;

const FALSE_POSITIVE_MARKERS: &[&str] = &[
    "example",
    "dummy",
    "sample",
    "your_key_here",
    "your-key-here",
    "xxx",
    "placeholder",
    "<your",
    "${",
    "{{",
];

const BUILTIN_PATTERNS: &[(&str, Severity, Scope, &str)] = &[
    (
        "Private Key",
        Severity::Critical,
        Scope::Block,
        r"(?s)-----BEGIN[ A-Z]*PRIVATE KEY-----.*?(?:-----END[ A-Z]*PRIVATE KEY-----|\z)",
    ),
    (
        "AWS Access Key ID",
        Severity::Critical,
        Scope::Line,
        r"AKIA[0-9A-Z]{16}",
    ),
    (
        "AWS Secret Key",
        Severity::Critical,
        Scope::Line,
        r#"(?i)aws_secret_access_key\s*[=:]\s*['"]?(?P<secret>[^'"\s]+)"#,
    ),
    (
        "GitHub Token",
        Severity::High,
        Scope::Line,
        r"gh[ps]_[a-zA-Z0-9]{36}",
    ),
    (
        "Generic API Key",
        Severity::High,
        Scope::Line,
        r#"(?i)(?:api[_-]?key|apikey)\s*[=:]\s*['"]?(?P<secret>[\w-]{20,})"#,
    ),
    (
        "Password Assignment",
        Severity::High,
        Scope::Line,
        r#"(?i)(?:password|passwd|pwd)\s*[=:]\s*['"]?(?P<secret>[^'"\r\n]+)"#,
    ),
    (
        "Bearer Token",
        Severity::High,
        Scope::Line,
        r"(?i)bearer\s+(?P<secret>[a-zA-Z0-9._-]+)",
    ),
    (
        "Auth Token",
        Severity::High,
        Scope::Line,
        r#"(?i)(?:auth[_-]?token|token)\s*[=:]\s*['"]?(?P<secret>[\w-]{20,})"#,
    ),
    (
        "JWT Token",
        Severity::Medium,
        Scope::Line,
        r"eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+",
    ),
    (
        "Generic Secret",
        Severity::Medium,
        Scope::Line,
        r#"(?i)(?:secret|credential)\s*[=:]\s*['"]?(?P<secret>[^'"\r\n]+)"#,
    ),
];

/// Severity of a finding, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Display for Severity {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Low => fmt.write_str("low"),
            Self::Medium => fmt.write_str("medium"),
            Self::High => fmt.write_str("high"),
            Self::Critical => fmt.write_str("critical"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Line,
    Block,
}

/// How a pattern is applied to content.
#[derive(Clone, Debug)]
pub enum Matcher {
    /// Applied to each line on its own.
    Line(Regex),

    /// Applied to whole content, may span lines.
    Block(Regex),
}

/// Named detection rule.
#[derive(Clone, Debug)]
pub struct SecretPattern {
    pub name: String,
    pub severity: Severity,
    pub matcher: Matcher,
}

/// User supplied detection rule.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CustomPattern {
    pub name: String,
    pub regex: String,
    pub severity: Severity,
}

/// Located secret.
///
/// Holds offsets only. The secret itself is never copied into a finding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretFinding {
    pub pattern_name: String,
    pub severity: Severity,
    pub file_path: Option<PathBuf>,
    pub line_number: usize,
    pub span: Range<usize>,
}

impl SecretFinding {
    /// Attach file path to finding.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Check if finding aborts strict mode.
    pub fn is_blocking(&self) -> bool {
        self.severity >= Severity::High
    }
}

impl Display for SecretFinding {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let path = self
            .file_path
            .as_deref()
            .map(Path::display)
            .map(|path| path.to_string())
            .unwrap_or_else(|| "<content>".into());
        write!(
            fmt,
            "{path}:{}: {} ({}), bytes {}..{}",
            self.line_number, self.pattern_name, self.severity, self.span.start, self.span.end
        )
    }
}

/// Stateless secret scanner over an ordered pattern table.
#[derive(Clone, Debug)]
pub struct SecretScanner {
    patterns: Vec<SecretPattern>,
}

impl SecretScanner {
    /// Construct scanner with built-in patterns only.
    pub fn new() -> Self {
        let patterns = BUILTIN_PATTERNS
            .iter()
            .filter_map(|(name, severity, scope, expr)| {
                // INVARIANT: Built-in expressions are constant and known to compile.
                let regex = Regex::new(expr).ok()?;
                let matcher = match scope {
                    Scope::Line => Matcher::Line(regex),
                    Scope::Block => Matcher::Block(regex),
                };
                Some(SecretPattern {
                    name: (*name).to_string(),
                    severity: *severity,
                    matcher,
                })
            })
            .collect();

        Self { patterns }
    }

    /// Construct scanner with built-in patterns followed by custom ones.
    ///
    /// # Errors
    ///
    /// - Return [`ScanError::PatternCompilation`] if a custom expression is
    ///   invalid.
    pub fn with_custom(custom: &[CustomPattern]) -> Result<Self> {
        let mut scanner = Self::new();
        for pattern in custom {
            let regex = Regex::new(&pattern.regex).map_err(|source| ScanError::PatternCompilation {
                name: pattern.name.clone(),
                source,
            })?;
            scanner.patterns.push(SecretPattern {
                name: pattern.name.clone(),
                severity: pattern.severity,
                matcher: Matcher::Line(regex),
            });
        }

        Ok(scanner)
    }

    pub fn patterns(&self) -> &[SecretPattern] {
        &self.patterns
    }

    /// Scan content for secrets.
    ///
    /// Findings are sorted by span start, then by pattern order. Never fails.
    pub fn scan(&self, content: &[u8]) -> Vec<SecretFinding> {
        let lines = line_starts(content);
        let mut findings = Vec::new();

        for (order, pattern) in self.patterns.iter().enumerate() {
            match &pattern.matcher {
                Matcher::Line(regex) => {
                    for (index, start) in lines.iter().enumerate() {
                        let end = lines.get(index + 1).copied().unwrap_or(content.len());
                        let line = &content[*start..end];
                        if is_false_positive(line) {
                            continue;
                        }

                        for span in match_spans(regex, line) {
                            let span = (start + span.start)..(start + span.end);
                            findings.push((order, finding(pattern, index + 1, span)));
                        }
                    }
                }
                Matcher::Block(regex) => {
                    for span in match_spans(regex, content) {
                        let index = line_index(&lines, span.start);
                        let end = lines.get(index + 1).copied().unwrap_or(content.len());
                        if is_false_positive(&content[lines[index]..end]) {
                            continue;
                        }
                        findings.push((order, finding(pattern, index + 1, span)));
                    }
                }
            }
        }

        // INVARIANT: Already redacted spans are not secrets anymore.
        findings.retain(|(_, finding)| !contains_marker(&content[finding.span.clone()]));
        findings.sort_by_key(|(order, finding)| (finding.span.start, *order));
        debug!("scan produced {} findings", findings.len());

        findings.into_iter().map(|(_, finding)| finding).collect()
    }
}

impl Default for SecretScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Content with secrets swapped for [`REDACTION_MARKER`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Redacted {
    pub content: Vec<u8>,
    pub spans: Vec<RedactedSpan>,
}

/// One replaced span.
#[derive(Clone, PartialEq, Eq)]
pub struct RedactedSpan {
    /// Original bytes that were replaced.
    pub original: Vec<u8>,

    /// Offset of marker in redacted content.
    pub offset: usize,
}

impl std::fmt::Debug for RedactedSpan {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("RedactedSpan")
            .field("original", &format_args!("<{} bytes>", self.original.len()))
            .field("offset", &self.offset)
            .finish()
    }
}

/// Replace every finding span with [`REDACTION_MARKER`].
///
/// Overlapping or touching spans are merged into one marker.
pub fn redact(content: &[u8], findings: &[SecretFinding]) -> Redacted {
    let mut spans: Vec<Range<usize>> = findings
        .iter()
        .map(|finding| finding.span.clone())
        .filter(|span| span.start < span.end && span.end <= content.len())
        .collect();
    spans.sort_by_key(|span| span.start);

    let mut merged: Vec<Range<usize>> = Vec::new();
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }

    let mut redacted = Redacted::default();
    let mut cursor = 0;
    for span in merged {
        redacted.content.extend_from_slice(&content[cursor..span.start]);
        redacted.spans.push(RedactedSpan {
            original: content[span.clone()].to_vec(),
            offset: redacted.content.len(),
        });
        redacted.content.extend_from_slice(REDACTION_MARKER.as_bytes());
        cursor = span.end;
    }
    redacted.content.extend_from_slice(&content[cursor..]);

    redacted
}

/// Guess whether content is binary.
///
/// Content with a null byte in its first 8 KiB counts as binary.
pub fn is_binary(content: &[u8]) -> bool {
    content[..content.len().min(BINARY_SNIFF_LEN)].contains(&0)
}

fn finding(pattern: &SecretPattern, line_number: usize, span: Range<usize>) -> SecretFinding {
    SecretFinding {
        pattern_name: pattern.name.clone(),
        severity: pattern.severity,
        file_path: None,
        line_number,
        span,
    }
}

fn match_spans(regex: &Regex, haystack: &[u8]) -> Vec<Range<usize>> {
    regex
        .captures_iter(haystack)
        .filter_map(|captures| captures.name("secret").or_else(|| captures.get(0)))
        .map(|found| found.range())
        .filter(|span| !span.is_empty())
        .collect()
}

fn line_starts(content: &[u8]) -> Vec<usize> {
    let mut starts = vec![0];
    starts.extend(
        content
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte == b'\n')
            .map(|(index, _)| index + 1)
            .filter(|start| *start < content.len()),
    );
    starts
}

fn line_index(starts: &[usize], offset: usize) -> usize {
    match starts.binary_search(&offset) {
        Ok(index) => index,
        Err(index) => index.saturating_sub(1),
    }
}

fn is_false_positive(line: &[u8]) -> bool {
    let line = line.to_ascii_lowercase();
    FALSE_POSITIVE_MARKERS
        .iter()
        .any(|marker| contains(&line, marker.as_bytes()))
}

fn contains_marker(span: &[u8]) -> bool {
    contains(span, REDACTION_MARKER.as_bytes())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Secret scanning error types.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Custom pattern is not a valid regular expression.
    #[error("secret pattern {name:?} does not compile")]
    PatternCompilation {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = ScanError> = std::result::Result<T, E>;
