//! Deduplication keys for statements.
//!
//! Two strategies coexist because captured workloads mix parameterized
//! statements (where the text is already shape-stable) with plain-text
//! statements that inline their literals:
//!
//! - [`FingerprintStrategy::Exact`]: whitespace-collapsed text. Two texts that
//!   differ only in literal values are different statements.
//! - [`FingerprintStrategy::Normalized`]: literals and every bind-marker style
//!   collapse to `?`, comments are dropped and keywords/identifiers are
//!   lower-cased, so the key identifies the query shape.
//!
//! Bind values never participate in either key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::lexer::{tokenize, Token};

/// How a statement's fingerprint is derived from its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintStrategy {
    /// Exact text, whitespace-collapsed.
    #[default]
    Exact,
    /// Query shape with literals and bind markers normalized.
    Normalized,
}

impl FingerprintStrategy {
    /// Canonical text the fingerprint is computed from.
    pub fn canonicalize(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut pending_space = false;

        for token in tokenize(sql) {
            let piece: std::borrow::Cow<'_, str> = match (self, token) {
                (_, Token::Space(_)) => {
                    pending_space = true;
                    continue;
                }
                (FingerprintStrategy::Normalized, Token::Comment(_)) => {
                    pending_space = true;
                    continue;
                }
                (FingerprintStrategy::Exact, Token::Comment(text))
                | (FingerprintStrategy::Exact, Token::Str(text))
                | (FingerprintStrategy::Exact, Token::Word(text))
                | (FingerprintStrategy::Exact, Token::Number(text)) => text.into(),
                (FingerprintStrategy::Exact, Token::Bind(marker)) => marker.text.into(),
                (FingerprintStrategy::Normalized, Token::Str(_))
                | (FingerprintStrategy::Normalized, Token::Number(_))
                | (FingerprintStrategy::Normalized, Token::Bind(_)) => "?".into(),
                (FingerprintStrategy::Normalized, Token::Word(text)) => {
                    text.to_lowercase().into()
                }
                (_, Token::QuotedIdent(text)) | (_, Token::Symbol(text)) => text.into(),
            };

            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push_str(&piece);
        }

        out
    }

    /// SHA-256 hex digest of the canonical text.
    pub fn fingerprint(&self, sql: &str) -> String {
        let canonical = self.canonicalize(sql);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
