//! Input validation and log-sanitization utilities.
//!
//! Address and signature grammar is enforced here, before any handler
//! logic runs. Secrets never reach the logs: anything key-shaped is
//! redacted by [`sanitize_for_logging`].

use anyhow::{anyhow, Result};
use regex::Regex;
use std::sync::OnceLock;

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("static regex"))
}

fn signature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{87,88}$").expect("static regex"))
}

/// Validate a base58 account address (32-44 chars, Bitcoin alphabet).
pub fn validate_address(address: &str) -> Result<()> {
    if address_re().is_match(address) {
        Ok(())
    } else {
        Err(anyhow!("invalid base58 address: expected 32-44 base58 characters"))
    }
}

/// Validate a token mint address. Same grammar as account addresses.
pub fn validate_mint(mint: &str) -> Result<()> {
    validate_address(mint).map_err(|_| anyhow!("invalid token mint address"))
}

/// Validate a transaction signature (87-88 base58 chars).
pub fn validate_signature(signature: &str) -> Result<()> {
    if signature_re().is_match(signature) {
        Ok(())
    } else {
        Err(anyhow!("invalid transaction signature: expected 87-88 base58 characters"))
    }
}

/// Validate a server secret (salt, admin key, webhook secret).
///
/// # Errors
/// Shorter than `min_len`, or equal to a known placeholder value.
pub fn validate_secret(
    name: &str,
    value: &str,
    min_len: usize,
    placeholders: &[&str],
) -> Result<()> {
    if value.len() < min_len {
        return Err(anyhow!("{} must be at least {} characters", name, min_len));
    }
    let lowered = value.to_ascii_lowercase();
    if placeholders.iter().any(|p| lowered == *p) {
        return Err(anyhow!("{} is set to a placeholder value", name));
    }
    Ok(())
}

/// Sanitize log output to prevent sensitive data leakage.
pub fn sanitize_for_logging(input: &str) -> String {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (r"tfa_live_[0-9a-f]{64}", "tfa_live_[REDACTED]"),
            (r"[a-zA-Z0-9]{64,}", "[REDACTED-KEY]"),
            (r"(?i)secret[=:]\s*\S+", "secret=[REDACTED]"),
            (r"(?i)salt[=:]\s*\S+", "salt=[REDACTED]"),
            (r"(?i)api[-_]?key[=:]\s*\S+", "api-key=[REDACTED]"),
        ]
        .iter()
        .filter_map(|(p, r)| Regex::new(p).ok().map(|re| (re, *r)))
        .collect()
    });

    let mut output = input.to_string();
    for (re, replacement) in patterns {
        output = re.replace_all(&output, *replacement).to_string();
    }
    output
}
