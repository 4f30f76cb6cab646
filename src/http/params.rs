//! Request parameter normalization and validation.
//!
//! The public gateway accepts the same parameters through GET query
//! strings and POST bodies, under every capitalization the integrations
//! ever shipped (`tokenAddress`, `Token_Address`, `"Token Address"`, ...).
//! Names are canonicalized here; grammar checks run before any handler
//! logic touches the upstream.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::ApiError;
use crate::graph::types::{Direction, TimeWindow};
use crate::security;

/// Default traversal depth.
pub const DEFAULT_MAX_DEPTH: usize = 5;
/// Default activity limit.
pub const DEFAULT_LIMIT: usize = 100;
/// Largest accepted activity limit.
pub const MAX_LIMIT: usize = 1000;
/// Largest accepted trace batch.
pub const MAX_TRACE_BATCH: usize = 100;

/// Canonical name for a raw parameter key, if it is one we know.
fn canonical_key(raw: &str) -> Option<&'static str> {
    let folded: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    match folded.as_str() {
        "token" | "tokenaddress" | "tokenmint" | "mint" => Some("token"),
        "address" | "walletaddress" | "wallet" => Some("address"),
        "direction" => Some("direction"),
        "maxdepth" | "depth" => Some("maxDepth"),
        "timerange" => Some("timeRange"),
        "limit" => Some("limit"),
        "signature" => Some("signature"),
        "signatures" => Some("signatures"),
        "buildgraph" => Some("buildGraph"),
        "includeintent" => Some("includeIntent"),
        "email" => Some("email"),
        "fullname" => Some("fullName"),
        "companyname" => Some("companyName"),
        "plan" => Some("plan"),
        "name" => Some("name"),
        _ => None,
    }
}

/// Merge query-string pairs and an optional JSON body into one map of
/// canonical parameters. The body wins on conflicts.
pub fn normalize(query: &HashMap<String, String>, body: Option<&Value>) -> Map<String, Value> {
    let mut params = Map::new();
    for (key, value) in query {
        if let Some(canonical) = canonical_key(key) {
            params.insert(canonical.to_string(), Value::String(value.clone()));
        }
    }
    if let Some(Value::Object(object)) = body {
        for (key, value) in object {
            if let Some(canonical) = canonical_key(key) {
                params.insert(canonical.to_string(), value.clone());
            }
        }
    }
    params
}

pub fn str_param(params: &Map<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn usize_param(params: &Map<String, Value>, key: &str) -> Result<Option<usize>, ApiError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|v| Some(v as usize))
            .ok_or_else(|| ApiError::InvalidRequest(format!("{} must be a positive integer", key))),
        Some(Value::String(s)) => s
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ApiError::InvalidRequest(format!("{} must be a positive integer", key))),
        Some(_) => Err(ApiError::InvalidRequest(format!(
            "{} must be a positive integer",
            key
        ))),
    }
}

/// Required, grammar-checked token mint.
pub fn require_token(params: &Map<String, Value>) -> Result<String, ApiError> {
    let token = str_param(params, "token")
        .ok_or_else(|| ApiError::InvalidRequest("missing required parameter: token".into()))?;
    security::validate_mint(&token).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    Ok(token)
}

/// Required, grammar-checked wallet address.
pub fn require_address(params: &Map<String, Value>) -> Result<String, ApiError> {
    let address = str_param(params, "address")
        .ok_or_else(|| ApiError::InvalidRequest("missing required parameter: address".into()))?;
    security::validate_address(&address).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    Ok(address)
}

/// Traversal direction, defaulting to forward.
pub fn direction(params: &Map<String, Value>) -> Result<Direction, ApiError> {
    match str_param(params, "direction").as_deref() {
        None => Ok(Direction::Forward),
        Some(s) if s.eq_ignore_ascii_case("forward") => Ok(Direction::Forward),
        Some(s) if s.eq_ignore_ascii_case("backward") => Ok(Direction::Backward),
        Some(other) => Err(ApiError::InvalidRequest(format!(
            "direction must be forward or backward, got {}",
            other
        ))),
    }
}

/// Traversal depth: defaults to 5, clamped into [1, 10].
pub fn max_depth(params: &Map<String, Value>) -> Result<usize, ApiError> {
    Ok(usize_param(params, "maxDepth")?
        .unwrap_or(DEFAULT_MAX_DEPTH)
        .clamp(1, 10))
}

/// Activity limit: defaults to 100, rejects values beyond 1000.
pub fn limit(params: &Map<String, Value>) -> Result<usize, ApiError> {
    let limit = usize_param(params, "limit")?.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(ApiError::InvalidRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }
    Ok(limit)
}

fn time_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(d|h|m)$").expect("static regex"))
}

/// Parse the `timeRange` grammar `^(\d+)(d|h|m)$` with the unit caps
/// (1440 m, 720 h, 365 d). Out-of-range values are a 400, not a clamp.
pub fn parse_time_range(raw: &str) -> Result<TimeWindow, ApiError> {
    let captures = time_range_re()
        .captures(raw.trim())
        .ok_or_else(|| ApiError::InvalidRequest(format!("invalid timeRange: {}", raw)))?;
    let quantity: i64 = captures[1]
        .parse()
        .map_err(|_| ApiError::InvalidRequest(format!("invalid timeRange: {}", raw)))?;
    if quantity == 0 {
        return Err(ApiError::InvalidRequest(format!("invalid timeRange: {}", raw)));
    }

    let (cap, unit_secs) = match &captures[2] {
        "m" => (1440, 60),
        "h" => (720, 3600),
        "d" => (365, 86_400),
        _ => unreachable!("regex admits only d/h/m"),
    };
    if quantity > cap {
        return Err(ApiError::InvalidRequest(format!(
            "timeRange out of range: {} exceeds {}{}",
            raw, cap, &captures[2]
        )));
    }
    Ok(TimeWindow { seconds: quantity * unit_secs })
}

/// `timeRange` parameter, defaulting to 30 days.
pub fn time_range(params: &Map<String, Value>) -> Result<TimeWindow, ApiError> {
    match str_param(params, "timeRange") {
        Some(raw) => parse_time_range(&raw),
        None => Ok(TimeWindow::days(30)),
    }
}

/// Trace batch: 1..=100 grammar-checked signatures, validated before any
/// upstream call.
pub fn require_signatures(params: &Map<String, Value>) -> Result<Vec<String>, ApiError> {
    let Some(Value::Array(raw)) = params.get("signatures") else {
        return Err(ApiError::InvalidRequest(
            "signatures must be an array of transaction signatures".into(),
        ));
    };
    if raw.is_empty() || raw.len() > MAX_TRACE_BATCH {
        return Err(ApiError::InvalidRequest(format!(
            "signatures must contain between 1 and {} entries",
            MAX_TRACE_BATCH
        )));
    }
    let mut signatures = Vec::with_capacity(raw.len());
    for value in raw {
        let signature = value
            .as_str()
            .ok_or_else(|| ApiError::InvalidRequest("signatures must be strings".into()))?;
        security::validate_signature(signature)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        signatures.push(signature.to_string());
    }
    Ok(signatures)
}

pub fn bool_param(params: &Map<String, Value>, key: &str) -> bool {
    match params.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn params_from_body(body: Value) -> Map<String, Value> {
        normalize(&HashMap::new(), Some(&body))
    }

    #[test]
    fn alias_spellings_normalize_to_token() {
        for alias in ["tokenAddress", "Token_Address", "token_address", "TokenAddress", "Token Address"] {
            let mut query = HashMap::new();
            query.insert(alias.to_string(), MINT.to_string());
            let params = normalize(&query, None);
            assert_eq!(
                params.get("token").and_then(Value::as_str),
                Some(MINT),
                "alias {} did not normalize",
                alias
            );
        }
    }

    #[test]
    fn body_overrides_query() {
        let mut query = HashMap::new();
        query.insert("maxDepth".to_string(), "3".to_string());
        let body = serde_json::json!({"max_depth": 7});
        let params = normalize(&query, Some(&body));
        assert_eq!(max_depth(&params).unwrap(), 7);
    }

    #[test]
    fn max_depth_clamps_to_ceiling() {
        let params = params_from_body(serde_json::json!({"maxDepth": 11}));
        assert_eq!(max_depth(&params).unwrap(), 10);
        let params = params_from_body(serde_json::json!({"maxDepth": 0}));
        assert_eq!(max_depth(&params).unwrap(), 1);
        let params = params_from_body(serde_json::json!({}));
        assert_eq!(max_depth(&params).unwrap(), 5);
    }

    #[test]
    fn time_range_grammar_and_caps() {
        assert_eq!(parse_time_range("30d").unwrap(), TimeWindow::days(30));
        assert_eq!(parse_time_range("90m").unwrap().seconds, 90 * 60);
        assert_eq!(parse_time_range("720h").unwrap().seconds, 720 * 3600);
        assert!(parse_time_range("366d").is_err());
        assert!(parse_time_range("1441m").is_err());
        assert!(parse_time_range("721h").is_err());
        assert!(parse_time_range("30x").is_err());
        assert!(parse_time_range("d30").is_err());
        assert!(parse_time_range("0d").is_err());
    }

    #[test]
    fn limit_bounds() {
        let params = params_from_body(serde_json::json!({"limit": 1000}));
        assert_eq!(limit(&params).unwrap(), 1000);
        let params = params_from_body(serde_json::json!({"limit": 1001}));
        assert!(limit(&params).is_err());
        let params = params_from_body(serde_json::json!({}));
        assert_eq!(limit(&params).unwrap(), DEFAULT_LIMIT);
    }

    #[test]
    fn trace_batch_bounds() {
        let sig = "5".repeat(88);
        let params = params_from_body(serde_json::json!({"signatures": vec![sig.clone(); 100]}));
        assert_eq!(require_signatures(&params).unwrap().len(), 100);

        let params = params_from_body(serde_json::json!({"signatures": vec![sig.clone(); 101]}));
        assert!(require_signatures(&params).is_err());

        let params = params_from_body(serde_json::json!({"signatures": []}));
        assert!(require_signatures(&params).is_err());

        // Grammar is checked before anything touches the upstream.
        let params = params_from_body(serde_json::json!({"signatures": ["tooshort"]}));
        assert!(require_signatures(&params).is_err());
    }

    #[test]
    fn token_grammar_enforced() {
        let params = params_from_body(serde_json::json!({"token": "not-base58-0OIl"}));
        assert!(require_token(&params).is_err());
        let params = params_from_body(serde_json::json!({"token": MINT}));
        assert_eq!(require_token(&params).unwrap(), MINT);
    }
}
