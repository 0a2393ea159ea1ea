use crate::constants::redaction::MAX_DETAIL_STRING;
use crate::errors::{ErrorCode, RequestError};
use crate::services::transport::TransportResponse;
use crate::utils::redact::{redact_object, redact_text};
use serde_json::Value;

/// Turns a raw upstream reply into the normalized payload or a classified error.
pub fn normalize_response(response: &TransportResponse) -> Result<Value, RequestError> {
    let parsed = response.json();
    if !response.is_success() {
        return Err(classify_failure(response, parsed.as_ref()));
    }

    let Some(body) = parsed else {
        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        return Ok(Value::String(response.text()));
    };

    // Some CMS servlets answer 200 and report the failure in the body.
    if let Some(embedded) = embedded_failure_status(&body) {
        let mut err = classify_status(embedded, extract_message(&body));
        err = err.with_details(error_details(response.status, &body));
        return Err(err);
    }
    if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
        let message = extract_message(&body).unwrap_or_else(|| "Upstream reported failure".to_string());
        let code = classify_message(&message).unwrap_or(ErrorCode::ServerError);
        return Err(RequestError::new(code, message).with_details(error_details(response.status, &body)));
    }
    Ok(body)
}

fn embedded_failure_status(body: &Value) -> Option<u16> {
    let raw = body
        .get("status.code")
        .or_else(|| body.get("status").and_then(|s| s.get("code")))?;
    let code = raw
        .as_u64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))?;
    if (400..=599).contains(&code) {
        Some(code as u16)
    } else {
        None
    }
}

fn classify_failure(response: &TransportResponse, body: Option<&Value>) -> RequestError {
    let message = body.and_then(extract_message).or_else(|| {
        let text = response.text();
        let trimmed = text.trim();
        (!trimmed.is_empty() && !trimmed.starts_with('<')).then(|| trimmed.chars().take(200).collect())
    });
    let mut err = classify_status(response.status, message);
    if let Some(after) = response.header("retry-after").and_then(parse_retry_after) {
        err = err.with_retry_after(after);
    }
    let details = match body {
        Some(body) => error_details(response.status, body),
        None => serde_json::json!({
            "status": response.status,
            "body": redact_text(&response.text(), MAX_DETAIL_STRING),
        }),
    };
    err.with_details(details)
}

/// Status-range mapping into the error taxonomy.
pub fn classify_status(status: u16, message: Option<String>) -> RequestError {
    let text = |fallback: &str| {
        message
            .clone()
            .unwrap_or_else(|| format!("{} ({})", fallback, status))
    };
    match status {
        401 => RequestError::authentication(text("Authentication required")),
        403 => RequestError::authorization(text("Access denied")),
        404 | 410 => RequestError::not_found(text("Resource not found")),
        408 => RequestError::timeout(text("Upstream request timeout")),
        429 => RequestError::server(text("Too many requests")).with_retryable(true),
        400..=499 => RequestError::validation(text("Request rejected")),
        500..=599 => RequestError::server(text("Upstream server error")),
        _ => RequestError::unknown(text("Unexpected upstream status")),
    }
}

/// Keyword classification for failures reported without a usable status.
pub fn classify_message(message: &str) -> Option<ErrorCode> {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(&["timed out", "timeout"]) {
        Some(ErrorCode::TimeoutError)
    } else if has(&["unauthorized", "unauthenticated", "authentication", "login required"]) {
        Some(ErrorCode::AuthenticationError)
    } else if has(&["forbidden", "access denied", "permission", "not allowed"]) {
        Some(ErrorCode::AuthorizationError)
    } else if has(&["not found", "no such", "does not exist"]) {
        Some(ErrorCode::NotFoundError)
    } else if has(&["invalid", "validation", "malformed", "required", "already exists"]) {
        Some(ErrorCode::ValidationError)
    } else if has(&["connection", "network", "refused", "unreachable"]) {
        Some(ErrorCode::NetworkError)
    } else {
        None
    }
}

/// Pulls a human-readable message out of the usual error shapes.
pub fn extract_message(body: &Value) -> Option<String> {
    let candidates = [
        body.get("error"),
        body.get("exception"),
        body.get("message"),
        body.get("status.message"),
        body.get("status").and_then(|s| s.get("message")),
        body.get("title"),
    ];
    candidates.into_iter().flatten().find_map(|value| match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty()),
        _ => None,
    })
}

/// `Retry-After` as milliseconds: delta-seconds or an HTTP date.
pub fn parse_retry_after(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(secs.saturating_mul(1000));
    }
    let at = chrono::DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.num_milliseconds().max(0) as u64)
}

fn error_details(status: u16, body: &Value) -> Value {
    serde_json::json!({
        "status": status,
        "body": redact_object(body, MAX_DETAIL_STRING),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn reply(status: u16, body: &str) -> TransportResponse {
        TransportResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn status_ranges_map_into_taxonomy() {
        let cases = [
            (400, ErrorCode::ValidationError),
            (401, ErrorCode::AuthenticationError),
            (403, ErrorCode::AuthorizationError),
            (404, ErrorCode::NotFoundError),
            (409, ErrorCode::ValidationError),
            (410, ErrorCode::NotFoundError),
            (408, ErrorCode::TimeoutError),
            (422, ErrorCode::ValidationError),
            (429, ErrorCode::ServerError),
            (500, ErrorCode::ServerError),
            (503, ErrorCode::ServerError),
            (302, ErrorCode::UnknownError),
        ];
        for (status, code) in cases {
            assert_eq!(classify_status(status, None).code, code, "status {}", status);
        }
        assert!(!classify_status(404, None).recoverable);
        assert!(classify_status(502, None).recoverable);
    }

    #[test]
    fn throttled_reply_carries_retry_after() {
        let mut response = reply(429, "");
        response
            .headers
            .insert("retry-after".to_string(), "3".to_string());
        let err = normalize_response(&response).expect_err("throttled");
        assert_eq!(err.code, ErrorCode::ServerError);
        assert_eq!(err.retry_after_ms, Some(3000));
        assert_eq!(err.retryable, Some(true));
    }

    #[test]
    fn error_bodies_provide_message_and_are_redacted() {
        let err = normalize_response(&reply(
            500,
            r#"{"exception":{"message":"javax.jcr.RepositoryException"},"password":"hunter2"}"#,
        ))
        .expect_err("server error");
        assert_eq!(err.message, "javax.jcr.RepositoryException");
        let details = err.details.expect("details").to_string();
        assert!(!details.contains("hunter2"));
    }

    #[test]
    fn success_status_with_failure_body() {
        let err = normalize_response(&reply(
            200,
            r#"{"status.code":409,"status.message":"Node already exists"}"#,
        ))
        .expect_err("embedded failure");
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert_eq!(err.message, "Node already exists");

        let err = normalize_response(&reply(200, r#"{"success":false,"error":"Package not found"}"#))
            .expect_err("flagged failure");
        assert_eq!(err.code, ErrorCode::NotFoundError);

        let err = normalize_response(&reply(200, r#"{"success":false}"#)).expect_err("bare failure");
        assert_eq!(err.code, ErrorCode::ServerError);
    }

    #[test]
    fn success_payloads_pass_through() {
        assert_eq!(
            normalize_response(&reply(200, r#"{"jcr:title":"Home"}"#)).expect("ok"),
            serde_json::json!({"jcr:title": "Home"})
        );
        assert_eq!(normalize_response(&reply(204, "")).expect("ok"), Value::Null);
        assert_eq!(
            normalize_response(&reply(200, "<html>ok</html>")).expect("ok"),
            Value::String("<html>ok</html>".to_string())
        );
        assert!(normalize_response(&reply(200, r#"{"status.code":201}"#)).is_ok());
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        assert_eq!(parse_retry_after("120"), Some(120_000));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), Some(0));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn message_keywords() {
        assert_eq!(classify_message("Read timed out"), Some(ErrorCode::TimeoutError));
        assert_eq!(classify_message("Access denied for user"), Some(ErrorCode::AuthorizationError));
        assert_eq!(classify_message("something odd"), None);
    }
}
