use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as JsonValue;

use vxproxy_provider_core::ResolveError;

static PROJECT_RE: OnceLock<Regex> = OnceLock::new();

fn project_re() -> &'static Regex {
    PROJECT_RE.get_or_init(|| {
        Regex::new(r"projects/([^/\s]+)/locations/").expect("project id pattern is valid")
    })
}

/// Reads the project id out of a probe answer.
///
/// Vertex Express rejects a generate call against an unknown publisher model
/// with a 404 whose message names the key's project:
/// `Publisher Model `projects/<id>/locations/global/publishers/google/models/...` not found.`
pub(crate) fn parse_probe(status: u16, body: &[u8]) -> Result<String, ResolveError> {
    if status == 429 || (500..600).contains(&status) {
        return Err(ResolveError::Transient(format!("probe answered {status}")));
    }

    let message = error_message(body);
    if status == 404 {
        let haystack = match message.as_deref() {
            Some(message) => message,
            None => std::str::from_utf8(body).unwrap_or_default(),
        };
        if let Some(project) = project_re()
            .captures(haystack)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
        {
            return Ok(project);
        }
    }

    Err(ResolveError::Unresolvable(match message {
        Some(message) => format!("probe answered {status}: {message}"),
        None => format!("probe answered {status}"),
    }))
}

fn error_message(body: &[u8]) -> Option<String> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    // Errors come back either as an object or wrapped in a one-element array.
    let error = match &value {
        JsonValue::Array(items) => items.first()?.get("error")?,
        other => other.get("error")?,
    };
    error
        .get("message")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_is_read_from_not_found_message() {
        let body = br#"{"error":{"code":404,"message":"Publisher Model `projects/my-proj-123/locations/global/publishers/google/models/gemini-2.6-pro` not found.","status":"NOT_FOUND"}}"#;
        assert_eq!(parse_probe(404, body), Ok("my-proj-123".to_string()));
    }

    #[test]
    fn array_wrapped_errors_are_understood() {
        let body = br#"[{"error":{"code":404,"message":"projects/p-9/locations/global/x","status":"NOT_FOUND"}}]"#;
        assert_eq!(parse_probe(404, body), Ok("p-9".to_string()));
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(matches!(
            parse_probe(503, b"unavailable"),
            Err(ResolveError::Transient(_))
        ));
        assert!(matches!(parse_probe(429, b""), Err(ResolveError::Transient(_))));
    }

    #[test]
    fn invalid_key_is_unresolvable() {
        let body = br#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT"}}"#;
        let err = parse_probe(400, body).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("API key not valid"));
    }

    #[test]
    fn project_pattern_outside_a_not_found_is_ignored() {
        let body = br#"{"error":{"code":403,"message":"Permission denied on projects/p-1/locations/global"}}"#;
        assert!(matches!(parse_probe(403, body), Err(ResolveError::Unresolvable(_))));

        let body = br#"{"candidates":[{"content":{"parts":[{"text":"projects/p-2/locations/x"}]}}]}"#;
        assert!(matches!(parse_probe(200, body), Err(ResolveError::Unresolvable(_))));
    }
}
