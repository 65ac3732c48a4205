use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Headers a caller is allowed to hand through to a function backend.
///
/// Everything else is stripped before forwarding, so callers cannot forge
/// platform-internal headers (`x-quiver-*`) on the backend side.
pub const HEADER_ALLOW_LIST: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "authorization",
    "cache-control",
    "content-type",
    "cookie",
    "user-agent",
];

pub fn is_forwardable(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    HEADER_ALLOW_LIST.contains(&lowered.as_str())
}

/// Filters an incoming header map down to the allow-listed entries, as
/// `reqwest` header pairs.
pub fn forwardable_headers(
    headers: &HeaderMap,
) -> Vec<(reqwest::header::HeaderName, reqwest::header::HeaderValue)> {
    let mut result = Vec::new();
    for (name, value) in headers.iter() {
        if !is_forwardable(name.as_str()) {
            continue;
        }

        if let (Ok(header_name), Ok(header_value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            result.push((header_name, header_value));
        }
    }
    result
}

/// Same filter, but collecting into the string map stored on a queued
/// invocation.
pub fn forwardable_header_map(
    headers: &HeaderMap,
) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| is_forwardable(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Builds an axum header pair for the platform request id.
pub fn request_id_header(request_id: &str) -> Option<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_static(quiver_protocol::invoke::REQUEST_ID_HEADER);
    HeaderValue::from_str(request_id).ok().map(|value| (name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_headers_are_not_forwardable() {
        assert!(!is_forwardable("x-quiver-request-id"));
        assert!(!is_forwardable("x-quiver-user"));
        assert!(!is_forwardable("host"));
        assert!(!is_forwardable("x-forwarded-for"));
    }

    #[test]
    fn common_request_headers_pass() {
        assert!(is_forwardable("content-type"));
        assert!(is_forwardable("Content-Type"));
        assert!(is_forwardable("authorization"));
        assert!(is_forwardable("accept"));
    }

    #[test]
    fn filtering_drops_everything_not_listed() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("x-quiver-request-id", HeaderValue::from_static("forged"));
        headers.insert("x-custom", HeaderValue::from_static("nope"));

        let forwarded = forwardable_headers(&headers);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0.as_str(), "content-type");

        let map = forwardable_header_map(&headers);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("content-type"));
    }
}
