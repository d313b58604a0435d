//! Endpoint URL validation.

use agent_link_core::TransportError;
use url::Url;

/// Normalize an endpoint into a WebSocket URL.
///
/// `http(s)://` is rewritten to `ws(s)://`; trailing slashes are trimmed.
///
/// # Errors
/// Returns [`TransportError::InvalidEndpoint`] if the URL does not parse,
/// uses any other scheme or has no host.
pub fn normalize_endpoint(url: &str) -> Result<String, TransportError> {
    let mut parsed = Url::parse(url.trim())
        .map_err(|e| TransportError::InvalidEndpoint(format!("{url}: {e}")))?;

    let scheme = match parsed.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported URL scheme {other}: {url}"
            )));
        }
    };
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(TransportError::InvalidEndpoint(format!("missing host: {url}")));
    }
    parsed
        .set_scheme(scheme)
        .map_err(|()| TransportError::InvalidEndpoint(format!("cannot use {scheme}: {url}")))?;

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}
