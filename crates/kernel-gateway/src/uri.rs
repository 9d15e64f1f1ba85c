//! Gateway URI discovery from unstructured stdout.
//!
//! The kernel gateway prints its listening address in a log line such as
//! `[KernelGatewayApp] Jupyter Kernel Gateway at http://127.0.0.1:8888`. This
//! is the only bridge between log text and connection state, so it is kept
//! as a small parser with its own tests.

/// Marker searched for in gateway stdout lines.
pub const DEFAULT_URI_MARKER: &str = "http://";

/// Characters that may trail a URI in prose but are never part of it.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ')', ']', '"', '\'', '>'];

/// Extract a gateway URI from one stdout line.
///
/// The marker may appear anywhere in the line. The URI runs from the marker to
/// the first whitespace or control character (ANSI colour codes included), minus
/// trailing punctuation. Returns an empty string when the marker is absent or
/// nothing follows it.
pub fn extract_gateway_uri(line: &str, marker: &str) -> String {
    if marker.is_empty() {
        return String::new();
    }
    let Some(start) = line.find(marker) else {
        return String::new();
    };

    let rest = &line[start..];
    let end = rest
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || c.is_control())
        .map(|(i, _)| i)
        .unwrap_or(rest.len());

    let candidate = rest[..end].trim_end_matches(TRAILING_PUNCTUATION);
    if candidate.len() <= marker.len() {
        return String::new();
    }
    candidate.to_string()
}

/// Derive the streaming-transport URI by swapping the scheme:
/// `http` → `ws`, `https` → `wss`. Other schemes are returned unchanged.
pub fn websocket_uri(http_uri: &str) -> String {
    if let Some(rest) = http_uri.strip_prefix("https") {
        format!("wss{}", rest)
    } else if let Some(rest) = http_uri.strip_prefix("http") {
        format!("ws{}", rest)
    } else {
        http_uri.to_string()
    }
}
