//! Endpoint URL construction.
//!
//! A socket is configured with a base endpoint such as
//! `wss://example.com/socket`. The transport suffix (`websocket` or
//! `longpoll`) is appended, followed by the connection params and the
//! protocol version as query parameters.

use serde_json::Value;
use thiserror::Error;
use url::form_urlencoded;
use url::Url;

/// Endpoint errors.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// A path-absolute endpoint needs a host from the page context.
    #[error("Endpoint `{0}` is relative and no host is available")]
    MissingHost(String),

    /// The resulting URL does not parse.
    #[error("Invalid endpoint `{url}`: {source}")]
    Invalid {
        /// The URL that failed to parse.
        url: String,
        /// Parse error.
        #[source]
        source: url::ParseError,
    },
}

/// Environment the endpoint is resolved against.
///
/// Relative endpoints (`/socket` or `//host/socket`) borrow the scheme and
/// host of the hosting page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    /// Whether the hosting context is secure (selects `wss`).
    pub secure: bool,
    /// Host (and port) of the hosting context.
    pub host: Option<String>,
}

impl PageContext {
    /// Create a page context.
    #[must_use]
    pub fn new(secure: bool, host: Option<String>) -> Self {
        Self { secure, host }
    }

    /// The WebSocket scheme matching this context.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }
}

/// Build the full endpoint URL for a transport.
///
/// # Errors
///
/// Returns an error if the endpoint is path-absolute and the context has no
/// host, or if the final URL does not parse.
pub fn endpoint_url(
    base: &str,
    suffix: &str,
    params: &Value,
    vsn: &str,
    context: &PageContext,
) -> Result<String, EndpointError> {
    let mut query = form_urlencoded::Serializer::new(String::new());
    append_params(&mut query, None, params);
    query.append_pair("vsn", vsn);

    let path = format!("{}/{}", base.trim_end_matches('/'), suffix);
    let separator = if path.contains('?') { '&' } else { '?' };
    let uri = format!("{path}{separator}{}", query.finish());

    let resolved = if uri.starts_with("//") {
        format!("{}:{uri}", context.scheme())
    } else if uri.starts_with('/') {
        let host = context
            .host
            .as_deref()
            .ok_or_else(|| EndpointError::MissingHost(base.to_string()))?;
        format!("{}://{host}{uri}", context.scheme())
    } else {
        uri
    };

    Url::parse(&resolved).map_err(|source| EndpointError::Invalid {
        url: resolved.clone(),
        source,
    })?;
    Ok(resolved)
}

/// Flatten params into query pairs; nested keys become `parent[child]`.
fn append_params(
    query: &mut form_urlencoded::Serializer<'_, String>,
    parent: Option<&str>,
    value: &Value,
) {
    let nested_key = |key: &str| match parent {
        Some(parent) => format!("{parent}[{key}]"),
        None => key.to_string(),
    };

    match value {
        Value::Object(map) => {
            for (key, value) in map {
                append_params(query, Some(&nested_key(key)), value);
            }
        }
        Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                append_params(query, Some(&nested_key(&index.to_string())), value);
            }
        }
        Value::Null => {}
        Value::String(s) => {
            if let Some(key) = parent {
                query.append_pair(key, s);
            }
        }
        other => {
            if let Some(key) = parent {
                query.append_pair(key, &other.to_string());
            }
        }
    }
}
