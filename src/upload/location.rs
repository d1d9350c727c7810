//! Location URL builder
//!
//! Builds the absolute URL returned in the creation response. Forwarded proxy
//! headers win over the values of the direct connection.

/// Request values needed to build an upload URL
#[derive(Debug, Clone, Default)]
pub struct LocationParts<'a> {
    /// `Host` header of the direct connection
    pub host: Option<&'a str>,
    /// `X-Forwarded-Proto`
    pub forwarded_proto: Option<&'a str>,
    /// `X-Forwarded-Host`
    pub forwarded_host: Option<&'a str>,
    /// Scheme of the direct connection
    pub scheme: Option<&'a str>,
}

/// First value of a possibly comma-separated forwarded header
fn first_value(value: Option<&str>) -> Option<&str> {
    value
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Build `<proto>://<host><prefix>/<id>`.
///
/// Falls back to `http` and `localhost` when the request carries neither.
pub fn build_location_url(parts: &LocationParts<'_>, path_prefix: &str, id: &str) -> String {
    let proto = first_value(parts.forwarded_proto)
        .or(parts.scheme)
        .unwrap_or("http");
    let host = first_value(parts.forwarded_host)
        .or_else(|| first_value(parts.host))
        .unwrap_or("localhost");
    let prefix = path_prefix.trim_end_matches('/');

    format!("{}://{}{}/{}", proto, host, prefix, id)
}
