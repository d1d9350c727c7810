//! tus request router
//!
//! Maps method + path onto a [`TusOperation`] relative to the configured
//! path prefix. The collection (`/files`) accepts POST and OPTIONS; a
//! resource (`/files/{id}`) accepts HEAD, PATCH, GET, DELETE and OPTIONS.

use crate::storage::is_valid_id;
use thiserror::Error;

/// Header clients behind restrictive proxies use to tunnel PATCH/DELETE
pub const METHOD_OVERRIDE_HEADER: &str = "x-http-method-override";

/// Router errors
#[derive(Error, Debug, PartialEq)]
pub enum RouterError {
    /// Path is outside the prefix, or names no valid upload
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),
}

/// tus operation types
#[derive(Debug, Clone, PartialEq)]
pub enum TusOperation {
    /// POST {prefix}
    Create,
    /// OPTIONS {prefix} or {prefix}/{id}
    Options { upload_id: Option<String> },
    /// HEAD {prefix}/{id}
    Head { upload_id: String },
    /// PATCH {prefix}/{id}
    Append { upload_id: String },
    /// GET {prefix}/{id}
    Download { upload_id: String },
    /// DELETE {prefix}/{id}
    Delete { upload_id: String },
}

impl TusOperation {
    /// Operation name, as passed to the authorizer and used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Options { .. } => "options",
            Self::Head { .. } => "head",
            Self::Append { .. } => "append",
            Self::Download { .. } => "download",
            Self::Delete { .. } => "delete",
        }
    }

    pub fn upload_id(&self) -> Option<&str> {
        match self {
            Self::Create => None,
            Self::Options { upload_id } => upload_id.as_deref(),
            Self::Head { upload_id }
            | Self::Append { upload_id }
            | Self::Download { upload_id }
            | Self::Delete { upload_id } => Some(upload_id),
        }
    }
}

/// tus Request Parser
pub struct TusRequestParser;

impl TusRequestParser {
    /// Parse an HTTP request into a tus operation.
    ///
    /// `method_override` is the value of `X-HTTP-Method-Override`; it only
    /// applies to POST requests.
    pub fn parse(
        method: &str,
        method_override: Option<&str>,
        path: &str,
        prefix: &str,
    ) -> Result<TusOperation, RouterError> {
        let method = match method_override {
            Some(over) if method.eq_ignore_ascii_case("POST") => over.trim().to_ascii_uppercase(),
            _ => method.to_ascii_uppercase(),
        };

        let rest = Self::strip_prefix(path, prefix)
            .ok_or_else(|| RouterError::NotFound(path.to_string()))?;

        if rest.is_empty() {
            return match method.as_str() {
                "POST" => Ok(TusOperation::Create),
                "OPTIONS" => Ok(TusOperation::Options { upload_id: None }),
                other => Err(RouterError::MethodNotAllowed(format!(
                    "{} on the upload collection",
                    other
                ))),
            };
        }

        if !is_valid_id(rest) {
            return Err(RouterError::NotFound(path.to_string()));
        }
        let upload_id = rest.to_string();

        match method.as_str() {
            "HEAD" => Ok(TusOperation::Head { upload_id }),
            "PATCH" => Ok(TusOperation::Append { upload_id }),
            "GET" => Ok(TusOperation::Download { upload_id }),
            "DELETE" => Ok(TusOperation::Delete { upload_id }),
            "OPTIONS" => Ok(TusOperation::Options {
                upload_id: Some(upload_id),
            }),
            other => Err(RouterError::MethodNotAllowed(format!(
                "{} on an upload",
                other
            ))),
        }
    }

    /// Path after the prefix, without surrounding slashes. Matches on a
    /// segment boundary so `/files2` is not under `/files`.
    fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
        let prefix = prefix.trim_end_matches('/');
        let after = path.strip_prefix(prefix)?;
        if !after.is_empty() && !after.starts_with('/') {
            return None;
        }
        Some(after.trim_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_parse_create() {
        let op = TusRequestParser::parse("POST", None, "/files", "/files").unwrap();
        assert_eq!(op, TusOperation::Create);
        let op = TusRequestParser::parse("POST", None, "/files/", "/files").unwrap();
        assert_eq!(op, TusOperation::Create);
    }

    #[test]
    fn test_parse_resource_methods() {
        let path = format!("/files/{}", ID);
        let op = TusRequestParser::parse("PATCH", None, &path, "/files").unwrap();
        assert_eq!(op, TusOperation::Append { upload_id: ID.into() });
        let op = TusRequestParser::parse("HEAD", None, &path, "/files").unwrap();
        assert_eq!(op.name(), "head");
        assert_eq!(op.upload_id(), Some(ID));
    }

    #[test]
    fn test_method_override() {
        let path = format!("/files/{}", ID);
        let op = TusRequestParser::parse("POST", Some("delete"), &path, "/files").unwrap();
        assert_eq!(op, TusOperation::Delete { upload_id: ID.into() });
    }

    #[test]
    fn test_prefix_boundary() {
        let result = TusRequestParser::parse("POST", None, "/files2", "/files");
        assert!(matches!(result, Err(RouterError::NotFound(_))));
    }

    #[test]
    fn test_invalid_id() {
        let result = TusRequestParser::parse("HEAD", None, "/files/../etc", "/files");
        assert!(matches!(result, Err(RouterError::NotFound(_))));
    }

    #[test]
    fn test_method_not_allowed() {
        let result = TusRequestParser::parse("PUT", None, "/files", "/files");
        assert!(matches!(result, Err(RouterError::MethodNotAllowed(_))));
    }
}
