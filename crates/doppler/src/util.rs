// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions for drain configuration.

use crate::errors::DrainUrlError;

const SYSLOG_SCHEME: &str = "syslog://";

/// Parses a syslog drain URL into the `host:port` address to dial.
///
/// A valid drain URL must:
/// - Use the `syslog://` scheme
/// - Name a host and a non-zero port
///
/// Whitespace is trimmed and anything after the authority (path, query) is ignored.
///
/// # Examples
///
/// ```
/// use doppler::util::parse_drain_url;
///
/// assert_eq!(parse_drain_url("syslog://logs.example.com:514").unwrap(), "logs.example.com:514");
/// assert!(parse_drain_url("https://logs.example.com").is_err());
/// assert!(parse_drain_url("syslog://logs.example.com").is_err());
/// ```
pub fn parse_drain_url(drain_url: &str) -> Result<String, DrainUrlError> {
    let trimmed = drain_url.trim();
    let Some(rest) = trimmed.strip_prefix(SYSLOG_SCHEME) else {
        return Err(DrainUrlError::UnsupportedScheme(trimmed.to_string()));
    };

    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let Some((host, port)) = authority.rsplit_once(':') else {
        return Err(DrainUrlError::MissingAddress(trimmed.to_string()));
    };
    if host.is_empty() {
        return Err(DrainUrlError::MissingAddress(trimmed.to_string()));
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(format!("{host}:{port}")),
        _ => Err(DrainUrlError::InvalidPort(trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drain_url_valid() {
        assert_eq!(
            parse_drain_url("syslog://127.0.0.1:6514"),
            Ok("127.0.0.1:6514".to_string())
        );
        assert_eq!(
            parse_drain_url("  syslog://drain.example.com:514/path?x=1 "),
            Ok("drain.example.com:514".to_string())
        );
        assert_eq!(
            parse_drain_url("syslog://[::1]:514"),
            Ok("[::1]:514".to_string())
        );
    }

    #[test]
    fn test_parse_drain_url_bad_scheme() {
        assert_eq!(
            parse_drain_url("http://example.com:514"),
            Err(DrainUrlError::UnsupportedScheme(
                "http://example.com:514".to_string()
            ))
        );
        assert!(parse_drain_url("example.com:514").is_err());
    }

    #[test]
    fn test_parse_drain_url_missing_parts() {
        assert!(matches!(
            parse_drain_url("syslog://example.com"),
            Err(DrainUrlError::MissingAddress(_))
        ));
        assert!(matches!(
            parse_drain_url("syslog://:514"),
            Err(DrainUrlError::MissingAddress(_))
        ));
        assert!(matches!(
            parse_drain_url("syslog://example.com:0"),
            Err(DrainUrlError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_drain_url("syslog://example.com:notaport"),
            Err(DrainUrlError::InvalidPort(_))
        ));
    }
}
