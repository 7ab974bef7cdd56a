//! Startup options for a [`crate::context::Context`].
//!
//! Options arrive as an ordered list of `(key, value)` string pairs — the
//! shape the C ABI receives them in, and are parsed once, at
//! `init` time, into this typed, validated struct. Unlike almost every
//! other failure in this crate, a bad option is not a programming error: it
//! originates outside the process, so parsing returns a [`ConfigError`]
//! instead of panicking.

use std::net::SocketAddr;

use crate::error::ConfigError;

/// Image quality selector: either a fixed JPEG quality or PNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultQuality {
    Jpeg(u32),
    Png,
}

impl DefaultQuality {
    /// Numeric encoding used on the wire and in `Window::quality` (spec
    /// §3): 101 means PNG, otherwise the JPEG quality itself.
    pub fn as_numeric(self) -> u32 {
        match self {
            DefaultQuality::Jpeg(q) => q,
            DefaultQuality::Png => 101,
        }
    }
}

/// HTTP Basic Auth credentials, if configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAuthCredentials {
    pub username: String,
    pub password: String,
}

const ENV_AUTH_VAR: &str = "BROWSERVICE_HTTP_AUTH_CREDENTIALS";

/// Validated, typed configuration for a `Context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub default_quality: DefaultQuality,
    pub http_listen_addr: SocketAddr,
    pub http_max_threads: usize,
    pub http_auth: Option<HttpAuthCredentials>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_quality: DefaultQuality::Png,
            http_listen_addr: "127.0.0.1:8080".parse().unwrap(),
            http_max_threads: default_http_max_threads(),
            http_auth: None,
        }
    }
}

fn default_http_max_threads() -> usize {
    num_cpus::get().max(1) * 4
}

impl Config {
    /// Parses an ordered option list into a `Config`, applying defaults for
    /// any option left unspecified.
    pub fn parse(options: &[(String, String)]) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for (key, value) in options {
            match key.as_str() {
                "default-quality" => {
                    config.default_quality = parse_default_quality(value)?;
                }
                "http-listen-addr" => {
                    config.http_listen_addr = value.parse().map_err(|_| ConfigError::InvalidValue {
                        key: key.clone(),
                        reason: format!("'{value}' is not a valid IP:PORT address"),
                    })?;
                }
                "http-max-threads" => {
                    config.http_max_threads = value.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                        ConfigError::InvalidValue {
                            key: key.clone(),
                            reason: format!("'{value}' is not a positive integer"),
                        }
                    })?;
                }
                "http-auth" => {
                    config.http_auth = parse_http_auth(value).map_err(|reason| ConfigError::InvalidValue {
                        key: key.clone(),
                        reason,
                    })?;
                }
                other => return Err(ConfigError::UnknownOption(other.to_string())),
            }
        }

        Ok(config)
    }
}

fn parse_default_quality(value: &str) -> Result<DefaultQuality, ConfigError> {
    if value.eq_ignore_ascii_case("png") {
        return Ok(DefaultQuality::Png);
    }
    match value.parse::<u32>() {
        Ok(q) if (10..=100).contains(&q) => Ok(DefaultQuality::Jpeg(q)),
        _ => Err(ConfigError::InvalidValue {
            key: "default-quality".to_string(),
            reason: format!("'{value}' must be 'PNG' or an integer in 10..=100"),
        }),
    }
}

fn parse_http_auth(value: &str) -> Result<Option<HttpAuthCredentials>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    let raw = if value == "env" {
        std::env::var(ENV_AUTH_VAR).map_err(|_| format!("environment variable {ENV_AUTH_VAR} is not set"))?
    } else {
        value.to_string()
    };
    let (user, password) = raw
        .split_once(':')
        .ok_or_else(|| format!("'{raw}' is not in USER:PASSWORD form"))?;
    if user.is_empty() {
        return Err("username must not be empty".to_string());
    }
    Ok(Some(HttpAuthCredentials {
        username: user.to_string(),
        password: password.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::parse(&[]).unwrap();
        assert_eq!(config.default_quality, DefaultQuality::Png);
        assert_eq!(config.http_listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert!(config.http_auth.is_none());
    }

    #[test]
    fn accepts_valid_options() {
        let options = vec![
            ("default-quality".to_string(), "80".to_string()),
            ("http-listen-addr".to_string(), "0.0.0.0:9000".to_string()),
            ("http-max-threads".to_string(), "16".to_string()),
            ("http-auth".to_string(), "alice:secret".to_string()),
        ];
        let config = Config::parse(&options).unwrap();
        assert_eq!(config.default_quality, DefaultQuality::Jpeg(80));
        assert_eq!(config.http_listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.http_max_threads, 16);
        assert_eq!(
            config.http_auth,
            Some(HttpAuthCredentials {
                username: "alice".to_string(),
                password: "secret".to_string(),
            })
        );
    }

    #[test]
    fn rejects_unknown_option() {
        let err = Config::parse(&[("nonexistent".to_string(), "x".to_string())]).unwrap_err();
        assert_eq!(err, ConfigError::UnknownOption("nonexistent".to_string()));
    }

    #[test]
    fn rejects_out_of_range_quality() {
        for bad in ["0", "9", "101", "102", "notanumber"] {
            let err = Config::parse(&[("default-quality".to_string(), bad.to_string())]);
            assert!(err.is_err(), "{bad} should have been rejected");
        }
    }

    #[test]
    fn rejects_malformed_listen_addr() {
        let err = Config::parse(&[("http-listen-addr".to_string(), "not-an-addr".to_string())]);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_malformed_auth() {
        let err = Config::parse(&[("http-auth".to_string(), "no-colon-here".to_string())]);
        assert!(err.is_err());
    }

    #[test]
    fn empty_auth_disables_basic_auth() {
        let config = Config::parse(&[("http-auth".to_string(), "".to_string())]).unwrap();
        assert!(config.http_auth.is_none());
    }
}
