// src/pac/directive.rs
use std::fmt;
use std::num::NonZeroU16;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty proxy directive")]
    Empty,
    #[error("unknown proxy scheme `{0}`")]
    UnknownScheme(String),
    #[error("missing proxy host in `{0}`")]
    MissingHost(String),
    #[error("missing proxy port in `{0}`")]
    MissingPort(String),
    #[error("invalid proxy port in `{0}`")]
    InvalidPort(String),
    #[error("unexpected text after DIRECT in `{0}`")]
    TrailingText(String),
}

/// Transport used to reach a proxy. `PROXY` and `HTTP` both map to [`ProxyScheme::Http`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyScheme {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_uppercase().as_str() {
            "PROXY" | "HTTP" => Some(ProxyScheme::Http),
            "HTTPS" => Some(ProxyScheme::Https),
            "SOCKS" | "SOCKS4" => Some(ProxyScheme::Socks4),
            "SOCKS5" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }

    /// Keyword written back into directive strings.
    pub fn keyword(self) -> &'static str {
        match self {
            ProxyScheme::Http => "PROXY",
            ProxyScheme::Https => "HTTPS",
            ProxyScheme::Socks4 => "SOCKS4",
            ProxyScheme::Socks5 => "SOCKS5",
        }
    }

    pub fn url_scheme(self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyServer {
    scheme: ProxyScheme,
    host: String,
    port: NonZeroU16,
}

impl ProxyServer {
    /// Returns `None` for an empty host or port 0.
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Option<Self> {
        let host = host.into();
        if host.is_empty() {
            return None;
        }
        Some(Self {
            scheme,
            host,
            port: NonZeroU16::new(port)?,
        })
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port.get()
    }

    /// Renders the proxy as a URL, e.g. `socks5://10.0.0.1:1080`.
    pub fn to_url(&self) -> String {
        format!("{}://{}", self.scheme.url_scheme(), self.authority())
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.scheme.keyword(), self.authority())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyChoice {
    Direct,
    Proxy(ProxyServer),
}

impl ProxyChoice {
    pub fn is_direct(&self) -> bool {
        matches!(self, ProxyChoice::Direct)
    }

    pub fn server(&self) -> Option<&ProxyServer> {
        match self {
            ProxyChoice::Direct => None,
            ProxyChoice::Proxy(server) => Some(server),
        }
    }
}

impl fmt::Display for ProxyChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyChoice::Direct => f.write_str("DIRECT"),
            ProxyChoice::Proxy(server) => server.fmt(f),
        }
    }
}

impl FromStr for ProxyChoice {
    type Err = ParseError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let entry = entry.trim();
        let (keyword, rest) = match entry.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (entry, ""),
        };

        if keyword.eq_ignore_ascii_case("DIRECT") {
            if !rest.is_empty() {
                return Err(ParseError::TrailingText(entry.to_string()));
            }
            return Ok(ProxyChoice::Direct);
        }

        let scheme = ProxyScheme::from_keyword(keyword)
            .ok_or_else(|| ParseError::UnknownScheme(keyword.to_string()))?;
        let (host, port) = split_endpoint(rest, entry)?;
        let port: u16 = port
            .parse()
            .map_err(|_| ParseError::InvalidPort(entry.to_string()))?;
        let server = ProxyServer::new(scheme, host, port)
            .ok_or_else(|| ParseError::InvalidPort(entry.to_string()))?;
        Ok(ProxyChoice::Proxy(server))
    }
}

/// Splits `host:port` / `[v6]:port`. The port is never defaulted.
fn split_endpoint<'a>(endpoint: &'a str, entry: &str) -> Result<(&'a str, &'a str), ParseError> {
    if endpoint.is_empty() {
        return Err(ParseError::MissingHost(entry.to_string()));
    }
    if endpoint.contains(char::is_whitespace) {
        return Err(ParseError::TrailingText(entry.to_string()));
    }

    let (host, port) = if let Some(bracketed) = endpoint.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| ParseError::MissingHost(entry.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| ParseError::MissingPort(entry.to_string()))?;
        (host, port)
    } else {
        endpoint
            .rsplit_once(':')
            .ok_or_else(|| ParseError::MissingPort(entry.to_string()))?
    };

    if host.is_empty() {
        return Err(ParseError::MissingHost(entry.to_string()));
    }
    if port.is_empty() {
        return Err(ParseError::MissingPort(entry.to_string()));
    }
    Ok((host, port))
}

/// Ordered, non-empty list of proxy choices. The first entry is preferred.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyDirective {
    choices: Vec<ProxyChoice>,
}

impl ProxyDirective {
    pub fn direct() -> Self {
        Self {
            choices: vec![ProxyChoice::Direct],
        }
    }

    /// Returns `None` when `choices` is empty.
    pub fn new(choices: Vec<ProxyChoice>) -> Option<Self> {
        if choices.is_empty() {
            None
        } else {
            Some(Self { choices })
        }
    }

    pub fn choices(&self) -> &[ProxyChoice] {
        &self.choices
    }

    pub fn primary(&self) -> &ProxyChoice {
        &self.choices[0]
    }

    pub fn is_direct(&self) -> bool {
        self.choices.len() == 1 && self.choices[0].is_direct()
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProxyChoice> {
        self.choices.iter()
    }

    /// Appends DIRECT as last resort unless the list already ends with it.
    pub fn with_direct_fallback(mut self) -> Self {
        if !self.choices.last().is_some_and(ProxyChoice::is_direct) {
            self.choices.push(ProxyChoice::Direct);
        }
        self
    }
}

impl<'a> IntoIterator for &'a ProxyDirective {
    type Item = &'a ProxyChoice;
    type IntoIter = std::slice::Iter<'a, ProxyChoice>;

    fn into_iter(self) -> Self::IntoIter {
        self.choices.iter()
    }
}

impl FromStr for ProxyDirective {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let choices = raw
            .split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<ProxyChoice>, _>>()?;
        ProxyDirective::new(choices).ok_or(ParseError::Empty)
    }
}

impl fmt::Display for ProxyDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, choice) in self.choices.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            choice.fmt(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(scheme: ProxyScheme, host: &str, port: u16) -> ProxyChoice {
        ProxyChoice::Proxy(ProxyServer::new(scheme, host, port).unwrap())
    }

    #[test]
    fn parses_direct() {
        let directive: ProxyDirective = "DIRECT".parse().unwrap();
        assert!(directive.is_direct());
        assert_eq!("  direct ; ".parse::<ProxyDirective>().unwrap(), directive);
    }

    #[test]
    fn keeps_entry_order() {
        let directive: ProxyDirective = "HTTPS some-such-proxy:443; HTTPS any-such-proxy:41"
            .parse()
            .unwrap();
        assert_eq!(
            directive.choices(),
            &[
                proxy(ProxyScheme::Https, "some-such-proxy", 443),
                proxy(ProxyScheme::Https, "any-such-proxy", 41),
            ]
        );
    }

    #[test]
    fn maps_scheme_synonyms() {
        let directive: ProxyDirective =
            "proxy a:1;HTTP b:2; socks c:3; SOCKS4 d:4; Socks5 e:5; DIRECT"
                .parse()
                .unwrap();
        let schemes: Vec<_> = directive
            .iter()
            .map(|choice| choice.server().map(ProxyServer::scheme))
            .collect();
        assert_eq!(
            schemes,
            vec![
                Some(ProxyScheme::Http),
                Some(ProxyScheme::Http),
                Some(ProxyScheme::Socks4),
                Some(ProxyScheme::Socks4),
                Some(ProxyScheme::Socks5),
                None,
            ]
        );
    }

    #[test]
    fn tolerates_extra_whitespace_and_empty_entries() {
        let directive: ProxyDirective = " ;; PROXY \t cache.local:3128 ;;DIRECT;"
            .parse()
            .unwrap();
        assert_eq!(directive.len(), 2);
        assert_eq!(directive.primary(), &proxy(ProxyScheme::Http, "cache.local", 3128));
    }

    #[test]
    fn port_is_mandatory() {
        assert_eq!(
            "PROXY no-port".parse::<ProxyDirective>(),
            Err(ParseError::MissingPort("PROXY no-port".into()))
        );
        assert!(matches!(
            "PROXY host:".parse::<ProxyDirective>(),
            Err(ParseError::MissingPort(_))
        ));
    }

    #[test]
    fn rejects_bad_ports() {
        for raw in ["PROXY h:0", "PROXY h:65536", "PROXY h:http", "PROXY h:-1"] {
            assert!(
                matches!(raw.parse::<ProxyDirective>(), Err(ParseError::InvalidPort(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn rejects_malformed_directives() {
        assert_eq!("".parse::<ProxyDirective>(), Err(ParseError::Empty));
        assert_eq!(" ; ;; ".parse::<ProxyDirective>(), Err(ParseError::Empty));
        assert!(matches!(
            "TUNNEL h:1".parse::<ProxyDirective>(),
            Err(ParseError::UnknownScheme(_))
        ));
        assert!(matches!(
            "PROXY".parse::<ProxyDirective>(),
            Err(ParseError::MissingHost(_))
        ));
        assert!(matches!(
            "PROXY :80".parse::<ProxyDirective>(),
            Err(ParseError::MissingHost(_))
        ));
        assert!(matches!(
            "DIRECT please".parse::<ProxyDirective>(),
            Err(ParseError::TrailingText(_))
        ));
        assert!(matches!(
            "PROXY a:1 b:2".parse::<ProxyDirective>(),
            Err(ParseError::TrailingText(_))
        ));
    }

    #[test]
    fn one_bad_entry_rejects_the_whole_directive() {
        assert!("PROXY good:80; PROXY bad".parse::<ProxyDirective>().is_err());
    }

    #[test]
    fn handles_bracketed_ipv6_hosts() {
        let directive: ProxyDirective = "SOCKS5 [::1]:1080".parse().unwrap();
        let server = directive.primary().server().unwrap();
        assert_eq!(server.host(), "::1");
        assert_eq!(server.port(), 1080);
        assert_eq!(server.to_url(), "socks5://[::1]:1080");
        assert_eq!(directive.to_string(), "SOCKS5 [::1]:1080");
    }

    #[test]
    fn serialized_directives_parse_back() {
        let directive = ProxyDirective::new(vec![
            proxy(ProxyScheme::Https, "secure.example", 443),
            proxy(ProxyScheme::Http, "plain.example", 8080),
            proxy(ProxyScheme::Socks4, "10.1.1.1", 1080),
            proxy(ProxyScheme::Socks5, "fe80::1", 9050),
            ProxyChoice::Direct,
        ])
        .unwrap();
        let text = directive.to_string();
        assert_eq!(
            text,
            "HTTPS secure.example:443; PROXY plain.example:8080; SOCKS4 10.1.1.1:1080; SOCKS5 [fe80::1]:9050; DIRECT"
        );
        assert_eq!(text.parse::<ProxyDirective>().unwrap(), directive);
    }

    #[test]
    fn direct_fallback_is_appended_once() {
        let directive: ProxyDirective = "PROXY a:1".parse().unwrap();
        let with_fallback = directive.with_direct_fallback();
        assert_eq!(with_fallback.to_string(), "PROXY a:1; DIRECT");
        assert_eq!(with_fallback.clone().with_direct_fallback(), with_fallback);
    }

    #[test]
    fn renders_proxy_urls() {
        let server = ProxyServer::new(ProxyScheme::Http, "no-such-proxy", 80).unwrap();
        assert_eq!(server.to_url(), "http://no-such-proxy:80");
        assert!(ProxyServer::new(ProxyScheme::Http, "h", 0).is_none());
        assert!(ProxyServer::new(ProxyScheme::Http, "", 1).is_none());
    }
}
