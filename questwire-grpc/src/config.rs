//! Client configuration and credentials.

use std::fmt;
use std::time::Duration;

use questwire_h2::Settings;
use rustls::pki_types::CertificateDer;

use crate::error::{Error, Result};

/// Default per-call deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
/// Default bound on TCP connect + TLS + HTTP/2 handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_USER_AGENT: &str = concat!("questwire-grpc/", env!("CARGO_PKG_VERSION"));

/// Transport used to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    /// HTTP/2 over TLS, negotiated with ALPN.
    #[default]
    Https,
    /// Cleartext HTTP/2 with prior knowledge (h2c).
    Http,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Https => "https",
            Self::Http => "http",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Https => 443,
            Self::Http => 80,
        }
    }
}

/// A bearer token for one account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    /// Build a credential, accepting the raw token or a pasted
    /// `Bearer <token>` / `authorization: Bearer <token>` line.
    pub fn bearer(token: impl AsRef<str>) -> Result<Self> {
        let mut token = token.as_ref().trim();
        if let Some((name, rest)) = token.split_once(':')
            && name.trim().eq_ignore_ascii_case("authorization")
        {
            token = rest.trim();
        }
        if let Some(prefix) = token.get(..6)
            && prefix.eq_ignore_ascii_case("bearer")
            && token[6..].chars().next().is_none_or(char::is_whitespace)
        {
            token = token[6..].trim();
        }
        if token.is_empty() {
            return Err(Error::Config("empty bearer token".into()));
        }
        if token.bytes().any(|b| b.is_ascii_control()) {
            return Err(Error::Config("bearer token contains control characters".into()));
        }
        Ok(Self {
            token: token.to_string(),
        })
    }

    /// Split a comma-separated token list into one credential per account.
    /// Blank entries are skipped.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',')
            .filter(|t| !t.trim().is_empty())
            .map(Self::bearer)
            .collect()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Value for the `authorization` header.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Everything a [`GrpcClient`](crate::GrpcClient) needs besides its schema.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host[:port]`; the port defaults from the scheme.
    pub authority: String,
    pub scheme: Scheme,
    /// Deadline applied when a call does not give its own.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Extra request headers sent with every call.
    pub metadata: Vec<(String, String)>,
    /// Value of `grpc-accept-encoding`.
    pub accept_encoding: String,
    /// Local HTTP/2 settings.
    pub h2: Settings,
    /// TLS server name when it differs from the authority host (for example
    /// when connecting to an IP address).
    pub server_name: Option<String>,
    /// Trusted in addition to the webpki roots.
    pub extra_roots: Vec<CertificateDer<'static>>,
    pub credential: Option<Credential>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            authority: "localhost".into(),
            scheme: Scheme::Https,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.into(),
            metadata: Vec::new(),
            accept_encoding: "gzip".into(),
            h2: Settings::client_default(),
            server_name: None,
            extra_roots: Vec::new(),
            credential: None,
        }
    }
}

impl ClientConfig {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            ..Default::default()
        }
    }

    /// Parse `https://host[:port]` or `http://host[:port]`. A bare
    /// `host[:port]` means https. Any path is ignored.
    pub fn from_url(url: &str) -> Result<Self> {
        let (scheme, rest) = match url.split_once("://") {
            Some((s, rest)) if s.eq_ignore_ascii_case("https") => (Scheme::Https, rest),
            Some((s, rest)) if s.eq_ignore_ascii_case("http") => (Scheme::Http, rest),
            Some((s, _)) => return Err(Error::Config(format!("unsupported scheme `{s}`"))),
            None => (Scheme::Https, url),
        };
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(Error::Config(format!("no host in `{url}`")));
        }
        Ok(Self::new(authority).scheme(scheme))
    }

    /// Build from `QUESTWIRE_*` environment variables.
    ///
    /// - `QUESTWIRE_URL` (required) server URL, see [`ClientConfig::from_url`]
    /// - `QUESTWIRE_TOKEN` bearer token
    /// - `QUESTWIRE_TIMEOUT_MS` default call deadline
    /// - `QUESTWIRE_USER_AGENT`
    /// - `QUESTWIRE_SNI_HOST` TLS server name override
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`ClientConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("QUESTWIRE_URL")
            .ok_or_else(|| Error::Config("QUESTWIRE_URL environment variable not set".into()))?;
        let mut config = Self::from_url(&url)?;

        if let Some(token) = lookup("QUESTWIRE_TOKEN") {
            config.credential = Some(Credential::bearer(token)?);
        }
        if let Some(ms) = lookup("QUESTWIRE_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                Error::Config(format!("QUESTWIRE_TIMEOUT_MS is not a number: `{ms}`"))
            })?;
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(agent) = lookup("QUESTWIRE_USER_AGENT") {
            config.user_agent = agent;
        }
        config.server_name = lookup("QUESTWIRE_SNI_HOST");
        config.validate()?;
        Ok(config)
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Add a header sent with every call. Names are lowercased.
    pub fn metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .push((name.into().to_ascii_lowercase(), value.into()));
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.extra_roots.push(cert);
        self
    }

    pub fn h2_settings(mut self, settings: Settings) -> Self {
        self.h2 = settings;
        self
    }

    /// Check values that would otherwise fail at connect or call time.
    pub fn validate(&self) -> Result<()> {
        if self.host().is_empty() {
            return Err(Error::Config("authority has no host".into()));
        }
        if self.port().is_none() {
            return Err(Error::Config(format!(
                "invalid port in authority `{}`",
                self.authority
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be non-zero".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect_timeout must be non-zero".into()));
        }
        for (name, _) in &self.metadata {
            if name.is_empty() || name.starts_with(':') {
                return Err(Error::Config(format!("invalid metadata name `{name}`")));
            }
        }
        Ok(())
    }

    /// Host part of the authority, without brackets for IPv6 literals.
    pub fn host(&self) -> &str {
        let authority = self.authority.as_str();
        if let Some(rest) = authority.strip_prefix('[') {
            return rest.split(']').next().unwrap_or_default();
        }
        authority.split(':').next().unwrap_or_default()
    }

    /// Port from the authority, or the scheme default. `None` if malformed.
    pub fn port(&self) -> Option<u16> {
        let after_host = match self.authority.strip_prefix('[') {
            Some(rest) => rest.split_once(']').map_or("", |(_, tail)| tail),
            None => self
                .authority
                .find(':')
                .map_or("", |i| &self.authority[i..]),
        };
        match after_host.strip_prefix(':') {
            Some(port) => port.parse().ok(),
            None if after_host.is_empty() => Some(self.scheme.default_port()),
            None => None,
        }
    }

    /// Name presented for SNI and certificate verification.
    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or_else(|| self.host())
    }
}
