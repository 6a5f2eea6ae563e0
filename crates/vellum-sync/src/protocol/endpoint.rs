//! Server addresses and WebSocket subprotocol negotiation.

use std::fmt;

use url::Url;
use vellum_common::config::SyncMode;

use crate::error::{SyncError, SyncResult};

/// Prefix of the partition sync subprotocol.
pub const PBS_SUBPROTOCOL_PREFIX: &str = "com.mongodb.realm-sync#";

/// Prefix of the flexible sync subprotocol.
pub const FLX_SUBPROTOCOL_PREFIX: &str = "com.mongodb.realm-query-sync#";

/// Oldest protocol version the client speaks.
pub const OLDEST_PROTOCOL_VERSION: u32 = 1;

/// Newest protocol version the client speaks.
pub const CURRENT_PROTOCOL_VERSION: u32 = 10;

/// Path segment of the sync route.
const SYNC_ROUTE: &str = "realm-sync";

/// Scheme of a sync server URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolEnvelope {
    /// `realm://`, plain.
    Realm,
    /// `realms://`, TLS.
    Realms,
    /// `ws://`, plain.
    Ws,
    /// `wss://`, TLS.
    Wss,
}

impl ProtocolEnvelope {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "realm" => Some(Self::Realm),
            "realms" => Some(Self::Realms),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    /// URL scheme.
    #[must_use]
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Realm => "realm",
            Self::Realms => "realms",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    /// Port used when the URL names none.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Realm => 7800,
            Self::Realms => 7801,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    /// True for TLS envelopes.
    #[must_use]
    pub fn is_ssl(self) -> bool {
        matches!(self, Self::Realms | Self::Wss)
    }
}

/// A parsed sync server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    /// Scheme.
    pub envelope: ProtocolEnvelope,
    /// Host name or address.
    pub host: String,
    /// Port, defaulted from the envelope.
    pub port: u16,
    /// Path of the sync route, always starting with `/`.
    pub path: String,
}

impl ServerEndpoint {
    /// Parses a `realm`, `realms`, `ws` or `wss` URL.
    pub fn parse(server_url: &str) -> SyncResult<Self> {
        let invalid = |reason: &str| SyncError::InvalidServerUrl {
            url: server_url.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(server_url).map_err(|e| invalid(&e.to_string()))?;
        let envelope = ProtocolEnvelope::from_scheme(url.scheme())
            .ok_or_else(|| invalid("scheme must be realm, realms, ws or wss"))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed"));
        }
        let port = url.port().unwrap_or_else(|| envelope.default_port());

        let base = url.path().trim_end_matches('/');
        let path = if base.ends_with(SYNC_ROUTE) {
            base.to_string()
        } else {
            format!("{base}/{SYNC_ROUTE}")
        };
        Ok(Self {
            envelope,
            host,
            port,
            path,
        })
    }

    /// True if the connection uses TLS.
    #[must_use]
    pub fn is_ssl(&self) -> bool {
        self.envelope.is_ssl()
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.envelope.scheme(),
            self.host,
            self.port,
            self.path
        )
    }
}

fn prefix(mode: SyncMode) -> &'static str {
    match mode {
        SyncMode::Pbs => PBS_SUBPROTOCOL_PREFIX,
        SyncMode::Flx => FLX_SUBPROTOCOL_PREFIX,
    }
}

/// Subprotocols offered during the handshake, newest version first.
#[must_use]
pub fn make_subprotocols(mode: SyncMode) -> Vec<String> {
    (OLDEST_PROTOCOL_VERSION..=CURRENT_PROTOCOL_VERSION)
        .rev()
        .map(|v| format!("{}{}", prefix(mode), v))
        .collect()
}

/// Parses the subprotocol the server selected.
pub fn parse_subprotocol(protocol: &str) -> SyncResult<(SyncMode, u32)> {
    let unsupported = || SyncError::UnsupportedProtocol(protocol.to_string());
    let (mode, rest) = if let Some(rest) = protocol.strip_prefix(FLX_SUBPROTOCOL_PREFIX) {
        (SyncMode::Flx, rest)
    } else if let Some(rest) = protocol.strip_prefix(PBS_SUBPROTOCOL_PREFIX) {
        (SyncMode::Pbs, rest)
    } else {
        return Err(unsupported());
    };
    let version: u32 = rest.parse().map_err(|_| unsupported())?;
    if !(OLDEST_PROTOCOL_VERSION..=CURRENT_PROTOCOL_VERSION).contains(&version) {
        return Err(unsupported());
    }
    Ok((mode, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let cases = [
            ("realm://example.com", 7800, false),
            ("realms://example.com", 7801, true),
            ("ws://example.com", 80, false),
            ("wss://example.com", 443, true),
        ];
        for (url, port, ssl) in cases {
            let ep = ServerEndpoint::parse(url).unwrap();
            assert_eq!(ep.port, port, "{url}");
            assert_eq!(ep.is_ssl(), ssl, "{url}");
            assert_eq!(ep.path, "/realm-sync");
        }
    }

    #[test]
    fn test_explicit_port_and_path() {
        let ep = ServerEndpoint::parse("wss://sync.example.com:9443/api/client/v2.0/").unwrap();
        assert_eq!(ep.host, "sync.example.com");
        assert_eq!(ep.port, 9443);
        assert_eq!(ep.path, "/api/client/v2.0/realm-sync");
        assert_eq!(
            ep.to_string(),
            "wss://sync.example.com:9443/api/client/v2.0/realm-sync"
        );
    }

    #[test]
    fn test_rejects_bad_urls() {
        for url in ["http://example.com", "not a url", "ws://example.com/?a=b"] {
            assert!(
                matches!(
                    ServerEndpoint::parse(url),
                    Err(SyncError::InvalidServerUrl { .. })
                ),
                "{url}"
            );
        }
    }

    #[test]
    fn test_subprotocols() {
        let offered = make_subprotocols(SyncMode::Flx);
        assert_eq!(offered.len(), 10);
        assert_eq!(offered[0], "com.mongodb.realm-query-sync#10");
        assert_eq!(
            parse_subprotocol(&offered[3]).unwrap(),
            (SyncMode::Flx, 7)
        );
        assert_eq!(
            parse_subprotocol("com.mongodb.realm-sync#2").unwrap(),
            (SyncMode::Pbs, 2)
        );
        assert!(parse_subprotocol("com.mongodb.realm-sync#11").is_err());
        assert!(parse_subprotocol("chat").is_err());
    }
}
