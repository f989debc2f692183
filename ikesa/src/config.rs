//! Connection policy objects
//!
//! A [Connection] is the local policy an SA negotiates under: who the
//! peer must be, how aggressively to retransmit, how many requests may be
//! in flight. The [ConnectionStore] holds the configured templates and
//! supports the responder-side refinement the identity resolver performs
//! once the peer's declared identity is known.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use ikewire::params::{AuthMethod, IdType};

/// How the peer is expected to authenticate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum AuthBy {
    Rsasig,
    Psk,
    Null,
    Ecdsa,
    Never,
}

impl AuthBy {
    /// Map a received AUTH payload method onto the policy value it satisfies
    pub fn from_auth_method(method: AuthMethod) -> AuthBy {
        match method {
            AuthMethod::RsaDigitalSignature | AuthMethod::DigitalSignature => AuthBy::Rsasig,
            AuthMethod::SharedKeyMic => AuthBy::Psk,
            AuthMethod::NullAuthentication => AuthBy::Null,
            AuthMethod::EcdsaSha256 | AuthMethod::EcdsaSha384 | AuthMethod::EcdsaSha512 => {
                AuthBy::Ecdsa
            }
            _ => AuthBy::Never,
        }
    }
}

/// An identity a connection expects its peer to present
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdPattern {
    /// Kind of the identification data
    pub id_type: IdTypePattern,
    /// The expected data; empty means "any value of this type"
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Wire ID types a pattern can name, plus the any-type wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum IdTypePattern {
    Any,
    Ipv4,
    Fqdn,
    Email,
    Ipv6,
    Dn,
    KeyId,
    Null,
}

impl IdTypePattern {
    /// Whether a concrete wire type satisfies this pattern
    pub fn matches(self, ty: IdType) -> bool {
        match self {
            IdTypePattern::Any => true,
            IdTypePattern::Ipv4 => ty == IdType::Ipv4Addr,
            IdTypePattern::Fqdn => ty == IdType::Fqdn,
            IdTypePattern::Email => ty == IdType::Rfc822Addr,
            IdTypePattern::Ipv6 => ty == IdType::Ipv6Addr,
            IdTypePattern::Dn => ty == IdType::DerAsn1Dn,
            IdTypePattern::KeyId => ty == IdType::KeyId,
            IdTypePattern::Null => ty == IdType::Null,
        }
    }
}

impl IdPattern {
    /// Whether a declared peer identity satisfies this pattern
    pub fn matches(&self, id_type: IdType, data: &[u8]) -> bool {
        self.id_type.matches(id_type) && (self.data.is_empty() || self.data == data)
    }
}

/// The policy one SA negotiates under
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Connection {
    /// Name used in every log line concerning SAs of this connection
    pub name: String,
    /// Suppress routine-error chatter for this connection
    pub opportunistic: bool,
    /// Whether RFC 7383 fragmentation may be used with this peer
    pub allow_fragmentation: bool,
    /// Whether to offer IPcomp on child SAs
    pub compress: bool,
    /// Expected peer authentication
    pub authby: AuthBy,
    /// Identity the peer must declare; `None` accepts any
    pub peer_id: Option<IdPattern>,
    /// Whether this entry may be refined onto by the identity resolver
    pub template: bool,
    /// Initial retransmission interval in milliseconds
    pub retransmit_interval_ms: u64,
    /// Upper bound one back-off step may reach, in milliseconds
    pub retransmit_cap_ms: u64,
    /// Total time to keep retransmitting before giving up, in milliseconds
    pub retransmit_timeout_ms: u64,
    /// Number of concurrent in-flight requests permitted per IKE SA
    pub window: u32,
    /// Dead-peer-detection delay in milliseconds, `None` disables liveness
    pub dpd_delay_ms: Option<u64>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            name: String::new(),
            opportunistic: false,
            allow_fragmentation: true,
            compress: false,
            authby: AuthBy::Psk,
            peer_id: None,
            template: false,
            retransmit_interval_ms: 500,
            retransmit_cap_ms: 8_000,
            retransmit_timeout_ms: 60_000,
            window: 1,
            dpd_delay_ms: None,
        }
    }
}

impl Connection {
    /// Initial retransmission interval
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    /// Cap one back-off step may reach
    pub fn retransmit_cap(&self) -> Duration {
        Duration::from_millis(self.retransmit_cap_ms)
    }

    /// Total time to keep retransmitting
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }
}

/// All configured connections
#[derive(Debug, Default)]
pub struct ConnectionStore {
    connections: Vec<Arc<Connection>>,
}

impl ConnectionStore {
    /// Build a store from configured entries
    pub fn new(connections: Vec<Connection>) -> Self {
        Self {
            connections: connections.into_iter().map(Arc::new).collect(),
        }
    }

    /// The connection a fresh responder SA starts out under
    ///
    /// Refinement onto a better-matching template happens later, once
    /// the peer declared its identity during IKE_AUTH.
    pub fn default_responder(&self) -> Option<Arc<Connection>> {
        self.connections.first().cloned()
    }

    /// Connection by name, for initiations
    pub fn by_name(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.iter().find(|c| c.name == name).cloned()
    }

    /// Find a template that matches the declared peer identity and auth
    /// method better than `current` does
    pub fn refine(
        &self,
        current: &Connection,
        id_type: IdType,
        id_data: &[u8],
        authby: AuthBy,
    ) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|c| c.template && c.authby == authby)
            .find(|c| {
                c.peer_id
                    .as_ref()
                    .map(|p| p.matches(id_type, id_data))
                    .unwrap_or(false)
            })
            .filter(|c| c.name != current.name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matching() {
        let pattern = IdPattern {
            id_type: IdTypePattern::Fqdn,
            data: b"peer.example.org".to_vec(),
        };
        assert!(pattern.matches(IdType::Fqdn, b"peer.example.org"));
        assert!(!pattern.matches(IdType::Fqdn, b"other.example.org"));
        assert!(!pattern.matches(IdType::KeyId, b"peer.example.org"));

        let any_fqdn = IdPattern {
            id_type: IdTypePattern::Fqdn,
            data: vec![],
        };
        assert!(any_fqdn.matches(IdType::Fqdn, b"whatever"));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn refine_prefers_matching_template() {
        let store = ConnectionStore::new(vec![
            Connection {
                name: "road-warrior".into(),
                ..Connection::default()
            },
            Connection {
                name: "peer-a".into(),
                template: true,
                peer_id: Some(IdPattern {
                    id_type: IdTypePattern::Fqdn,
                    data: b"a.example.org".to_vec(),
                }),
                ..Connection::default()
            },
        ]);

        let current = store.default_responder().unwrap();
        let refined = store.refine(&current, IdType::Fqdn, b"a.example.org", AuthBy::Psk);
        assert_eq!(refined.map(|c| c.name.clone()), Some("peer-a".into()));

        let none = store.refine(&current, IdType::Fqdn, b"b.example.org", AuthBy::Psk);
        assert!(none.is_none());
    }
}
