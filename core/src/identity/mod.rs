// Identity documents, node keys and the identity cache gate

mod cache;
mod fetch;
mod keys;
mod local;

pub use cache::{IdentityCache, ResolveCallback};
pub use fetch::{DirectoryFetcher, HttpFetcher, IdentityFetcher};
pub use keys::IdentityKeys;
pub use local::LocalIdentity;

use crate::transport::Protocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest identity document accepted from the network.
pub const MAX_IDENTITY_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Failed to fetch identity {idurl}: {reason}")]
    FetchFailed { idurl: IdUrl, reason: String },

    #[error("Malformed identity document: {0}")]
    Malformed(String),

    #[error("Identity {0} has an invalid signature")]
    BadSignature(IdUrl),

    #[error("Identity {0} has an invalid public key")]
    InvalidPublicKey(IdUrl),

    #[error("Identity {0} is not cached")]
    NotCached(IdUrl),

    #[error("Fetched identity {found} while resolving {expected}")]
    Mismatch { expected: IdUrl, found: IdUrl },

    #[error("Invalid contact address: {0}")]
    InvalidContact(String),
}

/// Identity URL: the globally unique name of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdUrl(String);

impl IdUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for IdUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdUrl {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdUrl {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A contact address `proto://host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Contact {
    pub proto: Protocol,
    pub host: String,
}

impl Contact {
    pub fn new(proto: Protocol, host: impl Into<String>) -> Self {
        Self {
            proto,
            host: host.into(),
        }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proto, self.host)
    }
}

impl FromStr for Contact {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, host) = s
            .split_once("://")
            .ok_or_else(|| IdentityError::InvalidContact(s.to_string()))?;
        let proto = proto
            .parse::<Protocol>()
            .map_err(|_| IdentityError::InvalidContact(s.to_string()))?;
        if host.is_empty() {
            return Err(IdentityError::InvalidContact(s.to_string()));
        }
        Ok(Self::new(proto, host))
    }
}

impl TryFrom<String> for Contact {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Contact> for String {
    fn from(c: Contact) -> Self {
        c.to_string()
    }
}

/// Signed, versioned identity document of one node.
///
/// Documents are replaced wholesale; there are no setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    idurl: IdUrl,
    sources: Vec<IdUrl>,
    contacts: Vec<Contact>,
    public_key: String,
    revision: u64,
    signature: String,
}

impl Identity {
    /// Build and self-sign a document.
    pub fn create(
        keys: &IdentityKeys,
        idurl: IdUrl,
        sources: Vec<IdUrl>,
        contacts: Vec<Contact>,
        revision: u64,
    ) -> Self {
        let mut identity = Self {
            idurl,
            sources,
            contacts,
            public_key: keys.public_key_hex(),
            revision,
            signature: String::new(),
        };
        identity.signature = hex::encode(keys.sign(identity.signed_text().as_bytes()));
        identity
    }

    /// Next revision of this document with a different contact list.
    pub fn with_contacts(&self, keys: &IdentityKeys, contacts: Vec<Contact>) -> Self {
        Self::create(
            keys,
            self.idurl.clone(),
            self.sources.clone(),
            contacts,
            self.revision + 1,
        )
    }

    fn signed_text(&self) -> String {
        let sources: Vec<&str> = self.sources.iter().map(|s| s.as_str()).collect();
        let contacts: Vec<String> = self.contacts.iter().map(|c| c.to_string()).collect();
        format!(
            "{}\n{}\n{}\n{}\n{}",
            self.idurl,
            sources.join(" "),
            contacts.join(" "),
            self.public_key,
            self.revision
        )
    }

    /// Check the public key and the self signature.
    pub fn validate(&self) -> Result<(), IdentityError> {
        let public_key = self.public_key_bytes()?;
        let signature = hex::decode(&self.signature)
            .map_err(|_| IdentityError::BadSignature(self.idurl.clone()))?;
        match IdentityKeys::verify(self.signed_text().as_bytes(), &signature, &public_key) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(IdentityError::BadSignature(self.idurl.clone())),
        }
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32], IdentityError> {
        let raw = hex::decode(&self.public_key)
            .map_err(|_| IdentityError::InvalidPublicKey(self.idurl.clone()))?;
        raw.as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey(self.idurl.clone()))
    }

    pub fn idurl(&self) -> &IdUrl {
        &self.idurl
    }

    pub fn sources(&self) -> &[IdUrl] {
        &self.sources
    }

    /// The idurl followed by every distinct source, in order.
    pub fn source_urls(&self) -> Vec<IdUrl> {
        let mut urls = vec![self.idurl.clone()];
        for source in &self.sources {
            if !urls.contains(source) {
                urls.push(source.clone());
            }
        }
        urls
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn contact_for(&self, proto: Protocol) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.proto == proto)
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn to_json(&self) -> Result<Vec<u8>, IdentityError> {
        serde_json::to_vec(self).map_err(|e| IdentityError::Malformed(e.to_string()))
    }

    /// Parse a document. Does not validate it.
    pub fn from_json(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() > MAX_IDENTITY_SIZE {
            return Err(IdentityError::Malformed(format!(
                "document too large: {} bytes",
                bytes.len()
            )));
        }
        serde_json::from_slice(bytes).map_err(|e| IdentityError::Malformed(e.to_string()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[rev {}]", self.idurl, self.revision)
    }
}
