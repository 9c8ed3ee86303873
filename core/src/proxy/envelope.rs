// Routed payload carried inside Relay packets
//
// Plaintext layout, before encryption for the next hop:
//
//   <sender idurl>\n<receiver idurl>\n<"wide" or empty>\n<encoded inner packet>

use super::ProxyError;
use crate::crypto::KeyRing;
use crate::identity::IdUrl;

const WIDE_FLAG: &str = "wide";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPayload {
    /// Node the inner packet comes from.
    pub sender: IdUrl,
    /// Node the inner packet is meant for.
    pub receiver: IdUrl,
    pub wide: bool,
    /// Encoded inner packet, untouched.
    pub inner: Vec<u8>,
}

impl RoutedPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = format!(
            "{}\n{}\n{}\n",
            self.sender,
            self.receiver,
            if self.wide { WIDE_FLAG } else { "" }
        );
        let mut bytes = Vec::with_capacity(header.len() + self.inner.len());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&self.inner);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProxyError> {
        let mut rest = bytes;
        let mut fields = Vec::with_capacity(3);
        for _ in 0..3 {
            let end = rest
                .iter()
                .position(|b| *b == b'\n')
                .ok_or_else(|| ProxyError::MalformedPayload("truncated header".into()))?;
            let field = std::str::from_utf8(&rest[..end])
                .map_err(|_| ProxyError::MalformedPayload("header is not utf-8".into()))?;
            fields.push(field);
            rest = &rest[end + 1..];
        }
        let (sender, receiver, flag) = (fields[0], fields[1], fields[2]);
        if sender.is_empty() || receiver.is_empty() {
            return Err(ProxyError::MalformedPayload("empty idurl".into()));
        }
        if rest.is_empty() {
            return Err(ProxyError::MalformedPayload("no inner packet".into()));
        }
        Ok(Self {
            sender: IdUrl::new(sender),
            receiver: IdUrl::new(receiver),
            wide: flag == WIDE_FLAG,
            inner: rest.to_vec(),
        })
    }

    /// Encrypt for the holder of `public_key`.
    pub fn seal(&self, keyring: &KeyRing, public_key: &[u8; 32]) -> Result<Vec<u8>, ProxyError> {
        Ok(keyring.encrypt_for(public_key, &self.to_bytes())?)
    }

    pub fn open(keyring: &KeyRing, block: &[u8]) -> Result<Self, ProxyError> {
        let plain = keyring.decrypt(block)?;
        Self::from_bytes(&plain)
    }
}
