//! Signed, addressed packets
//!
//! A [`Packet`] is immutable once signed. The only way to obtain one is
//! [`PacketBuilder::sign`] or decoding bytes received from the network, so an
//! unsigned packet never reaches the wire.

pub mod codec;
mod command;
pub mod packet_id;

pub use codec::{decode, encode, MAX_PACKET_SIZE};
pub use command::Command;

use crate::crypto::KeyRing;
use crate::identity::{IdUrl, Identity, IdentityKeys};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Packet too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Packet signature does not verify")]
    BadSignature,

    #[error("Packet created by {creator} checked against identity {identity}")]
    CreatorMismatch { creator: IdUrl, identity: IdUrl },

    #[error("Packet has an empty id")]
    EmptyPacketId,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    command: Command,
    owner_id: IdUrl,
    creator_id: IdUrl,
    packet_id: String,
    date: u64,
    payload: Vec<u8>,
    remote_id: IdUrl,
    key_id: Option<String>,
    signature: Vec<u8>,
}

/// Collects the fields of a packet before it is signed.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    command: Command,
    owner_id: IdUrl,
    creator_id: IdUrl,
    packet_id: String,
    date: u64,
    payload: Vec<u8>,
    remote_id: IdUrl,
    key_id: Option<String>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PacketBuilder {
    pub fn owner(mut self, owner_id: IdUrl) -> Self {
        self.owner_id = owner_id;
        self
    }

    pub fn packet_id(mut self, packet_id: impl Into<String>) -> Self {
        self.packet_id = packet_id.into();
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn remote(mut self, remote_id: IdUrl) -> Self {
        self.remote_id = remote_id;
        self
    }

    pub fn key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn date(mut self, date: u64) -> Self {
        self.date = date;
        self
    }

    pub fn sign(self, keyring: &KeyRing) -> Packet {
        let mut packet = Packet {
            command: self.command,
            owner_id: self.owner_id,
            creator_id: self.creator_id,
            packet_id: self.packet_id,
            date: self.date,
            payload: self.payload,
            remote_id: self.remote_id,
            key_id: self.key_id,
            signature: Vec::new(),
        };
        packet.signature = keyring.sign(&packet.digest());
        packet
    }
}

impl Packet {
    /// Start a packet created (and owned) by `creator`, with a fresh id.
    pub fn build(command: Command, creator: IdUrl) -> PacketBuilder {
        PacketBuilder {
            command,
            owner_id: creator.clone(),
            creator_id: creator,
            packet_id: packet_id::unique(),
            date: now_secs(),
            payload: Vec::new(),
            remote_id: IdUrl::new(""),
            key_id: None,
        }
    }

    /// Deterministic `-`-joined concatenation of every signed field.
    fn hash_base(&self) -> String {
        let mut parts: Vec<Cow<'_, str>> = vec![
            Cow::Borrowed(self.command.as_str()),
            Cow::Borrowed(self.owner_id.as_str()),
            Cow::Borrowed(self.creator_id.as_str()),
            Cow::Borrowed(self.packet_id.as_str()),
            Cow::Owned(self.date.to_string()),
            Cow::Owned(hex::encode(&self.payload)),
            Cow::Borrowed(self.remote_id.as_str()),
        ];
        if let Some(key_id) = &self.key_id {
            parts.push(Cow::Borrowed(key_id.as_str()));
        }
        parts.join("-")
    }

    fn digest(&self) -> Vec<u8> {
        Sha256::digest(self.hash_base().as_bytes()).to_vec()
    }

    /// Check the signature against the creator's identity.
    pub fn verify_with(&self, creator: &Identity) -> Result<(), PacketError> {
        if creator.idurl() != &self.creator_id {
            return Err(PacketError::CreatorMismatch {
                creator: self.creator_id.clone(),
                identity: creator.idurl().clone(),
            });
        }
        let public_key = creator
            .public_key_bytes()
            .map_err(|_| PacketError::BadSignature)?;
        match IdentityKeys::verify(&self.digest(), &self.signature, &public_key) {
            Ok(true) => Ok(()),
            _ => Err(PacketError::BadSignature),
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn owner_id(&self) -> &IdUrl {
        &self.owner_id
    }

    pub fn creator_id(&self) -> &IdUrl {
        &self.creator_id
    }

    pub fn packet_id(&self) -> &str {
        &self.packet_id
    }

    pub fn date(&self) -> u64 {
        self.date
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text, lossy.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn remote_id(&self) -> &IdUrl {
        &self.remote_id
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]({} bytes) {} -> {}",
            self.command,
            self.packet_id,
            self.payload.len(),
            self.creator_id,
            self.remote_id
        )
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.command, self.packet_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Contact;
    use crate::transport::Protocol;
    use proptest::prelude::*;

    fn node(name: &str, seed: u8) -> (KeyRing, Identity) {
        let keys = IdentityKeys::from_seed(&[seed; 32]);
        let identity = Identity::create(
            &keys,
            IdUrl::from(format!("http://id.example/{}.xml", name)),
            vec![],
            vec![Contact::new(Protocol::Tcp, format!("{}:7771", name))],
            1,
        );
        (KeyRing::new(keys), identity)
    }

    #[test]
    fn test_signed_packet_verifies() {
        let (ring, alice) = node("alice", 1);
        let packet = Packet::build(Command::Data, alice.idurl().clone())
            .payload(b"block".to_vec())
            .remote(IdUrl::from("http://id.example/bob.xml"))
            .sign(&ring);

        packet.verify_with(&alice).unwrap();
        assert_eq!(packet.owner_id(), alice.idurl());
        assert_eq!(packet.payload_text(), "block");
    }

    #[test]
    fn test_wrong_identity_is_rejected() {
        let (ring, alice) = node("alice", 1);
        let (_, bob) = node("bob", 2);
        let packet = Packet::build(Command::Ack, alice.idurl().clone()).sign(&ring);
        assert!(matches!(
            packet.verify_with(&bob),
            Err(PacketError::CreatorMismatch { .. })
        ));
    }

    #[test]
    fn test_key_id_is_signed() {
        let (ring, alice) = node("alice", 1);
        let mut packet = Packet::build(Command::Message, alice.idurl().clone())
            .key_id("master")
            .sign(&ring);
        packet.verify_with(&alice).unwrap();
        packet.key_id = Some("other".into());
        assert_eq!(packet.verify_with(&alice), Err(PacketError::BadSignature));
        packet.key_id = None;
        assert_eq!(packet.verify_with(&alice), Err(PacketError::BadSignature));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_any_field_mutation_invalidates(
            field in 0usize..6,
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            noise in "[a-z]{1,8}",
        ) {
            let (ring, alice) = node("alice", 7);
            let original = Packet::build(Command::Data, alice.idurl().clone())
                .payload(payload)
                .remote(IdUrl::from("http://id.example/bob.xml"))
                .sign(&ring);
            prop_assert!(original.verify_with(&alice).is_ok());

            let mut mutated = original.clone();
            match field {
                0 => mutated.command = Command::Retrieve,
                1 => mutated.owner_id = IdUrl::from(format!("http://id.example/x-{}.xml", noise)),
                2 => mutated.packet_id.push_str(&noise),
                3 => mutated.date += 1,
                4 => mutated.payload.extend_from_slice(noise.as_bytes()),
                _ => mutated.remote_id = IdUrl::from(noise.clone()),
            }
            prop_assert!(mutated.verify_with(&alice).is_err());
        }
    }
}
