// Packet codec: self-describing JSON wire form with size limits

use super::{Command, Packet, PacketError};
use crate::identity::IdUrl;
use serde::{Deserialize, Serialize};

/// Maximum encoded packet size: 64 MB
pub const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct WirePacket {
    command: String,
    owner_id: IdUrl,
    creator_id: IdUrl,
    packet_id: String,
    date: u64,
    /// hex
    payload: String,
    remote_id: IdUrl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_id: Option<String>,
    /// hex
    signature: String,
}

/// Serialize a signed packet for transfer.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, PacketError> {
    let wire = WirePacket {
        command: packet.command.as_str().to_string(),
        owner_id: packet.owner_id.clone(),
        creator_id: packet.creator_id.clone(),
        packet_id: packet.packet_id.clone(),
        date: packet.date,
        payload: hex::encode(&packet.payload),
        remote_id: packet.remote_id.clone(),
        key_id: packet.key_id.clone(),
        signature: hex::encode(&packet.signature),
    };
    let bytes = serde_json::to_vec(&wire).map_err(|e| PacketError::Malformed(e.to_string()))?;
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge {
            size: bytes.len(),
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(bytes)
}

/// Parse received bytes. The signature is not checked here.
pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge {
            size: bytes.len(),
            max: MAX_PACKET_SIZE,
        });
    }
    let wire: WirePacket =
        serde_json::from_slice(bytes).map_err(|e| PacketError::Malformed(e.to_string()))?;
    let command: Command = wire.command.parse()?;
    if wire.packet_id.is_empty() {
        return Err(PacketError::EmptyPacketId);
    }
    let payload =
        hex::decode(&wire.payload).map_err(|e| PacketError::Malformed(format!("payload: {}", e)))?;
    let signature = hex::decode(&wire.signature)
        .map_err(|e| PacketError::Malformed(format!("signature: {}", e)))?;

    Ok(Packet {
        command,
        owner_id: wire.owner_id,
        creator_id: wire.creator_id,
        packet_id: wire.packet_id,
        date: wire.date,
        payload,
        remote_id: wire.remote_id,
        key_id: wire.key_id,
        signature,
    })
}
