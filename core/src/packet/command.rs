// Command vocabulary and the acknowledgement table

use super::PacketError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Command {
    Data,
    Ack,
    Fail,
    Retrieve,
    ListFiles,
    Files,
    RequestIdentity,
    Identity,
    DeleteFile,
    DeleteBackup,
    Message,
    Receipt,
    RequestService,
    CancelService,
    Correspondent,
    Broadcast,
    Relay,
    Coin,
    RetrieveCoin,
    Key,
    Event,
    Contacts,
}

impl Command {
    pub const ALL: [Command; 22] = [
        Command::Data,
        Command::Ack,
        Command::Fail,
        Command::Retrieve,
        Command::ListFiles,
        Command::Files,
        Command::RequestIdentity,
        Command::Identity,
        Command::DeleteFile,
        Command::DeleteBackup,
        Command::Message,
        Command::Receipt,
        Command::RequestService,
        Command::CancelService,
        Command::Correspondent,
        Command::Broadcast,
        Command::Relay,
        Command::Coin,
        Command::RetrieveCoin,
        Command::Key,
        Command::Event,
        Command::Contacts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Data => "Data",
            Command::Ack => "Ack",
            Command::Fail => "Fail",
            Command::Retrieve => "Retrieve",
            Command::ListFiles => "ListFiles",
            Command::Files => "Files",
            Command::RequestIdentity => "RequestIdentity",
            Command::Identity => "Identity",
            Command::DeleteFile => "DeleteFile",
            Command::DeleteBackup => "DeleteBackup",
            Command::Message => "Message",
            Command::Receipt => "Receipt",
            Command::RequestService => "RequestService",
            Command::CancelService => "CancelService",
            Command::Correspondent => "Correspondent",
            Command::Broadcast => "Broadcast",
            Command::Relay => "Relay",
            Command::Coin => "Coin",
            Command::RetrieveCoin => "RetrieveCoin",
            Command::Key => "Key",
            Command::Event => "Event",
            Command::Contacts => "Contacts",
        }
    }

    /// Commands accepted as a response to this one. `Fail` is accepted by
    /// every command that expects anything at all.
    pub fn acks(&self) -> &'static [Command] {
        use Command::*;
        match self {
            Data | Identity | DeleteFile | DeleteBackup | Message | RequestService
            | CancelService | Coin | Files | Receipt | Key | Event => &[Ack, Fail],
            Retrieve => &[Data, Fail],
            ListFiles => &[Files, Fail],
            RequestIdentity => &[Identity, Fail],
            Correspondent => &[Correspondent, Fail],
            Contacts => &[Contacts, Ack, Fail],
            Ack | Fail | Broadcast | Relay | RetrieveCoin => &[],
        }
    }

    /// The positive response this command waits for, if any.
    pub fn expected_ack(&self) -> Option<Command> {
        self.acks().first().copied()
    }

    pub fn expects_response(&self) -> bool {
        !self.acks().is_empty()
    }

    /// Whether `self` answers a packet that carried `outgoing`.
    pub fn is_ack_of(&self, outgoing: Command) -> bool {
        outgoing.acks().contains(self)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| PacketError::UnknownCommand(s.to_string()))
    }
}
