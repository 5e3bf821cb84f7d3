use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::messages::{
    ClientMessage, CommandResultMsg, CreateRoomMsg, EndSessionMsg, HelloMsg, InvitationMsg,
    InviteMsg, JoinRoomMsg, LeaveRoomMsg, MessageType, PresenceMsg, ReportProgressMsg,
    ServerMessage, SessionEndedMsg, SessionStartedMsg, StartSessionMsg, WelcomeMsg,
};
use crate::room::RoomSnapshot;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("payload too large: {0} bytes (max {MAX_MESSAGE_SIZE})")]
    PayloadTooLarge(usize),
    #[error("serialize error: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),
    #[error("deserialize error: {0}")]
    Deserialize(#[from] rmp_serde::decode::Error),
}

/// Encode a serializable payload with a 1-byte type prefix.
pub fn encode_message<T: Serialize>(
    msg_type: MessageType,
    payload: &T,
) -> Result<Vec<u8>, ProtocolError> {
    let payload_bytes = rmp_serde::to_vec(payload)?;
    let total = 1 + payload_bytes.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(total));
    }
    let mut buf = Vec::with_capacity(total);
    buf.push(msg_type as u8);
    buf.extend_from_slice(&payload_bytes);
    Ok(buf)
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    match msg {
        ClientMessage::Hello(m) => encode_message(MessageType::Hello, m),
        ClientMessage::CreateRoom(m) => encode_message(MessageType::CreateRoom, m),
        ClientMessage::JoinRoom(m) => encode_message(MessageType::JoinRoom, m),
        ClientMessage::StartSession(m) => encode_message(MessageType::StartSession, m),
        ClientMessage::ReportProgress(m) => encode_message(MessageType::ReportProgress, m),
        ClientMessage::EndSession(m) => encode_message(MessageType::EndSession, m),
        ClientMessage::Invite(m) => encode_message(MessageType::Invite, m),
        ClientMessage::LeaveRoom(m) => encode_message(MessageType::LeaveRoom, m),
    }
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    match msg {
        ServerMessage::Welcome(m) => encode_message(MessageType::Welcome, m),
        ServerMessage::CommandResult(m) => encode_message(MessageType::CommandResult, m),
        ServerMessage::RoomUpdate(m) => encode_message(MessageType::RoomUpdate, m),
        ServerMessage::SessionStarted(m) => encode_message(MessageType::SessionStarted, m),
        ServerMessage::SessionEnded(m) => encode_message(MessageType::SessionEnded, m),
        ServerMessage::Invitation(m) => encode_message(MessageType::Invitation, m),
        ServerMessage::Presence(m) => encode_message(MessageType::Presence, m),
    }
}

/// Extract the message type byte from raw wire data.
pub fn decode_message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    let &first = data.first().ok_or(ProtocolError::EmptyMessage)?;
    MessageType::from_byte(first).ok_or(ProtocolError::UnknownMessageType(first))
}

/// Decode the MessagePack payload that follows the type prefix.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    Ok(rmp_serde::from_slice(&data[1..])?)
}

pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let kind = decode_message_type(data)?;
    if !kind.is_client_command() {
        return Err(ProtocolError::UnknownMessageType(kind as u8));
    }
    let msg = match kind {
        MessageType::Hello => ClientMessage::Hello(decode_payload::<HelloMsg>(data)?),
        MessageType::CreateRoom => {
            ClientMessage::CreateRoom(decode_payload::<CreateRoomMsg>(data)?)
        },
        MessageType::JoinRoom => ClientMessage::JoinRoom(decode_payload::<JoinRoomMsg>(data)?),
        MessageType::StartSession => {
            ClientMessage::StartSession(decode_payload::<StartSessionMsg>(data)?)
        },
        MessageType::ReportProgress => {
            ClientMessage::ReportProgress(decode_payload::<ReportProgressMsg>(data)?)
        },
        MessageType::EndSession => {
            ClientMessage::EndSession(decode_payload::<EndSessionMsg>(data)?)
        },
        MessageType::Invite => ClientMessage::Invite(decode_payload::<InviteMsg>(data)?),
        MessageType::LeaveRoom => ClientMessage::LeaveRoom(decode_payload::<LeaveRoomMsg>(data)?),
        _ => return Err(ProtocolError::UnknownMessageType(data[0])),
    };
    Ok(msg)
}

pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    let msg = match decode_message_type(data)? {
        MessageType::Welcome => ServerMessage::Welcome(decode_payload::<WelcomeMsg>(data)?),
        MessageType::CommandResult => {
            ServerMessage::CommandResult(decode_payload::<CommandResultMsg>(data)?)
        },
        MessageType::RoomUpdate => {
            ServerMessage::RoomUpdate(Box::new(decode_payload::<RoomSnapshot>(data)?))
        },
        MessageType::SessionStarted => {
            ServerMessage::SessionStarted(decode_payload::<SessionStartedMsg>(data)?)
        },
        MessageType::SessionEnded => {
            ServerMessage::SessionEnded(Box::new(decode_payload::<SessionEndedMsg>(data)?))
        },
        MessageType::Invitation => {
            ServerMessage::Invitation(decode_payload::<InvitationMsg>(data)?)
        },
        MessageType::Presence => ServerMessage::Presence(decode_payload::<PresenceMsg>(data)?),
        _ => return Err(ProtocolError::UnknownMessageType(data[0])),
    };
    Ok(msg)
}
