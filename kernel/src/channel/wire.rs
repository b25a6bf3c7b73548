/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Userspace/kernel wire format for a channel message (§6.3): a fixed
//! header, the body bytes, then a packed array of attachment headers.
//!
//! This module only marshals the bytes; it knows nothing about handle
//! tables or [`super::ChannelHalf`]/[`crate::vm::Mapping`] objects. Channel
//! and mapping attachments cross the wire as plain kernel-object ids — the
//! syscall layer is what turns an id into (or out of) a live object
//! reference.

use alloc::vec::Vec;

use crate::error::Status;

const MESSAGE_HEADER_LEN: usize = 32;
const ATTACHMENT_HEADER_LEN: usize = 24;

const TYPE_NULL: u8 = 1;
const TYPE_CHANNEL: u8 = 2;
const TYPE_MAPPING: u8 = 3;
const TYPE_DATA: u8 = 4;

const DATA_FLAG_SHARED: u8 = 1 << 0;

/// One attachment as it appears on the wire (§6.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireAttachment {
    Null,
    Channel { object_id: u64 },
    Mapping { object_id: u64 },
    DataInline { bytes: Vec<u8> },
    DataShared { mapping_id: u64, length: u64 },
}

/// A full wire message: header, body, attachments (§6.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub conversation_id: u64,
    pub message_id: u64,
    pub body: Vec<u8>,
    pub attachments: Vec<WireAttachment>,
}

fn push_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, Status> {
    let slice = bytes.get(offset..offset + 8).ok_or(Status::InvalidArgument)?;
    Ok(u64::from_le_bytes(slice.try_into().expect("8-byte slice")))
}

/// Encode a message into its wire representation.
pub fn encode(message: &WireMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MESSAGE_HEADER_LEN + message.body.len());
    push_u64(&mut buf, message.conversation_id);
    push_u64(&mut buf, message.message_id);
    push_u64(&mut buf, message.body.len() as u64);
    push_u64(&mut buf, message.attachments.len() as u64);
    buf.extend_from_slice(&message.body);

    let attachments_start = buf.len();
    for attachment in &message.attachments {
        let header_offset = buf.len() - attachments_start;
        let payload_offset = header_offset + ATTACHMENT_HEADER_LEN;

        let mut payload = Vec::new();
        let ty = match attachment {
            WireAttachment::Null => TYPE_NULL,
            WireAttachment::Channel { object_id } => {
                push_u64(&mut payload, *object_id);
                TYPE_CHANNEL
            }
            WireAttachment::Mapping { object_id } => {
                push_u64(&mut payload, *object_id);
                TYPE_MAPPING
            }
            WireAttachment::DataInline { bytes } => {
                payload.extend_from_slice(bytes);
                TYPE_DATA
            }
            WireAttachment::DataShared { mapping_id, length } => {
                push_u64(&mut payload, *mapping_id);
                push_u64(&mut payload, *length);
                TYPE_DATA
            }
        };
        let flags = if matches!(attachment, WireAttachment::DataShared { .. }) { DATA_FLAG_SHARED } else { 0 };

        let next_offset = (payload_offset + payload.len()) as u64;
        push_u64(&mut buf, next_offset);
        push_u64(&mut buf, payload.len() as u64);
        buf.push(ty);
        buf.push(flags);
        buf.extend_from_slice(&[0u8; 6]);
        buf.extend_from_slice(&payload);
    }

    buf
}

/// Decode a message from its wire representation.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, Status> {
    if bytes.len() < MESSAGE_HEADER_LEN {
        return Err(Status::InvalidArgument);
    }
    let conversation_id = read_u64(bytes, 0)?;
    let message_id = read_u64(bytes, 8)?;
    let body_length = read_u64(bytes, 16)? as usize;
    let attachment_count = read_u64(bytes, 24)? as usize;

    let body_start = MESSAGE_HEADER_LEN;
    let body_end = body_start.checked_add(body_length).ok_or(Status::InvalidArgument)?;
    let body = bytes.get(body_start..body_end).ok_or(Status::InvalidArgument)?.to_vec();

    let mut attachments = Vec::with_capacity(attachment_count);
    let mut cursor = body_end;
    for _ in 0..attachment_count {
        if cursor + ATTACHMENT_HEADER_LEN > bytes.len() {
            return Err(Status::InvalidArgument);
        }
        let length = read_u64(bytes, cursor + 8)? as usize;
        let ty = bytes[cursor + 16];
        let flags = bytes[cursor + 17];
        let payload_start = cursor + ATTACHMENT_HEADER_LEN;
        let payload_end = payload_start.checked_add(length).ok_or(Status::InvalidArgument)?;
        let payload = bytes.get(payload_start..payload_end).ok_or(Status::InvalidArgument)?;

        let attachment = match ty {
            TYPE_NULL => WireAttachment::Null,
            TYPE_CHANNEL => WireAttachment::Channel { object_id: read_u64(payload, 0)? },
            TYPE_MAPPING => WireAttachment::Mapping { object_id: read_u64(payload, 0)? },
            TYPE_DATA if flags & DATA_FLAG_SHARED != 0 => {
                WireAttachment::DataShared { mapping_id: read_u64(payload, 0)?, length: read_u64(payload, 8)? }
            }
            TYPE_DATA => WireAttachment::DataInline { bytes: payload.to_vec() },
            _ => return Err(Status::InvalidArgument),
        };
        attachments.push(attachment);

        let next_offset = read_u64(bytes, cursor)? as usize;
        let next_cursor = body_end.checked_add(next_offset).ok_or(Status::InvalidArgument)?;
        if next_cursor <= cursor && attachment_count > 1 {
            return Err(Status::InvalidArgument);
        }
        cursor = next_cursor;
    }

    Ok(WireMessage { conversation_id, message_id, body, attachments })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_message_with_mixed_attachments() {
        let message = WireMessage {
            conversation_id: 7,
            message_id: 42,
            body: alloc::vec![1, 2, 3, 4],
            attachments: alloc::vec![
                WireAttachment::Null,
                WireAttachment::Channel { object_id: 99 },
                WireAttachment::Mapping { object_id: 100 },
                WireAttachment::DataInline { bytes: alloc::vec![5, 6, 7] },
                WireAttachment::DataShared { mapping_id: 55, length: 4096 },
            ],
        };
        let encoded = encode(&message);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn decode_rejects_a_truncated_header() {
        assert_eq!(decode(&[0u8; 4]), Err(Status::InvalidArgument));
    }

    #[test]
    fn decode_rejects_a_body_length_past_the_buffer_end() {
        let mut buf = alloc::vec![0u8; MESSAGE_HEADER_LEN];
        buf[16..24].copy_from_slice(&1000u64.to_le_bytes());
        assert_eq!(decode(&buf), Err(Status::InvalidArgument));
    }

    #[test]
    fn empty_body_and_no_attachments_round_trips() {
        let message = WireMessage { conversation_id: 0, message_id: 1, body: Vec::new(), attachments: Vec::new() };
        let decoded = decode(&encode(&message)).unwrap();
        assert_eq!(decoded, message);
    }
}
