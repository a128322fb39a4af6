//! Wire protocol types and framing codec for CascadeMQ client communication
//!
//! Every frame is a `u32` big-endian length prefix followed by a one-byte
//! command type and the command fields. Inbound `Message` frames carry a
//! metadata envelope (`uvarint` length + `MessageMetadata`) in front of the
//! payload; batched payloads repeat the same envelope shape per message with
//! `SingleMessageMetadata`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::compression::CompressionType;
use crate::error::CascadeClientError;

/// Largest uncompressed payload the protocol permits. A metadata record
/// claiming more than this is corruption, not a large message.
pub const MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

/// Hard cap on a single wire frame, metadata and framing included
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE + 64 * 1024;

/// Protocol version spoken by this client
pub const PROTOCOL_VERSION: i32 = 2;

/// First protocol version that understands the redeliver command
pub const MIN_REDELIVER_PROTOCOL_VERSION: i32 = 2;

/// Subscription mode requested at subscribe time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionType {
    Exclusive = 0,
    Shared = 1,
    Failover = 2,
}

/// Acknowledgment scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckType {
    /// Acknowledge exactly one entry
    Individual = 0,
    /// Acknowledge the entry and everything with a strictly lower id
    Cumulative = 1,
}

/// Reason a message was discarded client-side, reported back on the ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValidationError {
    UncompressedSizeCorruption = 0,
    DecompressionError = 1,
    ChecksumMismatch = 2,
    BatchDeSerializeError = 3,
}

/// Commands sent from the consumer to the broker
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Subscribe {
        topic: String,
        subscription: String,
        consumer_id: u64,
        request_id: u64,
        sub_type: SubscriptionType,
        consumer_name: String,
    },
    Unsubscribe {
        consumer_id: u64,
        request_id: u64,
    },
    CloseConsumer {
        consumer_id: u64,
        request_id: u64,
    },
    Flow {
        consumer_id: u64,
        permits: u32,
    },
    Ack {
        consumer_id: u64,
        ledger_id: u64,
        entry_id: u64,
        ack_type: AckType,
        validation_error: Option<ValidationError>,
    },
    RedeliverUnacknowledgedMessages {
        consumer_id: u64,
    },
}

/// Commands pushed from the broker to the client
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCommand {
    Connected {
        protocol_version: i32,
    },
    Success {
        request_id: u64,
    },
    Error {
        request_id: u64,
        message: String,
    },
    Message {
        consumer_id: u64,
        ledger_id: u64,
        entry_id: u64,
        headers_and_payload: Bytes,
    },
}

mod cmd_type {
    pub const SUBSCRIBE: u8 = 1;
    pub const UNSUBSCRIBE: u8 = 2;
    pub const CLOSE_CONSUMER: u8 = 3;
    pub const FLOW: u8 = 4;
    pub const ACK: u8 = 5;
    pub const REDELIVER: u8 = 6;

    pub const CONNECTED: u8 = 16;
    pub const SUCCESS: u8 = 17;
    pub const ERROR: u8 = 18;
    pub const MESSAGE: u8 = 19;
}

/// Compute the 64-bit xxhash checksum carried in message metadata
pub fn compute_checksum(payload: &[u8]) -> u64 {
    use std::hash::Hasher;

    let mut hasher = twox_hash::XxHash64::with_seed(0);
    hasher.write(payload);
    hasher.finish()
}

/// Encoding and decoding primitives shared by the commands and the metadata
/// envelopes
pub mod wire {
    use super::*;

    /// Write a length-prefixed string. The empty string encodes as length
    /// zero; absence of an optional field is carried by its presence flag,
    /// never by the length.
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_i16(s.len() as i16);
        buf.put_slice(s.as_bytes());
    }

    /// Read a length-prefixed string
    pub fn get_string(buf: &mut Bytes) -> Result<String, CascadeClientError> {
        ensure(buf, 2, "string length")?;
        let len = buf.get_i16();
        if len < 0 {
            return Err(CascadeClientError::protocol("Invalid string length"));
        }
        ensure(buf, len as usize, "string bytes")?;
        let raw = buf.split_to(len as usize);
        String::from_utf8(raw.to_vec())
            .map_err(|_| CascadeClientError::protocol("Invalid UTF-8 string"))
    }

    /// Write an unsigned LEB128 varint
    pub fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                buf.put_u8(byte);
                return;
            }
            buf.put_u8(byte | 0x80);
        }
    }

    /// Read an unsigned LEB128 varint
    pub fn get_uvarint(buf: &mut Bytes) -> Result<u64, CascadeClientError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            ensure(buf, 1, "varint byte")?;
            let byte = buf.get_u8();
            if shift >= 64 {
                return Err(CascadeClientError::protocol("Varint overflow"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Fail with a protocol error if fewer than `needed` bytes remain
    pub fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<(), CascadeClientError> {
        if buf.remaining() < needed {
            return Err(CascadeClientError::protocol(format!(
                "Insufficient bytes for {}",
                what
            )));
        }
        Ok(())
    }
}

/// Per-message metadata preceding the payload of an inbound `Message` frame
#[derive(Debug, Clone, PartialEq)]
pub struct MessageMetadata {
    pub compression: CompressionType,
    pub uncompressed_size: u32,
    pub publish_time: u64,
    pub checksum: Option<u64>,
    pub num_messages_in_batch: Option<u32>,
    pub partition_key: Option<String>,
    pub properties: HashMap<String, String>,
}

const META_FLAG_CHECKSUM: u8 = 0x01;
const META_FLAG_NUM_MESSAGES: u8 = 0x02;
const META_FLAG_PARTITION_KEY: u8 = 0x04;

impl MessageMetadata {
    /// Parse the metadata envelope off the front of `headers_and_payload`,
    /// leaving only the (possibly compressed) payload behind.
    pub fn parse(buf: &mut Bytes) -> Result<MessageMetadata, CascadeClientError> {
        let meta_len = wire::get_uvarint(buf)? as usize;
        wire::ensure(buf, meta_len, "message metadata")?;
        let mut meta = buf.split_to(meta_len);

        wire::ensure(&meta, 1 + 1 + 4 + 8, "metadata header")?;
        let flags = meta.get_u8();
        let compression = CompressionType::try_from(meta.get_u8())
            .map_err(|e| CascadeClientError::protocol(e.to_string()))?;
        let uncompressed_size = meta.get_u32();
        let publish_time = meta.get_u64();

        let checksum = if flags & META_FLAG_CHECKSUM != 0 {
            wire::ensure(&meta, 8, "checksum")?;
            Some(meta.get_u64())
        } else {
            None
        };
        let num_messages_in_batch = if flags & META_FLAG_NUM_MESSAGES != 0 {
            wire::ensure(&meta, 4, "batch size")?;
            Some(meta.get_u32())
        } else {
            None
        };
        let partition_key = if flags & META_FLAG_PARTITION_KEY != 0 {
            Some(wire::get_string(&mut meta)?)
        } else {
            None
        };
        let properties = parse_properties(&mut meta)?;

        Ok(MessageMetadata {
            compression,
            uncompressed_size,
            publish_time,
            checksum,
            num_messages_in_batch,
            partition_key,
            properties,
        })
    }
}

/// Metadata preceding each message inside a batched payload
#[derive(Debug, Clone, PartialEq)]
pub struct SingleMessageMetadata {
    pub payload_size: u32,
    pub partition_key: Option<String>,
    pub properties: HashMap<String, String>,
}

const SINGLE_FLAG_PARTITION_KEY: u8 = 0x01;

impl SingleMessageMetadata {
    /// Read one `[uvarint len][metadata][payload]` element off the front of a
    /// batched payload, returning the metadata and the payload slice.
    pub fn parse_next(buf: &mut Bytes) -> Result<(SingleMessageMetadata, Bytes), CascadeClientError> {
        let meta_len = wire::get_uvarint(buf)? as usize;
        wire::ensure(buf, meta_len, "single message metadata")?;
        let mut meta = buf.split_to(meta_len);

        wire::ensure(&meta, 1 + 4, "single message header")?;
        let flags = meta.get_u8();
        let payload_size = meta.get_u32();
        let partition_key = if flags & SINGLE_FLAG_PARTITION_KEY != 0 {
            Some(wire::get_string(&mut meta)?)
        } else {
            None
        };
        let properties = parse_properties(&mut meta)?;

        wire::ensure(buf, payload_size as usize, "single message payload")?;
        let payload = buf.split_to(payload_size as usize);

        Ok((
            SingleMessageMetadata {
                payload_size,
                partition_key,
                properties,
            },
            payload,
        ))
    }
}

fn parse_properties(buf: &mut Bytes) -> Result<HashMap<String, String>, CascadeClientError> {
    wire::ensure(buf, 2, "property count")?;
    let count = buf.get_u16();
    let mut properties = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = wire::get_string(buf)?;
        let value = wire::get_string(buf)?;
        properties.insert(key, value);
    }
    Ok(properties)
}

/// Framing codec for the client side of a broker connection
#[derive(Debug, Default)]
pub struct ClientCodec;

impl ClientCodec {
    pub fn new() -> Self {
        Self
    }
}

impl tokio_util::codec::Encoder<ClientCommand> for ClientCodec {
    type Error = CascadeClientError;

    fn encode(&mut self, item: ClientCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u32(0); // length placeholder

        match item {
            ClientCommand::Subscribe {
                topic,
                subscription,
                consumer_id,
                request_id,
                sub_type,
                consumer_name,
            } => {
                dst.put_u8(cmd_type::SUBSCRIBE);
                wire::put_string(dst, &topic);
                wire::put_string(dst, &subscription);
                dst.put_u64(consumer_id);
                dst.put_u64(request_id);
                dst.put_u8(sub_type as u8);
                wire::put_string(dst, &consumer_name);
            }
            ClientCommand::Unsubscribe {
                consumer_id,
                request_id,
            } => {
                dst.put_u8(cmd_type::UNSUBSCRIBE);
                dst.put_u64(consumer_id);
                dst.put_u64(request_id);
            }
            ClientCommand::CloseConsumer {
                consumer_id,
                request_id,
            } => {
                dst.put_u8(cmd_type::CLOSE_CONSUMER);
                dst.put_u64(consumer_id);
                dst.put_u64(request_id);
            }
            ClientCommand::Flow {
                consumer_id,
                permits,
            } => {
                dst.put_u8(cmd_type::FLOW);
                dst.put_u64(consumer_id);
                dst.put_u32(permits);
            }
            ClientCommand::Ack {
                consumer_id,
                ledger_id,
                entry_id,
                ack_type,
                validation_error,
            } => {
                dst.put_u8(cmd_type::ACK);
                dst.put_u64(consumer_id);
                dst.put_u64(ledger_id);
                dst.put_u64(entry_id);
                dst.put_u8(ack_type as u8);
                match validation_error {
                    Some(err) => {
                        dst.put_u8(1);
                        dst.put_u8(err as u8);
                    }
                    None => dst.put_u8(0),
                }
            }
            ClientCommand::RedeliverUnacknowledgedMessages { consumer_id } => {
                dst.put_u8(cmd_type::REDELIVER);
                dst.put_u64(consumer_id);
            }
        }

        let frame_len = dst.len() - start - 4;
        (&mut dst[start..start + 4]).put_u32(frame_len as u32);
        Ok(())
    }
}

impl tokio_util::codec::Decoder for ClientCodec {
    type Item = BrokerCommand;
    type Error = CascadeClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let frame_len = (&src[0..4]).get_u32() as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(CascadeClientError::protocol(format!(
                "Frame of {} bytes exceeds maximum {}",
                frame_len, MAX_FRAME_SIZE
            )));
        }
        if src.len() < 4 + frame_len {
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(frame_len).freeze();

        wire::ensure(&frame, 1, "command type")?;
        let command = match frame.get_u8() {
            cmd_type::CONNECTED => {
                wire::ensure(&frame, 4, "protocol version")?;
                BrokerCommand::Connected {
                    protocol_version: frame.get_i32(),
                }
            }
            cmd_type::SUCCESS => {
                wire::ensure(&frame, 8, "request id")?;
                BrokerCommand::Success {
                    request_id: frame.get_u64(),
                }
            }
            cmd_type::ERROR => {
                wire::ensure(&frame, 8, "request id")?;
                let request_id = frame.get_u64();
                let message = wire::get_string(&mut frame)?;
                BrokerCommand::Error {
                    request_id,
                    message,
                }
            }
            cmd_type::MESSAGE => {
                wire::ensure(&frame, 8 + 8 + 8, "message ids")?;
                let consumer_id = frame.get_u64();
                let ledger_id = frame.get_u64();
                let entry_id = frame.get_u64();
                BrokerCommand::Message {
                    consumer_id,
                    ledger_id,
                    entry_id,
                    headers_and_payload: frame,
                }
            }
            other => {
                return Err(CascadeClientError::protocol(format!(
                    "Unknown broker command type {}",
                    other
                )));
            }
        };
        Ok(Some(command))
    }
}
