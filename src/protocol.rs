//! Control messages exchanged over plain SEND.
//!
//! Every control buffer starts with a 4-byte little-endian tag followed by a
//! packed little-endian payload whose layout the tag selects.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};

use crate::{
    error::{RdmaError, Result},
    mem::buffer::Buffer,
};

const TAG_SIZE: usize = size_of::<u32>();

/// `LargeBufferAck` result of a completed pull.
pub const LARGE_BUFFER_OK: u32 = 0;
/// `LargeBufferAck` result of a failed pull.
pub const LARGE_BUFFER_FAILED: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlTag {
    CreditUpdate = 1,
    LargeBufferSend = 2,
    LargeBufferAck = 3,
    AccessExchange = 4,
    SendDirectSignal = 5,
    RegDirectBuffer = 6,
    UnregDirectBuffer = 7,
}

impl ControlTag {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::CreditUpdate),
            2 => Some(Self::LargeBufferSend),
            3 => Some(Self::LargeBufferAck),
            4 => Some(Self::AccessExchange),
            5 => Some(Self::SendDirectSignal),
            6 => Some(Self::RegDirectBuffer),
            7 => Some(Self::UnregDirectBuffer),
            _ => None,
        }
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CreditUpdateWire {
    credit: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LargeBufferSendWire {
    id: u64,
    address: u64,
    length: u64,
    remote_key: u32,
    ty: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LargeBufferAckWire {
    id: u64,
    result: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct AccessExchangeWire {
    address: u64,
    length: u64,
    remote_key: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SendDirectSignalWire {
    source_id: u64,
    sink_id: u64,
    length: u64,
    ty: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RegDirectBufferWire {
    sink_id: u64,
    address: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct UnregDirectBufferWire {
    sink_id: u64,
}

/// Size of the largest encoded control message.
pub const MAX_CONTROL_MESSAGE_SIZE: usize = TAG_SIZE + size_of::<LargeBufferSendWire>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Receive buffers re-posted since the last announcement.
    CreditUpdate { credit: u32 },
    /// Announces a buffer too large for a receive buffer; the peer pulls it.
    LargeBufferSend {
        id: u64,
        address: u64,
        length: u64,
        remote_key: u32,
        ty: u32,
    },
    /// The peer finished pulling the buffer announced under `id`.
    LargeBufferAck { id: u64, result: u32 },
    /// Location and key of the sender's registered memory.
    AccessExchange {
        address: u64,
        length: u64,
        remote_key: u32,
    },
    /// `length` bytes were written into the direct buffer `sink_id`.
    SendDirectSignal {
        source_id: u64,
        sink_id: u64,
        length: u64,
        ty: u32,
    },
    RegDirectBuffer { sink_id: u64, address: u64 },
    UnregDirectBuffer { sink_id: u64 },
}

impl ControlMessage {
    pub fn tag(&self) -> ControlTag {
        match *self {
            ControlMessage::CreditUpdate { .. } => ControlTag::CreditUpdate,
            ControlMessage::LargeBufferSend { .. } => ControlTag::LargeBufferSend,
            ControlMessage::LargeBufferAck { .. } => ControlTag::LargeBufferAck,
            ControlMessage::AccessExchange { .. } => ControlTag::AccessExchange,
            ControlMessage::SendDirectSignal { .. } => ControlTag::SendDirectSignal,
            ControlMessage::RegDirectBuffer { .. } => ControlTag::RegDirectBuffer,
            ControlMessage::UnregDirectBuffer { .. } => ControlTag::UnregDirectBuffer,
        }
    }

    /// Number of bytes [`Self::encode_into`] writes.
    pub fn encoded_len(&self) -> usize {
        TAG_SIZE
            + match *self {
                ControlMessage::CreditUpdate { .. } => size_of::<CreditUpdateWire>(),
                ControlMessage::LargeBufferSend { .. } => size_of::<LargeBufferSendWire>(),
                ControlMessage::LargeBufferAck { .. } => size_of::<LargeBufferAckWire>(),
                ControlMessage::AccessExchange { .. } => size_of::<AccessExchangeWire>(),
                ControlMessage::SendDirectSignal { .. } => size_of::<SendDirectSignalWire>(),
                ControlMessage::RegDirectBuffer { .. } => size_of::<RegDirectBufferWire>(),
                ControlMessage::UnregDirectBuffer { .. } => size_of::<UnregDirectBufferWire>(),
            }
    }

    #[allow(clippy::as_conversions)] // fieldless enum discriminant
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.extend_from_slice(&(self.tag() as u32).to_le_bytes());
        match *self {
            ControlMessage::CreditUpdate { credit } => put(
                &mut bytes,
                &CreditUpdateWire {
                    credit: credit.to_le(),
                },
            ),
            ControlMessage::LargeBufferSend {
                id,
                address,
                length,
                remote_key,
                ty,
            } => put(
                &mut bytes,
                &LargeBufferSendWire {
                    id: id.to_le(),
                    address: address.to_le(),
                    length: length.to_le(),
                    remote_key: remote_key.to_le(),
                    ty: ty.to_le(),
                },
            ),
            ControlMessage::LargeBufferAck { id, result } => put(
                &mut bytes,
                &LargeBufferAckWire {
                    id: id.to_le(),
                    result: result.to_le(),
                },
            ),
            ControlMessage::AccessExchange {
                address,
                length,
                remote_key,
            } => put(
                &mut bytes,
                &AccessExchangeWire {
                    address: address.to_le(),
                    length: length.to_le(),
                    remote_key: remote_key.to_le(),
                },
            ),
            ControlMessage::SendDirectSignal {
                source_id,
                sink_id,
                length,
                ty,
            } => put(
                &mut bytes,
                &SendDirectSignalWire {
                    source_id: source_id.to_le(),
                    sink_id: sink_id.to_le(),
                    length: length.to_le(),
                    ty: ty.to_le(),
                },
            ),
            ControlMessage::RegDirectBuffer { sink_id, address } => put(
                &mut bytes,
                &RegDirectBufferWire {
                    sink_id: sink_id.to_le(),
                    address: address.to_le(),
                },
            ),
            ControlMessage::UnregDirectBuffer { sink_id } => put(
                &mut bytes,
                &UnregDirectBufferWire {
                    sink_id: sink_id.to_le(),
                },
            ),
        }
        bytes
    }

    /// Appends the encoded message to `buf`.
    pub fn encode_into(&self, buf: &mut Buffer) -> Result<()> {
        buf.write_bytes(&self.encode())
    }

    /// Decodes a received control buffer. Unknown tags and short payloads
    /// are protocol violations.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (tag, payload) = bytes
            .split_first_chunk::<TAG_SIZE>()
            .ok_or_else(|| RdmaError::Protocol(format!("{} byte control message", bytes.len())))?;
        let raw = u32::from_le_bytes(*tag);
        let tag = ControlTag::from_u32(raw)
            .ok_or_else(|| RdmaError::Protocol(format!("unknown control tag {raw}")))?;
        let msg = match tag {
            ControlTag::CreditUpdate => {
                let w: CreditUpdateWire = take(tag, payload)?;
                ControlMessage::CreditUpdate {
                    credit: u32::from_le(w.credit),
                }
            }
            ControlTag::LargeBufferSend => {
                let w: LargeBufferSendWire = take(tag, payload)?;
                ControlMessage::LargeBufferSend {
                    id: u64::from_le(w.id),
                    address: u64::from_le(w.address),
                    length: u64::from_le(w.length),
                    remote_key: u32::from_le(w.remote_key),
                    ty: u32::from_le(w.ty),
                }
            }
            ControlTag::LargeBufferAck => {
                let w: LargeBufferAckWire = take(tag, payload)?;
                ControlMessage::LargeBufferAck {
                    id: u64::from_le(w.id),
                    result: u32::from_le(w.result),
                }
            }
            ControlTag::AccessExchange => {
                let w: AccessExchangeWire = take(tag, payload)?;
                ControlMessage::AccessExchange {
                    address: u64::from_le(w.address),
                    length: u64::from_le(w.length),
                    remote_key: u32::from_le(w.remote_key),
                }
            }
            ControlTag::SendDirectSignal => {
                let w: SendDirectSignalWire = take(tag, payload)?;
                ControlMessage::SendDirectSignal {
                    source_id: u64::from_le(w.source_id),
                    sink_id: u64::from_le(w.sink_id),
                    length: u64::from_le(w.length),
                    ty: u32::from_le(w.ty),
                }
            }
            ControlTag::RegDirectBuffer => {
                let w: RegDirectBufferWire = take(tag, payload)?;
                ControlMessage::RegDirectBuffer {
                    sink_id: u64::from_le(w.sink_id),
                    address: u64::from_le(w.address),
                }
            }
            ControlTag::UnregDirectBuffer => {
                let w: UnregDirectBufferWire = take(tag, payload)?;
                ControlMessage::UnregDirectBuffer {
                    sink_id: u64::from_le(w.sink_id),
                }
            }
        };
        Ok(msg)
    }
}

fn put<T: Pod>(bytes: &mut Vec<u8>, wire: &T) {
    bytes.extend_from_slice(bytemuck::bytes_of(wire));
}

fn take<T: Pod>(tag: ControlTag, payload: &[u8]) -> Result<T> {
    let len = size_of::<T>();
    let Some(raw) = payload.get(..len) else {
        return Err(RdmaError::Protocol(format!(
            "{tag:?} payload truncated: {} of {len} bytes",
            payload.len()
        )));
    };
    Ok(bytemuck::pod_read_unaligned(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_update_layout() {
        let bytes = ControlMessage::CreditUpdate { credit: 0x0102_0304 }.encode();
        assert_eq!(bytes, [1, 0, 0, 0, 4, 3, 2, 1]);
    }

    #[test]
    fn large_buffer_send_layout() {
        let msg = ControlMessage::LargeBufferSend {
            id: 1,
            address: 0x1000,
            length: 300,
            remote_key: 0xaabb,
            ty: 9,
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), MAX_CONTROL_MESSAGE_SIZE);
        assert_eq!(bytes.len(), msg.encoded_len());
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[4..12], &1u64.to_le_bytes());
        assert_eq!(&bytes[12..20], &0x1000u64.to_le_bytes());
        assert_eq!(&bytes[20..28], &300u64.to_le_bytes());
        assert_eq!(&bytes[28..32], &0xaabbu32.to_le_bytes());
        assert_eq!(&bytes[32..36], &9u32.to_le_bytes());
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn direct_messages_decode_with_trailing_bytes() {
        let msg = ControlMessage::SendDirectSignal {
            source_id: 3,
            sink_id: 0xdead_0000,
            length: 64,
            ty: 2,
        };
        let mut bytes = msg.encode();
        assert_eq!(bytes.len(), 32);
        bytes.extend_from_slice(&[0xff; 4]);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);

        let unreg = ControlMessage::UnregDirectBuffer { sink_id: 77 };
        assert_eq!(unreg.encoded_len(), 12);
        assert_eq!(ControlMessage::decode(&unreg.encode()).unwrap(), unreg);
    }

    #[test]
    fn every_message_fits_the_largest_size() {
        let msgs = [
            ControlMessage::CreditUpdate { credit: 1 },
            ControlMessage::LargeBufferAck {
                id: 1,
                result: LARGE_BUFFER_FAILED,
            },
            ControlMessage::AccessExchange {
                address: 1,
                length: 2,
                remote_key: 3,
            },
            ControlMessage::RegDirectBuffer {
                sink_id: 1,
                address: 2,
            },
        ];
        for msg in msgs {
            assert!(msg.encoded_len() <= MAX_CONTROL_MESSAGE_SIZE);
            assert_eq!(msg.encode().len(), msg.encoded_len());
        }
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let mut bytes = ControlMessage::CreditUpdate { credit: 1 }.encode();
        bytes[0] = 8;
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(RdmaError::Protocol(_))
        ));
        bytes[0] = 0;
        assert!(ControlMessage::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_payload_is_a_protocol_error() {
        let bytes = ControlMessage::AccessExchange {
            address: 1,
            length: 2,
            remote_key: 3,
        }
        .encode();
        assert!(matches!(
            ControlMessage::decode(&bytes[..bytes.len() - 1]),
            Err(RdmaError::Protocol(_))
        ));
        assert!(matches!(
            ControlMessage::decode(&[1, 0]),
            Err(RdmaError::Protocol(_))
        ));
        assert!(ControlMessage::decode(&[]).is_err());
    }
}
