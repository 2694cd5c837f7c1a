//! On-wire framing for session-key announcements and FEC data fragments.
//!
//! See the module doc on [`crate::channel`] for how these frames fit into
//! the secure FEC channel's TX/RX algorithms.

pub mod rtp_seq;

use crate::error::ChannelError;

/// Session-key announcement packet type.
pub const PACKET_TYPE_SESSION: u8 = 0x01;
/// FEC data fragment packet type.
pub const PACKET_TYPE_DATA: u8 = 0x02;

/// Nonce length for the session packet's outer sealed box.
pub const SESSION_NONCE_LEN: usize = 24;

/// FEC type tag for Reed-Solomon over Vandermonde matrices, the only one this
/// crate speaks.
pub const FEC_TYPE_VDM_RS: u8 = 1;

/// Ceiling on a single UserPacket's payload.
pub const MAX_PAYLOAD: usize = 1400;

/// Flag bit marking a UserPacket as padding injected only to close a block.
pub const FEC_ONLY_FLAG: u8 = 0x01;

/// Fixed byte length of an encoded [`SessionDescriptor`] (pre-encryption).
pub const SESSION_DESCRIPTOR_LEN: usize = 8 + 4 + 1 + 1 + 1 + 32;

/// The plaintext sealed inside a `SESSION` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub epoch: u64,
    pub channel_id: u32,
    pub fec_type: u8,
    pub k: u8,
    pub n: u8,
    pub session_key: [u8; 32],
}

impl SessionDescriptor {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SESSION_DESCRIPTOR_LEN);
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        buf.extend_from_slice(&self.channel_id.to_be_bytes());
        buf.push(self.fec_type);
        buf.push(self.k);
        buf.push(self.n);
        buf.extend_from_slice(&self.session_key);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ChannelError> {
        if buf.len() < SESSION_DESCRIPTOR_LEN {
            return Err(ChannelError::ShortFrame {
                len: buf.len(),
                needed: SESSION_DESCRIPTOR_LEN,
            });
        }
        let epoch = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let channel_id = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let fec_type = buf[12];
        let k = buf[13];
        let n = buf[14];
        if k == 0 || k > n {
            return Err(ChannelError::InvalidFecParams { k, n });
        }
        let mut session_key = [0u8; 32];
        session_key.copy_from_slice(&buf[15..47]);
        Ok(SessionDescriptor {
            epoch,
            channel_id,
            fec_type,
            k,
            n,
            session_key,
        })
    }
}

/// Encode the `block_index << 8 | fragment_index` nonce used both as the
/// AEAD nonce seed and as the wire representation in a DATA packet header.
pub fn data_nonce_bytes(block_index: u64, fragment_index: u8) -> [u8; 8] {
    let combined = (block_index << 8) | fragment_index as u64;
    combined.to_be_bytes()
}

pub fn decode_data_nonce(bytes: &[u8; 8]) -> (u64, u8) {
    let combined = u64::from_be_bytes(*bytes);
    (combined >> 8, (combined & 0xFF) as u8)
}

/// Build a full `SESSION` packet: type || nonce || sealed ciphertext.
pub fn encode_session_packet(nonce: &[u8; SESSION_NONCE_LEN], sealed: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + SESSION_NONCE_LEN + sealed.len());
    buf.push(PACKET_TYPE_SESSION);
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(sealed);
    buf
}

/// Build a full `DATA` packet: type || nonce(8) || ciphertext.
pub fn encode_data_packet(block_index: u64, fragment_index: u8, ciphertext: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + ciphertext.len());
    buf.push(PACKET_TYPE_DATA);
    buf.extend_from_slice(&data_nonce_bytes(block_index, fragment_index));
    buf.extend_from_slice(ciphertext);
    buf
}

/// The two shapes of frame this channel understands.
pub enum ParsedFrame<'a> {
    Session {
        nonce: &'a [u8; SESSION_NONCE_LEN],
        sealed: &'a [u8],
    },
    Data {
        nonce: [u8; 8],
        ciphertext: &'a [u8],
    },
}

/// Split a raw frame into its type-tagged parts without touching crypto.
pub fn parse_frame(data: &[u8]) -> Result<ParsedFrame<'_>, ChannelError> {
    if data.is_empty() {
        return Err(ChannelError::ShortFrame { len: 0, needed: 1 });
    }
    match data[0] {
        PACKET_TYPE_SESSION => {
            if data.len() < 1 + SESSION_NONCE_LEN {
                return Err(ChannelError::ShortFrame {
                    len: data.len(),
                    needed: 1 + SESSION_NONCE_LEN,
                });
            }
            let nonce: &[u8; SESSION_NONCE_LEN] =
                data[1..1 + SESSION_NONCE_LEN].try_into().unwrap();
            Ok(ParsedFrame::Session {
                nonce,
                sealed: &data[1 + SESSION_NONCE_LEN..],
            })
        }
        PACKET_TYPE_DATA => {
            if data.len() < 9 {
                return Err(ChannelError::ShortFrame {
                    len: data.len(),
                    needed: 9,
                });
            }
            let nonce: [u8; 8] = data[1..9].try_into().unwrap();
            Ok(ParsedFrame::Data {
                nonce,
                ciphertext: &data[9..],
            })
        }
        other => Err(ChannelError::UnknownPacketType(other)),
    }
}

/// A single logical user datagram carried inside a data fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPacket {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl UserPacket {
    pub fn is_fec_only(&self) -> bool {
        self.flags & FEC_ONLY_FLAG != 0
    }

    /// Encode as `flags(1) || size(2 BE) || payload`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.payload.len());
        buf.push(self.flags);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// A UserPacket decoded out of a primary fragment, with the offset it was
/// found at so callers can reconstruct arrival order within the fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedUserPacket {
    pub fragment_index: u8,
    pub offset: usize,
    pub packet: UserPacket,
}

/// Parse a primary fragment's plaintext (already stripped of AEAD framing)
/// into the stream of UserPackets it carries. Stops at the first header that
/// doesn't fit in the remaining bytes (zero-padding tail).
pub fn decode_user_packets(fragment_index: u8, plaintext: &[u8]) -> Vec<DecodedUserPacket> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + 3 <= plaintext.len() {
        let flags = plaintext[offset];
        let size = u16::from_be_bytes([plaintext[offset + 1], plaintext[offset + 2]]) as usize;
        let start = offset + 3;
        if size > MAX_PAYLOAD || start + size > plaintext.len() {
            break;
        }
        let payload = plaintext[start..start + size].to_vec();
        out.push(DecodedUserPacket {
            fragment_index,
            offset,
            packet: UserPacket { flags, payload },
        });
        offset = start + size;
        if flags == 0 && size == 0 {
            // A well-formed stream never emits a fully-zero header except as
            // trailing padding; treat it as the end of real data.
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_descriptor_roundtrip() {
        let d = SessionDescriptor {
            epoch: 42,
            channel_id: 0x0102_0310,
            fec_type: FEC_TYPE_VDM_RS,
            k: 4,
            n: 6,
            session_key: [7u8; 32],
        };
        let encoded = d.encode();
        assert_eq!(encoded.len(), SESSION_DESCRIPTOR_LEN);
        let decoded = SessionDescriptor::decode(&encoded).unwrap();
        assert_eq!(decoded, d);
    }

    #[test]
    fn session_descriptor_rejects_k_greater_than_n() {
        let d = SessionDescriptor {
            epoch: 1,
            channel_id: 1,
            fec_type: FEC_TYPE_VDM_RS,
            k: 6,
            n: 4,
            session_key: [0u8; 32],
        };
        let encoded = d.encode();
        assert!(matches!(
            SessionDescriptor::decode(&encoded),
            Err(ChannelError::InvalidFecParams { k: 6, n: 4 })
        ));
    }

    #[test]
    fn data_nonce_roundtrip() {
        let bytes = data_nonce_bytes(123_456_789, 7);
        let (block_index, fragment_index) = decode_data_nonce(&bytes);
        assert_eq!(block_index, 123_456_789);
        assert_eq!(fragment_index, 7);
    }

    #[test]
    fn parse_frame_rejects_unknown_type() {
        assert!(matches!(
            parse_frame(&[0xFF, 0, 0]),
            Err(ChannelError::UnknownPacketType(0xFF))
        ));
    }

    #[test]
    fn parse_frame_rejects_short_data_frame() {
        assert!(matches!(
            parse_frame(&[PACKET_TYPE_DATA, 0, 0]),
            Err(ChannelError::ShortFrame { .. })
        ));
    }

    #[test]
    fn user_packet_stream_roundtrip() {
        let packets = [
            UserPacket { flags: 0, payload: vec![1, 2, 3] },
            UserPacket { flags: 0, payload: vec![4; 200] },
        ];
        let mut plaintext = Vec::new();
        for p in &packets {
            plaintext.extend_from_slice(&p.encode());
        }
        plaintext.resize(plaintext.len() + 16, 0); // simulate shard padding
        let decoded = decode_user_packets(0, &plaintext);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].packet, packets[0]);
        assert_eq!(decoded[1].packet, packets[1]);
        assert_eq!(decoded[0].offset, 0);
        assert_eq!(decoded[1].offset, 3 + 3);
    }

    #[test]
    fn decode_user_packets_skips_fec_only() {
        let fec_only = UserPacket { flags: FEC_ONLY_FLAG, payload: vec![] };
        let plaintext = fec_only.encode();
        let decoded = decode_user_packets(0, &plaintext);
        assert_eq!(decoded.len(), 0, "fully zero-length FEC_ONLY header ends the stream");
    }
}
