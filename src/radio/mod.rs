//! Parses and builds the 802.11 monitor/injection framing: a radiotap
//! header (HT or VHT variant depending on configured bandwidth), a
//! data-frame MAC header carrying the channel id replicated into two
//! address fields, and the opaque channel payload.

/// Channel bandwidth, selecting the HT vs VHT radiotap variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Bandwidth {
    Bw20,
    Bw40,
    Bw80,
    Bw160,
}

impl Bandwidth {
    fn is_vht(self) -> bool {
        matches!(self, Bandwidth::Bw80 | Bandwidth::Bw160)
    }
}

/// Radiotap/MAC-layer transmit parameters, driven by configuration.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PhyConfig {
    pub bandwidth: Bandwidth,
    pub mcs_index: u8,
    pub short_gi: bool,
    pub stbc: bool,
    pub ldpc: bool,
}

impl Default for PhyConfig {
    fn default() -> Self {
        PhyConfig {
            bandwidth: Bandwidth::Bw20,
            mcs_index: 3,
            short_gi: false,
            stbc: false,
            ldpc: false,
        }
    }
}

const FRAME_CONTROL_DATA: u8 = 0x08;
const MAC_HEADER_LEN: usize = 24;
const RADIOTAP_BASE_LEN: usize = 8;
const HT_MCS_FIELD_LEN: usize = 3;
const VHT_FIELD_LEN: usize = 12;
const RADIOTAP_PRESENT_MCS: u32 = 1 << 19;
const RADIOTAP_PRESENT_VHT: u32 = 1 << 21;

/// Builds and parses per-frame radio framing for one radio link.
pub struct RadioFrameCodec {
    phy: PhyConfig,
    tx_sequence: u16,
}

impl RadioFrameCodec {
    pub fn new(phy: PhyConfig) -> Self {
        RadioFrameCodec { phy, tx_sequence: 0 }
    }

    /// Parse a raw frame off the wire into `(channel_id, payload)`.
    /// Rejects anything that is not the configured data-injection flavor or
    /// whose MAC header does not carry a matching channel-id pattern.
    pub fn decode<'a>(&self, raw: &'a [u8]) -> Option<(u32, &'a [u8])> {
        if raw.len() < RADIOTAP_BASE_LEN {
            return None;
        }
        let it_len = u16::from_le_bytes([raw[2], raw[3]]) as usize;
        if raw.len() < it_len + MAC_HEADER_LEN {
            return None;
        }
        let mac = &raw[it_len..it_len + MAC_HEADER_LEN];
        if mac[0] != FRAME_CONTROL_DATA {
            return None;
        }
        let addr1 = &mac[4..10];
        let addr2 = &mac[10..16];
        if addr1[2..6] != addr2[2..6] {
            return None;
        }
        let channel_id = u32::from_be_bytes(addr1[2..6].try_into().unwrap());
        Some((channel_id, &raw[it_len + MAC_HEADER_LEN..]))
    }

    /// Build an outgoing frame: radiotap header, MAC header carrying
    /// `channel_id`, then `payload`. Advances the 16-bit sequence counter
    /// by 16 per frame, per the 802.11 convention of reserving the low 4
    /// bits for fragment number.
    pub fn encode(&mut self, channel_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut frame = self.radiotap_header();
        frame.extend_from_slice(&self.mac_header(channel_id));
        frame.extend_from_slice(payload);
        self.tx_sequence = self.tx_sequence.wrapping_add(16);
        frame
    }

    fn radiotap_header(&self) -> Vec<u8> {
        if self.phy.bandwidth.is_vht() {
            self.vht_radiotap()
        } else {
            self.ht_radiotap()
        }
    }

    fn ht_flags_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.phy.short_gi {
            flags |= 0x01;
        }
        if self.phy.ldpc {
            flags |= 0x10;
        }
        if self.phy.stbc {
            flags |= 0x20;
        }
        flags
    }

    fn ht_radiotap(&self) -> Vec<u8> {
        let total_len = RADIOTAP_BASE_LEN + HT_MCS_FIELD_LEN;
        let mut buf = Vec::with_capacity(total_len);
        buf.push(0); // it_version
        buf.push(0); // it_pad
        buf.extend_from_slice(&(total_len as u16).to_le_bytes());
        buf.extend_from_slice(&RADIOTAP_PRESENT_MCS.to_le_bytes());
        buf.push(0x07); // mcs.known: bandwidth, mcs index, gi/stbc
        buf.push(self.ht_flags_byte());
        buf.push(self.phy.mcs_index);
        buf
    }

    fn vht_radiotap(&self) -> Vec<u8> {
        let total_len = RADIOTAP_BASE_LEN + VHT_FIELD_LEN;
        let mut buf = Vec::with_capacity(total_len);
        buf.push(0);
        buf.push(0);
        buf.extend_from_slice(&(total_len as u16).to_le_bytes());
        buf.extend_from_slice(&RADIOTAP_PRESENT_VHT.to_le_bytes());
        buf.extend_from_slice(&[0u8; 2]); // vht.known
        buf.push(self.ht_flags_byte()); // vht.flags
        buf.push(bandwidth_code(self.phy.bandwidth));
        buf.extend_from_slice(&[0u8; 8]); // mcs/nss per user, unused fields
        buf
    }

    fn mac_header(&self, channel_id: u32) -> Vec<u8> {
        let mut mac = vec![0u8; MAC_HEADER_LEN];
        mac[0] = FRAME_CONTROL_DATA;
        let id_bytes = channel_id.to_be_bytes();
        mac[6..10].copy_from_slice(&id_bytes); // addr1[2..6]
        mac[12..16].copy_from_slice(&id_bytes); // addr2[2..6]
        mac[22..24].copy_from_slice(&self.tx_sequence.to_le_bytes());
        mac
    }
}

fn bandwidth_code(bw: Bandwidth) -> u8 {
    match bw {
        Bandwidth::Bw20 => 0,
        Bandwidth::Bw40 => 1,
        Bandwidth::Bw80 => 4,
        Bandwidth::Bw160 => 11,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_ht() {
        let mut codec = RadioFrameCodec::new(PhyConfig::default());
        let frame = codec.encode(0x0A0B0C0D, b"payload-bytes");
        let (channel_id, payload) = codec.decode(&frame).unwrap();
        assert_eq!(channel_id, 0x0A0B0C0D);
        assert_eq!(payload, b"payload-bytes");
    }

    #[test]
    fn roundtrip_vht() {
        let phy = PhyConfig {
            bandwidth: Bandwidth::Bw80,
            ..PhyConfig::default()
        };
        let mut codec = RadioFrameCodec::new(phy);
        let frame = codec.encode(42, b"vht");
        let (channel_id, payload) = codec.decode(&frame).unwrap();
        assert_eq!(channel_id, 42);
        assert_eq!(payload, b"vht");
    }

    #[test]
    fn sequence_increments_by_sixteen() {
        let mut codec = RadioFrameCodec::new(PhyConfig::default());
        codec.encode(1, b"a");
        assert_eq!(codec.tx_sequence, 16);
        codec.encode(1, b"b");
        assert_eq!(codec.tx_sequence, 32);
    }

    #[test]
    fn decode_rejects_mismatched_channel_id_fields() {
        let mut codec = RadioFrameCodec::new(PhyConfig::default());
        let mut frame = codec.encode(1, b"x");
        // Corrupt addr2's channel-id bytes so the two copies disagree.
        let it_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        frame[it_len + 12] ^= 0xFF;
        assert!(codec.decode(&frame).is_none());
    }

    #[test]
    fn decode_rejects_non_data_frame_control() {
        let mut codec = RadioFrameCodec::new(PhyConfig::default());
        let mut frame = codec.encode(1, b"x");
        let it_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        frame[it_len] = 0x00;
        assert!(codec.decode(&frame).is_none());
    }
}
