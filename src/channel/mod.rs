//! The secure, FEC-protected channel: session-key establishment, per-fragment
//! AEAD, and Reed-Solomon block assembly, in both directions.
//!
//! [`FecTx`] lives on the transmit feeder thread; [`FecRx`] lives on the
//! radio driver's receive callback thread. Neither type is `Sync` by
//! construction: each is owned exclusively by one thread, per the
//! concurrency model.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::crypto::{aead, KeyMaterial};
use crate::error::ChannelError;
use crate::fec::block::BlockRing;
use crate::fec::FecCodec;
use crate::wire::{
    data_nonce_bytes, decode_data_nonce, decode_user_packets, encode_data_packet,
    encode_session_packet, parse_frame, DecodedUserPacket, ParsedFrame, SessionDescriptor,
    FEC_ONLY_FLAG, FEC_TYPE_VDM_RS, PACKET_TYPE_DATA, SESSION_NONCE_LEN,
};

/// Upper bound on `block_index` before a session must rotate (`2^55 - 1`).
pub const MAX_BLOCK_IDX: u64 = (1u64 << 55) - 1;
/// Minimum interval between unsolicited session-key re-announcements.
pub const SESSION_KEY_ANNOUNCE_MSEC: u64 = 1000;
/// Default FEC-close timeout: how long the TX waits for the next user
/// packet before padding the current block closed.
pub const DEFAULT_FEC_CLOSE_TIMEOUT_MS: u64 = 20;

fn frame_aad(packet_type: u8, nonce: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + nonce.len());
    aad.push(packet_type);
    aad.extend_from_slice(nonce);
    aad
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionId {
    epoch: u64,
    channel_id: u32,
}

impl SessionId {
    fn dominates(&self, other: &SessionId) -> bool {
        (self.epoch, self.channel_id) > (other.epoch, other.channel_id)
    }
}

/// Atomic counters exported by the RX half, matching the names in the wire
/// protocol's failure taxonomy.
#[derive(Default)]
pub struct RxCounters {
    pub p_all: AtomicU64,
    pub p_dec_err: AtomicU64,
    pub p_lost: AtomicU64,
    pub p_fec_recovered: AtomicU64,
    pub p_bad: AtomicU64,
    pub p_outgoing: AtomicU64,
    pub p_override: AtomicU64,
}

impl RxCounters {
    pub fn snapshot(&self) -> RxCountersSnapshot {
        RxCountersSnapshot {
            p_all: self.p_all.load(Ordering::Relaxed),
            p_dec_err: self.p_dec_err.load(Ordering::Relaxed),
            p_lost: self.p_lost.load(Ordering::Relaxed),
            p_fec_recovered: self.p_fec_recovered.load(Ordering::Relaxed),
            p_bad: self.p_bad.load(Ordering::Relaxed),
            p_outgoing: self.p_outgoing.load(Ordering::Relaxed),
            p_override: self.p_override.load(Ordering::Relaxed),
        }
    }
}

/// Plain serializable snapshot of [`RxCounters`] for the `stats` CLI command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RxCountersSnapshot {
    pub p_all: u64,
    pub p_dec_err: u64,
    pub p_lost: u64,
    pub p_fec_recovered: u64,
    pub p_bad: u64,
    pub p_outgoing: u64,
    pub p_override: u64,
}

/// The receive half of the secure FEC channel. Owns the block-assembly ring
/// and the currently accepted session, if any.
pub struct FecRx {
    key_material: KeyMaterial,
    ring_size: u64,
    session: Option<SessionId>,
    k: u8,
    n: u8,
    session_key: [u8; 32],
    codec: Option<FecCodec>,
    ring: BlockRing,
    pub counters: RxCounters,
}

impl FecRx {
    pub fn new(key_material: KeyMaterial, ring_size: u64) -> Self {
        FecRx {
            key_material,
            ring_size,
            session: None,
            k: 0,
            n: 0,
            session_key: [0u8; 32],
            codec: None,
            ring: BlockRing::new(ring_size),
            counters: RxCounters::default(),
        }
    }

    /// Feed a raw frame already stripped of the radio/MAC layer. Returns the
    /// UserPackets newly available for delivery, in ascending
    /// `(block_index, fragment_index, offset)` order.
    pub fn handle_frame(&mut self, data: &[u8]) -> Vec<DecodedUserPacket> {
        match parse_frame(data) {
            Ok(ParsedFrame::Session { nonce, sealed }) => {
                self.handle_session(nonce, sealed);
                Vec::new()
            }
            Ok(ParsedFrame::Data { nonce, ciphertext }) => self.handle_data(nonce, ciphertext),
            Err(_) => {
                self.counters.p_bad.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        }
    }

    fn handle_session(&mut self, nonce: &[u8; SESSION_NONCE_LEN], sealed: &[u8]) {
        let descriptor = match self.key_material.unseal(nonce, sealed) {
            Ok(d) => d,
            Err(_) => {
                self.counters.p_bad.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let candidate = SessionId {
            epoch: descriptor.epoch,
            channel_id: descriptor.channel_id,
        };
        if let Some(current) = self.session {
            if candidate == current {
                // Idempotent replay of the already-accepted session: no-op.
                return;
            }
            if !candidate.dominates(&current) {
                self.counters.p_override.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.accept_session(descriptor);
    }

    fn accept_session(&mut self, descriptor: SessionDescriptor) {
        self.session = Some(SessionId {
            epoch: descriptor.epoch,
            channel_id: descriptor.channel_id,
        });
        self.k = descriptor.k;
        self.n = descriptor.n;
        self.session_key = descriptor.session_key;
        self.codec = FecCodec::new(descriptor.k, descriptor.n).ok();
        self.ring.reset(0);
    }

    fn handle_data(&mut self, nonce: [u8; 8], ciphertext: &[u8]) -> Vec<DecodedUserPacket> {
        self.counters.p_all.fetch_add(1, Ordering::Relaxed);
        let (block_index, fragment_index) = decode_data_nonce(&nonce);

        let (n, k, session_key) = match self.session {
            Some(_) => (self.n, self.k, self.session_key),
            None => {
                self.counters.p_bad.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        };
        if fragment_index >= n {
            self.counters.p_bad.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }

        let aad = frame_aad(PACKET_TYPE_DATA, &nonce);
        let plaintext = match aead::decrypt_fragment(
            &session_key,
            block_index,
            fragment_index,
            &aad,
            ciphertext,
        ) {
            Ok(p) => p,
            Err(_) => {
                self.counters.p_dec_err.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        };

        self.ring.insert_fragment(block_index, fragment_index, k, n, plaintext);
        self.counters.p_lost.store(self.ring.p_lost, Ordering::Relaxed);

        let mut delivered = Vec::new();
        let codec = match &self.codec {
            Some(c) => c,
            None => return delivered,
        };
        for ready in self.ring.drain_ready() {
            let block_index = ready.block_index;
            let primary_recovered = ready.block.needs_fec_recovery();
            let k_u8 = ready.block.k();
            let shards = ready.block.into_shards();
            let have_primary = shards[..k_u8 as usize].iter().filter(|s| s.is_some()).count() as u8;
            let reconstructed = match codec.reconstruct_data(shards) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if primary_recovered {
                self.counters
                    .p_fec_recovered
                    .fetch_add((k_u8 - have_primary) as u64, Ordering::Relaxed);
            }
            let _ = block_index; // ordering is implicit: caller receives blocks via drain order
            for (fragment_index, shard) in reconstructed.into_iter().enumerate() {
                let mut decoded = decode_user_packets(fragment_index as u8, &shard);
                decoded.retain(|d| !d.packet.is_fec_only());
                self.counters
                    .p_outgoing
                    .fetch_add(decoded.len() as u64, Ordering::Relaxed);
                delivered.extend(decoded);
            }
        }
        delivered
    }
}

/// The transmit half of the secure FEC channel.
pub struct FecTx {
    key_material: KeyMaterial,
    codec: FecCodec,
    k: u8,
    n: u8,
    max_fragment_size: usize,
    epoch: u64,
    channel_id: u32,
    session_key: [u8; 32],
    block_index: u64,
    fragment_index: u8,
    shard_buffer: Vec<Vec<u8>>,
    last_packet_instant: Option<Instant>,
    last_announce_instant: Option<Instant>,
}

impl FecTx {
    pub fn new(
        key_material: KeyMaterial,
        epoch: u64,
        k: u8,
        n: u8,
        max_fragment_size: usize,
    ) -> Result<Self, ChannelError> {
        let codec = FecCodec::new(k, n)?;
        let mut session_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut session_key);
        Ok(FecTx {
            key_material,
            codec,
            k,
            n,
            max_fragment_size,
            epoch,
            channel_id: rand::thread_rng().next_u32(),
            session_key,
            block_index: 0,
            fragment_index: 0,
            shard_buffer: Vec::with_capacity(k as usize),
            last_packet_instant: None,
            last_announce_instant: None,
        })
    }

    /// Build the current `SESSION` announcement frame.
    pub fn session_frame(&self) -> Vec<u8> {
        let descriptor = SessionDescriptor {
            epoch: self.epoch,
            channel_id: self.channel_id,
            fec_type: FEC_TYPE_VDM_RS,
            k: self.k,
            n: self.n,
            session_key: self.session_key,
        };
        let (nonce, sealed) = self.key_material.seal(&descriptor);
        encode_session_packet(&nonce, &sealed)
    }

    /// Returns a fresh announcement frame if `SESSION_KEY_ANNOUNCE_MSEC` has
    /// elapsed since the last one (or none has been sent yet).
    pub fn maybe_announce(&mut self, now: Instant) -> Option<Vec<u8>> {
        let due = match self.last_announce_instant {
            None => true,
            Some(t) => now.duration_since(t) >= Duration::from_millis(SESSION_KEY_ANNOUNCE_MSEC),
        };
        if due {
            self.last_announce_instant = Some(now);
            Some(self.session_frame())
        } else {
            None
        }
    }

    /// Encrypt and frame one UserPacket into the current block. Returns the
    /// wire frames to send: always the primary fragment, plus the block's
    /// parity fragments if this packet completed the block.
    pub fn push_user_packet(&mut self, flags: u8, payload: &[u8], now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let up = crate::wire::UserPacket {
            flags,
            payload: payload.to_vec(),
        };
        let mut plaintext = up.encode();
        plaintext.resize(self.max_fragment_size, 0);

        let fragment_index = self.fragment_index;
        let nonce = data_nonce_bytes(self.block_index, fragment_index);
        let aad = frame_aad(PACKET_TYPE_DATA, &nonce);
        let ciphertext =
            aead::encrypt_fragment(&self.session_key, self.block_index, fragment_index, &aad, &plaintext);
        out.push(encode_data_packet(self.block_index, fragment_index, &ciphertext));

        self.shard_buffer.push(plaintext);
        self.last_packet_instant = Some(now);
        self.fragment_index += 1;

        if self.fragment_index == self.k {
            out.extend(self.finish_block());
        }
        out
    }

    fn finish_block(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if self.n > self.k {
            let shards = self.codec.encode(std::mem::take(&mut self.shard_buffer));
            for (i, shard) in shards.into_iter().enumerate().skip(self.k as usize) {
                let fragment_index = i as u8;
                let nonce = data_nonce_bytes(self.block_index, fragment_index);
                let aad = frame_aad(PACKET_TYPE_DATA, &nonce);
                let ciphertext = aead::encrypt_fragment(
                    &self.session_key,
                    self.block_index,
                    fragment_index,
                    &aad,
                    &shard,
                );
                out.push(encode_data_packet(self.block_index, fragment_index, &ciphertext));
            }
        } else {
            self.shard_buffer.clear();
        }
        self.block_index += 1;
        self.fragment_index = 0;
        self.shard_buffer = Vec::with_capacity(self.k as usize);
        if self.block_index > MAX_BLOCK_IDX {
            self.rotate_session();
        }
        out
    }

    fn rotate_session(&mut self) {
        self.epoch += 1;
        self.channel_id = rand::thread_rng().next_u32();
        rand::thread_rng().fill_bytes(&mut self.session_key);
        self.block_index = 0;
        self.last_announce_instant = None;
    }

    /// If a block is open and `fec_timeout` has elapsed since the last user
    /// packet, pad it closed with `FEC_ONLY` fragments and emit parity.
    pub fn maybe_close_on_timeout(&mut self, now: Instant, fec_timeout: Duration) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if self.fragment_index == 0 {
            return out;
        }
        let elapsed = match self.last_packet_instant {
            Some(t) => now.duration_since(t),
            None => return out,
        };
        if elapsed < fec_timeout {
            return out;
        }
        while self.fragment_index != 0 {
            out.extend(self.push_user_packet(FEC_ONLY_FLAG, &[], now));
        }
        out
    }

    pub fn block_index(&self) -> u64 {
        self.block_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn paired_keys() -> (KeyMaterial, KeyMaterial) {
        let (tx_secret, tx_public) = KeyMaterial::generate_keypair();
        let (rx_secret, rx_public) = KeyMaterial::generate_keypair();
        let tx = KeyMaterial {
            own_secret: tx_secret,
            remote_public: rx_public,
        };
        let rx = KeyMaterial {
            own_secret: rx_secret,
            remote_public: tx_public,
        };
        (tx, rx)
    }

    fn run_round_trip(
        tx: &mut FecTx,
        rx: &mut FecRx,
        now: Instant,
        packets: &[&[u8]],
        drop_fragments: &[u8],
    ) -> Vec<Vec<u8>> {
        let session = tx.session_frame();
        rx.handle_frame(&session);

        let mut all_frames = Vec::new();
        for p in packets {
            all_frames.extend(tx.push_user_packet(0, p, now));
        }

        let mut delivered = Vec::new();
        for frame in all_frames {
            if let crate::wire::ParsedFrame::Data { nonce, .. } =
                crate::wire::parse_frame(&frame).unwrap()
            {
                let (_, fragment_index) = decode_data_nonce(&nonce);
                if drop_fragments.contains(&fragment_index) {
                    continue;
                }
            }
            delivered.extend(rx.handle_frame(&frame));
        }
        delivered.into_iter().map(|d| d.packet.payload).collect()
    }

    #[test]
    fn happy_path_fec_four_of_four() {
        let (tx_keys, rx_keys) = paired_keys();
        let mut tx = FecTx::new(tx_keys, 1, 4, 6, 32).unwrap();
        let mut rx = FecRx::new(rx_keys, 40);
        let now = Instant::now();
        let packets: Vec<Vec<u8>> = vec![vec![0u8; 10], vec![1u8; 20], vec![2u8; 30], vec![3u8; 40]];
        let refs: Vec<&[u8]> = packets.iter().map(|p| p.as_slice()).collect();
        let delivered = run_round_trip(&mut tx, &mut rx, now, &refs, &[]);
        assert_eq!(delivered, packets);
        assert_eq!(rx.counters.p_fec_recovered.load(Ordering::Relaxed), 0);
        assert_eq!(rx.counters.p_lost.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn single_fragment_loss_is_recovered() {
        let (tx_keys, rx_keys) = paired_keys();
        let mut tx = FecTx::new(tx_keys, 1, 4, 6, 32).unwrap();
        let mut rx = FecRx::new(rx_keys, 40);
        let now = Instant::now();
        let packets: Vec<Vec<u8>> = vec![vec![0u8; 10], vec![1u8; 20], vec![2u8; 30], vec![3u8; 40]];
        let refs: Vec<&[u8]> = packets.iter().map(|p| p.as_slice()).collect();
        let delivered = run_round_trip(&mut tx, &mut rx, now, &refs, &[2]);
        assert_eq!(delivered, packets);
        assert_eq!(rx.counters.p_fec_recovered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fec_close_timeout_pads_and_delivers_single_packet() {
        let (tx_keys, rx_keys) = paired_keys();
        let mut tx = FecTx::new(tx_keys, 1, 4, 6, 32).unwrap();
        let mut rx = FecRx::new(rx_keys, 40);
        let t0 = Instant::now();
        let session = tx.session_frame();
        rx.handle_frame(&session);

        let mut frames = tx.push_user_packet(0, b"hello", t0);
        let t1 = t0 + Duration::from_millis(25);
        frames.extend(tx.maybe_close_on_timeout(t1, Duration::from_millis(20)));
        assert_eq!(tx.block_index(), 1, "timeout must close the block");

        let mut delivered = Vec::new();
        for frame in frames {
            delivered.extend(rx.handle_frame(&frame));
        }
        let payloads: Vec<Vec<u8>> = delivered.into_iter().map(|d| d.packet.payload).collect();
        assert_eq!(payloads, vec![b"hello".to_vec()]);
    }

    #[test]
    fn session_replay_is_idempotent() {
        let (tx_keys, rx_keys) = paired_keys();
        let tx = FecTx::new(tx_keys, 1, 2, 4, 16).unwrap();
        let mut rx = FecRx::new(rx_keys, 40);
        let frame = tx.session_frame();
        rx.handle_frame(&frame);
        let before = rx.session;
        rx.handle_frame(&frame);
        assert_eq!(rx.session, before);
        assert_eq!(rx.counters.p_override.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn stale_session_is_rejected_and_counted() {
        let (tx_keys, rx_keys) = paired_keys();
        let mut rx = FecRx::new(rx_keys, 40);

        let newer = SessionDescriptor {
            epoch: 5,
            channel_id: 1,
            fec_type: FEC_TYPE_VDM_RS,
            k: 2,
            n: 4,
            session_key: [1u8; 32],
        };
        let older = SessionDescriptor {
            epoch: 3,
            channel_id: 1,
            fec_type: FEC_TYPE_VDM_RS,
            k: 2,
            n: 4,
            session_key: [2u8; 32],
        };

        let (nonce, sealed) = tx_keys.seal(&newer);
        rx.handle_frame(&encode_session_packet(&nonce, &sealed));
        assert_eq!(rx.session, Some(SessionId { epoch: 5, channel_id: 1 }));

        let (nonce, sealed) = tx_keys.seal(&older);
        rx.handle_frame(&encode_session_packet(&nonce, &sealed));
        assert_eq!(
            rx.session,
            Some(SessionId { epoch: 5, channel_id: 1 }),
            "older epoch must not regress the accepted session"
        );
        assert_eq!(rx.counters.p_override.load(Ordering::Relaxed), 1);
    }
}
