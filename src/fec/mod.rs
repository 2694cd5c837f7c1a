//! Reed-Solomon erasure coding over fixed-size fragment shards, and the
//! sliding block-assembly window built on top of it.

pub mod block;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::ChannelError;

/// Thin wrapper around [`reed_solomon_erasure`] pinning the `(k, n)` pair
/// for one session, so callers never have to re-derive the parity count.
pub struct FecCodec {
    k: u8,
    n: u8,
    rs: ReedSolomon,
}

impl FecCodec {
    pub fn new(k: u8, n: u8) -> Result<Self, ChannelError> {
        if k == 0 || k > n {
            return Err(ChannelError::InvalidFecParams { k, n });
        }
        let rs = ReedSolomon::new(k as usize, (n - k) as usize)
            .expect("k and n were already validated to form a legal (data, parity) split");
        Ok(FecCodec { k, n, rs })
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn n(&self) -> u8 {
        self.n
    }

    /// Encode `k` equal-length data shards into `n - k` parity shards,
    /// returning all `n` shards in fragment-index order.
    pub fn encode(&self, data_shards: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        debug_assert_eq!(data_shards.len(), self.k as usize);
        let shard_len = data_shards[0].len();
        let mut shards = data_shards;
        shards.extend((0..self.n - self.k).map(|_| vec![0u8; shard_len]));
        self.rs
            .encode(&mut shards)
            .expect("all shards are the same length by construction");
        shards
    }

    /// Reconstruct the `k` data shards given a `n`-length vector where
    /// missing fragments are `None`. Requires at least `k` shards present.
    pub fn reconstruct_data(
        &self,
        mut shards: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<Vec<u8>>, ChannelError> {
        let have = shards.iter().filter(|s| s.is_some()).count();
        if have < self.k as usize {
            return Err(ChannelError::FecDecodeImpossible {
                block_index: 0,
                have,
                k: self.k,
            });
        }
        self.rs
            .reconstruct(&mut shards)
            .expect("shard count matches n and enough shards are present");
        Ok(shards
            .into_iter()
            .take(self.k as usize)
            .map(|s| s.expect("reconstruct fills every slot"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad(data: &[u8], len: usize) -> Vec<u8> {
        let mut v = data.to_vec();
        v.resize(len, 0);
        v
    }

    #[test]
    fn encode_then_reconstruct_with_losses() {
        let codec = FecCodec::new(4, 6).unwrap();
        let shard_len = 16;
        let data: Vec<Vec<u8>> = (0..4u8).map(|i| pad(&[i; 4], shard_len)).collect();
        let expected = data.clone();
        let encoded = codec.encode(data);
        assert_eq!(encoded.len(), 6);

        // Drop two shards (one primary, one parity), still >= k present.
        let mut received: Vec<Option<Vec<u8>>> = encoded.into_iter().map(Some).collect();
        received[1] = None;
        received[5] = None;

        let reconstructed = codec.reconstruct_data(received).unwrap();
        assert_eq!(reconstructed, expected);
    }

    #[test]
    fn reconstruct_fails_below_k_shards() {
        let codec = FecCodec::new(4, 6).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = vec![Some(vec![0u8; 8]); 6];
        shards[0] = None;
        shards[1] = None;
        shards[2] = None;
        let err = codec.reconstruct_data(shards).unwrap_err();
        assert!(matches!(err, ChannelError::FecDecodeImpossible { have: 3, k: 4, .. }));
    }

    #[test]
    fn new_rejects_invalid_params() {
        assert!(FecCodec::new(0, 4).is_err());
        assert!(FecCodec::new(5, 4).is_err());
    }
}
