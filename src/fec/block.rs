//! Sliding window of in-flight FEC blocks (`RX_RING`), ordered delivery, and
//! loss accounting for blocks that are evicted before they complete.
//!
//! Blocks are retained by index in a bounded window: once a fragment with
//! index `i` arrives, any block older than `i - ring_size + 1` is evicted.
//! An evicted block that never reached `k` shards counts its missing
//! primary fragments as lost, including "virtual" blocks whose index was
//! skipped over entirely (no fragment of that block ever arrived).

use std::collections::BTreeMap;

/// One block's shard buffer, indexed by fragment index `0..n`.
pub struct Block {
    k: u8,
    n: u8,
    shards: Vec<Option<Vec<u8>>>,
    primary_count: u8,
    total_count: u8,
}

impl Block {
    fn new(k: u8, n: u8) -> Self {
        Block {
            k,
            n,
            shards: vec![None; n as usize],
            primary_count: 0,
            total_count: 0,
        }
    }

    /// Insert a fragment. Returns `false` if this slot was already filled
    /// (duplicate fragment, ignored by the caller's counters).
    fn insert(&mut self, fragment_index: u8, data: Vec<u8>) -> bool {
        let slot = &mut self.shards[fragment_index as usize];
        if slot.is_some() {
            return false;
        }
        *slot = Some(data);
        self.total_count += 1;
        if fragment_index < self.k {
            self.primary_count += 1;
        }
        true
    }

    pub fn can_reconstruct(&self) -> bool {
        self.total_count >= self.k
    }

    pub fn needs_fec_recovery(&self) -> bool {
        self.primary_count < self.k
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    pub fn n(&self) -> u8 {
        self.n
    }

    pub fn into_shards(self) -> Vec<Option<Vec<u8>>> {
        self.shards
    }

    fn missing_primary(&self) -> u64 {
        (self.k - self.primary_count) as u64
    }
}

/// A block that completed delivery, ready for FEC reconstruction by the
/// caller (which owns the [`crate::fec::FecCodec`] for the active session).
pub struct ReadyBlock {
    pub block_index: u64,
    pub block: Block,
}

pub struct BlockRing {
    ring_size: u64,
    blocks: BTreeMap<u64, Block>,
    /// Index of the next block this ring will hand out via `drain_ready`.
    next_deliver: u64,
    /// Lowest block index still inside the retained window.
    window_min: u64,
    highest_seen: Option<u64>,
    /// Default `k` used to charge loss against blocks whose index was
    /// skipped entirely (no fragment ever arrived for them).
    current_k: u8,
    pub p_lost: u64,
}

impl BlockRing {
    pub fn new(ring_size: u64) -> Self {
        BlockRing {
            ring_size,
            blocks: BTreeMap::new(),
            next_deliver: 0,
            window_min: 0,
            highest_seen: None,
            current_k: 0,
            p_lost: 0,
        }
    }

    /// Reset the ring to start fresh at `start_index`, as happens on session
    /// rotation. Any still-buffered blocks are dropped without being
    /// counted as lost: a new session means a new loss-accounting epoch.
    pub fn reset(&mut self, start_index: u64) {
        self.blocks.clear();
        self.next_deliver = start_index;
        self.window_min = start_index;
        self.highest_seen = None;
    }

    /// Record one fragment's arrival. Ignored (not even counted) if the
    /// block has already scrolled out of the retained window.
    pub fn insert_fragment(&mut self, block_index: u64, fragment_index: u8, k: u8, n: u8, data: Vec<u8>) {
        self.current_k = k;
        if block_index < self.window_min {
            return;
        }
        let block = self
            .blocks
            .entry(block_index)
            .or_insert_with(|| Block::new(k, n));
        block.insert(fragment_index, data);

        let highest = self.highest_seen.map_or(block_index, |h| h.max(block_index));
        self.highest_seen = Some(highest);
        let new_window_min = highest.saturating_sub(self.ring_size.saturating_sub(1));
        self.evict_up_to(new_window_min);
    }

    fn evict_up_to(&mut self, new_window_min: u64) {
        if new_window_min <= self.window_min {
            return;
        }
        for idx in self.window_min..new_window_min {
            match self.blocks.remove(&idx) {
                Some(block) if block.can_reconstruct() => {
                    // Completed but never drained (shouldn't happen if
                    // drain_ready is called after every insert); treat as
                    // delivered, not lost.
                    let _ = block;
                }
                Some(block) => {
                    self.p_lost += block.missing_primary();
                }
                None if idx < self.next_deliver => {
                    // Already handed to the caller by drain_ready before the
                    // window slid past it; a missing map entry here means
                    // delivered, not never-seen.
                }
                None => {
                    self.p_lost += self.current_k as u64;
                }
            }
        }
        self.window_min = new_window_min;
        if self.next_deliver < self.window_min {
            self.next_deliver = self.window_min;
        }
    }

    /// Pop every consecutive block starting at the delivery cursor that has
    /// enough shards to reconstruct. Stops at the first gap so output stays
    /// in strict block-index order.
    pub fn drain_ready(&mut self) -> Vec<ReadyBlock> {
        let mut out = Vec::new();
        loop {
            let ready = self
                .blocks
                .get(&self.next_deliver)
                .map(|b| b.can_reconstruct())
                .unwrap_or(false);
            if !ready {
                break;
            }
            let block = self.blocks.remove(&self.next_deliver).unwrap();
            out.push(ReadyBlock {
                block_index: self.next_deliver,
                block,
            });
            self.next_deliver += 1;
        }
        out
    }

    pub fn next_deliver(&self) -> u64 {
        self.next_deliver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(n: usize) -> Vec<u8> {
        vec![n as u8; 8]
    }

    #[test]
    fn delivers_in_order_even_if_later_block_completes_first() {
        let mut ring = BlockRing::new(40);
        // Block 1 completes fully before block 0 gets anything.
        for i in 0..2u8 {
            ring.insert_fragment(1, i, 2, 4, frag(i as usize));
        }
        assert!(ring.drain_ready().is_empty(), "block 0 still pending, nothing should drain");

        for i in 0..2u8 {
            ring.insert_fragment(0, i, 2, 4, frag(i as usize));
        }
        let ready = ring.drain_ready();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].block_index, 0);
        assert_eq!(ready[1].block_index, 1);
    }

    #[test]
    fn sequential_delivery_across_multiple_windows_causes_no_loss() {
        // Every block completes and is drained immediately, exactly as
        // channel::FecRx::handle_data does in steady state. The ring
        // (size 2) slides past a dozen already-delivered blocks; none of
        // them should ever be re-counted as lost just because eviction no
        // longer finds them in the map.
        let mut ring = BlockRing::new(2);
        for block_index in 0..12u64 {
            ring.insert_fragment(block_index, 0, 2, 4, frag(0));
            ring.insert_fragment(block_index, 1, 2, 4, frag(1));
            ring.drain_ready();
        }
        assert_eq!(ring.p_lost, 0);
    }

    #[test]
    fn virtual_blocks_skipped_without_any_fragment_are_counted_lost() {
        // RX_RING=2, k=2, n=4: block 0 completes and is drained, then block
        // 5 arrives directly. Blocks 1-3 never received a single fragment
        // and scroll out of the window as "virtual" losses; block 0 must
        // not be re-charged even though eviction also finds no map entry
        // for it (it's gone because it was delivered, not because it was
        // never seen).
        let mut ring = BlockRing::new(2);
        ring.insert_fragment(0, 0, 2, 4, frag(0));
        ring.insert_fragment(0, 1, 2, 4, frag(1));
        ring.drain_ready();

        ring.insert_fragment(5, 0, 2, 4, frag(0));
        ring.insert_fragment(5, 1, 2, 4, frag(1));

        assert_eq!(ring.p_lost, 3 * 2);
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut ring = BlockRing::new(40);
        ring.insert_fragment(0, 0, 2, 4, frag(0));
        ring.insert_fragment(0, 0, 2, 4, frag(99));
        ring.insert_fragment(0, 1, 2, 4, frag(1));
        let ready = ring.drain_ready();
        assert_eq!(ready.len(), 1);
        let shards = ready.into_iter().next().unwrap().block.into_shards();
        assert_eq!(shards[0], Some(frag(0)));
    }

    #[test]
    fn partial_block_evicted_counts_only_missing_primary() {
        let mut ring = BlockRing::new(2);
        // Block 0: k=2, only fragment 0 (primary) arrives, never fragment 1.
        ring.insert_fragment(0, 0, 2, 4, frag(0));
        // Push the window forward past block 0 without completing it.
        ring.insert_fragment(2, 0, 2, 4, frag(0));
        ring.insert_fragment(2, 1, 2, 4, frag(1));
        assert_eq!(ring.p_lost, 1, "only the one missing primary fragment of block 0 counts");
    }

    #[test]
    fn reset_clears_state_without_counting_loss() {
        let mut ring = BlockRing::new(40);
        ring.insert_fragment(0, 0, 2, 4, frag(0));
        ring.reset(1000);
        assert_eq!(ring.p_lost, 0);
        assert_eq!(ring.next_deliver(), 1000);
        ring.insert_fragment(1000, 0, 2, 4, frag(0));
        ring.insert_fragment(1000, 1, 2, 4, frag(1));
        let ready = ring.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].block_index, 1000);
    }
}
