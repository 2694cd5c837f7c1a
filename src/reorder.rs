//! Bounded reorder buffer for 16-bit wrap-around sequence numbers, used to
//! restore in-order delivery of RTP packets coming out of a lossy
//! [`crate::channel`] before they reach the stream dispatcher.

use std::collections::BTreeMap;

/// Capacity of the out-of-order buffer before an overflow flush fires.
pub const MAX_BUFFER: usize = 5;
/// Consecutive near-future arrivals required to trigger an early flush.
pub const MONOTONIC_THRESHOLD: u32 = 3;

/// Restores sequence order over a sliding window, delivering payloads via
/// the output vector passed to [`ReorderWindow::push`].
pub struct ReorderWindow {
    last_delivered: u16,
    first: bool,
    buffer: BTreeMap<u16, Vec<u8>>,
    monotonic_ooo_count: u32,
    /// Sequence number the current near-miss run is measured from: the
    /// cursor while the run is empty, the previous run member once it isn't.
    run_ref: u16,
}

impl Default for ReorderWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderWindow {
    pub fn new() -> Self {
        ReorderWindow {
            last_delivered: 0,
            first: true,
            buffer: BTreeMap::new(),
            monotonic_ooo_count: 0,
            run_ref: 0,
        }
    }

    /// Feed one packet. Delivered payloads, in order, are appended to `out`.
    pub fn push(&mut self, seq: u16, payload: Vec<u8>, out: &mut Vec<(u16, Vec<u8>)>) {
        if self.first {
            self.last_delivered = seq.wrapping_sub(1);
            self.first = false;
        }

        let next = self.last_delivered.wrapping_add(1);
        if seq == next {
            self.last_delivered = seq;
            out.push((seq, payload));
            self.monotonic_ooo_count = 0;
            self.drain_consecutive(out);
            self.run_ref = self.last_delivered;
            return;
        }

        let dist = seq.wrapping_sub(self.last_delivered) as i16;
        if dist <= 0 {
            // Already delivered or older than the current cursor: drop.
            return;
        }
        if self.buffer.contains_key(&seq) {
            return;
        }
        self.buffer.insert(seq, payload);

        // Distance from the previous member of the current near-miss run
        // (or from the cursor, if no run is active yet). A lost packet
        // immediately followed by a tight run of arrivals just past it
        // trips this well before MAX_BUFFER fills up.
        let run_dist = seq.wrapping_sub(self.run_ref) as i16;
        if run_dist > 0 && run_dist < MONOTONIC_THRESHOLD as i16 {
            self.monotonic_ooo_count += 1;
            self.run_ref = seq;
            if self.monotonic_ooo_count >= MONOTONIC_THRESHOLD {
                self.flush(seq, out);
                return;
            }
        } else {
            self.monotonic_ooo_count = 0;
            self.run_ref = self.last_delivered;
        }
        if self.buffer.len() >= MAX_BUFFER {
            self.flush(seq, out);
        }
    }

    fn drain_consecutive(&mut self, out: &mut Vec<(u16, Vec<u8>)>) {
        while let Some(payload) = self.buffer.remove(&self.last_delivered.wrapping_add(1)) {
            self.last_delivered = self.last_delivered.wrapping_add(1);
            out.push((self.last_delivered, payload));
        }
    }

    fn flush(&mut self, seq: u16, out: &mut Vec<(u16, Vec<u8>)>) {
        for (k, v) in std::mem::take(&mut self.buffer) {
            out.push((k, v));
        }
        self.last_delivered = seq;
        self.monotonic_ooo_count = 0;
        self.run_ref = seq;
    }
}
