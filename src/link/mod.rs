//! Adaptive-link control: rolling signal-quality windows, the FEC-level
//! ladder, periodic report emission, and TX power management.

pub mod ladder;

use std::collections::VecDeque;
use std::net::UdpSocket;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use ladder::FecLadder;

const WINDOW_HORIZON: Duration = Duration::from_secs(1);

struct RssiSample {
    ant1: u8,
    ant2: u8,
    at: Instant,
}

struct SnrSample {
    ant1: i8,
    ant2: i8,
    at: Instant,
}

struct FecSample {
    all: u32,
    recovered: u32,
    lost: u32,
    at: Instant,
}

/// The three rolling windows, guarded by one non-reentrant mutex.
///
/// `calculate_quality` (a public, locking entry point) needs the result of
/// `accumulated_fec` (also a public, locking entry point). Rather than reach
/// for a recursive mutex, every public method is a thin wrapper that locks
/// once and delegates to a `*_locked` helper taking `&mut WindowsInner`
/// directly; the `_locked` helpers call each other freely without ever
/// re-acquiring the lock.
struct WindowsInner {
    rssi: VecDeque<RssiSample>,
    snr: VecDeque<SnrSample>,
    fec: VecDeque<FecSample>,
}

impl WindowsInner {
    fn new() -> Self {
        WindowsInner {
            rssi: VecDeque::new(),
            snr: VecDeque::new(),
            fec: VecDeque::new(),
        }
    }

    fn trim_locked(&mut self, now: Instant) {
        while let Some(front) = self.rssi.front() {
            if now.duration_since(front.at) > WINDOW_HORIZON {
                self.rssi.pop_front();
            } else {
                break;
            }
        }
        while let Some(front) = self.snr.front() {
            if now.duration_since(front.at) > WINDOW_HORIZON {
                self.snr.pop_front();
            } else {
                break;
            }
        }
        while let Some(front) = self.fec.front() {
            if now.duration_since(front.at) > WINDOW_HORIZON {
                self.fec.pop_front();
            } else {
                break;
            }
        }
    }

    fn avg_rssi_locked(&self) -> f32 {
        if self.rssi.is_empty() {
            return 0.0;
        }
        let (sum1, sum2): (u32, u32) = self
            .rssi
            .iter()
            .fold((0, 0), |(a, b), s| (a + s.ant1 as u32, b + s.ant2 as u32));
        let n = self.rssi.len() as f32;
        (sum1 as f32 / n).max(sum2 as f32 / n)
    }

    fn avg_snr_locked(&self) -> f32 {
        if self.snr.is_empty() {
            return 0.0;
        }
        let (sum1, sum2): (i32, i32) = self
            .snr
            .iter()
            .fold((0, 0), |(a, b), s| (a + s.ant1 as i32, b + s.ant2 as i32));
        let n = self.snr.len() as f32;
        (sum1 as f32 / n).max(sum2 as f32 / n)
    }

    /// Sum FEC counters across the window. The sentinel `(300, 300)` for
    /// `(recovered, lost)` is returned when nothing has been observed at
    /// all, treated by callers as "no data, assume degraded" per the source
    /// this behavior is carried over from.
    fn accumulated_fec_locked(&self) -> (u32, u32) {
        let (all, recovered, lost) = self
            .fec
            .iter()
            .fold((0u32, 0u32, 0u32), |(a, r, l), s| {
                (a + s.all, r + s.recovered, l + s.lost)
            });
        if all == 0 {
            (300, 300)
        } else {
            (recovered, lost)
        }
    }
}

/// Link quality, clamped to `[-1024, 1024]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quality {
    pub quality: i32,
    /// The quality value re-mapped into `[1000, 2000]`. Despite the name
    /// `rssi_dB` used on the wire in the adaptive report, this is not a dB
    /// value; it is documented here as `report_q` for clarity.
    pub report_q: i32,
    pub recovered_last_second: u32,
    pub lost_last_second: u32,
    pub snr: f32,
}

fn clamp_f32(v: f32, lo: f32, hi: f32) -> f32 {
    v.max(lo).min(hi)
}

fn map_range(v: f32, in_lo: f32, in_hi: f32, out_lo: f32, out_hi: f32) -> f32 {
    out_lo + (v - in_lo) * (out_hi - out_lo) / (in_hi - in_lo)
}

/// Signal-quality accumulator and report formatter.
pub struct LinkController {
    windows: Mutex<WindowsInner>,
    ladder: Mutex<FecLadder>,
    idr_code: Mutex<String>,
    epoch: u64,
    report_socket: UdpSocket,
    report_target: std::net::SocketAddr,
    tx_power: std::sync::atomic::AtomicU8,
}

impl LinkController {
    pub fn new(epoch: u64, report_target: std::net::SocketAddr) -> std::io::Result<Self> {
        let report_socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(LinkController {
            windows: Mutex::new(WindowsInner::new()),
            ladder: Mutex::new(FecLadder::new()),
            idr_code: Mutex::new(roll_idr_code()),
            epoch,
            report_socket,
            report_target,
            tx_power: std::sync::atomic::AtomicU8::new(30),
        })
    }

    pub fn record_rssi(&self, ant1: u8, ant2: u8, now: Instant) {
        let mut w = self.windows.lock().expect("link windows mutex poisoned");
        w.trim_locked(now);
        w.rssi.push_back(RssiSample { ant1, ant2, at: now });
    }

    pub fn record_snr(&self, ant1: i8, ant2: i8, now: Instant) {
        let mut w = self.windows.lock().expect("link windows mutex poisoned");
        w.trim_locked(now);
        w.snr.push_back(SnrSample { ant1, ant2, at: now });
    }

    pub fn record_fec(&self, all: u32, recovered: u32, lost: u32, now: Instant) {
        let mut w = self.windows.lock().expect("link windows mutex poisoned");
        w.trim_locked(now);
        w.fec.push_back(FecSample {
            all,
            recovered,
            lost,
            at: now,
        });
        if lost > 0 {
            let mut idr = self.idr_code.lock().expect("idr mutex poisoned");
            *idr = roll_idr_code();
        }
    }

    /// Compute the current quality snapshot. Does not mutate the FEC ladder;
    /// call [`LinkController::tick_ladder`] separately on the adaptive cadence.
    pub fn calculate_quality(&self, now: Instant) -> Quality {
        let mut w = self.windows.lock().expect("link windows mutex poisoned");
        w.trim_locked(now);
        let avg_rssi = w.avg_rssi_locked();
        let (recovered, lost) = w.accumulated_fec_locked();
        let snr = w.avg_snr_locked();
        drop(w);

        let rssi_mapped = clamp_f32(map_range(avg_rssi, 0.0, 80.0, -1024.0, 1024.0), -1024.0, 1024.0);
        let quality = clamp_f32(
            rssi_mapped - 12.0 * recovered as f32 - 40.0 * lost as f32,
            -1024.0,
            1024.0,
        );
        let report_q = map_range(quality, -1024.0, 1024.0, 1000.0, 2000.0);

        Quality {
            quality: quality.round() as i32,
            report_q: report_q.round() as i32,
            recovered_last_second: recovered,
            lost_last_second: lost,
            snr,
        }
    }

    pub fn tick_ladder(&self, thresholds: &ladder::FecThresholds, now: Instant, quality: &Quality) {
        let level = thresholds.level_for(quality.recovered_last_second, quality.lost_last_second);
        let mut ladder = self.ladder.lock().expect("ladder mutex poisoned");
        ladder.bump(level, now);
        ladder.decay(now);
    }

    pub fn fec_level(&self) -> u8 {
        self.ladder.lock().expect("ladder mutex poisoned").value()
    }

    pub fn set_tx_power(&self, power: u8) {
        self.tx_power.store(power, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn tx_power(&self) -> u8 {
        self.tx_power.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Format and send the adaptive-link report: a 4-byte big-endian length
    /// prefix followed by the ASCII body.
    pub fn send_report(&self, now: Instant) -> std::io::Result<()> {
        let quality = self.calculate_quality(now);
        let idr = self.idr_code.lock().expect("idr mutex poisoned").clone();
        let fec_level = self.fec_level();
        let body = format!(
            "{}:{}:{}:{}:{}:{}:{:.6}:0:-1:{}:{}\n",
            self.epoch,
            quality.report_q,
            quality.report_q,
            quality.recovered_last_second,
            quality.lost_last_second,
            quality.report_q,
            quality.snr,
            fec_level,
            idr,
        );
        let mut datagram = Vec::with_capacity(4 + body.len());
        datagram.extend_from_slice(&(body.len() as u32).to_be_bytes());
        datagram.extend_from_slice(body.as_bytes());
        self.report_socket.send_to(&datagram, self.report_target)?;
        Ok(())
    }
}

fn roll_idr_code() -> String {
    let mut rng = rand::thread_rng();
    (0..4)
        .map(|_| (b'a' + rng.gen_range(0..26)) as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> LinkController {
        LinkController::new(42, "127.0.0.1:1".parse().unwrap()).unwrap()
    }

    #[test]
    fn quality_is_clamped_to_range() {
        let c = controller();
        let now = Instant::now();
        c.record_rssi(200, 200, now); // out-of-range input, avg still clamped downstream
        let q = c.calculate_quality(now);
        assert!(q.quality >= -1024 && q.quality <= 1024);
        assert!(q.report_q >= 1000 && q.report_q <= 2000);
    }

    #[test]
    fn no_fec_samples_uses_sentinel_and_degrades_quality() {
        let c = controller();
        let now = Instant::now();
        c.record_rssi(80, 80, now);
        let q = c.calculate_quality(now);
        // sentinel (300, 300) subtracts 12*300 + 40*300, clamped to -1024.
        assert_eq!(q.quality, -1024);
    }

    #[test]
    fn fec_loss_rerolls_idr_code() {
        let c = controller();
        let now = Instant::now();
        let before = c.idr_code.lock().unwrap().clone();
        c.record_fec(10, 0, 1, now);
        let after = c.idr_code.lock().unwrap().clone();
        assert_ne!(before, after);
    }

    #[test]
    fn report_body_matches_expected_shape() {
        let c = controller();
        let now = Instant::now();
        c.record_rssi(60, 60, now);
        c.record_fec(14, 3, 1, now);
        let quality = c.calculate_quality(now);
        let idr = c.idr_code.lock().unwrap().clone();
        let body = format!(
            "{}:{}:{}:{}:{}:{}:{:.6}:0:-1:{}:{}\n",
            c.epoch,
            quality.report_q,
            quality.report_q,
            quality.recovered_last_second,
            quality.lost_last_second,
            quality.report_q,
            quality.snr,
            c.fec_level(),
            idr,
        );
        assert_eq!(body.matches(':').count(), 10);
        assert!(body.ends_with('\n'));
    }
}
