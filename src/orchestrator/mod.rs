//! Wires the radio driver, the per-channel secure FEC channels, the reorder
//! window, the stream dispatcher, and the adaptive-link controller together,
//! and owns the lifetime of the background threads that drive them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel::{FecRx, FecTx};
use crate::crypto::session::KeyMaterial;
use crate::dispatch::{PayloadSink, StreamDispatcher, StreamKind};
use crate::driver::{FrameSink, RadioDriver, RawFrame};
use crate::link::ladder::FecThresholds;
use crate::link::LinkController;
use crate::radio::RadioFrameCodec;
use crate::reorder::ReorderWindow;
use crate::spsc;
use crate::wire::rtp_seq;

/// Event-pump / TX-feeder poll timeout, bounding how long a stop request can
/// take to be observed.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Maximum UserPacket payload; larger uplink datagrams are truncated.
const MAX_PAYLOAD: usize = crate::wire::MAX_PAYLOAD;
/// Dispatch queue depth: a burst this size can buffer behind a slow sink
/// before frames start getting dropped in favor of freshness.
const DISPATCH_QUEUE_DEPTH: usize = 64;

/// One decoded payload bound for a specific route, queued between the radio
/// callback and the dispatch worker thread.
struct DispatchItem {
    channel_id: u32,
    payload: Vec<u8>,
}

/// The "started/stopped/last-error" trio surfaced to the host application.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub last_error: Option<String>,
}

struct ChannelRuntime {
    kind: StreamKind,
    mac_channel_id: u32,
    fec_rx: Mutex<FecRx>,
    fec_tx: Mutex<FecTx>,
    reorder: Option<Mutex<ReorderWindow>>,
    last_p_all: AtomicU64,
    last_p_recovered: AtomicU64,
    last_p_lost: AtomicU64,
}

/// One channel's worth of construction inputs: which logical stream it
/// carries, the MAC-layer channel id the radio frames use to route to it,
/// the FEC parameters, and where decoded payloads should be delivered.
pub struct ChannelSpec {
    pub kind: StreamKind,
    pub mac_channel_id: u32,
    pub k: u8,
    pub n: u8,
    pub max_fragment_size: usize,
    pub reorders_rtp: bool,
    pub sink: Box<dyn PayloadSink>,
}

/// Owns one radio device's worth of channels and background threads.
pub struct OrchestratorCore {
    driver: Arc<dyn RadioDriver>,
    dispatcher: Arc<StreamDispatcher>,
    link: Arc<LinkController>,
    channels: Arc<Vec<ChannelRuntime>>,
    codec: Arc<Mutex<RadioFrameCodec>>,
    status: Arc<Mutex<OrchestratorStatus>>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    fec_close_timeout: Duration,
    adaptive_update: Duration,
    fec_thresholds: FecThresholds,
    dispatch_tx: Mutex<Option<spsc::Sender<DispatchItem>>>,
}

struct RxSink {
    channels: Arc<Vec<ChannelRuntime>>,
    dispatch_tx: spsc::Sender<DispatchItem>,
    link: Arc<LinkController>,
    codec: Arc<Mutex<RadioFrameCodec>>,
}

impl FrameSink for RxSink {
    fn on_frame(&self, frame: RawFrame) {
        let now = Instant::now();
        let (mac_channel_id, payload) = match self
            .codec
            .lock()
            .expect("radio codec mutex poisoned")
            .decode(&frame.data)
        {
            Some(v) => v,
            None => return,
        };
        let runtime = match self.channels.iter().find(|c| c.mac_channel_id == mac_channel_id) {
            Some(c) => c,
            None => return,
        };

        self.link
            .record_rssi(frame.metadata.rssi[0] as u8, frame.metadata.rssi[1] as u8, now);
        self.link
            .record_snr(frame.metadata.snr[0], frame.metadata.snr[1], now);

        let decoded = runtime.fec_rx.lock().expect("fec_rx mutex poisoned").handle_frame(payload);

        let snapshot = runtime.fec_rx.lock().expect("fec_rx mutex poisoned").counters.snapshot();
        let delta_all = snapshot.p_all.saturating_sub(runtime.last_p_all.swap(snapshot.p_all, Ordering::Relaxed));
        let delta_recovered = snapshot
            .p_fec_recovered
            .saturating_sub(runtime.last_p_recovered.swap(snapshot.p_fec_recovered, Ordering::Relaxed));
        let delta_lost = snapshot
            .p_lost
            .saturating_sub(runtime.last_p_lost.swap(snapshot.p_lost, Ordering::Relaxed));
        if delta_all > 0 || delta_recovered > 0 || delta_lost > 0 {
            self.link.record_fec(delta_all as u32, delta_recovered as u32, delta_lost as u32, now);
        }

        for item in decoded {
            let channel_id = runtime.mac_channel_id;
            match &runtime.reorder {
                Some(reorder) => {
                    let seq = match rtp_seq::sequence_number(&item.packet.payload) {
                        Some(s) => s,
                        None => continue,
                    };
                    let mut delivered = Vec::new();
                    reorder
                        .lock()
                        .expect("reorder mutex poisoned")
                        .push(seq, item.packet.payload, &mut delivered);
                    for (_, payload) in delivered {
                        self.dispatch_tx.send(DispatchItem { channel_id, payload });
                    }
                }
                None => {
                    self.dispatch_tx.send(DispatchItem {
                        channel_id,
                        payload: item.packet.payload,
                    });
                }
            }
        }
    }
}

impl OrchestratorCore {
    /// Build an orchestrator for one radio device from a set of channel
    /// specs. Every channel reuses the same long-lived key material (the
    /// link has one identity; only the FEC session per logical stream
    /// differs), loaded fresh per channel since `KeyMaterial` is not `Clone`.
    pub fn new(
        driver: Arc<dyn RadioDriver>,
        key_file_bytes: &[u8],
        epoch: u64,
        phy: crate::radio::PhyConfig,
        fec_thresholds: FecThresholds,
        fec_close_timeout_ms: u64,
        adaptive_update_ms: u64,
        report_target: std::net::SocketAddr,
        specs: Vec<ChannelSpec>,
    ) -> anyhow::Result<Self> {
        let mut dispatcher = StreamDispatcher::new();
        let mut channels = Vec::with_capacity(specs.len());
        for spec in specs {
            let rx_keys = KeyMaterial::from_bytes(key_file_bytes)?;
            let tx_keys = KeyMaterial::from_bytes(key_file_bytes)?;
            let fec_tx = FecTx::new(tx_keys, epoch, spec.k, spec.n, spec.max_fragment_size)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let fec_rx = FecRx::new(rx_keys, 40);

            dispatcher.add_route(spec.mac_channel_id, spec.kind, spec.sink);
            channels.push(ChannelRuntime {
                kind: spec.kind,
                mac_channel_id: spec.mac_channel_id,
                fec_rx: Mutex::new(fec_rx),
                fec_tx: Mutex::new(fec_tx),
                reorder: if spec.reorders_rtp {
                    Some(Mutex::new(ReorderWindow::new()))
                } else {
                    None
                },
                last_p_all: AtomicU64::new(0),
                last_p_recovered: AtomicU64::new(0),
                last_p_lost: AtomicU64::new(0),
            });
        }

        let link = LinkController::new(epoch, report_target)?;

        Ok(OrchestratorCore {
            driver,
            dispatcher: Arc::new(dispatcher),
            link: Arc::new(link),
            channels: Arc::new(channels),
            codec: Arc::new(Mutex::new(RadioFrameCodec::new(phy))),
            status: Arc::new(Mutex::new(OrchestratorStatus::default())),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            fec_close_timeout: Duration::from_millis(fec_close_timeout_ms),
            adaptive_update: Duration::from_millis(adaptive_update_ms),
            fec_thresholds,
            dispatch_tx: Mutex::new(None),
        })
    }

    pub fn status(&self) -> OrchestratorStatus {
        self.status.lock().expect("status mutex poisoned").clone()
    }

    pub fn dispatcher_counters(&self) -> Vec<crate::dispatch::DispatcherCounters> {
        self.dispatcher.all_counters()
    }

    pub fn rx_counters(&self, kind: StreamKind) -> Option<crate::channel::RxCountersSnapshot> {
        self.channels
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.fec_rx.lock().expect("fec_rx mutex poisoned").counters.snapshot())
    }

    /// Push one uplink UserPacket into `kind`'s TX channel, encode it for
    /// the radio, and send it. Used both by the production TX-feeder thread
    /// (fed from a real UDP socket) and directly by tests/the CLI.
    pub fn inject_uplink(&self, kind: StreamKind, payload: &[u8]) -> anyhow::Result<()> {
        let truncated = if payload.len() > MAX_PAYLOAD {
            warn!(len = payload.len(), "uplink datagram exceeds MAX_PAYLOAD, truncating");
            &payload[..MAX_PAYLOAD]
        } else {
            payload
        };
        let runtime = self
            .channels
            .iter()
            .find(|c| c.kind == kind)
            .ok_or_else(|| anyhow::anyhow!("no channel configured for {:?}", kind))?;
        let now = Instant::now();
        let mut fec_tx = runtime.fec_tx.lock().expect("fec_tx mutex poisoned");
        let frames = fec_tx.push_user_packet(0, truncated, now);
        drop(fec_tx);
        self.send_frames(runtime.mac_channel_id, frames)
    }

    fn send_frames(&self, mac_channel_id: u32, frames: Vec<Vec<u8>>) -> anyhow::Result<()> {
        for frame in frames {
            let encoded = self
                .codec
                .lock()
                .expect("radio codec mutex poisoned")
                .encode(mac_channel_id, &frame);
            self.driver.send_packet(&encoded)?;
        }
        Ok(())
    }

    /// Service the FEC-close timeout and periodic session re-announcement
    /// for every channel. Called from the TX feeder loop on each wakeup.
    pub fn service_tx_timers(&self) -> anyhow::Result<()> {
        let now = Instant::now();
        for runtime in self.channels.iter() {
            let mut fec_tx = runtime.fec_tx.lock().expect("fec_tx mutex poisoned");
            let mut frames = fec_tx.maybe_close_on_timeout(now, self.fec_close_timeout);
            if let Some(announce) = fec_tx.maybe_announce(now) {
                frames.push(announce);
            }
            drop(fec_tx);
            self.send_frames(runtime.mac_channel_id, frames)?;
        }
        Ok(())
    }

    /// Start the event pump, TX feeder timer service, and adaptive loop
    /// threads. `uplink_poll` is called by the TX feeder on every wakeup to
    /// pull any pending uplink datagrams (reading real sockets is left to
    /// the caller, since socket ownership varies between the CLI and tests).
    pub fn start<F>(&self, uplink_poll: F) -> anyhow::Result<()>
    where
        F: Fn() + Send + 'static,
    {
        self.stop.store(false, Ordering::SeqCst);

        let (dispatch_tx, dispatch_rx) = spsc::channel::<DispatchItem>(DISPATCH_QUEUE_DEPTH);
        let sink = RxSink {
            channels: self.channels.clone(),
            dispatch_tx: dispatch_tx.clone(),
            link: self.link.clone(),
            codec: self.codec.clone(),
        };
        self.driver.init(0, Box::new(sink))?;

        let dispatcher = self.dispatcher.clone();
        let dispatch_worker = std::thread::Builder::new()
            .name("wfb-dispatch".into())
            .spawn(move || {
                loop {
                    match dispatch_rx.recv_timeout(POLL_TIMEOUT) {
                        Some(item) => {
                            dispatcher.dispatch(item.channel_id, &item.payload);
                        }
                        None if dispatch_rx.is_stopped() => break,
                        None => continue,
                    }
                }
                debug!("dispatch worker stopped");
            })?;
        *self.dispatch_tx.lock().expect("dispatch_tx mutex poisoned") = Some(dispatch_tx);

        let driver = self.driver.clone();
        let stop = self.stop.clone();
        let status = self.status.clone();
        let event_pump = std::thread::Builder::new()
            .name("wfb-event-pump".into())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) && !driver.should_stop() {
                    if let Err(e) = driver.poll_events(POLL_TIMEOUT) {
                        warn!(error = %e, "driver poll_events failed");
                        status.lock().expect("status mutex poisoned").last_error = Some(e.to_string());
                        break;
                    }
                }
                debug!("event pump stopped");
            })?;

        let this_tx = ThisForThread {
            channels: self.channels.clone(),
            driver: self.driver.clone(),
            codec: self.codec.clone(),
            fec_close_timeout: self.fec_close_timeout,
        };
        let stop2 = self.stop.clone();
        let tx_feeder = std::thread::Builder::new()
            .name("wfb-tx-feeder".into())
            .spawn(move || {
                while !stop2.load(Ordering::SeqCst) {
                    uplink_poll();
                    this_tx.service_timers();
                    std::thread::sleep(Duration::from_millis(10).min(POLL_TIMEOUT));
                }
                debug!("tx feeder stopped");
            })?;

        let link = self.link.clone();
        let thresholds = self.fec_thresholds;
        let adaptive_update = self.adaptive_update;
        let stop3 = self.stop.clone();
        let adaptive_loop = std::thread::Builder::new()
            .name("wfb-adaptive".into())
            .spawn(move || {
                while !stop3.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    let quality = link.calculate_quality(now);
                    link.tick_ladder(&thresholds, now, &quality);
                    if let Err(e) = link.send_report(now) {
                        debug!(error = %e, "adaptive report send failed");
                    }
                    std::thread::sleep(adaptive_update);
                }
                debug!("adaptive loop stopped");
            })?;

        self.status.lock().expect("status mutex poisoned").running = true;
        *self.threads.lock().expect("threads mutex poisoned") =
            vec![dispatch_worker, event_pump, tx_feeder, adaptive_loop];
        info!("orchestrator started");
        Ok(())
    }

    /// Set all stop flags, wake the dispatch worker, join every thread in
    /// reverse dependency order, and mark the orchestrator stopped.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(tx) = self.dispatch_tx.lock().expect("dispatch_tx mutex poisoned").take() {
            tx.stop();
        }
        let mut threads = self.threads.lock().expect("threads mutex poisoned");
        while let Some(handle) = threads.pop() {
            let _ = handle.join();
        }
        self.status.lock().expect("status mutex poisoned").running = false;
        info!("orchestrator stopped");
    }
}

/// Small bundle of shared state the TX-feeder thread needs, kept separate
/// from `OrchestratorCore` so it can be moved into the thread closure.
struct ThisForThread {
    channels: Arc<Vec<ChannelRuntime>>,
    driver: Arc<dyn RadioDriver>,
    codec: Arc<Mutex<RadioFrameCodec>>,
    fec_close_timeout: Duration,
}

impl ThisForThread {
    fn service_timers(&self) {
        let now = Instant::now();
        for runtime in self.channels.iter() {
            let mut fec_tx = runtime.fec_tx.lock().expect("fec_tx mutex poisoned");
            let mut frames = fec_tx.maybe_close_on_timeout(now, self.fec_close_timeout);
            if let Some(announce) = fec_tx.maybe_announce(now) {
                frames.push(announce);
            }
            drop(fec_tx);
            for frame in frames {
                let encoded = self
                    .codec
                    .lock()
                    .expect("radio codec mutex poisoned")
                    .encode(runtime.mac_channel_id, &frame);
                let _ = self.driver.send_packet(&encoded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::session::build_key_file;
    use crate::driver::LoopbackDriver;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink(Arc<StdMutex<Vec<Vec<u8>>>>);
    impl PayloadSink for CollectingSink {
        fn send(&self, payload: &[u8]) {
            self.0.lock().unwrap().push(payload.to_vec());
        }
    }

    fn test_key_file() -> Vec<u8> {
        let (secret, public) = KeyMaterial::generate_keypair();
        let mut secret_bytes = [0u8; 32];
        secret_bytes.copy_from_slice(secret.to_bytes().as_slice());
        let mut public_bytes = [0u8; 32];
        public_bytes.copy_from_slice(public.as_bytes());
        // Loopback: this side's secret paired with its own public key as
        // the "remote" half, so one key file can seal and unseal for tests.
        build_key_file(&secret_bytes, &public_bytes)
    }

    #[test]
    fn single_channel_round_trip_over_loopback_driver() {
        let driver = Arc::new(LoopbackDriver::new());
        let key_bytes = test_key_file();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let spec = ChannelSpec {
            kind: StreamKind::Mavlink,
            mac_channel_id: crate::dispatch::channel_id(1, 0x10),
            k: 2,
            n: 4,
            max_fragment_size: 64,
            reorders_rtp: false,
            sink: Box::new(CollectingSink(received.clone())),
        };
        let orchestrator = OrchestratorCore::new(
            driver.clone(),
            &key_bytes,
            1,
            crate::radio::PhyConfig::default(),
            FecThresholds::default(),
            20,
            100,
            "127.0.0.1:1".parse().unwrap(),
            vec![spec],
        )
        .unwrap();

        // Announce the session deterministically before starting any
        // background threads, so it lands first in the sent-frame order.
        orchestrator.service_tx_timers().unwrap();
        orchestrator.start(|| {}).unwrap();

        orchestrator.inject_uplink(StreamKind::Mavlink, b"heartbeat-1").unwrap();
        orchestrator.inject_uplink(StreamKind::Mavlink, b"heartbeat-2").unwrap();

        for frame in driver.sent_frames() {
            driver.inject(RawFrame {
                data: frame,
                metadata: crate::driver::RxMetadata::default(),
            });
        }

        orchestrator.stop();

        let got = received.lock().unwrap();
        assert_eq!(got.as_slice(), &[b"heartbeat-1".to_vec(), b"heartbeat-2".to_vec()]);
    }
}
