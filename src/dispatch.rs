//! Routes decrypted, reordered payloads to the three logical UDP streams
//! (video, MAVLink, tunnel) by channel id, and tracks per-channel counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The three logical streams this link carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StreamKind {
    Video,
    Mavlink,
    Tunnel,
}

/// `channel_id = (link_id << 8) | radio_port`.
pub fn channel_id(link_id: u32, radio_port: u8) -> u32 {
    (link_id << 8) | radio_port as u32
}

#[derive(Default)]
struct RouteCounters {
    delivered: AtomicU64,
    dropped_unroutable: AtomicU64,
}

/// Sink capability every routed stream is delivered through. A UDP socket
/// wrapper and a loopback/test sink both implement this.
pub trait PayloadSink: Send + Sync {
    fn send(&self, payload: &[u8]);
}

/// Forwards each payload as a UDP datagram to a fixed target, the
/// production implementation of [`PayloadSink`] for video/MAVLink/tunnel
/// output.
pub struct UdpSink {
    socket: std::net::UdpSocket,
    target: std::net::SocketAddr,
}

impl UdpSink {
    pub fn bind(target: std::net::SocketAddr) -> std::io::Result<Self> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        Ok(UdpSink { socket, target })
    }

    /// Same as [`Self::bind`], but sizes the socket's receive buffer first.
    /// `std::net::UdpSocket` has no portable `SO_RCVBUF` setter, hence the
    /// detour through `socket2` before the socket is handed back as a plain
    /// `std::net::UdpSocket`.
    pub fn bind_with_rcvbuf(target: std::net::SocketAddr, rcv_buf: usize) -> std::io::Result<Self> {
        let domain = if target.is_ipv6() { socket2::Domain::IPV6 } else { socket2::Domain::IPV4 };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_recv_buffer_size(rcv_buf)?;
        let bind_addr: std::net::SocketAddr = if target.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
        socket.bind(&bind_addr.into())?;
        Ok(UdpSink { socket: socket.into(), target })
    }
}

impl PayloadSink for UdpSink {
    fn send(&self, payload: &[u8]) {
        let _ = self.socket.send_to(payload, self.target);
    }
}

struct Route {
    kind: StreamKind,
    sink: Box<dyn PayloadSink>,
    counters: RouteCounters,
}

/// Small routing table keyed on `channel_id`, with monotonically increasing
/// per-channel counters and a `clear_stats` flag honored at the next packet
/// boundary rather than requiring a lock to reset atomics.
pub struct StreamDispatcher {
    routes: HashMap<u32, Route>,
    clear_stats: AtomicBool,
}

impl Default for StreamDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDispatcher {
    pub fn new() -> Self {
        StreamDispatcher {
            routes: HashMap::new(),
            clear_stats: AtomicBool::new(false),
        }
    }

    pub fn add_route(&mut self, channel_id: u32, kind: StreamKind, sink: Box<dyn PayloadSink>) {
        self.routes.insert(
            channel_id,
            Route {
                kind,
                sink,
                counters: RouteCounters::default(),
            },
        );
    }

    /// Deliver one payload to the route registered for `channel_id`. Returns
    /// `false` if no route exists (counted globally, not per-channel, since
    /// there is no channel entry to count against).
    pub fn dispatch(&self, channel_id: u32, payload: &[u8]) -> bool {
        if self.clear_stats.swap(false, Ordering::AcqRel) {
            for route in self.routes.values() {
                route.counters.delivered.store(0, Ordering::Relaxed);
                route.counters.dropped_unroutable.store(0, Ordering::Relaxed);
            }
        }
        match self.routes.get(&channel_id) {
            Some(route) => {
                route.sink.send(payload);
                route.counters.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn request_clear_stats(&self) {
        self.clear_stats.store(true, Ordering::Release);
    }

    pub fn counters_for(&self, channel_id: u32) -> Option<DispatcherCounters> {
        self.routes.get(&channel_id).map(|route| DispatcherCounters {
            channel_id,
            kind: route.kind,
            delivered: route.counters.delivered.load(Ordering::Relaxed),
            dropped_unroutable: route.counters.dropped_unroutable.load(Ordering::Relaxed),
        })
    }

    pub fn all_counters(&self) -> Vec<DispatcherCounters> {
        self.routes
            .keys()
            .copied()
            .filter_map(|id| self.counters_for(id))
            .collect()
    }
}

/// Serializable snapshot of one route's counters, for the `stats` CLI
/// subcommand and for tests.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherCounters {
    pub channel_id: u32,
    pub kind: StreamKind,
    pub delivered: u64,
    pub dropped_unroutable: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink(Mutex<Vec<Vec<u8>>>);

    impl PayloadSink for std::sync::Arc<CollectingSink> {
        fn send(&self, payload: &[u8]) {
            self.0.lock().unwrap().push(payload.to_vec());
        }
    }

    #[test]
    fn routes_by_channel_id() {
        let mut dispatcher = StreamDispatcher::new();
        let sink = std::sync::Arc::new(CollectingSink(Mutex::new(Vec::new())));
        dispatcher.add_route(channel_id(1, 0), StreamKind::Video, Box::new(sink.clone()));

        assert!(dispatcher.dispatch(channel_id(1, 0), b"frame"));
        assert!(!dispatcher.dispatch(channel_id(1, 0x10), b"unrouted"));

        assert_eq!(sink.0.lock().unwrap().as_slice(), &[b"frame".to_vec()]);
        let counters = dispatcher.counters_for(channel_id(1, 0)).unwrap();
        assert_eq!(counters.delivered, 1);
    }

    #[test]
    fn udp_sink_binds_with_sized_receive_buffer() {
        let sink = UdpSink::bind_with_rcvbuf("127.0.0.1:0".parse().unwrap(), 1 << 18).unwrap();
        // A bound ephemeral port sends fine even with nothing listening.
        sink.send(b"probe");
    }

    #[test]
    fn clear_stats_resets_at_next_dispatch() {
        let mut dispatcher = StreamDispatcher::new();
        let sink = std::sync::Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let cid = channel_id(1, 0);
        dispatcher.add_route(cid, StreamKind::Video, Box::new(sink));
        dispatcher.dispatch(cid, b"a");
        dispatcher.dispatch(cid, b"b");
        assert_eq!(dispatcher.counters_for(cid).unwrap().delivered, 2);

        dispatcher.request_clear_stats();
        dispatcher.dispatch(cid, b"c");
        assert_eq!(dispatcher.counters_for(cid).unwrap().delivered, 1);
    }
}
