//! LAN discovery
//!
//! Servers multicast a beacon every few seconds; clients listen on the same
//! group and report every server they hear, except themselves.

use dashmap::DashMap;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::constants::MAX_DISCOVERY_PACKET;
use crate::error::NetworkError;
use crate::network::MIN_TICK;
use crate::network::udp::{bind_multicast, is_transient, leave_multicast, multicast_sender};
use crate::protocol::{Announcement, PeerDescriptor};
use crate::session::StopSignal;

/// Hostname used when the OS will not tell us ours
const FALLBACK_HOSTNAME: &str = "Desktop-PC";

/// Name this machine announces itself under
pub fn local_hostname() -> String {
    let name = gethostname::gethostname()
        .into_string()
        .unwrap_or_default()
        .replace(';', "_");
    let name = name.trim();
    if name.is_empty() {
        FALLBACK_HOSTNAME.to_string()
    } else {
        name.to_string()
    }
}

/// Addresses of every local interface, loopback included
pub fn local_addresses() -> Result<HashSet<IpAddr>, NetworkError> {
    let interfaces =
        if_addrs::get_if_addrs().map_err(|e| NetworkError::Interfaces(e.to_string()))?;
    Ok(interfaces.into_iter().map(|iface| iface.ip()).collect())
}

/// Send `announcement` to `target` every `interval` until either signal fires.
///
/// `paired` lets a unicast server silence its beacon once a client has
/// handshaken while the session itself keeps running.
pub async fn run_beacon(
    announcement: Announcement,
    target: SocketAddrV4,
    interval: Duration,
    stop: StopSignal,
    paired: StopSignal,
) -> Result<(), NetworkError> {
    let socket = multicast_sender()?;
    let payload = announcement.encode();
    let mut ticker = tokio::time::interval(interval.max(MIN_TICK));

    tracing::info!("Announcing {} to {}", payload, target);

    loop {
        tokio::select! {
            _ = stop.triggered() => break,
            _ = paired.triggered() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(payload.as_bytes(), target).await {
                    tracing::warn!("Beacon send failed: {}", e);
                }
            }
        }
    }

    tracing::debug!("Beacon stopped");
    Ok(())
}

/// Join `group` on `port` and report servers until `stop` fires.
///
/// The group is left and the socket closed on every exit path.
pub async fn run_listener<F>(
    group: Ipv4Addr,
    port: u16,
    timeout: Duration,
    stop: StopSignal,
    on_peer: F,
) -> Result<(), NetworkError>
where
    F: Fn(String, PeerDescriptor) + Send + Sync,
{
    let local = local_addresses()?;
    let socket = bind_multicast(group, port)?;
    tracing::info!("Listening for servers on {}:{}", group, port);

    let result = listen_on(&socket, &local, timeout, &stop, &on_peer).await;

    leave_multicast(&socket, group);
    drop(socket);
    tracing::debug!("Discovery listener closed");
    result
}

/// Receive loop over an already bound socket
pub async fn listen_on<F>(
    socket: &UdpSocket,
    local: &HashSet<IpAddr>,
    timeout: Duration,
    stop: &StopSignal,
    on_peer: &F,
) -> Result<(), NetworkError>
where
    F: Fn(String, PeerDescriptor) + Send + Sync,
{
    let mut buf = [0u8; MAX_DISCOVERY_PACKET];

    loop {
        let received = tokio::select! {
            _ = stop.triggered() => return Ok(()),
            r = tokio::time::timeout(timeout, socket.recv_from(&mut buf)) => r,
        };

        match received {
            // Quiet network; go round and check the stop signal again
            Err(_elapsed) => continue,
            Ok(Err(e)) if is_transient(&e) => continue,
            Ok(Err(e)) => return Err(NetworkError::ReceiveFailed(e)),
            Ok(Ok((n, src))) => {
                if let Some((hostname, peer)) = accept_beacon(local, src, &buf[..n]) {
                    tracing::debug!("Discovered {} at {}:{} ({})", hostname, peer.addr, peer.port, peer.mode);
                    on_peer(hostname, peer);
                }
            }
        }
    }
}

/// Turn a datagram into a discovered peer, or `None` if it must be ignored
pub fn accept_beacon(
    local: &HashSet<IpAddr>,
    src: SocketAddr,
    payload: &[u8],
) -> Option<(String, PeerDescriptor)> {
    if local.contains(&src.ip()) {
        return None;
    }
    let message = std::str::from_utf8(payload).ok()?;
    let announcement = Announcement::parse(message)?;
    let peer = PeerDescriptor::new(src.ip(), announcement.mode, announcement.port);
    Some((announcement.hostname, peer))
}

/// Discovered servers keyed by hostname; the latest beacon wins
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<String, PeerDescriptor>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer, returning the descriptor it replaced
    pub fn upsert(&self, hostname: String, peer: PeerDescriptor) -> Option<PeerDescriptor> {
        self.peers.insert(hostname, peer)
    }

    pub fn get(&self, hostname: &str) -> Option<PeerDescriptor> {
        self.peers.get(hostname).map(|entry| *entry.value())
    }

    /// All peers sorted by hostname
    pub fn snapshot(&self) -> Vec<(String, PeerDescriptor)> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    pub fn clear(&self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::udp::bind_ephemeral;
    use crate::protocol::TransportMode;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn remote() -> SocketAddr {
        "192.168.1.50:9091".parse().unwrap()
    }

    #[test]
    fn test_accept_valid_beacon() {
        let local = HashSet::from([IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        let (host, peer) = accept_beacon(
            &local,
            remote(),
            b"WIFI_AUDIO_STREAMER_DISCOVERY;studio;MULTICAST;9090",
        )
        .unwrap();

        assert_eq!(host, "studio");
        assert_eq!(peer.addr, remote().ip());
        assert_eq!(peer.mode, TransportMode::Multicast);
        assert_eq!(peer.port, 9090);
    }

    #[test]
    fn test_ignores_foreign_and_broken_datagrams() {
        let local = HashSet::new();
        assert!(accept_beacon(&local, remote(), b"HELLO_FROM_CLIENT").is_none());
        assert!(accept_beacon(&local, remote(), b"WIFI_AUDIO_STREAMER_DISCOVERY;a;UNICAST;x").is_none());
        assert!(accept_beacon(&local, remote(), &[0xc3, 0x28]).is_none());
    }

    #[test]
    fn test_local_addresses_include_loopback() {
        let local = local_addresses().unwrap();
        assert!(local.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_hostname_is_usable() {
        let name = local_hostname();
        assert!(!name.is_empty());
        assert!(!name.contains(';'));
    }

    #[test]
    fn test_registry_last_write_wins() {
        let registry = PeerRegistry::new();
        let first = PeerDescriptor::new(remote().ip(), TransportMode::Unicast, 9090);
        let second = PeerDescriptor::new(remote().ip(), TransportMode::Multicast, 7000);

        assert!(registry.upsert("studio".into(), first).is_none());
        assert_eq!(registry.upsert("studio".into(), second), Some(first));
        registry.upsert("attic".into(), first);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("studio"), Some(second));
        let names: Vec<_> = registry.snapshot().into_iter().map(|(h, _)| h).collect();
        assert_eq!(names, vec!["attic", "studio"]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_beacon_reaches_target_and_stops() {
        let receiver = bind_ephemeral().unwrap();
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, receiver.local_addr().unwrap().port());
        let stop = StopSignal::new();
        let paired = StopSignal::new();

        let beacon = tokio::spawn(run_beacon(
            Announcement::new("studio", TransportMode::Unicast, 9090),
            target,
            Duration::from_millis(20),
            stop.clone(),
            paired.clone(),
        ));

        let mut buf = [0u8; 128];
        for _ in 0..2 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], b"WIFI_AUDIO_STREAMER_DISCOVERY;studio;UNICAST;9090");
        }

        paired.trigger();
        let result = tokio::time::timeout(Duration::from_secs(1), beacon).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_listener_reports_latest_beacon() {
        let socket = bind_ephemeral().unwrap();
        let port = socket.local_addr().unwrap().port();
        let stop = StopSignal::new();
        let registry = Arc::new(PeerRegistry::new());

        // Loopback stands in for a remote server here
        let sender = bind_ephemeral().unwrap();
        let target = (Ipv4Addr::LOCALHOST, port);

        let listener = {
            let stop = stop.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                let local = HashSet::from([IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9))]);
                listen_on(&socket, &local, Duration::from_millis(50), &stop, &|host: String, peer: PeerDescriptor| {
                    registry.upsert(host, peer);
                })
                .await
            })
        };

        sender.send_to(b"garbage", target).await.unwrap();
        sender
            .send_to(b"WIFI_AUDIO_STREAMER_DISCOVERY;studio;UNICAST;9090", target)
            .await
            .unwrap();
        sender
            .send_to(b"WIFI_AUDIO_STREAMER_DISCOVERY;studio;MULTICAST;9095", target)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.get("studio").map(|p| p.port) != Some(9095) {
            assert!(tokio::time::Instant::now() < deadline, "beacon never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("studio").unwrap().mode, TransportMode::Multicast);

        stop.trigger();
        let result = tokio::time::timeout(Duration::from_secs(1), listener).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_listener_suppresses_own_beacons() {
        let socket = bind_ephemeral().unwrap();
        let port = socket.local_addr().unwrap().port();
        let stop = StopSignal::new();
        let registry = Arc::new(PeerRegistry::new());

        let listener = {
            let stop = stop.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                let local = HashSet::from([IpAddr::V4(Ipv4Addr::LOCALHOST)]);
                listen_on(&socket, &local, Duration::from_millis(50), &stop, &|host: String, peer: PeerDescriptor| {
                    registry.upsert(host, peer);
                })
                .await
            })
        };

        let sender = bind_ephemeral().unwrap();
        for _ in 0..3 {
            sender
                .send_to(b"WIFI_AUDIO_STREAMER_DISCOVERY;me;UNICAST;9090", (Ipv4Addr::LOCALHOST, port))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.trigger();
        let result = tokio::time::timeout(Duration::from_secs(1), listener).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(registry.is_empty());
    }

    proptest! {
        #[test]
        fn local_sources_never_reported(
            last_octet in 1u8..=254,
            port in 1u16..=u16::MAX,
        ) {
            let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 0, last_octet));
            let local = HashSet::from([ip]);
            let message = Announcement::new("me", TransportMode::Unicast, port).encode();

            prop_assert!(accept_beacon(&local, SocketAddr::new(ip, 9091), message.as_bytes()).is_none());

            let other = IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet));
            prop_assert!(accept_beacon(&local, SocketAddr::new(other, 9091), message.as_bytes()).is_some());
        }
    }
}
