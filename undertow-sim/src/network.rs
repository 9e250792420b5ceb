//! In-memory peer transport fabric.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use undertow_core::network::{PeerNetwork, PeerStream};

/// Buffer size of each simulated stream half.
const STREAM_BUFFER: usize = 256 * 1024;

/// Dial/accept fabric connecting simulated peers with duplex streams.
///
/// Each peer gets an endpoint with a synthetic address; dialing an
/// address delivers one half of a fresh duplex pair to that endpoint's
/// accept queue and returns the other half.
pub struct SimulatedNetwork {
    endpoints: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<PeerStream>>>,
    next_host: Mutex<u32>,
}

impl SimulatedNetwork {
    /// Creates an empty fabric.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            next_host: Mutex::new(1),
        })
    }

    /// Registers a new peer endpoint on the fabric.
    pub fn endpoint(self: &Arc<Self>) -> SimulatedEndpoint {
        let addr = {
            let mut next = self.next_host.lock().expect("fabric lock poisoned");
            let host = *next;
            *next += 1;
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(10, 0, (host >> 8) as u8, host as u8),
                6881,
            ))
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .expect("fabric lock poisoned")
            .insert(addr, tx);
        SimulatedEndpoint {
            fabric: Arc::clone(self),
            addr,
            incoming: tokio::sync::Mutex::new(rx),
        }
    }

    /// Removes an endpoint, refusing future dials to it.
    pub fn disconnect(&self, addr: SocketAddr) {
        self.endpoints
            .lock()
            .expect("fabric lock poisoned")
            .remove(&addr);
    }
}

/// One peer's attachment to the fabric.
pub struct SimulatedEndpoint {
    fabric: Arc<SimulatedNetwork>,
    addr: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerStream>>,
}

#[async_trait]
impl PeerNetwork for SimulatedEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn dial(&self, addr: SocketAddr) -> io::Result<PeerStream> {
        let target = self
            .fabric
            .endpoints
            .lock()
            .expect("fabric lock poisoned")
            .get(&addr)
            .cloned();
        let Some(target) = target else {
            tracing::debug!(%addr, "dial refused, no endpoint registered");
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no endpoint at {addr}"),
            ));
        };
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        target
            .send(Box::new(remote))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "endpoint gone"))?;
        Ok(Box::new(local))
    }

    async fn accept(&self) -> io::Result<PeerStream> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "fabric shut down"))
    }
}
