//! The transmit pipeline: a master [`DataPacket`] per active universe,
//! refreshed at least once a second as a keep-alive and immediately on
//! every user payload, with a final stream-terminated packet sent on
//! teardown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::byte::{multicast_addr, SACN_PORT};
use crate::cid::Cid;
use crate::error::Error;
use crate::packet::DataPacket;
use crate::transport;

const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1000);

struct Master {
    packet: DataPacket,
    multicast: bool,
    destinations: Vec<SocketAddr>,
}

/// Everything `close()` needs to tear a universe down: the master state
/// (for `set_destinations`/etc.), the payload sender whose drop signals
/// the data-pump task to send its final packet and exit, and the
/// keep-alive task's handle, which otherwise loops forever.
struct UniverseHandle {
    master: Arc<Mutex<Master>>,
    payload_tx: mpsc::Sender<Vec<u8>>,
    keepalive_handle: tokio::task::JoinHandle<()>,
}

/// Owns the socket and per-universe master state for all active
/// universes. Mutation of a universe's master packet is confined to
/// the data-pump task for that universe; the keep-alive task only
/// reads the already-consistent master and increments its sequence.
pub struct Transmitter {
    socket: Arc<UdpSocket>,
    cid: Cid,
    source_name: String,
    universes: Arc<Mutex<HashMap<u16, UniverseHandle>>>,
}

/// A handle for pushing DMX payloads into an active universe. Dropping
/// or explicitly closing it tears the universe down: a final
/// stream-terminated packet is sent and the keep-alive task stops.
pub struct PayloadHandle {
    universe: u16,
    tx: mpsc::Sender<Vec<u8>>,
}

impl PayloadHandle {
    /// Send a DMX payload (at most 512 bytes; longer input is
    /// truncated by `DataPacket::set_data`).
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| Error::NotActive {
                universe: self.universe,
            })
    }

    /// Tear down the universe: the data task sends a final
    /// stream-terminated packet and stops the keep-alive task.
    pub async fn close(self) {
        drop(self.tx);
    }
}

impl Transmitter {
    pub async fn new(bind_host: &str, cid: Cid, source_name: impl Into<String>) -> Result<Self, Error> {
        let socket = transport::bind(bind_host, 0).await?;
        Ok(Self {
            socket: Arc::new(socket),
            cid,
            source_name: source_name.into(),
            universes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Activate `universe`: create its master packet, spawn the
    /// keep-alive task and the data-pump task, and return a handle the
    /// caller uses to push DMX payloads.
    pub fn activate(&self, universe: u16) -> Result<PayloadHandle, Error> {
        if self.universes.lock().contains_key(&universe) {
            return Err(Error::AlreadyActive { universe });
        }

        let mut packet = DataPacket::empty();
        packet.set_cid(self.cid);
        packet.set_source_name(&self.source_name);
        packet.set_universe(universe);
        packet.set_data(&[0u8; 512]);

        let master = Arc::new(Mutex::new(Master {
            packet,
            multicast: true,
            destinations: Vec::new(),
        }));

        let (payload_tx, mut payload_rx) = mpsc::channel::<Vec<u8>>(16);

        let socket = self.socket.clone();
        let keepalive_master = master.clone();
        let keepalive_socket = socket.clone();
        let keepalive_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            loop {
                interval.tick().await;
                if send_out(&keepalive_socket, &keepalive_master, universe)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let universes = self.universes.clone();
        let data_master = master.clone();
        tokio::spawn(async move {
            while let Some(payload) = payload_rx.recv().await {
                data_master.lock().packet.set_data(&payload);
                if let Err(err) = send_out(&socket, &data_master, universe).await {
                    tracing::warn!(universe, %err, "sACN send error");
                }
            }
            data_master.lock().packet.set_stream_terminated(true);
            let _ = send_out(&socket, &data_master, universe).await;
            universes.lock().remove(&universe);
            tracing::info!(universe, "sACN universe deactivated");
        });

        self.universes.lock().insert(
            universe,
            UniverseHandle {
                master,
                payload_tx: payload_tx.clone(),
                keepalive_handle,
            },
        );

        Ok(PayloadHandle {
            universe,
            tx: payload_tx,
        })
    }

    pub fn is_active(&self, universe: u16) -> bool {
        self.universes.lock().contains_key(&universe)
    }

    pub fn active_universes(&self) -> Vec<u16> {
        self.universes.lock().keys().copied().collect()
    }

    fn master(&self, universe: u16) -> Option<Arc<Mutex<Master>>> {
        self.universes.lock().get(&universe).map(|h| h.master.clone())
    }

    /// Replace the unicast destination list for `universe`. Every
    /// unresolvable host is collected into the returned list; the
    /// remaining, valid hosts are still applied.
    pub fn set_destinations(&self, universe: u16, hosts: &[String]) -> Vec<Error> {
        let Some(master) = self.master(universe) else {
            return vec![Error::NotActive { universe }];
        };
        let mut resolved = Vec::new();
        let mut errors = Vec::new();
        for host in hosts {
            match transport::resolve_destination(host) {
                Ok(addr) => resolved.push(addr),
                Err(err) => errors.push(err),
            }
        }
        master.lock().destinations = resolved;
        errors
    }

    pub fn set_multicast(&self, universe: u16, enabled: bool) -> Result<(), Error> {
        let Some(master) = self.master(universe) else {
            return Err(Error::NotActive { universe });
        };
        master.lock().multicast = enabled;
        Ok(())
    }

    pub fn is_multicast(&self, universe: u16) -> Result<bool, Error> {
        let Some(master) = self.master(universe) else {
            return Err(Error::NotActive { universe });
        };
        let enabled = master.lock().multicast;
        Ok(enabled)
    }

    pub fn destinations(&self, universe: u16) -> Result<Vec<SocketAddr>, Error> {
        let Some(master) = self.master(universe) else {
            return Err(Error::NotActive { universe });
        };
        let destinations = master.lock().destinations.clone();
        Ok(destinations)
    }

    /// Signal teardown of every active universe: stop each keep-alive
    /// task and drop its payload sender, which lets the data-pump task
    /// send a final stream-terminated packet and exit. Once every
    /// universe is torn down and the caller drops this `Transmitter`,
    /// the underlying socket closes with it.
    pub async fn close(&self) {
        let handles: Vec<UniverseHandle> = self.universes.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.keepalive_handle.abort();
            drop(handle.payload_tx);
        }
    }
}

/// Increment the master's sequence number and send to its multicast
/// address (if enabled) and every configured unicast destination. No-op
/// if the universe has already been deactivated underneath this call.
async fn send_out(socket: &UdpSocket, master: &Arc<Mutex<Master>>, universe: u16) -> Result<(), Error> {
    let (bytes, multicast, destinations) = {
        let mut guard = master.lock();
        guard.packet.increment_sequence();
        (
            guard.packet.as_bytes().to_vec(),
            guard.multicast,
            guard.destinations.clone(),
        )
    };

    if multicast {
        let addr = SocketAddr::new(multicast_addr(universe).into(), SACN_PORT);
        if let Err(err) = socket.send_to(&bytes, addr).await {
            tracing::warn!(universe, %err, "multicast send failed");
        }
    }
    for dest in destinations {
        if let Err(err) = socket.send_to(&bytes, dest).await {
            tracing::warn!(universe, %dest, %err, "unicast send failed");
        }
    }
    Ok(())
}
