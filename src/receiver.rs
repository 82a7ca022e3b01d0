//! The receive pipeline: a single reader task that owns a UDP socket
//! and the per-universe arbitration state, and filters/sequences/
//! dedupes incoming packets before handing the survivors to the caller
//! on either a channel or a callback surface.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::byte::SACN_PORT;
use crate::error::Error;
use crate::packet::DataPacket;
use crate::source::{SourceTable, SOURCE_TIMEOUT};
use crate::transport;

const READ_BUFFER_LEN: usize = 638;

/// Per-activated-universe receive-side state.
struct UniverseState {
    sources: SourceTable,
    last_sequence: Option<u8>,
    last_dmx_data: Vec<u8>,
    last_accepted_at: Instant,
    timeout_reported: bool,
    multicast: bool,
}

impl UniverseState {
    fn new(multicast: bool) -> Self {
        Self {
            sources: SourceTable::new(),
            last_sequence: None,
            last_dmx_data: Vec::new(),
            last_accepted_at: Instant::now(),
            timeout_reported: false,
            multicast,
        }
    }
}

type OnChange = Box<dyn Fn(Option<DataPacket>, DataPacket) + Send + Sync>;
type OnTimeout = Box<dyn Fn(u16) + Send + Sync>;
type OnError = Box<dyn Fn(&Error) + Send + Sync>;

/// What `handle_packet` decided to do with one arriving packet —
/// exposed for tests so the arbitration logic can be driven without a
/// real socket or real sleeps.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// The packet was delivered; `changed` is the new DMX payload.
    Delivered,
    /// Two or more sources are tied at the current highest priority.
    SourcesExceeded,
    /// Dropped: not the currently allowed (winning-priority) source.
    NotAllowed,
    /// Dropped: sequence number outside the acceptance window.
    SequenceRejected,
    /// Accepted but the DMX payload was unchanged, so not delivered.
    Unchanged,
}

/// Apply steps 5-10 of the receive pipeline to one packet already known
/// to decode successfully and match an activated universe. Pure with
/// respect to the wall clock — callers pass `now` explicitly, which is
/// what makes the 2500 ms timing testable without real sleeps.
fn handle_packet(state: &mut UniverseState, packet: &DataPacket, now: Instant) -> Outcome {
    state.sources.update(packet, now);
    let allowed = state.sources.allowed_sources();

    if allowed.len() > 1 {
        return Outcome::SourcesExceeded;
    }
    if !allowed.contains(&packet.cid()) {
        return Outcome::NotAllowed;
    }
    if let Some(last) = state.last_sequence {
        if !crate::byte::sequence_acceptable(last, packet.sequence()) {
            return Outcome::SequenceRejected;
        }
    }

    state.last_sequence = Some(packet.sequence());
    state.last_accepted_at = now;
    state.timeout_reported = false;

    if packet.data() == state.last_dmx_data.as_slice() {
        return Outcome::Unchanged;
    }
    state.last_dmx_data = packet.data().to_vec();
    Outcome::Delivered
}

/// Handle to a running receive pipeline. Owns nothing directly beyond
/// channels into the reader task and shared callback slots; all
/// universe/source-table state lives exclusively inside that task.
pub struct Receiver {
    command_tx: mpsc::Sender<Command>,
    packet_rx: mpsc::Receiver<DataPacket>,
    error_rx: mpsc::Receiver<Error>,
    callbacks: Arc<Callbacks>,
    active: Arc<Mutex<Vec<u16>>>,
}

#[derive(Default)]
struct Callbacks {
    on_change: Mutex<Option<OnChange>>,
    on_timeout: Mutex<Option<OnTimeout>>,
    on_error: Mutex<Option<OnError>>,
}

enum Command {
    Activate {
        universe: u16,
        multicast: bool,
        reply: tokio::sync::oneshot::Sender<Result<(), Error>>,
    },
    Deactivate {
        universe: u16,
        reply: tokio::sync::oneshot::Sender<Result<(), Error>>,
    },
    Close,
}

impl Receiver {
    /// Bind a UDP socket on `bind_host` and start the reader task.
    pub async fn new(bind_host: &str, interface: Option<Ipv4Addr>) -> Result<Self, Error> {
        let socket = transport::bind(bind_host, SACN_PORT).await?;
        let (command_tx, command_rx) = mpsc::channel(32);
        let (packet_tx, packet_rx) = mpsc::channel(256);
        let (error_tx, error_rx) = mpsc::channel(64);
        let callbacks = Arc::new(Callbacks::default());
        let active = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(run_reader(
            socket,
            interface,
            command_rx,
            packet_tx,
            error_tx,
            callbacks.clone(),
            active.clone(),
        ));

        Ok(Self {
            command_tx,
            packet_rx,
            error_rx,
            callbacks,
            active,
        })
    }

    pub async fn activate(&self, universe: u16, use_multicast: bool) -> Result<(), Error> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.command_tx
            .send(Command::Activate {
                universe,
                multicast: use_multicast,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotActive { universe })?;
        reply_rx.await.map_err(|_| Error::NotActive { universe })?
    }

    pub async fn deactivate(&self, universe: u16) -> Result<(), Error> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.command_tx
            .send(Command::Deactivate {
                universe,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotActive { universe })?;
        reply_rx.await.map_err(|_| Error::NotActive { universe })?
    }

    pub fn active_universes(&self) -> Vec<u16> {
        self.active.lock().clone()
    }

    pub fn set_on_change(&self, callback: impl Fn(Option<DataPacket>, DataPacket) + Send + Sync + 'static) {
        *self.callbacks.on_change.lock() = Some(Box::new(callback));
    }

    pub fn set_on_timeout(&self, callback: impl Fn(u16) + Send + Sync + 'static) {
        *self.callbacks.on_timeout.lock() = Some(Box::new(callback));
    }

    /// Register a callback for errors that aren't timeouts (for example
    /// `SourcesExceeded`), mirroring what's also sent on [`Receiver::errors`].
    pub fn set_on_error(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        *self.callbacks.on_error.lock() = Some(Box::new(callback));
    }

    /// The delivered-packet channel surface.
    pub fn packets(&mut self) -> &mut mpsc::Receiver<DataPacket> {
        &mut self.packet_rx
    }

    /// The error channel surface.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<Error> {
        &mut self.error_rx
    }

    /// Signal the reader task to stop and close the socket. Observed
    /// within at most one read deadline (2500 ms).
    pub async fn close(&self) {
        let _ = self.command_tx.send(Command::Close).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_reader(
    socket: UdpSocket,
    interface: Option<Ipv4Addr>,
    mut command_rx: mpsc::Receiver<Command>,
    packet_tx: mpsc::Sender<DataPacket>,
    error_tx: mpsc::Sender<Error>,
    callbacks: Arc<Callbacks>,
    active: Arc<Mutex<Vec<u16>>>,
) {
    let mut universes: HashMap<u16, UniverseState> = HashMap::new();
    let mut buf = [0u8; READ_BUFFER_LEN];

    loop {
        tokio::select! {
            biased;

            command = command_rx.recv() => {
                match command {
                    Some(Command::Activate { universe, multicast, reply }) => {
                        let result = activate_universe(&socket, interface, &mut universes, &active, universe, multicast).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Deactivate { universe, reply }) => {
                        let result = deactivate_universe(&socket, interface, &mut universes, &active, universe).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Close) | None => {
                        tracing::info!("receiver closing");
                        break;
                    }
                }
            }

            read = timeout(SOURCE_TIMEOUT, socket.recv_from(&mut buf)) => {
                match read {
                    Err(_elapsed) => {
                        report_timeouts(&mut universes, &callbacks, &error_tx).await;
                    }
                    Ok(Ok((len, _src))) => {
                        handle_datagram(&buf[..len], &mut universes, &callbacks, &packet_tx, &error_tx).await;
                    }
                    Ok(Err(err)) => {
                        tracing::error!(%err, "sACN socket read error");
                        let _ = error_tx.send(Error::Io(err)).await;
                    }
                }
            }
        }
    }
}

async fn handle_datagram(
    bytes: &[u8],
    universes: &mut HashMap<u16, UniverseState>,
    callbacks: &Arc<Callbacks>,
    packet_tx: &mpsc::Sender<DataPacket>,
    error_tx: &mpsc::Sender<Error>,
) {
    let packet = match DataPacket::from_bytes(bytes) {
        Ok(p) => p,
        Err(_) => return,
    };

    let Some(state) = universes.get_mut(&packet.universe()) else {
        return;
    };

    let now = Instant::now();
    let previous = state.last_dmx_data.clone();
    match handle_packet(state, &packet, now) {
        Outcome::SourcesExceeded => {
            let universe = packet.universe();
            tracing::warn!(universe, "sources exceeded");
            let err = Error::SourcesExceeded { universe };
            if let Some(cb) = callbacks.on_error.lock().as_ref() {
                cb(&err);
            }
            let _ = error_tx.send(err).await;
        }
        Outcome::Delivered => {
            let _ = packet_tx.send(packet.clone()).await;
            if let Some(cb) = callbacks.on_change.lock().as_ref() {
                let old = if previous.is_empty() {
                    None
                } else {
                    let mut old_packet = packet.clone();
                    old_packet.set_data(&previous);
                    Some(old_packet)
                };
                cb(old, packet);
            }
        }
        Outcome::NotAllowed | Outcome::SequenceRejected | Outcome::Unchanged => {}
    }
}

async fn report_timeouts(
    universes: &mut HashMap<u16, UniverseState>,
    callbacks: &Arc<Callbacks>,
    error_tx: &mpsc::Sender<Error>,
) {
    let now = Instant::now();
    for (&universe, state) in universes.iter_mut() {
        // A universe that has never had a source is silent by construction,
        // not timed out: report only once a source has actually been seen.
        if !state.timeout_reported
            && !state.sources.is_empty()
            && now.duration_since(state.last_accepted_at) > SOURCE_TIMEOUT
        {
            tracing::warn!(universe, "sACN timeout");
            state.timeout_reported = true;
            let _ = error_tx.send(Error::Timeout { universe }).await;
            if let Some(cb) = callbacks.on_timeout.lock().as_ref() {
                cb(universe);
            }
        }
    }
}

async fn activate_universe(
    socket: &UdpSocket,
    interface: Option<Ipv4Addr>,
    universes: &mut HashMap<u16, UniverseState>,
    active: &Arc<Mutex<Vec<u16>>>,
    universe: u16,
    multicast: bool,
) -> Result<(), Error> {
    if universes.contains_key(&universe) {
        return Err(Error::AlreadyActive { universe });
    }
    if multicast {
        transport::join_multicast(socket, universe, interface)?;
    }
    universes.insert(universe, UniverseState::new(multicast));
    active.lock().push(universe);
    Ok(())
}

async fn deactivate_universe(
    socket: &UdpSocket,
    interface: Option<Ipv4Addr>,
    universes: &mut HashMap<u16, UniverseState>,
    active: &Arc<Mutex<Vec<u16>>>,
    universe: u16,
) -> Result<(), Error> {
    let Some(state) = universes.remove(&universe) else {
        return Err(Error::NotActive { universe });
    };
    if state.multicast {
        transport::leave_multicast(socket, universe, interface)?;
    }
    active.lock().retain(|&u| u != universe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::Cid;

    fn packet(cid: [u8; 16], priority: u8, sequence: u8, payload: &[u8]) -> DataPacket {
        let mut p = DataPacket::empty();
        p.set_cid(Cid::new(cid));
        p.set_priority(priority).unwrap();
        p.set_sequence(sequence);
        p.set_universe(1);
        p.set_data(payload);
        p
    }

    /// S2: single source, monotone sequences, change detection.
    #[test]
    fn single_source_acceptance() {
        let mut state = UniverseState::new(false);
        let t0 = Instant::now();

        assert_eq!(
            handle_packet(&mut state, &packet([1; 16], 100, 0, &[1]), t0),
            Outcome::Delivered
        );
        assert_eq!(
            handle_packet(&mut state, &packet([1; 16], 100, 1, &[1]), t0),
            Outcome::Unchanged
        );
        assert_eq!(
            handle_packet(&mut state, &packet([1; 16], 100, 2, &[2]), t0),
            Outcome::Delivered
        );
    }

    /// S3: sequence rejection.
    #[test]
    fn sequence_rejection() {
        let mut state = UniverseState::new(false);
        let t0 = Instant::now();

        assert_eq!(
            handle_packet(&mut state, &packet([1; 16], 100, 10, &[1]), t0),
            Outcome::Delivered
        );
        assert_eq!(
            handle_packet(&mut state, &packet([1; 16], 100, 11, &[2]), t0),
            Outcome::Delivered
        );
        assert_eq!(
            handle_packet(&mut state, &packet([1; 16], 100, 5, &[3]), t0),
            Outcome::SequenceRejected
        );
    }

    /// S4: priority takeover.
    #[test]
    fn priority_takeover() {
        let mut state = UniverseState::new(false);
        let t0 = Instant::now();

        assert_eq!(
            handle_packet(&mut state, &packet([1; 16], 100, 0, &[1]), t0),
            Outcome::Delivered
        );
        assert_eq!(
            handle_packet(&mut state, &packet([2; 16], 150, 0, &[2]), t0),
            Outcome::Delivered
        );
        // A at prio 100 is no longer the allowed source
        assert_eq!(
            handle_packet(&mut state, &packet([1; 16], 100, 1, &[3]), t0),
            Outcome::NotAllowed
        );
    }

    /// S5: sources exceeded.
    #[test]
    fn sources_exceeded() {
        let mut state = UniverseState::new(false);
        let t0 = Instant::now();

        assert_eq!(
            handle_packet(&mut state, &packet([1; 16], 100, 0, &[1]), t0),
            Outcome::Delivered
        );
        assert_eq!(
            handle_packet(&mut state, &packet([2; 16], 100, 0, &[2]), t0),
            Outcome::SourcesExceeded
        );
    }

    /// S6: timeout reporting, once per silence.
    #[test]
    fn timeout_reported_once_until_next_good_packet() {
        let mut state = UniverseState::new(false);
        let t0 = Instant::now();
        handle_packet(&mut state, &packet([1; 16], 100, 0, &[1]), t0);

        let t1 = t0 + Duration::from_millis(3000);
        assert!(!state.timeout_reported);
        let should_report = !state.timeout_reported
            && t1.duration_since(state.last_accepted_at) > SOURCE_TIMEOUT;
        assert!(should_report);
        state.timeout_reported = true;

        // a second check before new data still should not re-fire
        let t2 = t1 + Duration::from_millis(100);
        let should_report_again = !state.timeout_reported
            && t2.duration_since(state.last_accepted_at) > SOURCE_TIMEOUT;
        assert!(!should_report_again);

        // a fresh valid packet clears the flag
        handle_packet(&mut state, &packet([1; 16], 100, 1, &[2]), t2);
        assert!(!state.timeout_reported);
    }

    /// A universe that was activated but has never received a packet
    /// should not be reported as timed out: there was never a source to
    /// lose. `report_timeouts` guards on `!state.sources.is_empty()`.
    #[test]
    fn never_fed_universe_is_not_a_timeout() {
        let state = UniverseState::new(false);
        let t1 = state.last_accepted_at + Duration::from_millis(3000);
        assert!(state.sources.is_empty());
        let should_report = !state.timeout_reported
            && !state.sources.is_empty()
            && t1.duration_since(state.last_accepted_at) > SOURCE_TIMEOUT;
        assert!(!should_report);
    }
}
