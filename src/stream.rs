//! The stream registry (C3) and flow-control accountant (C4).
//!
//! The per-stream byte/value buffer is an external collaborator (see the
//! crate-level docs): the connection core only ever calls the accessors and
//! mutators on [`StreamHandle`]. [`StreamState`] is the one concrete
//! in-memory implementation shipped here so the core is independently
//! testable; production embedders may supply their own.

use bytes::Bytes;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Tolerance multiplier applied when checking whether an incoming credit fits
/// a stream's receive window, to accommodate connector rounding (§4.4).
pub const FLOW_CONTROL_TOLERANCE_NUMERATOR: u64 = 101;
pub const FLOW_CONTROL_TOLERANCE_DENOMINATOR: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IncomingOffsets {
    pub max: u64,
    pub current: u64,
    pub max_acceptable: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutgoingOffsets {
    pub current: u64,
    pub max: u64,
}

/// The external per-stream buffer's published interface (§6). Holds are keyed
/// by the outbound packet sequence that reserved them so the send loop can
/// execute or cancel exactly the hold a response pertains to.
pub trait StreamHandle: Send + Sync {
    fn available_to_send(&self) -> u64;
    fn remote_receive_max(&self) -> u64;
    fn remote_received(&self) -> u64;
    fn send_max(&self) -> u64;
    fn total_sent(&self) -> u64;
    fn receive_max(&self) -> u64;
    fn total_received(&self) -> u64;
    fn readable_length(&self) -> u64;
    fn is_open(&self) -> bool;

    fn hold_outgoing(&self, sequence: u64, amount: u64);
    fn execute_hold(&self, sequence: u64) -> Option<u64>;
    fn cancel_hold(&self, sequence: u64) -> Option<u64>;

    fn push_incoming_data(&self, data: Bytes, offset: u64);
    fn get_available_data_to_send(&self, max_bytes: usize) -> (Bytes, u64);
    fn queued_outgoing_bytes(&self) -> u64;
    fn resend_outgoing_data(&self, data: Bytes, offset: u64);
    fn incoming_offsets(&self) -> IncomingOffsets;
    fn outgoing_offsets(&self) -> OutgoingOffsets;

    fn add_received(&self, amount: u64);
    fn add_delivered(&self, amount: u64);
    fn total_delivered(&self) -> u64;

    fn set_remote_receive_max(&self, value: u64);
    fn set_remote_received(&self, value: u64);
    fn set_send_max(&self, value: u64);
    fn set_receive_max(&self, value: u64);

    fn close(&self);
    fn is_closed(&self) -> bool;

    /// Lets callers that know the concrete buffer implementation recover it
    /// from the trait object, e.g. to reach [`StreamState::write`]/`read`,
    /// which are application-facing and not part of this protocol-facing trait.
    fn as_any(&self) -> &dyn Any;
}

struct IncomingData {
    read_cursor: u64,
    max_accepted_offset: u64,
    buffered: HashMap<u64, Bytes>,
    buffered_bytes: u64,
}

struct OutgoingData {
    sent_cursor: u64,
    remote_max_offset: u64,
    queue: VecDeque<u8>,
}

/// Default in-memory implementation of [`StreamHandle`].
pub struct StreamState {
    send_max: AtomicU64,
    total_sent: AtomicU64,
    receive_max: AtomicU64,
    total_received: AtomicU64,
    total_delivered: AtomicU64,
    remote_receive_max: AtomicU64,
    remote_received: AtomicU64,
    holds: Mutex<HashMap<u64, u64>>,
    incoming: Mutex<IncomingData>,
    outgoing: Mutex<OutgoingData>,
    closed: AtomicBool,
}

impl StreamState {
    pub fn new(send_max: u64, receive_max: u64) -> Arc<Self> {
        Arc::new(StreamState {
            send_max: AtomicU64::new(send_max),
            total_sent: AtomicU64::new(0),
            receive_max: AtomicU64::new(receive_max),
            total_received: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            remote_receive_max: AtomicU64::new(u64::MAX),
            remote_received: AtomicU64::new(0),
            holds: Mutex::new(HashMap::new()),
            incoming: Mutex::new(IncomingData {
                read_cursor: 0,
                max_accepted_offset: 0,
                buffered: HashMap::new(),
                buffered_bytes: 0,
            }),
            outgoing: Mutex::new(OutgoingData {
                sent_cursor: 0,
                remote_max_offset: u64::MAX,
                queue: VecDeque::new(),
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Application-facing write: appends bytes to the outgoing queue so the
    /// send loop will pick them up on its next iteration.
    pub fn write(&self, data: &[u8]) {
        self.outgoing.lock().queue.extend(data.iter().copied());
    }

    /// Application-facing read: drains readable bytes from the front of the
    /// contiguous incoming run, advancing the read cursor.
    pub fn read(&self, max_bytes: usize) -> Vec<u8> {
        let mut incoming = self.incoming.lock();
        let mut out = Vec::new();
        loop {
            if out.len() >= max_bytes {
                break;
            }
            let cursor = incoming.read_cursor;
            let chunk = match incoming.buffered.remove(&cursor) {
                Some(chunk) => chunk,
                None => break,
            };
            incoming.buffered_bytes -= chunk.len() as u64;
            incoming.read_cursor += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        out
    }

    pub fn raise_send_max(&self, additional: u64) {
        self.send_max.fetch_add(additional, Ordering::SeqCst);
    }

    pub fn raise_receive_max(&self, additional: u64) {
        self.receive_max.fetch_add(additional, Ordering::SeqCst);
    }
}

impl StreamHandle for StreamState {
    fn available_to_send(&self) -> u64 {
        let queued = self.outgoing.lock().queue.len() as u64;
        // available_to_send here reflects value, not bytes; value-writers use
        // send_max/total_sent directly. For a pure money stream (no data
        // payload of its own) the queue length is irrelevant to this figure,
        // so we report the remaining send window.
        let _ = queued;
        self.send_max()
            .saturating_sub(self.total_sent.load(Ordering::SeqCst))
    }

    fn remote_receive_max(&self) -> u64 {
        self.remote_receive_max.load(Ordering::SeqCst)
    }

    fn remote_received(&self) -> u64 {
        self.remote_received.load(Ordering::SeqCst)
    }

    fn send_max(&self) -> u64 {
        self.send_max.load(Ordering::SeqCst)
    }

    fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::SeqCst)
    }

    fn receive_max(&self) -> u64 {
        self.receive_max.load(Ordering::SeqCst)
    }

    fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::SeqCst)
    }

    fn readable_length(&self) -> u64 {
        self.incoming.lock().buffered_bytes
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn hold_outgoing(&self, sequence: u64, amount: u64) {
        self.holds.lock().insert(sequence, amount);
    }

    fn execute_hold(&self, sequence: u64) -> Option<u64> {
        let amount = self.holds.lock().remove(&sequence)?;
        self.total_sent.fetch_add(amount, Ordering::SeqCst);
        Some(amount)
    }

    fn cancel_hold(&self, sequence: u64) -> Option<u64> {
        self.holds.lock().remove(&sequence)
    }

    fn push_incoming_data(&self, data: Bytes, offset: u64) {
        let mut incoming = self.incoming.lock();
        if offset < incoming.read_cursor {
            return;
        }
        let end = offset + data.len() as u64;
        if end > incoming.max_accepted_offset {
            incoming.max_accepted_offset = end;
        }
        incoming.buffered_bytes += data.len() as u64;
        incoming.buffered.insert(offset, data);
    }

    fn get_available_data_to_send(&self, max_bytes: usize) -> (Bytes, u64) {
        let mut outgoing = self.outgoing.lock();
        let n = max_bytes.min(outgoing.queue.len());
        let data: Vec<u8> = outgoing.queue.drain(..n).collect();
        let offset = outgoing.sent_cursor;
        outgoing.sent_cursor += data.len() as u64;
        (Bytes::from(data), offset)
    }

    fn queued_outgoing_bytes(&self) -> u64 {
        self.outgoing.lock().queue.len() as u64
    }

    fn resend_outgoing_data(&self, data: Bytes, offset: u64) {
        let mut outgoing = self.outgoing.lock();
        if offset < outgoing.sent_cursor {
            outgoing.sent_cursor = offset;
        }
        for (i, byte) in data.iter().enumerate() {
            if i < outgoing.queue.len() {
                outgoing.queue[i] = *byte;
            } else {
                outgoing.queue.push_back(*byte);
            }
        }
    }

    fn incoming_offsets(&self) -> IncomingOffsets {
        let incoming = self.incoming.lock();
        IncomingOffsets {
            max: incoming.max_accepted_offset,
            current: incoming.read_cursor,
            max_acceptable: u64::MAX,
        }
    }

    fn outgoing_offsets(&self) -> OutgoingOffsets {
        let outgoing = self.outgoing.lock();
        OutgoingOffsets {
            current: outgoing.sent_cursor,
            max: outgoing.remote_max_offset,
        }
    }

    fn add_received(&self, amount: u64) {
        self.total_received.fetch_add(amount, Ordering::SeqCst);
    }

    fn add_delivered(&self, amount: u64) {
        self.total_delivered.fetch_add(amount, Ordering::SeqCst);
    }

    fn total_delivered(&self) -> u64 {
        self.total_delivered.load(Ordering::SeqCst)
    }

    fn set_remote_receive_max(&self, value: u64) {
        self.remote_receive_max.store(value, Ordering::SeqCst);
    }

    fn set_remote_received(&self, value: u64) {
        self.remote_received.store(value, Ordering::SeqCst);
    }

    fn set_send_max(&self, value: u64) {
        self.send_max.store(value, Ordering::SeqCst);
    }

    fn set_receive_max(&self, value: u64) {
        self.receive_max.store(value, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Protocol bookkeeping the connection keeps about a stream, on top of the
/// externalized buffer/window state in [`StreamHandle`].
pub struct StreamRecord {
    pub id: u64,
    pub handle: Arc<dyn StreamHandle>,
    pub sent_end: AtomicBool,
    pub remote_closed: AtomicBool,
    pub remote_sent_end: AtomicBool,
    pub error_message: Mutex<Option<String>>,
}

impl StreamRecord {
    fn new(id: u64, handle: Arc<dyn StreamHandle>) -> Self {
        StreamRecord {
            id,
            handle,
            sent_end: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            remote_sent_end: AtomicBool::new(false),
            error_message: Mutex::new(None),
        }
    }

    pub fn is_fully_closed(&self) -> bool {
        !self.handle.is_open()
            && self.sent_end.load(Ordering::SeqCst)
            && self.remote_sent_end.load(Ordering::SeqCst)
    }
}

/// Whether a connection is the STREAM initiator (client) or responder
/// (server); determines locally-originated stream-id parity (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn local_parity(self) -> u64 {
        match self {
            Role::Initiator => 1,
            Role::Responder => 0,
        }
    }

    fn remote_parity(self) -> u64 {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    StreamIdBlocked,
    ParityViolation,
    StreamIdTooLarge,
}

/// C3: maps stream id to stream record, enforces id parity and limits,
/// tracks lifecycle.
pub struct StreamRegistry {
    role: Role,
    streams: HashMap<u64, Arc<StreamRecord>>,
    closed_streams: HashSet<u64>,
    next_local_stream_id: u64,
    max_stream_id: u64,
    remote_max_stream_id: u64,
}

impl StreamRegistry {
    pub fn new(role: Role, max_remote_streams: u64) -> Self {
        let next_local_stream_id = match role {
            Role::Initiator => 1,
            Role::Responder => 2,
        };
        StreamRegistry {
            role,
            streams: HashMap::new(),
            closed_streams: HashSet::new(),
            next_local_stream_id,
            max_stream_id: 2 * max_remote_streams,
            remote_max_stream_id: 2 * max_remote_streams,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn max_stream_id(&self) -> u64 {
        self.max_stream_id
    }

    pub fn set_remote_max_stream_id(&mut self, value: u64) {
        self.remote_max_stream_id = value;
    }

    pub fn create_local(
        &mut self,
        handle: Arc<dyn StreamHandle>,
    ) -> Result<Arc<StreamRecord>, RegistryError> {
        let id = self.next_local_stream_id;
        if id > self.remote_max_stream_id {
            return Err(RegistryError::StreamIdBlocked);
        }
        let record = Arc::new(StreamRecord::new(id, handle));
        self.streams.insert(id, record.clone());
        self.next_local_stream_id += 2;
        Ok(record)
    }

    pub fn get(&self, id: u64) -> Option<Arc<StreamRecord>> {
        self.streams.get(&id).cloned()
    }

    pub fn is_closed(&self, id: u64) -> bool {
        self.closed_streams.contains(&id)
    }

    /// Ensures a stream the remote referenced exists, creating it from
    /// `make_handle` on first mention. Returns an error if the id has the
    /// wrong parity for a remote-initiated stream or exceeds our ceiling.
    pub fn accept_remote(
        &mut self,
        id: u64,
        make_handle: impl FnOnce() -> Arc<dyn StreamHandle>,
    ) -> Result<Arc<StreamRecord>, RegistryError> {
        if id % 2 != self.role.remote_parity() {
            return Err(RegistryError::ParityViolation);
        }
        if id > self.max_stream_id {
            return Err(RegistryError::StreamIdTooLarge);
        }
        if let Some(existing) = self.streams.get(&id) {
            return Ok(existing.clone());
        }
        let record = Arc::new(StreamRecord::new(id, make_handle()));
        self.streams.insert(id, record.clone());
        Ok(record)
    }

    /// True when a just-accepted remote stream id is within 25% of the
    /// current ceiling and we should advertise a higher one (§4.3).
    pub fn should_advertise_max_stream_id(&self, id: u64) -> bool {
        id.saturating_mul(4) >= self.max_stream_id.saturating_mul(3)
    }

    pub fn raise_max_stream_id(&mut self, new_ceiling: u64) {
        if new_ceiling > self.max_stream_id {
            self.max_stream_id = new_ceiling;
        }
    }

    pub fn remove(&mut self, id: u64) {
        self.streams.remove(&id);
        self.closed_streams.insert(id);
    }

    pub fn open_streams(&self) -> impl Iterator<Item = &Arc<StreamRecord>> {
        self.streams.values()
    }

    /// Stream ids in ascending order, used by the send loop's deterministic
    /// money-allocation pass (§4.6 step 2d).
    pub fn ids_in_order(&self) -> Vec<u64> {
        let ordered: BTreeMap<u64, ()> = self.streams.keys().map(|id| (*id, ())).collect();
        ordered.into_iter().map(|(id, _)| id).collect()
    }
}
