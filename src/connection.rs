//! The send loop (C6) and lifecycle controller (C8): the single owner of
//! connection state. Every mutation of the stream registry, the queued
//! control frames, or the connection totals happens while holding
//! [`Inner::state`]; the inbound handler (`crate::inbound`) locks the same
//! mutex so the two are mutually exclusive, per the concurrency model.

use crate::config::ConnectionConfig;
use crate::crypto::{generate_condition, random_condition, MAX_DATA_SIZE};
use crate::error::Error;
use crate::event::{ConnectionEvent, StreamOpened};
use crate::packet::{
    ConnectionAssetDetailsFrame, ConnectionCloseFrame, ConnectionDataBlockedFrame,
    ConnectionMaxDataFrame, ConnectionMaxStreamIdFrame, ConnectionNewAddressFrame,
    ConnectionStreamIdBlockedFrame, ErrorCode as StreamErrorCode, Frame, FrameIterator,
    StreamCloseFrame, StreamDataBlockedFrame, StreamDataFrame, StreamMaxDataFrame,
    StreamMaxMoneyFrame, StreamMoneyBlockedFrame, StreamMoneyFrame, StreamPacket,
    StreamPacketBuilder,
};
use crate::plugin::{Plugin, PluginResponse};
use crate::prober::{self, DiscoveryState, DiscoveryStep, ProbeOutcome};
use crate::stream::{Role, StreamHandle, StreamRecord, StreamRegistry, StreamState};
use bytes::{Bytes, BytesMut};
use interledger_packet::{
    Address, ErrorClass, ErrorCode as IlpErrorCode, Fulfill, MaxPacketAmountDetails, PacketType,
    Prepare, PrepareBuilder, Reject,
};
use log::{debug, info, trace, warn};
use num::rational::Ratio;
use num::BigUint;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

const PREPARE_EXPIRY: Duration = Duration::from_secs(30);
const STREAM_DATA_HEADER_OVERHEAD: usize = 20;

/// A queued control or stream frame, owned so it can outlive the iteration
/// that produced it until the packet that drains it is built.
#[derive(Debug, Clone)]
pub(crate) enum QueuedFrame {
    ConnectionClose { code: StreamErrorCode, message: String },
    ConnectionNewAddress { source_account: Address },
    ConnectionAssetDetails { code: String, scale: u8 },
    ConnectionMaxData { max_offset: u64 },
    ConnectionDataBlocked { max_offset: u64 },
    ConnectionMaxStreamId { max_stream_id: u64 },
    ConnectionStreamIdBlocked { max_stream_id: u64 },
    StreamClose { stream_id: u64, code: StreamErrorCode, message: String },
    StreamMoney { stream_id: u64, shares: u64 },
    StreamMaxMoney { stream_id: u64, receive_max: u64, total_received: u64 },
    StreamMoneyBlocked { stream_id: u64, send_max: u64, total_sent: u64 },
    StreamData { stream_id: u64, offset: u64, data: Bytes },
    StreamMaxData { stream_id: u64, max_offset: u64 },
    StreamDataBlocked { stream_id: u64, max_offset: u64 },
}

impl QueuedFrame {
    pub(crate) fn as_frame(&self) -> Frame<'_> {
        match self {
            QueuedFrame::ConnectionClose { code, message } => {
                Frame::ConnectionClose(ConnectionCloseFrame { code: *code, message })
            }
            QueuedFrame::ConnectionNewAddress { source_account } => Frame::ConnectionNewAddress(
                ConnectionNewAddressFrame { source_account: source_account.clone() },
            ),
            QueuedFrame::ConnectionAssetDetails { code, scale } => {
                Frame::ConnectionAssetDetails(ConnectionAssetDetailsFrame {
                    source_asset_code: code,
                    source_asset_scale: *scale,
                })
            }
            QueuedFrame::ConnectionMaxData { max_offset } => {
                Frame::ConnectionMaxData(ConnectionMaxDataFrame { max_offset: *max_offset })
            }
            QueuedFrame::ConnectionDataBlocked { max_offset } => {
                Frame::ConnectionDataBlocked(ConnectionDataBlockedFrame { max_offset: *max_offset })
            }
            QueuedFrame::ConnectionMaxStreamId { max_stream_id } => Frame::ConnectionMaxStreamId(
                ConnectionMaxStreamIdFrame { max_stream_id: *max_stream_id },
            ),
            QueuedFrame::ConnectionStreamIdBlocked { max_stream_id } => {
                Frame::ConnectionStreamIdBlocked(ConnectionStreamIdBlockedFrame {
                    max_stream_id: *max_stream_id,
                })
            }
            QueuedFrame::StreamClose { stream_id, code, message } => {
                Frame::StreamClose(StreamCloseFrame { stream_id: *stream_id, code: *code, message })
            }
            QueuedFrame::StreamMoney { stream_id, shares } => {
                Frame::StreamMoney(StreamMoneyFrame { stream_id: *stream_id, shares: *shares })
            }
            QueuedFrame::StreamMaxMoney { stream_id, receive_max, total_received } => {
                Frame::StreamMaxMoney(StreamMaxMoneyFrame {
                    stream_id: *stream_id,
                    receive_max: *receive_max,
                    total_received: *total_received,
                })
            }
            QueuedFrame::StreamMoneyBlocked { stream_id, send_max, total_sent } => {
                Frame::StreamMoneyBlocked(StreamMoneyBlockedFrame {
                    stream_id: *stream_id,
                    send_max: *send_max,
                    total_sent: *total_sent,
                })
            }
            QueuedFrame::StreamData { stream_id, offset, data } => {
                Frame::StreamData(StreamDataFrame { stream_id: *stream_id, offset: *offset, data })
            }
            QueuedFrame::StreamMaxData { stream_id, max_offset } => {
                Frame::StreamMaxData(StreamMaxDataFrame { stream_id: *stream_id, max_offset: *max_offset })
            }
            QueuedFrame::StreamDataBlocked { stream_id, max_offset } => {
                Frame::StreamDataBlocked(StreamDataBlockedFrame { stream_id: *stream_id, max_offset: *max_offset })
            }
        }
    }
}

/// Protocol state mutated exclusively by whoever holds [`Inner::state`].
pub(crate) struct CoreState {
    pub registry: StreamRegistry,
    pub queued_frames: VecDeque<QueuedFrame>,
    pub sequence: u64,
    pub discovery: DiscoveryState,
    pub exchange_rate: Option<Ratio<BigUint>>,
    pub connected: bool,
    pub closed: bool,
    pub remote_closed: bool,
    pub local_close_requested: bool,
    pub local_close_sent: bool,
    pub sending: bool,
    pub retry_delay: Duration,
    pub remote_connection_max_offset: u64,
    pub connection_bytes_sent: u64,
    pub connection_bytes_received: u64,
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_received: u64,
    pub remote_asset_code: Option<String>,
    pub remote_asset_scale: Option<u8>,
}

impl CoreState {
    fn new(role: Role, config: &ConnectionConfig) -> Self {
        CoreState {
            registry: StreamRegistry::new(role, config.max_remote_streams),
            queued_frames: VecDeque::new(),
            sequence: 1,
            discovery: DiscoveryState::new(config.min_exchange_rate_precision),
            exchange_rate: None,
            connected: false,
            closed: false,
            remote_closed: false,
            local_close_requested: false,
            local_close_sent: false,
            sending: false,
            retry_delay: prober::INITIAL_RETRY_DELAY,
            remote_connection_max_offset: config.connection_buffer_size,
            connection_bytes_sent: 0,
            connection_bytes_received: 0,
            total_sent: 0,
            total_delivered: 0,
            total_received: 0,
            remote_asset_code: None,
            remote_asset_scale: None,
        }
    }
}

pub(crate) struct Inner {
    pub role: Role,
    pub shared_secret: Bytes,
    pub config: ConnectionConfig,
    pub plugin: Arc<dyn Plugin>,
    pub destination_account: AsyncMutex<Option<Address>>,
    pub state: AsyncMutex<CoreState>,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
    pub connected_notify: Notify,
    pub closed_notify: Notify,
    pub last_active_ms: AtomicU64,
    pub closing_for_destroy: AtomicBool,
}

/// A handle to one STREAM connection. Cloning shares the same underlying
/// state; the connection is only actually torn down when `destroy` runs.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl Connection {
    pub fn new(
        role: Role,
        shared_secret: Bytes,
        plugin: Arc<dyn Plugin>,
        config: ConnectionConfig,
        destination_account: Option<Address>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: AsyncMutex::new(CoreState::new(role, &config)),
            role,
            shared_secret,
            destination_account: AsyncMutex::new(destination_account),
            plugin,
            events: tx,
            connected_notify: Notify::new(),
            closed_notify: Notify::new(),
            last_active_ms: AtomicU64::new(now_ms()),
            closing_for_destroy: AtomicBool::new(false),
            config,
        });
        if inner.config.idle_timeout_ms > 0 {
            tokio::spawn(Inner::run_idle_timer(inner.clone()));
        }
        (Connection { inner }, rx)
    }

    /// Creates a new locally-originated stream and fires a `Stream` event.
    pub async fn create_stream(&self) -> Result<u64, Error> {
        let mut state = self.inner.state.lock().await;
        let handle = StreamState::new(u64::MAX, self.inner.config.connection_buffer_size);
        let record = state
            .registry
            .create_local(handle)
            .map_err(|_| Error::StreamIdError("no stream ids available".to_string()))?;
        let id = record.id;
        drop(state);
        let _ = self.inner.events.send(ConnectionEvent::Stream(StreamOpened { id }));
        self.inner.clone().maybe_start_send_loop().await;
        Ok(id)
    }

    pub async fn stream_handle(&self, id: u64) -> Option<Arc<dyn StreamHandle>> {
        let state = self.inner.state.lock().await;
        state.registry.get(id).map(|record| record.handle.clone())
    }

    /// Queues bytes for stream `id` to go out on a future send loop iteration.
    /// Only works against the built-in [`StreamState`] buffer; embedders
    /// supplying their own [`StreamHandle`] write through their own API instead.
    pub async fn write_stream(&self, id: u64, data: &[u8]) -> Result<(), Error> {
        let handle = self
            .stream_handle(id)
            .await
            .ok_or_else(|| Error::StreamIdError(format!("no such stream {}", id)))?;
        let state = handle
            .as_any()
            .downcast_ref::<StreamState>()
            .ok_or_else(|| Error::InternalError("stream handle is not a StreamState".to_string()))?;
        state.write(data);
        self.inner.clone().maybe_start_send_loop().await;
        Ok(())
    }

    /// Drains up to `max_bytes` of contiguous readable data from stream `id`.
    pub async fn read_stream(&self, id: u64, max_bytes: usize) -> Result<Vec<u8>, Error> {
        let handle = self
            .stream_handle(id)
            .await
            .ok_or_else(|| Error::StreamIdError(format!("no such stream {}", id)))?;
        let state = handle
            .as_any()
            .downcast_ref::<StreamState>()
            .ok_or_else(|| Error::InternalError("stream handle is not a StreamState".to_string()))?;
        Ok(state.read(max_bytes))
    }

    /// Sets the address this connection sends Prepares to. Required before
    /// the send loop can dispatch anything; typically known up front for an
    /// initiator and learned via `ConnectionNewAddress` for a responder.
    pub async fn set_destination_account(&self, address: Address) {
        *self.inner.destination_account.lock().await = Some(address);
        self.inner.clone().maybe_start_send_loop().await;
    }

    /// Starts the send loop (if not running) and waits for the first
    /// successful probe, or an error/close.
    pub async fn connect(&self) -> Result<(), Error> {
        self.inner.clone().maybe_start_send_loop().await;
        loop {
            {
                let state = self.inner.state.lock().await;
                if state.connected {
                    return Ok(());
                }
                if state.closed {
                    return Err(Error::InternalError("connection closed before connecting".to_string()));
                }
            }
            tokio::select! {
                _ = self.inner.connected_notify.notified() => {},
                _ = self.inner.closed_notify.notified() => {},
            }
        }
    }

    /// Ends all open streams gracefully and sends ConnectionClose(NoError).
    pub async fn end(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.local_close_requested = true;
            for record in state.registry.open_streams() {
                record.handle.close();
            }
        }
        self.inner.clone().maybe_start_send_loop().await;
        loop {
            {
                let state = self.inner.state.lock().await;
                if state.closed {
                    return Ok(());
                }
            }
            self.inner.closed_notify.notified().await;
        }
    }

    /// Immediately tears down the connection, sending ConnectionClose(err)
    /// best-effort. Never returns an error to the caller.
    pub async fn destroy(&self, err: Option<Error>) {
        self.inner.clone().destroy_internal(err).await;
    }

    /// Entry point for the transport driver: handles one inbound Prepare and
    /// returns the Fulfill or Reject to send back.
    pub async fn handle_incoming(&self, prepare: Prepare) -> PluginResponse {
        crate::inbound::handle_prepare(&self.inner, prepare).await
    }
}

impl Inner {
    async fn run_idle_timer(self: Arc<Self>) {
        let timeout_ms = self.config.idle_timeout_ms;
        let poll_interval = Duration::from_millis(timeout_ms.min(500).max(1));
        loop {
            tokio::time::delay_for(poll_interval).await;
            let closed = self.state.lock().await.closed;
            if closed {
                return;
            }
            let last_active = self.last_active_ms.load(Ordering::SeqCst);
            if now_ms().saturating_sub(last_active) >= timeout_ms {
                warn!("connection idle for {} ms, destroying", timeout_ms);
                self.destroy_internal(Some(Error::IdleTimeout)).await;
                return;
            }
        }
    }

    pub(crate) fn touch_last_active(&self) {
        self.last_active_ms.store(now_ms(), Ordering::SeqCst);
    }

    pub(crate) async fn maybe_start_send_loop(self: Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.sending || state.closed {
                return;
            }
            state.sending = true;
        }
        tokio::spawn(Self::run_send_loop(self));
    }

    async fn run_send_loop(self: Arc<Self>) {
        loop {
            tokio::task::yield_now().await;
            if self.state.lock().await.closed {
                self.state.lock().await.sending = false;
                return;
            }
            let keep_going = self.send_loop_iteration().await;
            if !keep_going {
                self.state.lock().await.sending = false;
                return;
            }
        }
    }

    /// Runs one iteration of §4.6: discovery if needed, otherwise one
    /// outbound packet. Returns whether the loop should keep running.
    async fn send_loop_iteration(self: &Arc<Self>) -> bool {
        let destination = self.destination_account.lock().await.clone();
        let destination = match destination {
            Some(addr) => addr,
            None => return false,
        };

        let needs_discovery = self.state.lock().await.exchange_rate.is_none();
        if needs_discovery {
            return self.run_discovery_round(&destination).await;
        }

        self.build_and_dispatch_packet(&destination).await
    }

    async fn run_discovery_round(self: &Arc<Self>, destination: &Address) -> bool {
        let volley: Vec<u64> = {
            let state = self.state.lock().await;
            let ceiling = state.discovery.test_max_packet_amount;
            prober::initial_volley().into_iter().map(|a| a.min(ceiling)).collect()
        };

        let mut outcomes = Vec::with_capacity(volley.len());
        for amount in &volley {
            outcomes.push(self.send_probe(destination, *amount).await);
        }

        let mut state = self.state.lock().await;
        match state.discovery.observe_volley(&outcomes) {
            DiscoveryStep::Done => {
                let rate = state.discovery.exchange_rate.clone().unwrap();
                state.exchange_rate = Some(rate.clone());
                state.connected = true;
                let max_packet_amount = state.discovery.max_packet_amount;
                drop(state);
                info!(
                    "connection established, exchange_rate={:?}, max_packet_amount={}",
                    rate, max_packet_amount
                );
                let _ = self.events.send(ConnectionEvent::Connect);
                self.connected_notify.notify_waiters();
                true
            }
            DiscoveryStep::Continue(_) => {
                let saw_temporary = outcomes.iter().any(|o| matches!(o, ProbeOutcome::Temporary { .. }));
                let delay = state.discovery.retry_delay;
                drop(state);
                if saw_temporary {
                    tokio::time::delay_for(delay).await;
                }
                true
            }
            DiscoveryStep::Failed(message) => {
                drop(state);
                self.clone().destroy_internal(Some(Error::PathDiscoveryFailed(message))).await;
                false
            }
        }
    }

    async fn send_probe(self: &Arc<Self>, destination: &Address, source_amount: u64) -> ProbeOutcome {
        let sequence = {
            let mut state = self.state.lock().await;
            let seq = state.sequence;
            state.sequence += 1;
            seq
        };
        let stream_packet = StreamPacketBuilder {
            sequence,
            ilp_packet_type: PacketType::Prepare,
            prepare_amount: 0,
            frames: &[],
        }
        .build();
        let ciphertext = stream_packet.into_encrypted(&self.shared_secret, false);
        let condition = random_condition();
        let prepare = PrepareBuilder {
            amount: source_amount,
            expires_at: SystemTime::now() + PREPARE_EXPIRY,
            execution_condition: &condition,
            destination: destination.clone(),
            data: &ciphertext,
        }
        .build();

        debug!("sending unfulfillable probe for {}", source_amount);
        match self.plugin.send_data(prepare).await {
            Ok(PluginResponse::Fulfill(_)) => {
                warn!("probe was fulfilled unexpectedly; treating as no-op delivery");
                ProbeOutcome::Temporary { source_amount }
            }
            Ok(PluginResponse::Reject(reject)) => self.classify_reject(&reject, source_amount),
            Err(err) => ProbeOutcome::Fatal(err.0),
        }
    }

    fn classify_reject(&self, reject: &Reject, source_amount: u64) -> ProbeOutcome {
        let code = reject.code();
        if code == IlpErrorCode::F08_AMOUNT_TOO_LARGE {
            if let Ok(details) = MaxPacketAmountDetails::from_bytes(reject.data()) {
                return ProbeOutcome::TooLarge {
                    source_amount,
                    received: details.amount_received(),
                    maximum: details.max_amount(),
                };
            }
            return ProbeOutcome::Temporary { source_amount };
        }
        if code == IlpErrorCode::F99_APPLICATION_ERROR {
            if let Ok(packet) =
                StreamPacket::from_encrypted(&self.shared_secret, BytesMut::from(reject.data()))
            {
                return ProbeOutcome::Delivered {
                    source_amount,
                    prepare_amount: packet.prepare_amount(),
                };
            }
            return ProbeOutcome::Temporary { source_amount };
        }
        match code.class() {
            ErrorClass::Temporary => ProbeOutcome::Temporary { source_amount },
            _ => ProbeOutcome::Fatal(format!("path probe received fatal reject {:?}", code)),
        }
    }

    /// §4.6 step 2: builds and dispatches one real outbound packet.
    async fn build_and_dispatch_packet(self: &Arc<Self>, destination: &Address) -> bool {
        let mut state = self.state.lock().await;

        let mut owned_frames: Vec<QueuedFrame> = state.queued_frames.drain(..).collect();

        let ids = state.registry.ids_in_order();

        owned_frames.extend(stream_advertisement_frames(&state, &ids, self.config.connection_buffer_size));

        let sending_close = state.local_close_requested
            && !state.local_close_sent
            && state.registry.open_streams().all(|r| !r.handle.is_open());
        if sending_close {
            owned_frames.push(QueuedFrame::ConnectionClose {
                code: StreamErrorCode::NoError,
                message: String::new(),
            });
            state.local_close_sent = true;
        }

        let rate = state.exchange_rate.clone().unwrap();
        let mut remaining_cap = state.discovery.test_max_packet_amount;
        let mut held: Vec<(Arc<StreamRecord>, u64)> = Vec::new();

        for id in &ids {
            if remaining_cap == 0 {
                break;
            }
            let record = match state.registry.get(*id) {
                Some(r) => r,
                None => continue,
            };
            let wants = record.handle.available_to_send();
            if wants == 0 {
                continue;
            }
            let remote_window = record
                .handle
                .remote_receive_max()
                .saturating_sub(record.handle.remote_received());
            let remote_window_source = prober::invert_rate_ceil(remote_window, &rate);
            let cap = remaining_cap.min(remote_window_source);
            let amount = wants.min(cap);
            if amount > 0 {
                owned_frames.push(QueuedFrame::StreamMoney { stream_id: *id, shares: amount });
                remaining_cap -= amount;
                held.push((record.clone(), amount));
            }
            if wants > amount {
                owned_frames.push(QueuedFrame::StreamMoneyBlocked {
                    stream_id: *id,
                    send_max: record.handle.send_max(),
                    total_sent: record.handle.total_sent(),
                });
            }
        }

        let estimated_len = 64 + owned_frames.len() * 24;
        let conn_remaining = state
            .remote_connection_max_offset
            .saturating_sub(state.connection_bytes_sent);
        let available_for_data = (MAX_DATA_SIZE.saturating_sub(estimated_len) as u64).min(conn_remaining);
        let conn_clamped = conn_remaining < MAX_DATA_SIZE.saturating_sub(estimated_len) as u64;
        if conn_clamped {
            owned_frames.push(QueuedFrame::ConnectionDataBlocked {
                max_offset: state.remote_connection_max_offset,
            });
        }
        let mut bytes_budget = available_for_data as usize;

        for id in &ids {
            if bytes_budget <= STREAM_DATA_HEADER_OVERHEAD {
                break;
            }
            let record = match state.registry.get(*id) {
                Some(r) => r,
                None => continue,
            };
            let avail = bytes_budget - STREAM_DATA_HEADER_OVERHEAD;
            let (data, offset) = record.handle.get_available_data_to_send(avail);
            if !data.is_empty() {
                bytes_budget -= STREAM_DATA_HEADER_OVERHEAD + data.len();
                state.connection_bytes_sent += data.len() as u64;
                owned_frames.push(QueuedFrame::StreamData { stream_id: *id, offset, data });
            }
            if record.handle.queued_outgoing_bytes() > 0 {
                let outgoing = record.handle.outgoing_offsets();
                owned_frames.push(QueuedFrame::StreamDataBlocked {
                    stream_id: *id,
                    max_offset: outgoing.max,
                });
            }
        }

        let amount_to_send: u64 = held.iter().map(|(_, amount)| *amount).sum();
        let has_other_frames = !owned_frames.is_empty();
        if amount_to_send == 0 && !has_other_frames {
            return false;
        }

        let slipped_rate = prober::apply_slippage(&rate, &self.config.slippage);
        let prepare_amount = prober::apply_rate_floor(amount_to_send, &slipped_rate);

        let sequence = state.sequence;
        state.sequence += 1;
        for (record, amount) in &held {
            record.handle.hold_outgoing(sequence, *amount);
        }

        let borrowed: Vec<Frame> = owned_frames.iter().map(QueuedFrame::as_frame).collect();
        let stream_packet = StreamPacketBuilder {
            sequence,
            ilp_packet_type: PacketType::Prepare,
            prepare_amount,
            frames: &borrowed,
        }
        .build();
        drop(borrowed);
        drop(state);

        let ciphertext = stream_packet.into_encrypted(&self.shared_secret, self.config.enable_padding);
        let condition = generate_condition(&self.shared_secret, &ciphertext);
        let prepare = PrepareBuilder {
            amount: amount_to_send,
            expires_at: SystemTime::now() + PREPARE_EXPIRY,
            execution_condition: &condition,
            destination: destination.clone(),
            data: &ciphertext,
        }
        .build();

        trace!(
            "dispatching packet sequence={} prepare_amount={}",
            sequence, prepare_amount
        );
        let response = self.plugin.send_data(prepare).await;
        self.touch_last_active();

        match response {
            Ok(PluginResponse::Fulfill(fulfill)) => {
                self.handle_fulfill_response(sequence, amount_to_send, &held, fulfill).await;
            }
            Ok(PluginResponse::Reject(reject)) => {
                self.handle_reject_response(sequence, &held, reject).await;
            }
            Err(err) => {
                for (record, _) in &held {
                    record.handle.cancel_hold(sequence);
                }
                self.clone().destroy_internal(Some(Error::PluginError(err.0))).await;
                return false;
            }
        }

        let state = self.state.lock().await;
        !(state.closed || (state.local_close_sent && state.registry.open_streams().count() == 0))
    }

    async fn handle_fulfill_response(
        self: &Arc<Self>,
        sequence: u64,
        amount_to_send: u64,
        held: &[(Arc<StreamRecord>, u64)],
        fulfill: Fulfill,
    ) {
        let mut delivered = amount_to_send;
        let response_packet =
            StreamPacket::from_encrypted(&self.shared_secret, BytesMut::from(fulfill.data())).ok();

        for (record, amount) in held {
            record.handle.execute_hold(sequence);
            record.handle.add_delivered(*amount);
        }
        let mut state = self.state.lock().await;
        if let Some(packet) = &response_packet {
            if packet.sequence() == sequence {
                delivered = packet.prepare_amount();
                apply_control_frames(&mut state, packet.frames());
            }
        }
        state.total_sent += amount_to_send;
        state.total_delivered += delivered;
        if amount_to_send > 0 && amount_to_send == state.discovery.test_max_packet_amount {
            state.discovery.grow_test_max_packet_amount();
        }
        state.retry_delay = prober::INITIAL_RETRY_DELAY;
        debug!("packet {} fulfilled, delivered={}", sequence, delivered);
    }

    async fn handle_reject_response(
        self: &Arc<Self>,
        sequence: u64,
        held: &[(Arc<StreamRecord>, u64)],
        reject: Reject,
    ) {
        for (record, _) in held {
            record.handle.cancel_hold(sequence);
        }
        let code = reject.code();
        debug!("packet {} rejected with {:?}", sequence, code);
        if code == IlpErrorCode::F99_APPLICATION_ERROR {
            if let Ok(packet) =
                StreamPacket::from_encrypted(&self.shared_secret, BytesMut::from(reject.data()))
            {
                if packet.sequence() == sequence {
                    let mut state = self.state.lock().await;
                    apply_control_frames(&mut state, packet.frames());
                }
            }
        } else if code.class() == ErrorClass::Temporary {
            if code == IlpErrorCode::T04_INSUFFICIENT_LIQUIDITY {
                self.state.lock().await.discovery.shrink_on_t04();
            }
            let delay = {
                let mut state = self.state.lock().await;
                state.retry_delay = (state.retry_delay * 2).min(prober::MAX_RETRY_DELAY);
                state.retry_delay
            };
            tokio::time::delay_for(delay).await;
        } else {
            warn!("fatal reject {:?} on packet {}", code, sequence);
            self.clone()
                .destroy_internal(Some(Error::PathError {
                    code,
                    message: String::from_utf8_lossy(reject.message()).into_owned(),
                }))
                .await;
        }
    }

    pub(crate) async fn destroy_internal(self: Arc<Self>, err: Option<Error>) {
        if self.closing_for_destroy.swap(true, Ordering::SeqCst) {
            return;
        }
        let destination = self.destination_account.lock().await.clone();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            for record in state.registry.open_streams() {
                record.handle.close();
            }
        }
        if let Some(destination) = destination {
            let code = err
                .as_ref()
                .map(Error::as_stream_error_code)
                .unwrap_or(StreamErrorCode::NoError);
            let message = err.as_ref().map(|e| e.to_string()).unwrap_or_default();
            self.send_close_best_effort(&destination, code, message).await;
        }
        if let Some(err) = err {
            info!("connection destroyed: {}", err);
            let _ = self.events.send(ConnectionEvent::Error(Arc::new(err)));
        } else {
            info!("connection closed gracefully");
            let _ = self.events.send(ConnectionEvent::End);
        }
        let _ = self.events.send(ConnectionEvent::Close);
        self.closed_notify.notify_waiters();
        self.connected_notify.notify_waiters();
    }

    async fn send_close_best_effort(
        self: &Arc<Self>,
        destination: &Address,
        code: StreamErrorCode,
        message: String,
    ) {
        let sequence = {
            let mut state = self.state.lock().await;
            let seq = state.sequence;
            state.sequence += 1;
            seq
        };
        let frame = [Frame::ConnectionClose(ConnectionCloseFrame { code, message: &message })];
        let stream_packet = StreamPacketBuilder {
            sequence,
            ilp_packet_type: PacketType::Prepare,
            prepare_amount: 0,
            frames: &frame,
        }
        .build();
        let ciphertext = stream_packet.into_encrypted(&self.shared_secret, false);
        let condition = random_condition();
        let prepare = PrepareBuilder {
            amount: 0,
            expires_at: SystemTime::now() + PREPARE_EXPIRY,
            execution_condition: &condition,
            destination: destination.clone(),
            data: &ciphertext,
        }
        .build();
        let _ = self.plugin.send_data(prepare).await;
    }
}

/// Per-open-stream StreamMaxMoney/StreamMaxData advertisements, shared between
/// the send loop's outbound packets and the inbound handler's responses.
pub(crate) fn stream_advertisement_frames(
    state: &CoreState,
    ids: &[u64],
    connection_buffer_size: u64,
) -> Vec<QueuedFrame> {
    let mut frames = Vec::new();
    for id in ids {
        let record = match state.registry.get(*id) {
            Some(r) => r,
            None => continue,
        };
        if record.handle.is_open() {
            frames.push(QueuedFrame::StreamMaxMoney {
                stream_id: *id,
                receive_max: record.handle.receive_max(),
                total_received: record.handle.total_received(),
            });
            let offsets = record.handle.incoming_offsets();
            frames.push(QueuedFrame::StreamMaxData {
                stream_id: *id,
                max_offset: offsets.current + connection_buffer_size,
            });
        }
    }
    frames
}

/// Shared by the send loop's response handling and the inbound handler: applies
/// control/window frames found in a packet (ConnectionMax*/StreamMax*/*Blocked/
/// *Close). Caller already holds `state`.
pub(crate) fn apply_control_frames(state: &mut CoreState, frames: FrameIterator<'_>) {
    for frame in frames {
        match frame {
            Frame::ConnectionMaxData(f) => {
                if f.max_offset <= 2 * MAX_DATA_SIZE as u64 || f.max_offset > state.remote_connection_max_offset
                {
                    state.remote_connection_max_offset = f.max_offset;
                }
            }
            Frame::StreamMaxMoney(f) => {
                if let Some(record) = state.registry.get(f.stream_id) {
                    record.handle.set_remote_receive_max(f.receive_max);
                    record.handle.set_remote_received(f.total_received);
                }
            }
            Frame::StreamMoneyBlocked(f) => {
                if let Some(record) = state.registry.get(f.stream_id) {
                    record.handle.set_remote_receive_max(f.send_max);
                    record.handle.set_remote_received(f.total_sent);
                }
            }
            Frame::StreamClose(f) => {
                if let Some(record) = state.registry.get(f.stream_id) {
                    record.remote_closed.store(true, Ordering::SeqCst);
                    record.handle.close();
                }
            }
            Frame::ConnectionClose(_) => {
                state.remote_closed = true;
            }
            Frame::ConnectionMaxStreamId(f) => {
                state.registry.raise_max_stream_id(f.max_stream_id);
            }
            _ => {}
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
