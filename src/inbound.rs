//! The inbound handler (C7): validates and credits one inbound Prepare,
//! producing the Fulfill or Reject to send back. Runs under the same
//! connection-wide mutex as the send loop (§5), so it is never interleaved
//! with a send-loop iteration.

use crate::connection::{apply_control_frames, stream_advertisement_frames, CoreState, Inner, QueuedFrame};
use crate::crypto::{generate_condition, generate_fulfillment};
use crate::error::Error;
use crate::event::{ConnectionEvent, StreamOpened};
use crate::packet::{ErrorCode as StreamErrorCode, Frame, StreamPacket, StreamPacketBuilder};
use crate::plugin::PluginResponse;
use crate::stream::{
    StreamHandle, StreamRecord, StreamState, FLOW_CONTROL_TOLERANCE_DENOMINATOR,
    FLOW_CONTROL_TOLERANCE_NUMERATOR,
};
use bytes::{Bytes, BytesMut};
use interledger_packet::{
    Address, ErrorCode as IlpErrorCode, FulfillBuilder, PacketType, Prepare, RejectBuilder,
};
use log::{debug, trace, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn reject_bare(code: IlpErrorCode, message: &[u8]) -> PluginResponse {
    PluginResponse::Reject(
        RejectBuilder {
            code,
            message,
            triggered_by: None,
            data: &[],
        }
        .build(),
    )
}

pub(crate) async fn handle_prepare(inner: &Arc<Inner>, prepare: Prepare) -> PluginResponse {
    let packet =
        match StreamPacket::from_encrypted(&inner.shared_secret, BytesMut::from(prepare.data())) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("failed to decrypt inbound STREAM packet: {:?}", err);
                return reject_bare(IlpErrorCode::F06_UNEXPECTED_PAYMENT, b"unable to decrypt data");
            }
        };

    if packet.ilp_packet_type() != PacketType::Prepare {
        warn!(
            "inbound packet's inner type was {:?}, not Prepare",
            packet.ilp_packet_type()
        );
        return reject_bare(IlpErrorCode::F06_UNEXPECTED_PAYMENT, b"unexpected inner packet type");
    }

    let expected_condition = generate_condition(&inner.shared_secret, prepare.data());
    let expected_fulfillment = generate_fulfillment(&inner.shared_secret, prepare.data());
    let condition_mismatch = &expected_condition[..] != prepare.execution_condition();
    if condition_mismatch {
        trace!("inbound prepare's condition did not match the derived fulfillment, cannot fulfill");
    }

    inner.touch_last_active();

    let mut new_address: Option<Address> = None;
    let mut new_stream_ids: Vec<u64> = Vec::new();
    let mut protocol_violation: Option<(StreamErrorCode, String)> = None;
    let mut response_frames: Vec<QueuedFrame>;
    let mut should_reject = condition_mismatch;

    {
        let mut state = inner.state.lock().await;

        apply_control_frames(&mut state, packet.frames());

        let mut shares: Vec<(u64, u64)> = Vec::new();

        for frame in packet.frames() {
            match frame {
                Frame::ConnectionNewAddress(f) => {
                    new_address = Some(f.source_account.clone());
                }
                Frame::ConnectionAssetDetails(f) => {
                    state.remote_asset_code = Some(f.source_asset_code.to_string());
                    state.remote_asset_scale = Some(f.source_asset_scale);
                }
                Frame::StreamMoney(f) => {
                    if handle_closed_stream(&mut state, f.stream_id) {
                        should_reject = true;
                        continue;
                    }
                    match accept_stream(&mut state, f.stream_id, inner.config.connection_buffer_size) {
                        Ok(true) => new_stream_ids.push(f.stream_id),
                        Ok(false) => {}
                        Err((code, message)) => {
                            protocol_violation.get_or_insert((code, message));
                            continue;
                        }
                    }
                    shares.push((f.stream_id, f.shares));
                }
                Frame::StreamData(f) => {
                    if handle_closed_stream(&mut state, f.stream_id) {
                        should_reject = true;
                        continue;
                    }
                    match accept_stream(&mut state, f.stream_id, inner.config.connection_buffer_size) {
                        Ok(true) => new_stream_ids.push(f.stream_id),
                        Ok(false) => {}
                        Err((code, message)) => {
                            protocol_violation.get_or_insert((code, message));
                            continue;
                        }
                    }
                    if let Some(record) = state.registry.get(f.stream_id) {
                        let incoming = record.handle.incoming_offsets();
                        let proposed_end = f.offset + f.data.len() as u64;
                        if proposed_end > incoming.max_acceptable {
                            drop(state);
                            inner
                                .clone()
                                .destroy_internal(Some(Error::FlowControlError(format!(
                                    "stream {} incoming offset {} exceeds acceptable window",
                                    f.stream_id, proposed_end
                                ))))
                                .await;
                            return reject_bare(
                                IlpErrorCode::F06_UNEXPECTED_PAYMENT,
                                b"flow control violation",
                            );
                        }
                        record.handle.push_incoming_data(Bytes::from(f.data.to_vec()), f.offset);
                        state.connection_bytes_received += f.data.len() as u64;
                    }
                }
                _ => {}
            }
        }

        if let Some((code, message)) = &protocol_violation {
            state.queued_frames.push_back(QueuedFrame::ConnectionClose {
                code: *code,
                message: message.clone(),
            });
            should_reject = true;
        }

        if packet.prepare_amount() > prepare.amount() {
            warn!(
                "inbound prepare amount {} was less than the packet's declared prepare_amount {}",
                prepare.amount(),
                packet.prepare_amount()
            );
            should_reject = true;
        }

        let total_shares: u64 = shares.iter().map(|(_, s)| *s).sum();
        if !should_reject && total_shares > 0 {
            for (stream_id, share) in &shares {
                let amount = (u128::from(prepare.amount()) * u128::from(*share)
                    / u128::from(total_shares)) as u64;
                let record = match state.registry.get(*stream_id) {
                    Some(r) => r,
                    None => continue,
                };
                if !record.handle.is_open() {
                    state.queued_frames.push_back(QueuedFrame::StreamClose {
                        stream_id: *stream_id,
                        code: StreamErrorCode::StreamStateError,
                        message: String::new(),
                    });
                    should_reject = true;
                    continue;
                }
                let can_receive = record
                    .handle
                    .receive_max()
                    .saturating_sub(record.handle.total_received());
                if amount * FLOW_CONTROL_TOLERANCE_DENOMINATOR > can_receive * FLOW_CONTROL_TOLERANCE_NUMERATOR
                {
                    state.queued_frames.push_back(QueuedFrame::StreamMaxMoney {
                        stream_id: *stream_id,
                        receive_max: record.handle.receive_max(),
                        total_received: record.handle.total_received(),
                    });
                    should_reject = true;
                }
            }
        }

        if !should_reject && total_shares > 0 {
            for (stream_id, share) in &shares {
                let amount = (u128::from(prepare.amount()) * u128::from(*share)
                    / u128::from(total_shares)) as u64;
                if let Some(record) = state.registry.get(*stream_id) {
                    record.handle.add_received(amount);
                }
            }
            state.total_received += prepare.amount();
            debug!(
                "credited {} across {} stream(s)",
                prepare.amount(),
                shares.len()
            );
        }

        let ids = state.registry.ids_in_order();
        response_frames = stream_advertisement_frames(&state, &ids, inner.config.connection_buffer_size);
        response_frames.push(QueuedFrame::ConnectionMaxData {
            max_offset: state.connection_bytes_received + inner.config.connection_buffer_size,
        });
        response_frames.extend(drain_closed_streams(&mut state, &ids));
        response_frames.extend(state.queued_frames.drain(..));
    }

    if let Some(address) = new_address {
        *inner.destination_account.lock().await = Some(address);
        inner.clone().maybe_start_send_loop().await;
    }
    for id in new_stream_ids {
        let _ = inner.events.send(ConnectionEvent::Stream(StreamOpened { id }));
    }
    if let Some((code, message)) = protocol_violation {
        let inner_clone = inner.clone();
        tokio::spawn(async move {
            inner_clone
                .destroy_internal(Some(Error::ProtocolViolation(format!(
                    "{:?}: {}",
                    code, message
                ))))
                .await;
        });
    }

    let borrowed: Vec<Frame> = response_frames.iter().map(QueuedFrame::as_frame).collect();

    if should_reject {
        trace!("rejecting inbound packet sequence={}", packet.sequence());
        let stream_packet = StreamPacketBuilder {
            sequence: packet.sequence(),
            ilp_packet_type: PacketType::Reject,
            prepare_amount: prepare.amount(),
            frames: &borrowed,
        }
        .build();
        let ciphertext = stream_packet.into_encrypted(&inner.shared_secret, inner.config.enable_padding);
        return PluginResponse::Reject(
            RejectBuilder {
                code: IlpErrorCode::F99_APPLICATION_ERROR,
                message: b"",
                triggered_by: None,
                data: &ciphertext,
            }
            .build(),
        );
    }

    trace!(
        "fulfilling inbound packet sequence={} amount={}",
        packet.sequence(),
        prepare.amount()
    );
    let stream_packet = StreamPacketBuilder {
        sequence: packet.sequence(),
        ilp_packet_type: PacketType::Fulfill,
        prepare_amount: prepare.amount(),
        frames: &borrowed,
    }
    .build();
    let ciphertext = stream_packet.into_encrypted(&inner.shared_secret, inner.config.enable_padding);
    PluginResponse::Fulfill(
        FulfillBuilder {
            fulfillment: &expected_fulfillment,
            data: &ciphertext,
        }
        .build(),
    )
}

/// True if `stream_id` is in the registry's closed set (a StreamClose has
/// already been queued for it this call).
fn handle_closed_stream(state: &mut CoreState, stream_id: u64) -> bool {
    if state.registry.is_closed(stream_id) {
        state.queued_frames.push_back(QueuedFrame::StreamClose {
            stream_id,
            code: StreamErrorCode::StreamStateError,
            message: String::new(),
        });
        true
    } else {
        false
    }
}

/// Ensures `stream_id` exists in the registry, translating registry errors
/// into the ConnectionClose codes §4.3 specifies. Returns whether the stream
/// was newly created (so the caller can fire a `Stream` event).
fn accept_stream(
    state: &mut CoreState,
    stream_id: u64,
    connection_buffer_size: u64,
) -> Result<bool, (StreamErrorCode, String)> {
    let already_existed = state.registry.get(stream_id).is_some();
    let result = state
        .registry
        .accept_remote(stream_id, || StreamState::new(u64::MAX, connection_buffer_size));
    if result.is_ok() && !already_existed && state.registry.should_advertise_max_stream_id(stream_id) {
        let new_ceiling = state.registry.max_stream_id().saturating_mul(2);
        state.registry.raise_max_stream_id(new_ceiling);
        state.queued_frames.push_back(QueuedFrame::ConnectionMaxStreamId {
            max_stream_id: state.registry.max_stream_id(),
        });
    }
    result
        .map(|_| !already_existed)
        .map_err(|err| match err {
            crate::stream::RegistryError::ParityViolation => (
                StreamErrorCode::ProtocolViolation,
                format!("stream id {} has the wrong parity for a remote-initiated stream", stream_id),
            ),
            crate::stream::RegistryError::StreamIdTooLarge => (
                StreamErrorCode::StreamIdError,
                format!("stream id {} exceeds the maximum stream id", stream_id),
            ),
            crate::stream::RegistryError::StreamIdBlocked => (
                StreamErrorCode::StreamIdError,
                format!("stream id {} is blocked", stream_id),
            ),
        })
}

/// Queues StreamClose for any stream this side has already closed and the
/// remote has acknowledged closing, then removes it from the registry.
fn drain_closed_streams(state: &mut CoreState, ids: &[u64]) -> Vec<QueuedFrame> {
    let mut frames = Vec::new();
    let mut to_remove = Vec::new();
    for id in ids {
        let record: Arc<StreamRecord> = match state.registry.get(*id) {
            Some(r) => r,
            None => continue,
        };
        if !record.handle.is_open() && !record.sent_end.swap(true, Ordering::SeqCst) {
            frames.push(QueuedFrame::StreamClose {
                stream_id: *id,
                code: StreamErrorCode::NoError,
                message: String::new(),
            });
        }
        if record.is_fully_closed() {
            to_remove.push(*id);
        }
    }
    for id in to_remove {
        state.registry.remove(id);
    }
    frames
}
