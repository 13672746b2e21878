//! Fragmentation engine: chops oversized outbound payloads into
//! `tx_frag_size` blocks and reassembles inbound blocks, using ACKs
//! (spec §3.4/§4.3).
//!
//! This module holds the wire encoding of the three extended carrier types
//! (fragment-data, fragment-ack, extended-status) and the two state
//! machines (`TxFragState` for chopping + resend, `RxFragState` for
//! reassembly). The actual I/O — transmitting a carrier, waiting on the ack
//! signal — is driven by `iface.rs`, which owns the `ByteStream` and
//! `tx_lock`; keeping the state machines here, decoupled from I/O, mirrors
//! how the teacher's `socket/framing.rs` keeps `Frame` encode/decode free of
//! any socket handle.

use crate::constants::{frag_status, CMD0_EXTENDED_BIT, EXT_MINOR_FRAG_ACK, EXT_MINOR_FRAG_DATA, EXT_MINOR_EXT_STATUS, EXT_MINOR_SHIFT};
use crate::message::Message;

fn ext_descriptor(minor: u8) -> u8 {
    minor << EXT_MINOR_SHIFT
}

/// Build a fragment-data carrier: `[desc][block_index][total_size_lo][total_size_hi][chunk...]`.
pub fn build_frag_data(cmd0_base: u8, cmd1: u8, block_index: u8, total_size: u16, chunk: &[u8]) -> Message {
    let mut msg = Message::new(cmd0_base | CMD0_EXTENDED_BIT, cmd1, "[Frag]");
    let mut payload = Vec::with_capacity(4 + chunk.len());
    payload.push(ext_descriptor(EXT_MINOR_FRAG_DATA));
    payload.push(block_index);
    payload.extend_from_slice(&total_size.to_le_bytes());
    payload.extend_from_slice(chunk);
    msg.set_payload(&payload);
    msg
}

/// Build a fragment-ACK carrier: `[desc][block_index][status]`.
pub fn build_frag_ack(cmd0_base: u8, cmd1: u8, block_index: u8, status: u8) -> Message {
    let mut msg = Message::new(cmd0_base | CMD0_EXTENDED_BIT, cmd1, "[Frag]");
    msg.set_payload(&[ext_descriptor(EXT_MINOR_FRAG_ACK), block_index, status]);
    msg
}

/// Build an extended-status carrier: `[desc][block_index][status]`.
pub fn build_ext_status(cmd0_base: u8, cmd1: u8, block_index: u8, status: u8) -> Message {
    let mut msg = Message::new(cmd0_base | CMD0_EXTENDED_BIT, cmd1, "[Frag]");
    msg.set_payload(&[ext_descriptor(EXT_MINOR_EXT_STATUS), block_index, status]);
    msg
}

/// Decoded fragment-data carrier.
pub struct FragDataView {
    pub block_index: u8,
    pub total_size: u16,
    pub chunk: Vec<u8>,
}

/// Parse a fragment-data carrier's payload (including the leading
/// descriptor byte).
pub fn parse_frag_data(payload: &[u8]) -> Option<FragDataView> {
    if payload.len() < 4 {
        return None;
    }
    Some(FragDataView {
        block_index: payload[1],
        total_size: u16::from_le_bytes([payload[2], payload[3]]),
        chunk: payload[4..].to_vec(),
    })
}

/// Decoded fragment-ACK / extended-status carrier (same shape).
pub struct FragAckView {
    pub block_index: u8,
    pub status: u8,
}

pub fn parse_frag_ack(payload: &[u8]) -> Option<FragAckView> {
    if payload.len() < 3 {
        return None;
    }
    Some(FragAckView {
        block_index: payload[1],
        status: payload[2],
    })
}

/// Outcome of feeding one ACK to the outbound state machine.
pub enum TxAckOutcome {
    /// Advance to the next block (or finish, if this was the last).
    Advance,
    /// Duplicate ACK for the previous block; keep waiting.
    DuplicateIgnore,
    /// Peer asked for a resend of the current block.
    ResendCurrent,
    /// The whole session completed successfully.
    Complete,
    /// Any other status or a block-index mismatch: abort.
    Abort,
}

/// Outbound fragmentation state (spec §3.4 tx side).
pub struct TxFragState {
    pub block_cur: u32,
    pub block_count: u32,
    pub total_size: usize,
    pub block_size: usize,
    pub is_error: bool,
}

impl TxFragState {
    pub fn new(payload_len: usize, tx_frag_size: usize) -> Self {
        let block_count = payload_len.div_ceil(tx_frag_size.max(1)) as u32;
        Self {
            block_cur: 0,
            block_count: block_count.max(1),
            total_size: payload_len,
            block_size: tx_frag_size,
            is_error: false,
        }
    }

    /// Byte range of the current block within the full payload.
    pub fn current_chunk_range(&self) -> (usize, usize) {
        let start = self.block_cur as usize * self.block_size;
        let end = (start + self.block_size).min(self.total_size);
        (start, end)
    }

    /// Feed one received ACK, per spec §4.3 step 3's decision table.
    pub fn on_ack(&mut self, ack: &FragAckView) -> TxAckOutcome {
        let block_cur = self.block_cur;
        if ack.status == frag_status::SUCCESS && ack.block_index as u32 == block_cur {
            self.block_cur += 1;
            if self.block_cur >= self.block_count {
                return TxAckOutcome::Complete;
            }
            return TxAckOutcome::Advance;
        }
        if ack.status == frag_status::SUCCESS
            && block_cur > 0
            && ack.block_index as u32 == block_cur - 1
        {
            return TxAckOutcome::DuplicateIgnore;
        }
        if ack.status == frag_status::RESEND_LAST {
            return TxAckOutcome::ResendCurrent;
        }
        if ack.status == frag_status::FRAG_COMPLETE
            && ack.block_index as u32 + 1 == self.block_count
        {
            return TxAckOutcome::Complete;
        }
        self.is_error = true;
        TxAckOutcome::Abort
    }
}

/// Outcome of feeding one inbound fragment-data block to the reassembly
/// state machine.
pub enum RxBlockOutcome {
    /// Block accepted; ack success and continue.
    AckSuccess { block_index: u8 },
    /// Final block accepted; ack frag-complete and the payload is ready.
    Complete { block_index: u8, payload: Vec<u8> },
    /// Block rejected; ack the given error status and discard the session.
    Reject { block_index: u8, status: u8 },
}

/// Inbound fragmentation state (spec §3.4 rx side).
pub struct RxFragState {
    pub block_cur: i64,
    pub block_count: u32,
    pub total_size: usize,
    pub this_frag_size: usize,
    payload: Vec<u8>,
}

impl RxFragState {
    /// Start a new reassembly session from the first block.
    pub fn start(first: &FragDataView) -> Self {
        let this_frag_size = first.chunk.len().max(1);
        let block_count = (first.total_size as usize).div_ceil(this_frag_size) as u32;
        let mut payload = Vec::with_capacity(first.total_size as usize);
        payload.extend_from_slice(&first.chunk);
        Self {
            block_cur: 0,
            block_count: block_count.max(1),
            total_size: first.total_size as usize,
            this_frag_size,
            payload,
        }
    }

    /// Feed a non-initial block.
    pub fn on_block(&mut self, block: &FragDataView) -> RxBlockOutcome {
        let expected_next = self.block_cur + 1;
        if block.block_index as i64 != expected_next {
            return RxBlockOutcome::Reject {
                block_index: block.block_index,
                status: frag_status::BLOCK_OUT_OF_ORDER,
            };
        }
        if block.total_size as usize != self.total_size {
            return RxBlockOutcome::Reject {
                block_index: block.block_index,
                status: frag_status::BLOCK_LEN_CHANGED,
            };
        }
        let is_final = expected_next as u32 + 1 == self.block_count;
        let remaining = self.total_size - self.payload.len();
        if !is_final && block.chunk.len() != self.this_frag_size {
            return RxBlockOutcome::Reject {
                block_index: block.block_index,
                status: frag_status::BLOCK_LEN_CHANGED,
            };
        }
        if is_final && block.chunk.len() > remaining {
            return RxBlockOutcome::Reject {
                block_index: block.block_index,
                status: frag_status::BLOCK_LEN_CHANGED,
            };
        }
        self.payload.extend_from_slice(&block.chunk);
        self.block_cur = expected_next;

        if is_final {
            RxBlockOutcome::Complete {
                block_index: block.block_index,
                payload: std::mem::take(&mut self.payload),
            }
        } else {
            RxBlockOutcome::AckSuccess {
                block_index: block.block_index,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_state_advances_and_completes() {
        let mut tx = TxFragState::new(1000, 256);
        assert_eq!(tx.block_count, 4);
        for i in 0..3u8 {
            let outcome = tx.on_ack(&FragAckView { block_index: i, status: frag_status::SUCCESS });
            assert!(matches!(outcome, TxAckOutcome::Advance));
        }
        let outcome = tx.on_ack(&FragAckView { block_index: 3, status: frag_status::FRAG_COMPLETE });
        assert!(matches!(outcome, TxAckOutcome::Complete));
    }

    #[test]
    fn tx_state_ignores_duplicate_ack() {
        let mut tx = TxFragState::new(512, 256);
        let _ = tx.on_ack(&FragAckView { block_index: 0, status: frag_status::SUCCESS });
        let outcome = tx.on_ack(&FragAckView { block_index: 0, status: frag_status::SUCCESS });
        assert!(matches!(outcome, TxAckOutcome::DuplicateIgnore));
    }

    #[test]
    fn tx_state_aborts_on_mismatch() {
        let mut tx = TxFragState::new(512, 256);
        let outcome = tx.on_ack(&FragAckView { block_index: 9, status: frag_status::SUCCESS });
        assert!(matches!(outcome, TxAckOutcome::Abort));
        assert!(tx.is_error);
    }

    #[test]
    fn rx_state_reassembles_exact_bytes() {
        let total: Vec<u8> = (0..1000u32).map(|b| (b % 251) as u8).collect();
        let frag_size = 256usize;
        let blocks: Vec<&[u8]> = total.chunks(frag_size).collect();
        let first = FragDataView {
            block_index: 0,
            total_size: total.len() as u16,
            chunk: blocks[0].to_vec(),
        };
        let mut rx = RxFragState::start(&first);
        let mut result = None;
        for (i, chunk) in blocks.iter().enumerate().skip(1) {
            let block = FragDataView {
                block_index: i as u8,
                total_size: total.len() as u16,
                chunk: chunk.to_vec(),
            };
            match rx.on_block(&block) {
                RxBlockOutcome::Complete { payload, .. } => result = Some(payload),
                RxBlockOutcome::AckSuccess { .. } => {}
                RxBlockOutcome::Reject { .. } => panic!("unexpected reject"),
            }
        }
        assert_eq!(result.unwrap(), total);
    }

    #[test]
    fn rx_state_rejects_out_of_order_block() {
        let first = FragDataView {
            block_index: 0,
            total_size: 100,
            chunk: vec![0u8; 50],
        };
        let mut rx = RxFragState::start(&first);
        let skip_block = FragDataView {
            block_index: 2,
            total_size: 100,
            chunk: vec![0u8; 50],
        };
        let outcome = rx.on_block(&skip_block);
        assert!(matches!(
            outcome,
            RxBlockOutcome::Reject { status, .. } if status == frag_status::BLOCK_OUT_OF_ORDER
        ));
    }
}
