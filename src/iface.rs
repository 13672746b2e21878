//! `MsgInterface`: the endpoint bound to one `ByteStream` (spec §3.3/§4.2).
//!
//! Owns the RX worker thread, the SREQ slot, pending-fragment state, the TX
//! lock, and the inbound queue. The RX worker is grounded on the teacher's
//! `hub/workers.rs` idiom — `thread::spawn` plus an `AtomicBool` shutdown
//! flag, joined from `Drop` — generalized from a polling/heartbeat loop to
//! the MT frame-reader loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use log::{debug, warn};

use crate::byte_stream::ByteStream;
use crate::constants::{
    frag_status, CMD0_CLASS_SHIFT, CMD0_EXTENDED_BIT, DEFAULT_FLUSH_TIMEOUT_MS,
    DEFAULT_FRAG_TIMEOUT_MS, DEFAULT_INTERMSG_TIMEOUT_MS, DEFAULT_INTERSYMBOL_TIMEOUT_MS,
    DEFAULT_RETRY_MAX, DEFAULT_SRSP_TIMEOUT_MS, DEFAULT_TX_FRAG_SIZE, DEFAULT_TX_LOCK_TIMEOUT_MS,
    FRAG_CARRIER_HEADER_LEN, FRAME_SYNC_BYTE, SINGLE_BYTE_LEN_FRAME_LIMIT,
};
use crate::fragment::{
    build_ext_status, build_frag_ack, build_frag_data, parse_frag_ack, parse_frag_data,
    RxBlockOutcome, RxFragState, TxAckOutcome, TxFragState,
};
use crate::framer::{self, FrameOptions};
use crate::list::{MessageList, SignalSlot, TimedLock};
use crate::message::{BaseClass, IfaceId, Message, MessageKind};

static NEXT_IFACE_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_iface_id() -> IfaceId {
    NEXT_IFACE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-interface framing/timeout configuration (spec §3.3's field table;
/// §6's recognised config keys feed these).
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub dbg_name: String,
    pub is_npi: bool,
    pub frame_sync: bool,
    pub include_chksum: bool,
    pub len_2bytes: bool,
    pub tx_frag_size: usize,
    pub retry_max: u32,
    pub frag_timeout: Duration,
    pub srsp_timeout: Duration,
    pub intermsg_timeout: Duration,
    pub intersymbol_timeout: Duration,
    pub flush_timeout: Duration,
    pub tx_lock_timeout: Duration,
    pub stack_id: u8,
    pub startup_flush: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            dbg_name: "iface".to_string(),
            is_npi: false,
            frame_sync: true,
            include_chksum: true,
            len_2bytes: false,
            tx_frag_size: DEFAULT_TX_FRAG_SIZE,
            retry_max: DEFAULT_RETRY_MAX,
            frag_timeout: Duration::from_millis(DEFAULT_FRAG_TIMEOUT_MS),
            srsp_timeout: Duration::from_millis(DEFAULT_SRSP_TIMEOUT_MS),
            intermsg_timeout: Duration::from_millis(DEFAULT_INTERMSG_TIMEOUT_MS),
            intersymbol_timeout: Duration::from_millis(DEFAULT_INTERSYMBOL_TIMEOUT_MS),
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
            tx_lock_timeout: Duration::from_millis(DEFAULT_TX_LOCK_TIMEOUT_MS),
            stack_id: 0,
            startup_flush: false,
        }
    }
}

impl InterfaceConfig {
    pub fn frame_options(&self) -> FrameOptions {
        FrameOptions {
            frame_sync: self.frame_sync,
            include_chksum: self.include_chksum,
            len_2bytes: self.len_2bytes,
        }
    }

    fn log_prefix(&self) -> &'static str {
        if self.is_npi {
            "[NPI]"
        } else {
            "[UART]"
        }
    }
}

/// Outcome of one `send`/`send_and_wait` call: the transport's 0/1/2
/// messages-observed signal (spec §7 propagation rule).
pub struct TransmitOutcome {
    pub count: u8,
    pub srsp: Option<Message>,
}

struct Inner {
    cfg: InterfaceConfig,
    stream: Arc<dyn ByteStream>,
    rx_queue: MessageList,
    pending_sreq: Mutex<Option<(u8, u8)>>,
    srsp_signal: SignalSlot<Message>,
    tx_lock: TimedLock,
    tx_frag_acks: MessageList,
    rx_frag: Mutex<Option<RxFragState>>,
    is_dead: AtomicBool,
}

/// One per physical link — UART or an accepted client socket (spec §3.3).
pub struct MsgInterface {
    pub id: IfaceId,
    inner: Arc<Inner>,
    rx_thread: Option<JoinHandle<()>>,
}

fn read_exact(stream: &dyn ByteStream, n: usize, step_timeout: Duration) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut got = 0usize;
    while got < n {
        let deadline = Instant::now() + step_timeout;
        let read = stream.read(&mut buf[got..], deadline)?;
        if read == 0 {
            bail!("short read: got {got} of {n} bytes");
        }
        got += read;
    }
    Ok(buf)
}

fn scan_for_sync(stream: &dyn ByteStream, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut b = [0u8; 1];
    loop {
        if Instant::now() >= deadline {
            bail!("sync byte not found within intermsg_timeout");
        }
        let n = stream.read(&mut b, deadline)?;
        if n == 0 {
            continue;
        }
        if b[0] == FRAME_SYNC_BYTE {
            return Ok(());
        }
    }
}

/// Read one complete frame off `stream` and return its parsed (unframed)
/// form: `cmd0`/`cmd1` set, payload occupying offset 0 (spec §4.2 RX worker
/// loop, steps 1-3).
fn read_one_message(stream: &dyn ByteStream, cfg: &InterfaceConfig) -> Result<Message> {
    let opts = cfg.frame_options();
    if opts.frame_sync {
        scan_for_sync(stream, cfg.intermsg_timeout)?;
    }
    let header_rest = read_exact(stream, opts.length_field_width() + 2, cfg.intersymbol_timeout)?;
    let (len, cmd0, cmd1) = framer::parse_header(&header_rest, opts)?;
    let payload = read_exact(stream, len as usize, cfg.intersymbol_timeout)?;

    if opts.include_chksum {
        let trailer = read_exact(stream, 1, cfg.intersymbol_timeout)?;
        let mut region = Vec::with_capacity(header_rest.len() + payload.len());
        region.extend_from_slice(&header_rest);
        region.extend_from_slice(&payload);
        if framer::checksum(&region) != trailer[0] {
            bail!("checksum mismatch");
        }
    }

    let mut msg = Message::new(cmd0, cmd1, cfg.log_prefix());
    msg.set_payload(&payload);
    Ok(msg)
}

impl Inner {
    fn needs_fragmentation(&self, payload_len: usize) -> bool {
        if payload_len > self.cfg.tx_frag_size {
            return true;
        }
        if !self.cfg.len_2bytes {
            let opts = self.cfg.frame_options();
            let framed_size = opts.header_len() + payload_len + opts.trailer_len();
            if framed_size > SINGLE_BYTE_LEN_FRAME_LIMIT {
                return true;
            }
        }
        false
    }

    fn write_framed(&self, mut msg: Message) -> Result<()> {
        framer::frame(&mut msg, self.cfg.frame_options())?;
        let deadline = Instant::now() + self.cfg.tx_lock_timeout;
        self.stream.write(msg.bytes(), deadline)?;
        Ok(())
    }

    /// Chunk size actually used to slice a payload into fragment blocks.
    /// A fragment-data carrier's own payload is `FRAG_CARRIER_HEADER_LEN +
    /// chunk.len()`, and on a 1-byte-length interface that carrier payload
    /// must fit `u8::MAX` or `framer::frame` bails — so a misconfigured
    /// `tx_frag_size` above that ceiling is clamped rather than trusted.
    fn effective_tx_frag_size(&self) -> usize {
        if self.cfg.len_2bytes {
            return self.cfg.tx_frag_size;
        }
        self.cfg
            .tx_frag_size
            .min(u8::MAX as usize - FRAG_CARRIER_HEADER_LEN)
    }

    fn send_fragmented(&self, cmd0: u8, cmd1: u8, payload: &[u8]) -> Result<()> {
        let base_cmd0 = cmd0 & !CMD0_EXTENDED_BIT;
        let mut tx = TxFragState::new(payload.len(), self.effective_tx_frag_size());
        loop {
            let (start, end) = tx.current_chunk_range();
            let chunk = &payload[start..end];
            let carrier =
                build_frag_data(base_cmd0, cmd1, tx.block_cur as u8, tx.total_size as u16, chunk);

            let mut retries = 0u32;
            loop {
                self.write_framed(carrier.clone())?;

                let ack = self.tx_frag_acks.pop_timeout(self.cfg.frag_timeout);
                let Some(ack_msg) = ack else {
                    retries += 1;
                    if retries > self.cfg.retry_max {
                        bail!(
                            "fragment ack timeout at block {} after {} retries",
                            tx.block_cur,
                            retries
                        );
                    }
                    continue;
                };
                let Some(view) = parse_frag_ack(ack_msg.bytes()) else {
                    continue;
                };
                match tx.on_ack(&view) {
                    TxAckOutcome::Advance => break,
                    TxAckOutcome::DuplicateIgnore | TxAckOutcome::ResendCurrent => continue,
                    TxAckOutcome::Complete => {
                        let trailer = build_ext_status(
                            base_cmd0,
                            cmd1,
                            (tx.block_count - 1) as u8,
                            frag_status::FRAG_COMPLETE,
                        );
                        let _ = self.write_framed(trailer);
                        return Ok(());
                    }
                    TxAckOutcome::Abort => {
                        let abort = build_ext_status(
                            base_cmd0,
                            cmd1,
                            tx.block_cur as u8,
                            frag_status::FRAG_ABORTED,
                        );
                        let _ = self.write_framed(abort);
                        bail!("fragment session aborted at block {}", tx.block_cur);
                    }
                }
            }
        }
    }

    fn send_frag_ack(&self, base_cmd0: u8, base_cmd1: u8, block_index: u8, status: u8) {
        let ack = build_frag_ack(base_cmd0, base_cmd1, block_index, status);
        if let Err(e) = self.write_framed(ack) {
            warn!("{} failed to send fragment ack: {e:#}", self.cfg.dbg_name);
        }
    }

    fn handle_frag_data(&self, msg: &Message) {
        let Some(view) = parse_frag_data(msg.bytes()) else {
            warn!("{} malformed fragment data carrier, dropping", self.cfg.dbg_name);
            return;
        };
        let base_cmd0 = msg.cmd0 & !CMD0_EXTENDED_BIT;
        let base_cmd1 = msg.cmd1;

        let mut rx_frag = self.rx_frag.lock().unwrap();
        if rx_frag.is_none() {
            if view.block_index != 0 {
                drop(rx_frag);
                self.send_frag_ack(base_cmd0, base_cmd1, view.block_index, frag_status::BLOCK_OUT_OF_ORDER);
                return;
            }
            *rx_frag = Some(RxFragState::start(&view));
            drop(rx_frag);
            self.send_frag_ack(base_cmd0, base_cmd1, 0, frag_status::SUCCESS);
            return;
        }

        let outcome = rx_frag.as_mut().unwrap().on_block(&view);
        match outcome {
            RxBlockOutcome::AckSuccess { block_index } => {
                drop(rx_frag);
                self.send_frag_ack(base_cmd0, base_cmd1, block_index, frag_status::SUCCESS);
            }
            RxBlockOutcome::Complete { block_index, payload } => {
                *rx_frag = None;
                drop(rx_frag);
                self.send_frag_ack(base_cmd0, base_cmd1, block_index, frag_status::FRAG_COMPLETE);
                let mut whole = Message::new(base_cmd0, base_cmd1, self.cfg.log_prefix());
                whole.set_payload(&payload);
                self.dispatch_plain(BaseClass::from_bits(base_cmd0 >> CMD0_CLASS_SHIFT), whole);
            }
            RxBlockOutcome::Reject { block_index, status } => {
                *rx_frag = None;
                drop(rx_frag);
                self.send_frag_ack(base_cmd0, base_cmd1, block_index, status);
            }
        }
    }

    fn dispatch_plain(&self, class: BaseClass, msg: Message) {
        if class == BaseClass::Srsp {
            let mut pending = self.pending_sreq.lock().unwrap();
            if let Some((subsystem, cmd1)) = *pending {
                if msg.subsystem_id() == subsystem && msg.cmd1 == cmd1 {
                    *pending = None;
                    drop(pending);
                    self.srsp_signal.signal(msg);
                    return;
                }
            }
        }
        self.rx_queue.push(msg);
    }

    fn dispatch(&self, mut msg: Message) {
        let kind = framer::classify(msg.cmd0, msg.bytes().first().copied());
        msg.kind = Some(kind);
        match kind {
            MessageKind::FragData => self.handle_frag_data(&msg),
            MessageKind::FragAck => self.tx_frag_acks.push(msg),
            MessageKind::ExtStatus => {
                debug!("{} extended status from peer, discarding", self.cfg.dbg_name);
            }
            MessageKind::StackScoped(class) | MessageKind::Plain(class) => {
                self.dispatch_plain(class, msg);
            }
        }
    }

    /// Blocking wait for an SRSP, interruptible by `is_dead` so teardown
    /// during an in-flight SREQ doesn't strand the caller (spec §8
    /// cancellation-safety property).
    fn wait_srsp(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_dead.load(Ordering::Acquire) {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let slice = remaining.min(Duration::from_millis(50));
            if let Some(msg) = self.srsp_signal.wait_timeout(slice) {
                return Some(msg);
            }
        }
    }
}

fn rx_worker_loop(inner: Arc<Inner>) {
    // Guarantees `is_dead` flips and any stuck SRSP waiter is woken even if
    // this loop panics, so a send_and_wait caller is never stranded (spec §8
    // cancellation-safety property) — same idiom as the teacher's relay
    // shutdown guard, generalized from a channel send to a dead-flag flip.
    let inner_for_guard = Arc::clone(&inner);
    let _teardown_guard = scopeguard::guard((), move |_| {
        inner_for_guard.is_dead.store(true, Ordering::Release);
        inner_for_guard.srsp_signal.clear();
    });

    loop {
        if inner.is_dead.load(Ordering::Acquire) || inner.stream.is_closed() {
            break;
        }
        match read_one_message(&*inner.stream, &inner.cfg) {
            Ok(msg) => inner.dispatch(msg),
            Err(e) => {
                if inner.stream.is_closed() {
                    debug!("{} RX worker exiting: stream closed", inner.cfg.dbg_name);
                    inner.is_dead.store(true, Ordering::Release);
                    break;
                }
                debug!("{} frame error: {e:#}; draining and resyncing", inner.cfg.dbg_name);
                let deadline = Instant::now() + inner.cfg.flush_timeout;
                let _ = inner.stream.drain(deadline);
            }
        }
    }
}

impl MsgInterface {
    /// `create(cfg, stream)`: validate defaults, set up mutexes/signals,
    /// optionally drain inbound bytes, and spawn the RX worker (spec §4.2).
    pub fn new(cfg: InterfaceConfig, stream: Arc<dyn ByteStream>) -> Result<Self> {
        if cfg.startup_flush {
            let deadline = Instant::now() + cfg.flush_timeout;
            stream.drain(deadline)?;
        }

        let inner = Arc::new(Inner {
            cfg,
            stream,
            rx_queue: MessageList::new(),
            pending_sreq: Mutex::new(None),
            srsp_signal: SignalSlot::new(),
            tx_lock: TimedLock::new(),
            tx_frag_acks: MessageList::new(),
            rx_frag: Mutex::new(None),
            is_dead: AtomicBool::new(false),
        });

        let worker_inner = Arc::clone(&inner);
        let rx_thread = thread::spawn(move || rx_worker_loop(worker_inner));

        Ok(Self {
            id: allocate_iface_id(),
            inner,
            rx_thread: Some(rx_thread),
        })
    }

    pub fn dbg_name(&self) -> &str {
        &self.inner.cfg.dbg_name
    }

    pub fn frame_options(&self) -> FrameOptions {
        self.inner.cfg.frame_options()
    }

    pub fn is_dead(&self) -> bool {
        self.inner.is_dead.load(Ordering::Acquire)
    }

    /// Blocking pop from `rx_queue`, bounded by `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        self.inner.rx_queue.pop_timeout(timeout)
    }

    /// `send`: fire-and-forget transmit (AREQ/POLL, or the request half of
    /// an SREQ the caller doesn't want to block on).
    pub fn send(&self, msg: Message) -> Result<u8> {
        Ok(self.transmit(msg, false)?.count)
    }

    /// `send_and_wait`: SREQ transmit + blocking wait for the matching SRSP.
    pub fn send_and_wait(&self, msg: Message) -> Result<TransmitOutcome> {
        self.transmit(msg, true)
    }

    fn transmit(&self, msg: Message, wait: bool) -> Result<TransmitOutcome> {
        let _guard = self
            .inner
            .tx_lock
            .acquire(self.inner.cfg.tx_lock_timeout)
            .ok_or_else(|| anyhow!("cannot transmit: tx_lock timed out"))?;

        let subsystem = msg.subsystem_id();
        let cmd1 = msg.cmd1;
        let cmd0 = msg.cmd0;
        if wait {
            *self.inner.pending_sreq.lock().unwrap() = Some((subsystem, cmd1));
        }

        let payload = msg.bytes().to_vec();
        let send_result = if self.inner.needs_fragmentation(payload.len()) {
            self.inner.send_fragmented(cmd0, cmd1, &payload)
        } else {
            self.inner.write_framed(msg)
        };

        if let Err(e) = send_result {
            if wait {
                *self.inner.pending_sreq.lock().unwrap() = None;
            }
            return Err(e);
        }

        if !wait {
            return Ok(TransmitOutcome { count: 1, srsp: None });
        }

        let srsp = self.inner.wait_srsp(self.inner.cfg.srsp_timeout);
        *self.inner.pending_sreq.lock().unwrap() = None;

        match srsp {
            Some(reply) => Ok(TransmitOutcome { count: 2, srsp: Some(reply) }),
            None if self.inner.is_dead.load(Ordering::Acquire) => {
                bail!("interface torn down while SREQ was in flight")
            }
            None => Ok(TransmitOutcome { count: 1, srsp: None }),
        }
    }
}

impl Drop for MsgInterface {
    /// `destroy`: mark `is_dead`, close the stream (unblocking the RX
    /// worker's read), join it, then drain every queue (spec §4.2).
    fn drop(&mut self) {
        self.inner.is_dead.store(true, Ordering::Release);
        self.inner.stream.close();
        if let Some(handle) = self.rx_thread.take() {
            let _ = handle.join();
        }
        self.inner.rx_queue.clear();
        self.inner.tx_frag_acks.clear();
        *self.inner.pending_sreq.lock().unwrap() = None;
        self.inner.srsp_signal.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream::duplex_pair;

    fn test_cfg(name: &str) -> InterfaceConfig {
        InterfaceConfig {
            dbg_name: name.to_string(),
            srsp_timeout: Duration::from_millis(300),
            frag_timeout: Duration::from_millis(300),
            intermsg_timeout: Duration::from_millis(300),
            intersymbol_timeout: Duration::from_millis(300),
            tx_lock_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    #[test]
    fn sreq_srsp_round_trip() {
        let (a, b) = duplex_pair();
        let iface_a = MsgInterface::new(test_cfg("a"), Arc::new(a)).unwrap();
        let iface_b = MsgInterface::new(test_cfg("b"), Arc::new(b)).unwrap();

        let responder = thread::spawn(move || {
            let req = iface_b.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(req.cmd0, 0x21);
            let resp = Message::with_payload(0x61, 0x02, &[1, 2, 3, 4, 5], "[test]");
            iface_b.send(resp).unwrap();
            iface_b
        });

        let req = Message::new(0x21, 0x02, "[test]");
        let outcome = iface_a.send_and_wait(req).unwrap();
        assert_eq!(outcome.count, 2);
        let srsp = outcome.srsp.unwrap();
        assert_eq!(srsp.cmd0, 0x61);
        assert_eq!(srsp.bytes().len(), 5);

        let _iface_b = responder.join().unwrap();
    }

    #[test]
    fn sreq_times_out_without_stranding_pending_slot() {
        let (a, _b) = duplex_pair();
        let iface_a = MsgInterface::new(test_cfg("a"), Arc::new(a)).unwrap();

        let outcome = iface_a.send_and_wait(Message::new(0x21, 0x02, "[test]")).unwrap();
        assert_eq!(outcome.count, 1);
        assert!(outcome.srsp.is_none());

        // A second SREQ on the same interface must still be able to proceed
        // (no stuck pending_sreq from the timed-out attempt).
        let outcome2 = iface_a.send_and_wait(Message::new(0x21, 0x02, "[test]")).unwrap();
        assert_eq!(outcome2.count, 1);
    }

    #[test]
    fn fragmented_send_reassembles_on_peer() {
        let (a, b) = duplex_pair();
        let mut cfg_a = test_cfg("a");
        cfg_a.tx_frag_size = 64;
        let iface_a = MsgInterface::new(cfg_a, Arc::new(a)).unwrap();
        let iface_b = MsgInterface::new(test_cfg("b"), Arc::new(b)).unwrap();

        let payload: Vec<u8> = (0..500u32).map(|x| (x % 256) as u8).collect();
        let msg = Message::with_payload(0x44, 0x07, &payload, "[test]");
        let count = iface_a.send(msg).unwrap();
        assert_eq!(count, 1);

        let received = iface_b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received.cmd0, 0x44);
        assert_eq!(received.bytes(), payload.as_slice());
    }

    #[test]
    fn fragmented_send_with_default_frag_size_fits_1byte_len_field() {
        // Spec §8 scenario 3: a 1000-byte payload on the default (1-byte
        // length field) configuration must not overflow a fragment-data
        // carrier's own payload size.
        let (a, b) = duplex_pair();
        let iface_a = MsgInterface::new(test_cfg("a"), Arc::new(a)).unwrap();
        let iface_b = MsgInterface::new(test_cfg("b"), Arc::new(b)).unwrap();
        assert!(!iface_a.inner.cfg.len_2bytes);

        let payload: Vec<u8> = (0..1000u32).map(|x| (x % 251) as u8).collect();
        let msg = Message::with_payload(0x44, 0x07, &payload, "[test]");
        iface_a.send(msg).unwrap();

        let received = iface_b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received.bytes(), payload.as_slice());
    }

    #[test]
    fn effective_tx_frag_size_clamps_oversized_config_on_1byte_len_interface() {
        let (a, _b) = duplex_pair();
        let mut cfg = test_cfg("a");
        cfg.tx_frag_size = 256;
        let iface = MsgInterface::new(cfg, Arc::new(a)).unwrap();
        assert_eq!(
            iface.inner.effective_tx_frag_size(),
            u8::MAX as usize - FRAG_CARRIER_HEADER_LEN
        );
    }
}
