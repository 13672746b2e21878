//! `NpiConnection`: the per-client worker pair that bridges one accepted
//! socket to the shared UART interface (spec §3.5/§4.4).
//!
//! Grounded on the teacher's `socket/client_conn.rs` read/write task pair,
//! translated from tokio split-halves + channels to blocking `std::thread`
//! workers pulling from `MsgInterface`'s own queues, per
//! `SPEC_FULL.md`'s concurrency model decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::iface::MsgInterface;
use crate::list::MessageList;
use crate::message::BaseClass;

/// Per-connection poll interval for the cooperative-shutdown loops below;
/// bounds how promptly a connection notices its peer (client or UART) is
/// dead.
const WORKER_POLL: Duration = Duration::from_millis(200);

/// One accepted client: its own socket-side `MsgInterface`, the queue the
/// UART fan-out drops cloned AREQs into, and the two worker threads that
/// drive traffic between them (spec §3.5).
pub struct NpiConnection {
    pub id: String,
    pub dbg_name: String,
    pub socket_iface: Arc<MsgInterface>,
    pub areq_queue: Arc<MessageList>,
    is_dead: Arc<AtomicBool>,
    s2u_thread: Option<JoinHandle<()>>,
    u2s_thread: Option<JoinHandle<()>>,
}

impl NpiConnection {
    /// Spawn the s2u and u2s workers for one accepted client.
    pub fn spawn(id: String, socket_iface: Arc<MsgInterface>, uart: Arc<MsgInterface>) -> Self {
        let dbg_name = format!("[NPI:{id}]");
        let areq_queue = Arc::new(MessageList::new());
        let is_dead = Arc::new(AtomicBool::new(false));

        let s2u_thread = {
            let socket_iface = Arc::clone(&socket_iface);
            let uart = Arc::clone(&uart);
            let is_dead = Arc::clone(&is_dead);
            let dbg_name = dbg_name.clone();
            thread::spawn(move || s2u_loop(dbg_name, socket_iface, uart, is_dead))
        };

        let u2s_thread = {
            let socket_iface = Arc::clone(&socket_iface);
            let areq_queue = Arc::clone(&areq_queue);
            let is_dead = Arc::clone(&is_dead);
            let dbg_name = dbg_name.clone();
            thread::spawn(move || u2s_loop(dbg_name, socket_iface, areq_queue, is_dead))
        };

        Self {
            id,
            dbg_name,
            socket_iface,
            areq_queue,
            is_dead,
            s2u_thread: Some(s2u_thread),
            u2s_thread: Some(u2s_thread),
        }
    }

    /// True once either worker has observed an error or a peer disconnect.
    pub fn is_dead(&self) -> bool {
        self.is_dead.load(Ordering::Acquire) || self.socket_iface.is_dead()
    }

    /// Signal both workers to exit at their next poll.
    pub fn shutdown(&self) {
        self.is_dead.store(true, Ordering::Release);
    }
}

impl Drop for NpiConnection {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(h) = self.s2u_thread.take() {
            let _ = h.join();
        }
        if let Some(h) = self.u2s_thread.take() {
            let _ = h.join();
        }
    }
}

/// client → CoP: relay SREQ/POLL/AREQ from the client socket to the shared
/// UART, and the SRSP half back to the client (spec §4.4).
fn s2u_loop(dbg_name: String, socket_iface: Arc<MsgInterface>, uart: Arc<MsgInterface>, is_dead: Arc<AtomicBool>) {
    loop {
        if is_dead.load(Ordering::Acquire) || socket_iface.is_dead() || uart.is_dead() {
            break;
        }
        let Some(req) = socket_iface.recv_timeout(WORKER_POLL) else {
            continue;
        };

        let class = req.base_class();
        let result = match class {
            BaseClass::Sreq => uart.send_and_wait(req).map(|outcome| {
                if let Some(srsp) = outcome.srsp {
                    if let Err(e) = socket_iface.send(srsp) {
                        debug!("{dbg_name} failed to relay SRSP to client: {e:#}");
                    }
                }
            }),
            BaseClass::Areq | BaseClass::Poll | BaseClass::Srsp => {
                uart.send(req).map(|_| ())
            }
        };

        if let Err(e) = result {
            warn!("{dbg_name} s2u worker stopping: {e:#}");
            is_dead.store(true, Ordering::Release);
            break;
        }
    }
    debug!("{dbg_name} s2u worker exited");
}

/// CoP → client: deliver AREQs fanned out from the UART to this client.
fn u2s_loop(dbg_name: String, socket_iface: Arc<MsgInterface>, areq_queue: Arc<MessageList>, is_dead: Arc<AtomicBool>) {
    loop {
        if is_dead.load(Ordering::Acquire) || socket_iface.is_dead() {
            break;
        }
        let Some(msg) = areq_queue.pop_timeout(WORKER_POLL) else {
            continue;
        };
        if let Err(e) = socket_iface.send(msg) {
            warn!("{dbg_name} u2s worker stopping: {e:#}");
            is_dead.store(true, Ordering::Release);
            break;
        }
    }
    debug!("{dbg_name} u2s worker exited");
}
