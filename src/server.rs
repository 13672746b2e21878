//! `Server`: owns the single CoP `MsgInterface`, the TCP acceptor loop, and
//! the registry of live forwarders (spec §3.5/§4.4).
//!
//! The acceptor is grounded on the teacher's `socket/server.rs` accept loop
//! and its `generate_client_id()` helper, translated from a tokio
//! `UnixListener` to a blocking `std::net::TcpListener`, per
//! `SPEC_FULL.md`'s concurrency model decision.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::byte_stream::{ByteStream, TcpByteStream};
use crate::constants::SERVER_RESET_DRAIN_LIMIT;
use crate::device_msgs::{is_sys_reset_ind, sys_reset_req};
use crate::forwarder::NpiConnection;
use crate::iface::{InterfaceConfig, MsgInterface};

/// Generate a short, unique id for an accepted client connection. Grounded
/// on the teacher's `socket/server.rs::generate_client_id` (an atomic
/// sequence counter plus a random suffix, formatted as hex).
fn generate_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("npi:{seq:x}{rand:04x}")
}

/// Options the server needs beyond the interface-level config: the UART
/// device identity and the TCP bind address (spec §6's "server-facing TCP
/// surface").
pub struct ServerOptions {
    pub uart_cfg: InterfaceConfig,
    pub socket_cfg_template: InterfaceConfig,
    pub bind_addr: String,
}

/// Owns the UART interface, the TCP acceptor, the UART→clients fan-out
/// worker, and the registry of live connections.
pub struct Server {
    uart: Arc<MsgInterface>,
    registry: Arc<Mutex<HashMap<String, Arc<NpiConnection>>>>,
    socket_cfg_template: InterfaceConfig,
    is_dead: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    fanout_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Open the UART interface, perform the reset handshake, bind the TCP
    /// listener, and start the acceptor and fan-out workers (spec §4.4).
    pub fn start(opts: ServerOptions, uart_stream: Arc<dyn ByteStream>) -> Result<Self> {
        let uart = Arc::new(MsgInterface::new(opts.uart_cfg, uart_stream)?);
        reset_handshake(&uart)?;

        let listener = TcpListener::bind(&opts.bind_addr)
            .with_context(|| format!("failed to bind {}", opts.bind_addr))?;
        info!("[NPI] listening on {}", opts.bind_addr);

        let registry: Arc<Mutex<HashMap<String, Arc<NpiConnection>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let is_dead = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let uart = Arc::clone(&uart);
            let registry = Arc::clone(&registry);
            let socket_cfg_template = opts.socket_cfg_template.clone();
            let is_dead = Arc::clone(&is_dead);
            thread::spawn(move || accept_loop(listener, uart, registry, socket_cfg_template, is_dead))
        };

        let fanout_thread = {
            let uart = Arc::clone(&uart);
            let registry = Arc::clone(&registry);
            let is_dead = Arc::clone(&is_dead);
            thread::spawn(move || fanout_loop(uart, registry, is_dead))
        };

        Ok(Self {
            uart,
            registry,
            socket_cfg_template: opts.socket_cfg_template,
            is_dead,
            accept_thread: Some(accept_thread),
            fanout_thread: Some(fanout_thread),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    pub fn uart_is_dead(&self) -> bool {
        self.uart.is_dead()
    }

    /// Used by callers that want their own socket config per connection
    /// rather than the template passed to `start` (kept for completeness;
    /// the acceptor uses the template directly).
    pub fn socket_cfg_template(&self) -> &InterfaceConfig {
        &self.socket_cfg_template
    }

    pub fn shutdown(&self) {
        self.is_dead.store(true, Ordering::Release);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(h) = self.accept_thread.take() {
            let _ = h.join();
        }
        if let Some(h) = self.fanout_thread.take() {
            let _ = h.join();
        }
        self.registry.lock().unwrap().clear();
    }
}

/// Reset the CoP and wait for its `SYS_RESET_IND`, draining at most
/// `SERVER_RESET_DRAIN_LIMIT` messages before failing fast (spec §4.4;
/// `original_source/example/npi_server2/app_main.c`'s reset handshake).
fn reset_handshake(uart: &MsgInterface) -> Result<()> {
    uart.send(sys_reset_req(true))
        .context("failed to send SYS_RESET_REQ")?;

    for _ in 0..SERVER_RESET_DRAIN_LIMIT {
        let Some(msg) = uart.recv_timeout(Duration::from_secs(2)) else {
            continue;
        };
        if is_sys_reset_ind(&msg) {
            info!("[UART] CoP reset handshake complete");
            return Ok(());
        }
    }
    bail!(
        "CoP did not send SYS_RESET_IND within {SERVER_RESET_DRAIN_LIMIT} messages; giving up"
    );
}

fn accept_loop(
    listener: TcpListener,
    uart: Arc<MsgInterface>,
    registry: Arc<Mutex<HashMap<String, Arc<NpiConnection>>>>,
    socket_cfg_template: InterfaceConfig,
    is_dead: Arc<AtomicBool>,
) {
    for incoming in listener.incoming() {
        if is_dead.load(Ordering::Acquire) {
            break;
        }
        match incoming {
            Ok(stream) => {
                let id = generate_client_id();
                info!("[NPI] client connected: {id}");
                match TcpByteStream::new(stream) {
                    Ok(byte_stream) => {
                        let mut cfg = socket_cfg_template.clone();
                        cfg.dbg_name = format!("[NPI:{id}]");
                        cfg.is_npi = true;
                        match MsgInterface::new(cfg, Arc::new(byte_stream)) {
                            Ok(socket_iface) => {
                                let conn = Arc::new(NpiConnection::spawn(
                                    id.clone(),
                                    Arc::new(socket_iface),
                                    Arc::clone(&uart),
                                ));
                                registry.lock().unwrap().insert(id, conn);
                            }
                            Err(e) => warn!("[NPI] failed to create socket interface: {e:#}"),
                        }
                    }
                    Err(e) => warn!("[NPI] failed to wrap accepted socket: {e:#}"),
                }
            }
            Err(e) => {
                warn!("[NPI] accept error: {e:#}");
            }
        }
        registry.lock().unwrap().retain(|_, conn| !conn.is_dead());
    }
}

/// UART→clients fan-out: dequeue from `uart.rx_queue`, clone once per
/// registered client, and append to each connection's `areq_queue` (spec
/// §4.4). The last client reuses the original message rather than cloning.
fn fanout_loop(
    uart: Arc<MsgInterface>,
    registry: Arc<Mutex<HashMap<String, Arc<NpiConnection>>>>,
    is_dead: Arc<AtomicBool>,
) {
    loop {
        if is_dead.load(Ordering::Acquire) || uart.is_dead() {
            break;
        }
        let Some(msg) = uart.recv_timeout(Duration::from_millis(200)) else {
            continue;
        };

        let conns: Vec<Arc<NpiConnection>> = {
            let reg = registry.lock().unwrap();
            reg.values().cloned().collect()
        };
        let Some((last, rest)) = conns.split_last() else {
            continue;
        };
        for conn in rest {
            conn.areq_queue.push(msg.clone_for_fanout());
        }
        last.areq_queue.push(msg);
    }
}
