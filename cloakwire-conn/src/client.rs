//! Client side of the tunnel
//!
//! The client owns the handshake: it fires a SYN at construction, answers
//! the peer's SYN+ACK, and once established runs the keeper. Four tasks
//! cooperate around one state machine (the device reader, the
//! queue-to-device writer, the keeper ticker and the one-shot SYN timer),
//! and every state transition goes through the single mutex guarding the
//! machine and the receive snapshot.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use cloak_protocol::{
    BoundedQueue, BufferPool, ConnPacket, DataBuffer, Event, Fsm, TcpFlags, HEADER_LEN,
    MAGIC_WINDOW,
};
use cloak_tun::TunDevice;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ConnConfig;
use crate::event::ClientHandler;
use crate::keeper::Keeper;
use crate::{INITIAL_ACK, INITIAL_SEQ};

/// Action tags of the client state machine
#[derive(Debug, Clone, Copy)]
enum ClientAction {
    /// Emit the opening SYN and arm the handshake timer
    SendSyn,
    /// Answer a SYN+ACK, then self-fire `sdack`
    SendAck,
    /// Emit RST, then self-fire `sdrst`
    SendRst,
    /// Handshake done: notify the handler, start the keeper
    Established,
    /// Hand a data payload to the handler
    Deliver,
    /// Interrupt everything and notify the handler
    Teardown,
}

/// Mutable state serialized under the connection mutex
struct ClientCore {
    fsm: Fsm<ClientAction>,
    /// Snapshot of the most recent accepted frame from the peer
    last_rcv_seq: u32,
    last_rcv_ack: u32,
    last_rcv_len: u32,
    /// IP identification counter, one per emitted frame
    send_id: u16,
}

impl ClientCore {
    fn next_ip_id(&mut self) -> u16 {
        let id = self.send_id;
        self.send_id = self.send_id.wrapping_add(1);
        id
    }

    /// Acknowledgment number for the next outbound frame
    fn ack_num(&self) -> u32 {
        self.last_rcv_seq.wrapping_add(self.last_rcv_len)
    }
}

/// Client connection over a raw packet interface.
///
/// Construction fires the handshake immediately; the upper layer learns
/// about progress through its [`ClientHandler`].
pub struct ClientConn {
    tun: Arc<dyn TunDevice>,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    config: ConnConfig,
    core: Mutex<ClientCore>,
    /// Frames from upper-layer writes, consumed by the device writer
    queue: BoundedQueue<DataBuffer>,
    pool: BufferPool,
    keeper: Keeper,
    handler: StdMutex<Option<Arc<dyn ClientHandler>>>,
    disconnected: AtomicBool,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    syn_timer: StdMutex<Option<JoinHandle<()>>>,
    me: Weak<ClientConn>,
}

impl ClientConn {
    /// Create a connection and start the handshake toward
    /// `dst_ip:dst_port`. The SYN is on the wire before this returns.
    pub async fn new(
        tun: Arc<dyn TunDevice>,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        config: ConnConfig,
    ) -> Arc<Self> {
        let conn = Arc::new_cyclic(|me: &Weak<ClientConn>| {
            let mut fsm = Fsm::new("stop");
            fsm.add_rule("stop", "sdsyn", "synsd", ClientAction::SendSyn);
            fsm.add_rule("synsd", "synTimeout", "stop", ClientAction::Teardown);
            fsm.add_rule("synsd", "rcvsynack", "gotsynsck", ClientAction::SendAck);
            fsm.add_rule("synsd", "rcvrst", "error", ClientAction::SendRst);
            fsm.add_rule("gotsynsck", "sdack", "estb", ClientAction::Established);
            fsm.add_rule("estb", "rcvack", "estb", ClientAction::Deliver);
            fsm.add_rule("estb", "rcvsynack", "error", ClientAction::SendRst);
            fsm.add_rule("estb", "rcvrst", "error", ClientAction::SendRst);
            fsm.add_rule("error", "sdrst", "stop", ClientAction::Teardown);

            Self {
                tun,
                src_ip,
                dst_ip,
                src_port,
                dst_port,
                core: Mutex::new(ClientCore {
                    fsm,
                    last_rcv_seq: 0,
                    last_rcv_ack: 0,
                    last_rcv_len: 0,
                    send_id: 0,
                }),
                queue: BoundedQueue::new(config.queue_capacity),
                pool: BufferPool::new(),
                keeper: Keeper::new(config.keeper_interval(), config.dead_threshold()),
                handler: StdMutex::new(None),
                disconnected: AtomicBool::new(false),
                workers: StdMutex::new(Vec::new()),
                syn_timer: StdMutex::new(None),
                config,
                me: me.clone(),
            }
        });

        conn.dispatch(Event::internal("sdsyn")).await;

        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.read_loop().await })
        };
        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.queue_to_tun().await })
        };
        conn.workers
            .lock()
            .expect("workers lock poisoned")
            .extend([reader, writer]);

        conn
    }

    /// Register the upper-layer callbacks.
    pub fn add_handler(&self, handler: Arc<dyn ClientHandler>) {
        *self.handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    /// Name of the current state
    pub async fn state(&self) -> &'static str {
        // A keeper-declared death tears the connection down without an FSM
        // event, so the machine may still read "estb"; the torn-down flag
        // is authoritative.
        if self.disconnected.load(Ordering::SeqCst) {
            return "stop";
        }
        self.core.lock().await.fsm.current()
    }

    /// Smoothed round-trip estimate from the keeper.
    pub fn latency(&self) -> Option<std::time::Duration> {
        self.keeper.latency()
    }

    pub(crate) fn keeper(&self) -> &Keeper {
        &self.keeper
    }

    /// Queue one payload toward the peer. Fire-and-forget: after teardown
    /// the write is dropped silently.
    ///
    /// `keepalive` marks the frame as a heartbeat (PSH set); the peer routes
    /// such frames to its liveness path instead of its data path.
    pub async fn write(&self, data: &[u8], keepalive: bool) {
        let mut buf = self.pool.get();
        {
            let mut core = self.core.lock().await;
            let mut cp =
                ConnPacket::new(self.src_ip, self.dst_ip, self.src_port, self.dst_port);
            cp.flags = if keepalive {
                TcpFlags::ack().with_push()
            } else {
                TcpFlags::ack()
            };
            cp.seq = core.last_rcv_ack;
            cp.ack = core.ack_num();
            cp.ip_id = core.next_ip_id();
            cp.payload = data;

            match cp.encode(buf.space()) {
                Ok(n) => buf.set_len(n),
                Err(err) => {
                    warn!("write dropped: {err}");
                    self.pool.put(buf);
                    return;
                }
            }
        }

        if let Err(buf) = self.queue.put(buf).await {
            self.pool.put(buf);
        }
    }

    /// Block until the reader, the writer and the keeper have all exited.
    pub async fn wait_stop(&self) {
        debug!("waiting for workers to stop");
        let workers: Vec<_> = {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.drain(..).collect()
        };
        for handle in workers {
            let _ = handle.await;
        }
        self.keeper.wait_stop().await;
        debug!("all workers stopped");
    }

    /// Interrupt device and queue, stop the keeper and notify the handler.
    /// Runs at most once; later calls are no-ops.
    pub(crate) fn teardown(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("client teardown");
        self.disarm_syn_timer();
        self.tun.interrupt();
        self.queue.interrupt();
        self.keeper.stop();
        if let (Some(handler), Some(me)) = (self.handler(), self.me.upgrade()) {
            handler.on_disconnect(&me);
        }
    }

    fn handler(&self) -> Option<Arc<dyn ClientHandler>> {
        self.handler.lock().expect("handler lock poisoned").clone()
    }

    async fn dispatch(&self, event: Event<'_>) {
        let mut core = self.core.lock().await;
        self.dispatch_locked(&mut core, event).await;
    }

    /// Run one event and any follow-ups it fires, under the caller's lock.
    /// Follow-ups are processed before the lock is released, so a self-fired
    /// transition is visible immediately after the one that caused it.
    async fn dispatch_locked(&self, core: &mut ClientCore, event: Event<'_>) {
        let mut next = Some(event);
        while let Some(ev) = next.take() {
            let Some(action) = core.fsm.on_event(ev.name) else {
                break;
            };
            match action {
                ClientAction::SendSyn => {
                    info!(
                        "send syn {}:{} => {}:{}",
                        self.src_ip, self.src_port, self.dst_ip, self.dst_port
                    );
                    let mut cp = ConnPacket::new(
                        self.src_ip,
                        self.dst_ip,
                        self.src_port,
                        self.dst_port,
                    );
                    cp.flags = TcpFlags::syn();
                    cp.seq = INITIAL_SEQ;
                    cp.ack = INITIAL_ACK;
                    cp.ip_id = core.next_ip_id();
                    self.emit(&cp).await;
                    self.arm_syn_timer();
                }
                ClientAction::SendAck => {
                    debug!("got syn+ack, sending ack");
                    let mut cp = ConnPacket::new(
                        self.src_ip,
                        self.dst_ip,
                        self.src_port,
                        self.dst_port,
                    );
                    cp.flags = TcpFlags::ack();
                    cp.seq = core.last_rcv_ack;
                    cp.ack = core.ack_num();
                    cp.ip_id = core.next_ip_id();
                    self.emit(&cp).await;
                    next = Some(Event::internal("sdack"));
                }
                ClientAction::SendRst => {
                    self.send_reset(core).await;
                    next = Some(Event::internal("sdrst"));
                }
                ClientAction::Established => {
                    info!("client established");
                    self.disarm_syn_timer();
                    if let (Some(handler), Some(me)) = (self.handler(), self.me.upgrade()) {
                        handler.on_connect(&me);
                    }
                    self.keeper.start(self.me.clone());
                }
                ClientAction::Deliver => {
                    if let Some(cp) = ev.packet.as_ref() {
                        if !cp.payload.is_empty() {
                            if let Some(handler) = self.handler() {
                                handler.on_data(cp.payload);
                            }
                        }
                    }
                }
                ClientAction::Teardown => {
                    self.teardown();
                }
            }
        }
    }

    /// Write one control frame (no payload) straight to the device.
    async fn emit(&self, cp: &ConnPacket<'_>) {
        let mut frame = [0u8; HEADER_LEN];
        match cp.encode(&mut frame) {
            Ok(n) => {
                if let Err(err) = self.tun.write(&frame[..n]).await {
                    warn!("control frame write failed: {err}");
                }
            }
            Err(err) => warn!("control frame encode failed: {err}"),
        }
    }

    async fn send_reset(&self, core: &mut ClientCore) {
        info!("send reset");
        let mut cp = ConnPacket::new(self.src_ip, self.dst_ip, self.src_port, self.dst_port);
        cp.flags = TcpFlags::rst();
        cp.seq = core.last_rcv_ack;
        cp.ack = core.ack_num();
        cp.ip_id = core.next_ip_id();
        self.emit(&cp).await;
        core.send_id = 0;
    }

    fn arm_syn_timer(&self) {
        let conn = self.me.clone();
        let timeout = self.config.syn_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(conn) = conn.upgrade() {
                debug!("syn sent wait timeout");
                conn.dispatch(Event::internal("synTimeout")).await;
            }
        });
        *self.syn_timer.lock().expect("timer lock poisoned") = Some(handle);
    }

    fn disarm_syn_timer(&self) {
        if let Some(handle) = self.syn_timer.lock().expect("timer lock poisoned").take() {
            handle.abort();
        }
    }

    /// Device reader: decodes, filters and turns frames into events.
    async fn read_loop(self: Arc<Self>) {
        loop {
            let Some(buf) = self.tun.read().await else {
                break;
            };
            if buf.is_empty() {
                self.tun.recycle(buf);
                break;
            }

            match ConnPacket::decode(buf.bytes()) {
                Err(err) => trace!("undecodable frame dropped: {err}"),
                Ok(cp) => {
                    if cp.src_ip != self.dst_ip || cp.src_port != self.dst_port {
                        trace!(
                            "frame from {}:{} is not from the peer, drop",
                            cp.src_ip,
                            cp.src_port
                        );
                    } else if cp.window != MAGIC_WINDOW {
                        warn!(
                            "window {} is not {}, danger drop ({}:{})",
                            cp.window, MAGIC_WINDOW, cp.src_ip, cp.src_port
                        );
                    } else if cp.flags.is_push() {
                        // Heartbeat echo: routed to the keeper, never to the FSM.
                        if cp.payload.len() >= 8 {
                            let p = cp.payload;
                            let stamp = u64::from_be_bytes([
                                p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7],
                            ]);
                            self.keeper.rcv(stamp);
                        } else {
                            trace!("short heartbeat dropped");
                        }
                    } else {
                        let name = if cp.flags.is_rst() {
                            Some("rcvrst")
                        } else if cp.flags.is_syn_ack() {
                            Some("rcvsynack")
                        } else if cp.flags.is_ack() {
                            Some("rcvack")
                        } else {
                            None
                        };

                        if let Some(name) = name {
                            let mut core = self.core.lock().await;
                            core.last_rcv_seq = cp.seq;
                            core.last_rcv_ack = cp.ack;
                            // A SYN consumes one sequence number.
                            core.last_rcv_len = if cp.flags.is_syn() {
                                1
                            } else {
                                cp.payload.len() as u32
                            };
                            let event = Event::frame(name, cp.clone());
                            self.dispatch_locked(&mut core, event).await;
                        } else {
                            trace!("frame with flags {} dropped", cp.flags);
                        }
                    }
                }
            }

            self.tun.recycle(buf);
        }
        debug!("client read loop exit");
    }

    /// Device writer: drains the queue into the device.
    async fn queue_to_tun(self: Arc<Self>) {
        while let Some(buf) = self.queue.get().await {
            let misdirected = match ConnPacket::decode(buf.bytes()) {
                Ok(cp) => cp.dst_ip != self.dst_ip,
                Err(_) => true,
            };
            if misdirected {
                warn!("queued frame is not for the peer, drop");
            } else if let Err(err) = self.tun.write(buf.bytes()).await {
                warn!("device write failed: {err}");
            }
            self.pool.put(buf);
        }
        debug!("queue to device writer exit");
    }
}
