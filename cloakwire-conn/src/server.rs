//! Server side of the tunnel
//!
//! The server is passive and reusable: it waits for a SYN, learns the peer's
//! 4-tuple from it, answers SYN+ACK, and serves exactly one peer until a
//! reset or a protocol violation sends it back to waiting. It runs no keeper
//! of its own: client heartbeats are echoed straight back from the read
//! loop and never reach the upper layer.

use std::net::Ipv4Addr;
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
use crate::event::ServerHandler;
use crate::INITIAL_SEQ;

/// Action tags of the server state machine
#[derive(Debug, Clone, Copy)]
enum ServerAction {
    /// Entered the accepting state
    AwaitSyn,
    /// Learn the peer from its SYN, answer SYN+ACK, self-fire `sdsynack`
    SendSynAck,
    /// Emit RST, then self-fire `sdrst`
    SendRst,
    /// The SYN+ACK is on the wire
    SynAckSent,
    /// Handshake completed: notify the handler, deliver any piggybacked data
    Establish,
    /// Hand a data payload to the handler
    Deliver,
    /// A stray RST while accepting; stay put
    StayWaiting,
    /// Session over: clear the peer and accept again
    Rearm,
}

/// Mutable state serialized under the connection mutex
struct ServerCore {
    fsm: Fsm<ServerAction>,
    /// Peer 4-tuple; unspecified until the first SYN arrives
    dst_ip: Ipv4Addr,
    dst_port: u16,
    last_rcv_seq: u32,
    last_rcv_len: u32,
    /// Outbound sequence number, advanced by each payload's length
    send_seq: u32,
    send_id: u16,
}

impl ServerCore {
    fn next_ip_id(&mut self) -> u16 {
        let id = self.send_id;
        self.send_id = self.send_id.wrapping_add(1);
        id
    }

    fn ack_num(&self) -> u32 {
        self.last_rcv_seq.wrapping_add(self.last_rcv_len)
    }

    /// Record the accepted frame the next acknowledgment refers to.
    fn note_received(&mut self, cp: &ConnPacket<'_>) {
        self.last_rcv_seq = cp.seq;
        // A SYN consumes one sequence number.
        self.last_rcv_len = if cp.flags.is_syn() {
            1
        } else {
            cp.payload.len() as u32
        };
    }
}

/// Server connection over a raw packet interface.
///
/// One instance serves one peer at a time and survives across sessions.
pub struct ServerConn {
    tun: Arc<dyn TunDevice>,
    src_ip: Ipv4Addr,
    src_port: u16,
    core: Mutex<ServerCore>,
    queue: BoundedQueue<DataBuffer>,
    pool: BufferPool,
    handler: Arc<dyn ServerHandler>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    me: Weak<ServerConn>,
}

impl ServerConn {
    /// Create a server listening on `src_ip:src_port` and start its workers.
    pub async fn new(
        src_ip: Ipv4Addr,
        src_port: u16,
        tun: Arc<dyn TunDevice>,
        handler: Arc<dyn ServerHandler>,
    ) -> Arc<Self> {
        let config = ConnConfig::default();
        let conn = Arc::new_cyclic(|me: &Weak<ServerConn>| {
            let mut fsm = Fsm::new("stop");
            fsm.add_rule("stop", "start", "waitsyn", ServerAction::AwaitSyn);
            fsm.add_rule("waitsyn", "rcvsyn", "gotSyn", ServerAction::SendSynAck);
            fsm.add_rule("waitsyn", "rcvack", "error", ServerAction::SendRst);
            fsm.add_rule("waitsyn", "rcvrst", "waitsyn", ServerAction::StayWaiting);
            fsm.add_rule("gotSyn", "sdsynack", "synacksd", ServerAction::SynAckSent);
            fsm.add_rule("synacksd", "rcvack", "estb", ServerAction::Establish);
            fsm.add_rule("synacksd", "rcvsyn", "error", ServerAction::SendRst);
            fsm.add_rule("synacksd", "rcvrst", "error", ServerAction::SendRst);
            fsm.add_rule("estb", "rcvack", "estb", ServerAction::Deliver);
            fsm.add_rule("estb", "rcvsyn", "error", ServerAction::SendRst);
            fsm.add_rule("estb", "rcvrst", "error", ServerAction::SendRst);
            fsm.add_rule("error", "sdrst", "waitsyn", ServerAction::Rearm);

            Self {
                tun,
                src_ip,
                src_port,
                core: Mutex::new(ServerCore {
                    fsm,
                    dst_ip: Ipv4Addr::UNSPECIFIED,
                    dst_port: 0,
                    last_rcv_seq: 0,
                    last_rcv_len: 0,
                    send_seq: INITIAL_SEQ,
                    send_id: 0,
                }),
                queue: BoundedQueue::new(config.queue_capacity),
                pool: BufferPool::new(),
                handler,
                workers: StdMutex::new(Vec::new()),
                me: me.clone(),
            }
        });

        conn.dispatch(Event::internal("start")).await;

        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.queue_to_tun().await })
        };
        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.read_loop().await })
        };
        conn.workers
            .lock()
            .expect("workers lock poisoned")
            .extend([writer, reader]);

        conn
    }

    /// Name of the current state
    pub async fn state(&self) -> &'static str {
        self.core.lock().await.fsm.current()
    }

    /// Block until both workers have exited. They only do once the device
    /// has been interrupted, so this is the tail end of a shutdown.
    pub async fn wait_stop(&self) {
        let workers: Vec<_> = {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.drain(..).collect()
        };
        for handle in workers {
            let _ = handle.await;
        }
    }

    /// Queue one payload toward the current peer. Fire-and-forget.
    pub async fn write(&self, data: &[u8]) {
        self.send(data, false).await;
    }

    async fn send(&self, data: &[u8], heartbeat: bool) {
        let mut buf = self.pool.get();
        {
            let mut core = self.core.lock().await;
            let mut cp = ConnPacket::new(self.src_ip, core.dst_ip, self.src_port, core.dst_port);
            cp.flags = if heartbeat {
                TcpFlags::ack().with_push()
            } else {
                TcpFlags::ack()
            };
            cp.seq = core.send_seq;
            cp.ack = core.ack_num();
            cp.ip_id = core.next_ip_id();
            cp.payload = data;

            match cp.encode(buf.space()) {
                Ok(n) => {
                    buf.set_len(n);
                    core.send_seq = core.send_seq.wrapping_add(data.len() as u32);
                }
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

    async fn dispatch(&self, event: Event<'_>) {
        let mut core = self.core.lock().await;
        self.dispatch_locked(&mut core, event).await;
    }

    /// Run one event and its follow-ups under the caller's lock.
    async fn dispatch_locked(&self, core: &mut ServerCore, event: Event<'_>) {
        let mut next = Some(event);
        while let Some(ev) = next.take() {
            let Some(action) = core.fsm.on_event(ev.name) else {
                break;
            };
            match action {
                ServerAction::AwaitSyn => {
                    info!("server waiting for syn on {}:{}", self.src_ip, self.src_port);
                }
                ServerAction::SendSynAck => {
                    if let Some(cp) = ev.packet.as_ref() {
                        core.note_received(cp);
                        core.dst_ip = cp.src_ip;
                        core.dst_port = cp.src_port;
                        info!(
                            "got syn from {}:{}, sending syn+ack",
                            core.dst_ip, core.dst_port
                        );

                        let mut out = ConnPacket::new(
                            self.src_ip,
                            core.dst_ip,
                            self.src_port,
                            core.dst_port,
                        );
                        out.flags = TcpFlags::syn().with_ack();
                        out.seq = core.send_seq;
                        out.ack = core.ack_num();
                        out.ip_id = core.next_ip_id();
                        self.emit(&out).await;
                        // Our own SYN consumes one sequence number too.
                        core.send_seq = core.send_seq.wrapping_add(1);
                        next = Some(Event::internal("sdsynack"));
                    }
                }
                ServerAction::SynAckSent => {
                    debug!("syn+ack sent");
                }
                ServerAction::Establish => {
                    info!("server established");
                    if let Some(cp) = ev.packet.as_ref() {
                        core.note_received(cp);
                    }
                    if let Some(me) = self.me.upgrade() {
                        self.handler.on_connect(&me);
                    }
                    self.deliver(&ev);
                }
                ServerAction::Deliver => {
                    if let Some(cp) = ev.packet.as_ref() {
                        core.note_received(cp);
                    }
                    self.deliver(&ev);
                }
                ServerAction::SendRst => {
                    self.send_reset(core).await;
                    next = Some(Event::internal("sdrst"));
                }
                ServerAction::StayWaiting => {
                    debug!("stray rst while waiting for syn, ignored");
                }
                ServerAction::Rearm => {
                    info!("session over, back to waiting for syn");
                    if core.dst_port != 0 {
                        self.handler.on_disconnect();
                    }
                    core.dst_ip = Ipv4Addr::UNSPECIFIED;
                    core.dst_port = 0;
                    core.last_rcv_seq = 0;
                    core.last_rcv_len = 0;
                }
            }
        }
    }

    fn deliver(&self, ev: &Event<'_>) {
        if let Some(cp) = ev.packet.as_ref() {
            if !cp.payload.is_empty() {
                if let Some(me) = self.me.upgrade() {
                    self.handler.on_data(cp.payload, &me);
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

    async fn send_reset(&self, core: &mut ServerCore) {
        info!("send reset");
        let mut cp = ConnPacket::new(self.src_ip, core.dst_ip, self.src_port, core.dst_port);
        cp.flags = TcpFlags::rst();
        cp.seq = core.send_seq;
        cp.ack = core.last_rcv_seq.wrapping_add(1);
        cp.ip_id = core.next_ip_id();
        self.emit(&cp).await;
        core.send_id = 0;
        core.send_seq = INITIAL_SEQ;
    }

    /// Device reader: filters frames, echoes heartbeats, feeds the machine.
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
                    if cp.window != MAGIC_WINDOW {
                        warn!(
                            "window {} is not {}, danger drop ({}:{})",
                            cp.window, MAGIC_WINDOW, cp.src_ip, cp.src_port
                        );
                    } else {
                        let core = self.core.lock().await;
                        let state = core.fsm.current();
                        let peer_known = core.dst_port != 0 && state != "waitsyn";
                        let from_peer =
                            cp.src_ip == core.dst_ip && cp.src_port == core.dst_port;

                        if peer_known && !from_peer {
                            trace!(
                                "frame from {}:{} is not from the peer, drop",
                                cp.src_ip,
                                cp.src_port
                            );
                        } else if cp.flags.is_push() {
                            // Heartbeat: echo the stamp back, keep it away
                            // from the machine and the handler.
                            let echo = state == "estb" && cp.payload.len() >= 8;
                            drop(core);
                            if echo {
                                self.send(cp.payload, true).await;
                            } else {
                                trace!("heartbeat outside estb dropped");
                            }
                        } else {
                            let name = if cp.flags.is_rst() {
                                Some("rcvrst")
                            } else if cp.flags.is_syn() && !cp.flags.is_ack() {
                                Some("rcvsyn")
                            } else if cp.flags.is_ack() {
                                Some("rcvack")
                            } else {
                                None
                            };

                            let mut core = core;
                            if let Some(name) = name {
                                let event = Event::frame(name, cp.clone());
                                self.dispatch_locked(&mut core, event).await;
                            } else {
                                trace!("frame with flags {} dropped", cp.flags);
                            }
                        }
                    }
                }
            }

            self.tun.recycle(buf);
        }

        // Device gone: release the writer too.
        self.queue.interrupt();
        debug!("server read loop exit");
    }

    /// Device writer: drains the queue into the device.
    async fn queue_to_tun(self: Arc<Self>) {
        while let Some(buf) = self.queue.get().await {
            if let Err(err) = self.tun.write(buf.bytes()).await {
                warn!("device write failed: {err}");
            }
            self.pool.put(buf);
        }
        debug!("queue to device writer exit");
    }
}
