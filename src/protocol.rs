//! Owns the listening sockets, the Remote set, old connections pending
//! GC, reconnect backoff, and the GC timer.
//!
//! Everything here runs inside a single `tokio::task::LocalSet`: all
//! mutable state lives behind one `Rc<RefCell<ProtocolState>>`, mirroring
//! the "entire core runs on one event loop" concurrency model of
//! spec.md §5. Slab keys replace the raw `Connection*`/`Remote*`
//! pointers per the Design Notes §9 ownership redesign.

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use fnv::{FnvHashMap, FnvHashSet};
use rand::Rng;
use slab::Slab;
use slog::{warn, Logger};
use tokio::net::{TcpListener, TcpStream};

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::connection::{ConnFlags, Connection, ConnectionHandle};
use crate::error::{ChirpError, Result};
use crate::message::{EndpointKey, IpProtocol, Message, MsgFlags, SendCallback, TYPE_ACK};
use crate::notify::Notify;
use crate::reader::ReaderSink;
use crate::remote::{Remote, RemoteFlags};
use crate::serializer::Handshake;
use crate::tls::TlsEnv;
use crate::transport::Transport;
use crate::writer::WriteBuffers;

/// Debounce window applied between a connection failure and the retry
/// (spec.md §4.7 "Debounce"): uniform random in `[50ms, 550ms]`.
const DEBOUNCE_MIN_MS: u64 = 50;
const DEBOUNCE_MAX_MS: u64 = 550;

pub type SharedProtocol = Rc<RefCell<ProtocolState>>;

struct PendingSend {
    cb: Option<SendCallback>,
}

pub struct ProtocolState {
    pub config: Config,
    pub local_identity: [u8; 16],
    pub logger: Logger,
    pub tls_env: Option<Rc<TlsEnv>>,

    pub connections: Slab<Connection>,
    pub remotes: FnvHashMap<EndpointKey, Remote>,
    pub reconnect_remotes: Vec<EndpointKey>,
    pub handshake_conns: FnvHashSet<ConnectionHandle>,
    pub old_connections: FnvHashSet<ConnectionHandle>,
    pub connecting: FnvHashSet<EndpointKey>,

    pub notifiers: FnvHashMap<ConnectionHandle, Rc<Notify>>,
    send_callbacks: FnvHashMap<u64, PendingSend>,
    next_callback_id: u64,
    pub closing: bool,
    pub close_semaphore: u32,
    pub close_notify: Rc<Notify>,
    /// The user's receive dispatch, set once by `start`. Outbound
    /// (dialled) connections need this too — Chirp is symmetric, and a
    /// reply can arrive on either side of a connection.
    pub recv: Option<Rc<dyn Fn(Message)>>,
}

impl ProtocolState {
    pub fn register_callback(&mut self, cb: SendCallback) -> u64 {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.send_callbacks.insert(id, PendingSend { cb: Some(cb) });
        id
    }

    pub fn fire_callback(&mut self, id: u64, result: crate::message::SendResult) {
        if let Some(mut pending) = self.send_callbacks.remove(&id) {
            if let Some(cb) = pending.cb.take() {
                cb(result);
            }
        }
    }

    pub fn notify_for(&self, handle: ConnectionHandle) -> Option<Rc<Notify>> {
        self.notifiers.get(&handle).cloned()
    }
}

/// Top-level owner, cheap to clone (an `Rc` underneath).
#[derive(Clone)]
pub struct Protocol(pub SharedProtocol);

impl Protocol {
    pub fn new(config: Config, local_identity: [u8; 16], logger: Logger, tls_env: Option<Rc<TlsEnv>>) -> Protocol {
        let state = ProtocolState {
            config,
            local_identity,
            logger,
            tls_env,
            connections: Slab::new(),
            remotes: FnvHashMap::default(),
            reconnect_remotes: Vec::new(),
            handshake_conns: FnvHashSet::default(),
            old_connections: FnvHashSet::default(),
            connecting: FnvHashSet::default(),
            notifiers: FnvHashMap::default(),
            send_callbacks: FnvHashMap::default(),
            next_callback_id: 0,
            closing: false,
            close_semaphore: 0,
            close_notify: Rc::new(Notify::new()),
            recv: None,
        };
        Protocol(Rc::new(RefCell::new(state)))
    }

    /// Binds the v4/v6 listening sockets and spawns their accept loops,
    /// plus the GC and reconnect timers. Bind failure surfaces
    /// `ChirpError::AddrInUse` synchronously, matching spec.md §4.8.
    pub async fn start(&self, recv: std::rc::Rc<dyn Fn(Message) + 'static>) -> Result<()> {
        let (bind_v4, bind_v6, port) = {
            let mut p = self.0.borrow_mut();
            p.recv = Some(recv.clone());
            (p.config.bind_v4, p.config.bind_v6, p.config.port)
        };

        let v4_addr = SocketAddr::new(IpAddr::V4(bind_v4), port);
        let v6_addr = SocketAddr::new(IpAddr::V6(bind_v6), port);

        let v4 = TcpListener::bind(v4_addr)
            .await
            .map_err(|_| ChirpError::AddrInUse)?;
        let v6 = TcpListener::bind(v6_addr)
            .await
            .map_err(|_| ChirpError::AddrInUse)?;

        spawn_accept_loop(self.0.clone(), v4, recv.clone());
        spawn_accept_loop(self.0.clone(), v6, recv);
        spawn_gc_timer(self.0.clone());

        Ok(())
    }

    /// Enqueue `msg` for delivery to its endpoint, applying control-vs-
    /// data queue priority and the liveness probe described in
    /// spec.md §4.7.
    pub fn send(&self, msg: Message, cb: SendCallback) {
        enqueue_and_dispatch(self.0.clone(), msg, false, Some(cb));
    }

    /// Release a slot previously delivered to the receive callback.
    /// Sends the pending ACK (if any), decrements the pool refcount,
    /// and resumes a stopped stream.
    pub fn release_msg_slot(&self, msg: Message) {
        release_msg_slot(&self.0, msg);
    }

    /// Shut down every handshake/old/authoritative connection and
    /// empty every Remote's queues with `SHUTDOWN`, per spec.md §4.8
    /// `close`. Arms `close_semaphore` to the number of handles being
    /// torn down so [`Protocol::closed`] can await full drain.
    pub fn close(&self) {
        let mut proto = self.0.borrow_mut();
        proto.closing = true;
        let handles: FnvHashSet<ConnectionHandle> = proto
            .handshake_conns
            .iter()
            .chain(proto.old_connections.iter())
            .cloned()
            .chain(proto.remotes.values().filter_map(|r| r.conn))
            .collect();
        proto.close_semaphore = handles.len() as u32;
        for (_, remote) in proto.remotes.iter_mut() {
            remote.msg_queue.clear();
            remote.cntl_msg_queue.clear();
            remote.wait_ack_message = None;
        }
        drop(proto);
        if handles.is_empty() {
            self.0.borrow().close_notify.notify();
            return;
        }
        for h in handles {
            schedule_shutdown(self.0.clone(), h, ChirpError::Shutdown);
        }
    }

    /// Resolves once every handle counted at `close()` time has run its
    /// final close callback, per spec.md §4.9's `closing_tasks`
    /// semaphore reaching zero.
    pub async fn closed(&self) {
        loop {
            let notified = {
                let p = self.0.borrow();
                if p.closing && p.close_semaphore == 0 {
                    return;
                }
                p.close_notify.clone()
            };
            notified.notified().await;
        }
    }
}

fn spawn_accept_loop(
    proto: SharedProtocol,
    mut listener: TcpListener,
    recv: std::rc::Rc<dyn Fn(Message) + 'static>,
) {
    tokio::task::spawn_local(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => continue,
            };
            let _ = stream.set_nodelay(true);

            let (should_encrypt, tls_env) = {
                let p = proto.borrow();
                (p.config.should_encrypt(&peer.ip()), p.tls_env.clone())
            };
            let transport = if should_encrypt {
                match tls_env.as_ref() {
                    Some(env) => match Transport::accept_tls(stream, env).await {
                        Ok(t) => t,
                        Err(_) => continue,
                    },
                    None => Transport::plain(stream),
                }
            } else {
                Transport::plain(stream)
            };

            let max_slots = proto.borrow().config.max_slots;
            let conn = Connection::new(0, transport, peer.ip(), peer.port(), max_slots, true);
            let handle = {
                let mut p = proto.borrow_mut();
                let entry = p.connections.vacant_entry();
                let handle = entry.key();
                let mut conn = conn;
                conn.handle = handle;
                entry.insert(conn);
                p.handshake_conns.insert(handle);
                handle
            };
            let notify = Rc::new(Notify::new());
            proto.borrow_mut().notifiers.insert(handle, notify.clone());
            spawn_connection_io(proto.clone(), handle, notify, recv.clone());
        }
    });
}

fn spawn_gc_timer(proto: SharedProtocol) {
    tokio::task::spawn_local(async move {
        loop {
            let reuse = proto.borrow().config.reuse_time;
            let base = reuse.as_millis() as u64 / 2;
            let jitter = rand::thread_rng().gen_range(0, base.max(1) + 1);
            tokio::time::delay_for(Duration::from_millis(base + jitter)).await;
            run_gc(&proto);
        }
    });
}

fn run_gc(proto: &SharedProtocol) {
    let mut p = proto.borrow_mut();
    let reuse = p.config.reuse_time;
    let now = Instant::now();

    let stale_old: Vec<ConnectionHandle> = p
        .old_connections
        .iter()
        .cloned()
        .filter(|h| {
            p.connections
                .get(*h)
                .map(|c| now.duration_since(c.last_activity) > reuse)
                .unwrap_or(true)
        })
        .collect();

    let stale_remotes: Vec<EndpointKey> = p
        .remotes
        .values()
        .filter(|r| {
            !r.flags.contains(RemoteFlags::CONN_BLOCKED) && now.duration_since(r.timestamp) > reuse
        })
        .map(|r| r.key)
        .collect();

    drop(p);

    for h in stale_old {
        schedule_shutdown(proto.clone(), h, ChirpError::Shutdown);
    }

    for key in stale_remotes {
        let mut p = proto.borrow_mut();
        let (failed_msgs, conn_handle) = if let Some(remote) = p.remotes.get_mut(&key) {
            let mut failed_msgs: Vec<Message> = remote.msg_queue.drain(..).collect();
            failed_msgs.extend(remote.cntl_msg_queue.drain(..));
            (failed_msgs, remote.conn)
        } else {
            (Vec::new(), None)
        };
        for msg in failed_msgs {
            fail_message(&mut p, msg, ChirpError::Shutdown);
        }
        p.remotes.remove(&key);
        drop(p);
        if let Some(h) = conn_handle {
            let mut p = proto.borrow_mut();
            if let Some(c) = p.connections.get_mut(h) {
                c.flags.insert(ConnFlags::DELETE_REMOTE);
            }
            drop(p);
            schedule_shutdown(proto.clone(), h, ChirpError::Shutdown);
        }
    }
}

fn fail_message(proto: &mut ProtocolState, msg: Message, err: ChirpError) {
    if let Some(id) = msg.callback_id {
        proto.fire_callback(id, Err(err));
    }
}

/// Connection I/O task: sends our handshake, then alternates between
/// reading bytes off the wire and flushing whatever `Remote::process_queues`
/// has queued for this connection.
fn spawn_connection_io(
    proto: SharedProtocol,
    handle: ConnectionHandle,
    notify: Rc<Notify>,
    recv: std::rc::Rc<dyn Fn(Message) + 'static>,
) {
    tokio::task::spawn_local(async move {
        let (local_port, local_identity) = {
            let p = proto.borrow();
            (p.config.port, p.local_identity)
        };
        let hs = Handshake {
            port: local_port,
            identity: local_identity,
        };
        let mut hs_buf = [0u8; crate::serializer::HANDSHAKE_SIZE];
        hs.encode(&mut hs_buf);

        let mut transport = {
            let mut p = proto.borrow_mut();
            match p.connections.get_mut(handle) {
                Some(c) => c.transport.take(),
                None => return,
            }
        };
        let write_res = transport.write_scatter(&hs_buf, &[], &[]).await;
        {
            let mut p = proto.borrow_mut();
            if let Some(c) = p.connections.get_mut(handle) {
                c.transport.put_back(transport);
            } else {
                return;
            }
        }
        if write_res.is_err() {
            schedule_shutdown(proto.clone(), handle, ChirpError::WriteError("handshake".into()));
            return;
        }

        let buf_size = proto.borrow().config.buffer_size;
        let mut buf = vec![0u8; buf_size];

        loop {
            let stopped = proto
                .borrow()
                .connections
                .get(handle)
                .map(|c| c.flags.contains(ConnFlags::STOPPED))
                .unwrap_or(true);

            if stopped {
                notify.notified().await;
                continue;
            }

            let mut transport = {
                let mut p = proto.borrow_mut();
                match p.connections.get_mut(handle) {
                    Some(c) => c.transport.take(),
                    None => return,
                }
            };

            tokio::select! {
                res = transport.read(&mut buf) => {
                    {
                        let mut p = proto.borrow_mut();
                        if let Some(c) = p.connections.get_mut(handle) {
                            c.transport.put_back(transport);
                        } else {
                            return;
                        }
                    }
                    match res {
                        Ok(0) => {
                            schedule_shutdown(proto.clone(), handle, ChirpError::Shutdown);
                            return;
                        }
                        Ok(n) => {
                            handle_bytes(&proto, handle, &buf[..n], &recv);
                            flush_writes(&proto, handle, &notify).await;
                        }
                        Err(e) => {
                            schedule_shutdown(proto.clone(), handle, ChirpError::UvError(e.to_string()));
                            return;
                        }
                    }
                }
                _ = notify.notified() => {
                    {
                        let mut p = proto.borrow_mut();
                        if let Some(c) = p.connections.get_mut(handle) {
                            c.transport.put_back(transport);
                        } else {
                            return;
                        }
                    }
                    flush_writes(&proto, handle, &notify).await;
                }
            }

            if proto.borrow().connections.get(handle).is_none() {
                return;
            }
        }
    });
}

fn handle_bytes(
    proto: &SharedProtocol,
    handle: ConnectionHandle,
    mut bytes: &[u8],
    recv: &std::rc::Rc<dyn Fn(Message) + 'static>,
) {
    let mut delivered = Vec::new();
    {
        let mut p = proto.borrow_mut();
        loop {
            if bytes.is_empty() {
                break;
            }
            let mut sink = ConnSink {
                proto: &mut p,
                handle,
                delivered: &mut delivered,
            };
            let mut reader = match sink.proto.connections.get_mut(handle) {
                Some(c) => std::mem::replace(&mut c.reader, crate::reader::Reader::new()),
                None => return,
            };
            let consumed = reader.read(&mut sink, bytes);
            if let Some(c) = p.connections.get_mut(handle) {
                c.reader = reader;
                c.touch();
            }
            if consumed == 0 {
                break;
            }
            bytes = &bytes[consumed..];
        }
    }
    for msg in delivered {
        recv(msg);
    }
}

struct ConnSink<'a> {
    proto: &'a mut ProtocolState,
    handle: ConnectionHandle,
    delivered: &'a mut Vec<Message>,
}

impl<'a> ReaderSink for ConnSink<'a> {
    fn pool(&self) -> &BufferPool {
        &self.proto.connections.get(self.handle).unwrap().pool
    }

    fn max_msg_size(&self) -> usize {
        self.proto.config.max_msg_size
    }

    fn local_handshake(&self) -> Handshake {
        Handshake {
            port: self.proto.config.port,
            identity: self.proto.local_identity,
        }
    }

    fn on_handshake(&mut self, hs: Handshake) -> Result<()> {
        let (address, port) = {
            let c = self.proto.connections.get(self.handle).unwrap();
            (c.address, c.port)
        };
        let key = EndpointKey::new(address, hs.port);
        if let Some(c) = self.proto.connections.get_mut(self.handle) {
            c.remote_port = hs.port;
            c.remote_identity = hs.identity;
            c.remote_key = Some(key);
            c.flags.insert(ConnFlags::CONNECTED);
        }
        self.proto.handshake_conns.remove(&self.handle);

        let prior = {
            let remote = self
                .proto
                .remotes
                .entry(key)
                .or_insert_with(|| Remote::new(key));
            let prior = remote.conn;
            remote.conn = Some(self.handle);
            remote.touch();
            prior
        };
        // Network-race resolution: if a different connection was
        // already authoritative for this Remote, demote it to `old`
        // rather than tearing down the one that just finished its
        // handshake (the latest winner keeps serving).
        if let Some(prior_handle) = prior {
            if prior_handle != self.handle {
                if let Some(prior_conn) = self.proto.connections.get_mut(prior_handle) {
                    prior_conn.flags.insert(ConnFlags::OLD);
                }
                self.proto.old_connections.insert(prior_handle);
            }
        }
        let _ = port;
        Ok(())
    }

    fn on_noop(&mut self) {
        if let Some(c) = self.proto.connections.get_mut(self.handle) {
            c.touch();
        }
        if let Some(key) = self.proto.connections.get(self.handle).and_then(|c| c.remote_key) {
            if let Some(r) = self.proto.remotes.get_mut(&key) {
                r.touch();
            }
        }
    }

    fn on_ack(&mut self, identity: [u8; 16]) {
        let key = match self.proto.connections.get(self.handle).and_then(|c| c.remote_key) {
            Some(k) => k,
            None => return,
        };
        let matches = self
            .proto
            .remotes
            .get(&key)
            .and_then(|r| r.wait_ack_message.as_ref())
            .map(|m| m.identity == identity)
            .unwrap_or(false);
        if !matches {
            // Unknown-id ACKs may reference a prior connection; ignore.
            return;
        }
        if let Some(remote) = self.proto.remotes.get_mut(&key) {
            if let Some(msg) = remote.wait_ack_message.as_mut() {
                msg.flags.insert(MsgFlags::ACK_RECEIVED);
            }
        }
        if let Some(conn) = self.proto.connections.get_mut(self.handle) {
            conn.writer.on_ack_received();
            if let Some(done) = conn.writer.take_if_complete() {
                if let Some(id) = done.callback_id {
                    self.proto.fire_callback(id, Ok(()));
                }
            }
        }
        if let Some(remote) = self.proto.remotes.get_mut(&key) {
            remote.wait_ack_message = None;
        }
    }

    fn remote_endpoint(&self) -> (IpAddr, u16, [u8; 16]) {
        let c = self.proto.connections.get(self.handle).unwrap();
        (c.address, c.remote_port, c.remote_identity)
    }

    fn connection_handle(&self) -> usize {
        self.handle
    }

    fn deliver(&mut self, mut msg: Message, _slot: u32) {
        if let Some(c) = self.proto.connections.get(self.handle) {
            msg.port = c.remote_port;
        }
        self.delivered.push(msg);
    }

    fn protocol_error(&mut self, reason: String) {
        warn!(self.proto.logger, "protocol error"; "reason" => reason.clone(), "handle" => self.handle);
        if let Some(c) = self.proto.connections.get_mut(self.handle) {
            c.flags.insert(ConnFlags::SHUTTING_DOWN);
        }
    }

    fn set_stopped(&mut self, stopped: bool) {
        if let Some(c) = self.proto.connections.get_mut(self.handle) {
            c.flags.set(ConnFlags::STOPPED, stopped);
        }
        if !stopped {
            if let Some(n) = self.proto.notify_for(self.handle) {
                n.notify();
            }
        }
    }
}

async fn flush_writes(proto: &SharedProtocol, handle: ConnectionHandle, notify: &Rc<Notify>) {
    loop {
        let key = match proto.borrow().connections.get(handle).and_then(|c| c.remote_key) {
            Some(k) => k,
            None => return,
        };
        dispatch_for_remote(proto, key);

        let buffers = {
            let mut p = proto.borrow_mut();
            take_pending_write(&mut p, handle)
        };
        let buffers = match buffers {
            Some(b) => b,
            None => return,
        };

        let mut transport = {
            let mut p = proto.borrow_mut();
            match p.connections.get_mut(handle) {
                Some(c) => c.transport.take(),
                None => return,
            }
        };
        let res = transport
            .write_scatter(&buffers.wire_header, &buffers.header, &buffers.data)
            .await;
        {
            let mut p = proto.borrow_mut();
            if let Some(c) = p.connections.get_mut(handle) {
                c.transport.put_back(transport);
            } else {
                return;
            }
        }

        let mut p = proto.borrow_mut();
        if res.is_err() {
            drop(p);
            schedule_shutdown(proto.clone(), handle, ChirpError::WriteError("write failed".into()));
            return;
        }
        let completed = p.connections.get_mut(handle).and_then(|c| {
            c.writer.on_write_complete();
            c.writer.take_if_complete()
        });
        if let Some(done) = completed {
            if let Some(id) = done.callback_id {
                p.fire_callback(id, Ok(()));
            }
            drop(p);
            dispatch_for_remote(proto, key);
        }
        let _ = notify;
    }
}

/// A write has been "begun" on the writer but not yet attempted on the
/// transport; this extracts those buffers once, so `flush_writes` can
/// await the scatter write outside of any `RefCell` borrow.
fn take_pending_write(proto: &mut ProtocolState, handle: ConnectionHandle) -> Option<WriteBuffers> {
    let conn = proto.connections.get_mut(handle)?;
    if !conn.flags.contains(ConnFlags::WRITE_PENDING) {
        return None;
    }
    conn.flags.remove(ConnFlags::WRITE_PENDING);
    conn.pending_write.take()
}

fn dispatch_for_remote(proto: &SharedProtocol, key: EndpointKey) {
    let mut p = proto.borrow_mut();
    let synchronous = p.config.synchronous;
    let reuse_time = p.config.reuse_time;

    let (blocked, conn, queues_empty) = match p.remotes.get(&key) {
        Some(r) => (
            r.flags.contains(RemoteFlags::CONN_BLOCKED),
            r.conn,
            r.msg_queue.is_empty() && r.cntl_msg_queue.is_empty(),
        ),
        None => return,
    };

    if blocked {
        return;
    }

    let handle = match conn {
        None => {
            if !queues_empty {
                if p.connecting.insert(key) {
                    drop(p);
                    spawn_connect(proto.clone(), key);
                }
            }
            return;
        }
        Some(h) => h,
    };

    let conn_ready = p
        .connections
        .get(handle)
        .map(|c| c.flags.contains(ConnFlags::CONNECTED) && !c.flags.contains(ConnFlags::SHUTTING_DOWN))
        .unwrap_or(false);
    if !conn_ready {
        return;
    }
    if p.connections.get(handle).map(|c| c.writer.is_busy()).unwrap_or(true) {
        return;
    }

    let remote = match p.remotes.get_mut(&key) {
        Some(r) => r,
        None => return,
    };

    // Liveness probe: if this Remote has been silent for more than
    // 3/4 of REUSE_TIME, queue the NOOP ahead of the next real send.
    let quiet_for = Instant::now().duration_since(remote.timestamp);
    if quiet_for > reuse_time.mul_f64(0.75) && remote.cntl_msg_queue.is_empty() {
        let noop = remote.noop.clone();
        remote.cntl_msg_queue.push_back(noop);
    }

    let next = if let Some(m) = remote.cntl_msg_queue.pop_front() {
        Some(m)
    } else if synchronous {
        if remote.wait_ack_message.is_none() {
            remote.msg_queue.pop_front().map(|mut m| {
                m.set_req_ack(true);
                remote.wait_ack_message = Some(m.clone());
                m
            })
        } else {
            None
        }
    } else {
        remote.msg_queue.pop_front()
    };

    let msg = match next {
        Some(m) => m,
        None => return,
    };

    let serial = remote.next_serial();
    remote.touch();
    drop(p);

    let mut p = proto.borrow_mut();
    if let Some(conn) = p.connections.get_mut(handle) {
        let buffers = conn.writer.begin(msg, serial);
        conn.pending_write = Some(buffers);
        conn.flags.insert(ConnFlags::WRITE_PENDING);
    }
    if let Some(n) = p.notify_for(handle) {
        n.notify();
    }
}

fn spawn_connect(proto: SharedProtocol, key: EndpointKey) {
    tokio::task::spawn_local(async move {
        let (connect_timeout, max_slots, tls_env, should_encrypt, recv) = {
            let p = proto.borrow();
            (
                p.config.connect_timeout(),
                p.config.max_slots,
                p.tls_env.clone(),
                p.config.should_encrypt(&key.address),
                p.recv.clone(),
            )
        };
        let recv = recv.unwrap_or_else(|| Rc::new(|_msg: Message| {}) as Rc<dyn Fn(Message)>);
        let addr = SocketAddr::new(key.address, key.port);
        let connect_fut = TcpStream::connect(addr);
        let stream = match tokio::time::timeout(connect_timeout, connect_fut).await {
            Ok(Ok(s)) => s,
            _ => {
                proto.borrow_mut().connecting.remove(&key);
                fail_head_of_queue(&proto, key, ChirpError::CannotConnect);
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let transport = if should_encrypt {
            match tls_env.as_ref() {
                Some(env) => {
                    match Transport::connect_tls(stream, env, &key.address.to_string()).await {
                        Ok(t) => t,
                        Err(_) => {
                            proto.borrow_mut().connecting.remove(&key);
                            fail_head_of_queue(&proto, key, ChirpError::TlsError("handshake failed".into()));
                            return;
                        }
                    }
                }
                None => Transport::plain(stream),
            }
        } else {
            Transport::plain(stream)
        };

        let conn = Connection::new(0, transport, key.address, key.port, max_slots, false);
        let handle = {
            let mut p = proto.borrow_mut();
            let entry = p.connections.vacant_entry();
            let handle = entry.key();
            let mut conn = conn;
            conn.handle = handle;
            entry.insert(conn);
            p.handshake_conns.insert(handle);
            p.connecting.remove(&key);
            handle
        };
        let notify = Rc::new(Notify::new());
        proto.borrow_mut().notifiers.insert(handle, notify.clone());
        spawn_connection_io(proto.clone(), handle, notify, recv);
    });
}

fn fail_head_of_queue(proto: &SharedProtocol, key: EndpointKey, err: ChirpError) {
    let mut p = proto.borrow_mut();
    if let Some(remote) = p.remotes.get_mut(&key) {
        let msg = remote
            .cntl_msg_queue
            .pop_front()
            .or_else(|| remote.msg_queue.pop_front());
        if let Some(msg) = msg {
            fail_message(&mut p, msg, err);
        }
    }
    // Debounce before retrying, matching spec.md §4.7.
    if let Some(remote) = p.remotes.get_mut(&key) {
        remote.flags.insert(RemoteFlags::CONN_BLOCKED);
    }
    drop(p);
    arm_debounce(proto.clone(), key);
}

fn arm_debounce(proto: SharedProtocol, key: EndpointKey) {
    tokio::task::spawn_local(async move {
        let ms = rand::thread_rng().gen_range(DEBOUNCE_MIN_MS, DEBOUNCE_MAX_MS + 1);
        tokio::time::delay_for(Duration::from_millis(ms)).await;
        let mut p = proto.borrow_mut();
        if let Some(remote) = p.remotes.get_mut(&key) {
            remote.flags.remove(RemoteFlags::CONN_BLOCKED);
        }
        drop(p);
        dispatch_for_remote(&proto, key);
    });
}

fn schedule_shutdown(proto: SharedProtocol, handle: ConnectionHandle, reason: ChirpError) {
    tokio::task::spawn_local(async move {
        shutdown_connection(&proto, handle, reason).await;
    });
}

/// Idempotent connection shutdown (spec.md §4.6). A second call on an
/// already-shutting-down or already-removed handle is a no-op.
async fn shutdown_connection(proto: &SharedProtocol, handle: ConnectionHandle, reason: ChirpError) {
    let (key, delete_remote, mut transport) = {
        let mut p = proto.borrow_mut();
        let conn = match p.connections.get_mut(handle) {
            Some(c) => c,
            None => return,
        };
        if conn.flags.contains(ConnFlags::SHUTTING_DOWN) {
            return;
        }
        conn.flags.insert(ConnFlags::SHUTTING_DOWN);
        let key = conn.remote_key;
        let delete_remote = conn.flags.contains(ConnFlags::DELETE_REMOTE);
        let transport = conn.transport.take();

        if let Some(done) = conn.writer.abort() {
            fail_message(&mut p, done, reason.clone());
        }
        (key, delete_remote, transport)
    };

    if let Some(key) = key {
        let mut p = proto.borrow_mut();
        let failed_msg = if let Some(remote) = p.remotes.get_mut(&key) {
            if remote.conn == Some(handle) {
                remote.conn = None;
            }
            let failed_msg = if let Some(wait) = remote.wait_ack_message.take() {
                Some(wait)
            } else {
                remote.msg_queue.pop_front()
            };
            remote.flags.insert(RemoteFlags::CONN_BLOCKED);
            Some(failed_msg)
        } else {
            None
        };
        if let Some(failed_msg) = failed_msg {
            if let Some(msg) = failed_msg {
                fail_message(&mut p, msg, reason.clone());
            }
            drop(p);
            arm_debounce(proto.clone(), key);
        }
    }

    let _ = transport.shutdown().await;

    let mut p = proto.borrow_mut();
    p.handshake_conns.remove(&handle);
    p.old_connections.remove(&handle);
    p.notifiers.remove(&handle);
    p.connections.remove(handle);
    if delete_remote {
        if let Some(key) = key {
            p.remotes.remove(&key);
        }
    }
    if p.closing && p.close_semaphore > 0 {
        p.close_semaphore -= 1;
        if p.close_semaphore == 0 {
            p.close_notify.notify();
        }
    }
}

fn enqueue_and_dispatch(
    proto: SharedProtocol,
    msg: Message,
    is_control: bool,
    cb: Option<SendCallback>,
) {
    let key = msg.endpoint();
    let mut msg = msg;
    let mut p = proto.borrow_mut();
    if let Some(c) = cb {
        msg.callback_id = Some(p.register_callback(c));
    }
    {
        let remote = p.remotes.entry(key).or_insert_with(|| Remote::new(key));
        if is_control {
            remote.cntl_msg_queue.push_back(msg);
        } else {
            remote.msg_queue.push_back(msg);
        }
    }
    drop(p);
    dispatch_for_remote(&proto, key);
}

fn release_msg_slot(proto: &SharedProtocol, msg: Message) {
    let slot = match msg.slot_index() {
        Some(s) => s,
        None => return,
    };
    let pool = match &msg.pool {
        Some(p) => p.clone(),
        None => return,
    };
    pool.release(slot);
    pool.drop_refcount();

    if msg.flags_contains_send_ack() {
        let mut ack = msg.make_ack_for();
        ack.address = msg.address;
        ack.port = msg.port;
        enqueue_and_dispatch(proto.clone(), ack, true, None);
    }

    if let Some(handle) = msg.conn_handle {
        let mut p = proto.borrow_mut();
        let was_stopped = p
            .connections
            .get(handle)
            .map(|c| c.flags.contains(ConnFlags::STOPPED))
            .unwrap_or(false);
        if was_stopped {
            if let Some(conn) = p.connections.get_mut(handle) {
                conn.flags.remove(ConnFlags::STOPPED);
            }
            if let Some(n) = p.notify_for(handle) {
                n.notify();
            }
        }
    }
}
