//! Top-level lifecycle: configuration, start/close bookkeeping, and the
//! two cross-thread trampoline operations (`send_ts`,
//! `release_msg_slot_ts`).
//!
//! Mirrors the C core's `chirp_t` façade over `Protocol`, but replaces
//! the mutex-guarded FIFO + async-handle trampoline with a bounded
//! `tokio::sync::mpsc` channel per Design Notes §9 ("Cross-thread
//! send"): the channel's sender half is `Send`, so
//! [`ChirpHandle::send_ts`] can be called from any thread, while the
//! receiver is drained by a task pinned to the same `LocalSet` as
//! every other piece of protocol state.

use std::cell::RefCell;
use std::rc::Rc;

use slog::{o, Drain, Logger};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{ChirpError, Result};
use crate::hooks::{DefaultHooks, Hooks};
use crate::message::{Message, RecvCallback, SendCallback};
use crate::protocol::Protocol;
use crate::tls::TlsEnv;

enum TsOp {
    Send(Message, SendCallback),
    Release(Message),
    Close,
}

/// A `Send` handle that may be moved to another OS thread to enqueue
/// work back onto the `Chirp` instance's I/O task.
#[derive(Clone)]
pub struct ChirpHandle {
    ts_tx: mpsc::UnboundedSender<TsOp>,
}

impl ChirpHandle {
    pub fn send_ts(&self, msg: Message, cb: SendCallback) {
        let _ = self.ts_tx.send(TsOp::Send(msg, cb));
    }

    pub fn release_msg_slot_ts(&self, msg: Message) {
        let _ = self.ts_tx.send(TsOp::Release(msg));
    }

    /// Triggers `close` on the I/O thread. There is no cross-thread way
    /// to await drain completion; call [`Chirp::closed`] from the I/O
    /// thread itself if the caller needs to know when it finishes.
    pub fn close_ts(&self) {
        let _ = self.ts_tx.send(TsOp::Close);
    }
}

/// The embeddable library entry point. Not `Send`/`Sync` — it must be
/// driven from the `tokio::task::LocalSet` it was created on; use
/// [`Chirp::handle`] to get a `Send` handle for other threads.
pub struct Chirp {
    protocol: Protocol,
    hooks: Box<dyn Hooks>,
    recv: Rc<RefCell<Option<RecvCallback>>>,
    ts_tx: mpsc::UnboundedSender<TsOp>,
    local_identity: [u8; 16],
    logger: Logger,
}

fn default_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("crate" => "chirp"))
}

impl Chirp {
    /// Validates `config`, resolves a random identity if none was
    /// configured, and loads TLS material if encryption is enabled.
    /// Returns synchronously; nothing here touches a callback (spec.md
    /// §7 "configuration problems ... never reach a callback").
    pub fn new(config: Config) -> Result<Chirp> {
        Chirp::with_hooks(config, Box::new(DefaultHooks))
    }

    pub fn with_hooks(config: Config, hooks: Box<dyn Hooks>) -> Result<Chirp> {
        let config = config.validate()?;
        let logger = default_logger();

        let identity = if config.identity == [0; 16] {
            hooks.generate_identity()
        } else {
            config.identity
        };

        let tls_env = if config.disable_encryption {
            None
        } else {
            let cert = config
                .cert_chain_pem
                .as_ref()
                .ok_or_else(|| ChirpError::ValueError("cert_chain_pem required".into()))?;
            let dh = config
                .dh_params_pem
                .as_ref()
                .ok_or_else(|| ChirpError::ValueError("dh_params_pem required".into()))?;
            Some(Rc::new(TlsEnv::load(cert, dh)?))
        };

        let protocol = Protocol::new(config, identity, logger.clone(), tls_env);
        let (ts_tx, ts_rx) = mpsc::unbounded_channel();
        let recv = Rc::new(RefCell::new(None));

        let chirp = Chirp {
            protocol,
            hooks,
            recv,
            ts_tx,
            local_identity: identity,
            logger,
        };
        chirp.spawn_ts_drain(ts_rx);
        Ok(chirp)
    }

    pub fn identity(&self) -> [u8; 16] {
        self.local_identity
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Binds the listening sockets and begins accepting connections.
    /// `on_recv` is invoked once per fully reassembled inbound message,
    /// on the `LocalSet` task this `Chirp` instance runs on.
    pub async fn start(&self, on_recv: impl FnMut(Message) + 'static) -> Result<()> {
        *self.recv.borrow_mut() = Some(Box::new(on_recv));
        let recv = self.recv.clone();
        let dispatch: Rc<dyn Fn(Message)> = Rc::new(move |msg: Message| {
            if let Some(cb) = recv.borrow_mut().as_mut() {
                cb(msg);
            }
        });
        self.protocol.start(dispatch).await
    }

    pub fn send(&self, msg: Message, cb: SendCallback) {
        self.protocol.send(msg, cb);
    }

    pub fn release_msg_slot(&self, msg: Message) {
        self.protocol.release_msg_slot(msg);
    }

    /// A `Send` handle for calling `send`/`release_msg_slot` from
    /// threads other than the one driving this `Chirp`'s `LocalSet`.
    pub fn handle(&self) -> ChirpHandle {
        ChirpHandle {
            ts_tx: self.ts_tx.clone(),
        }
    }

    fn spawn_ts_drain(&self, mut rx: mpsc::UnboundedReceiver<TsOp>) {
        let protocol = self.protocol.clone();
        tokio::task::spawn_local(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    TsOp::Send(msg, cb) => protocol.send(msg, cb),
                    TsOp::Release(msg) => protocol.release_msg_slot(msg),
                    TsOp::Close => protocol.close(),
                }
            }
        });
    }

    /// Installs a `tokio::signal::ctrl_c` handler that calls
    /// [`Chirp::close`] once, unless `Config::disable_signals` is set.
    pub fn close_on_ctrl_c(&self) {
        if self.protocol.0.borrow().config.disable_signals {
            return;
        }
        let protocol = self.protocol.clone();
        tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                protocol.close();
            }
        });
    }

    /// Shuts down every connection and empties every Remote's queues
    /// with `SHUTDOWN`. Synchronous: the actual handle teardown
    /// happens on already-spawned tasks.
    pub fn close(&self) {
        self.protocol.close();
    }

    /// Resolves once every handle counted at `close()` time has run its
    /// final close callback (spec.md §4.9's `closing_tasks` semaphore
    /// reaching zero). Call after `close()` to wait for full drain
    /// before dropping this `Chirp`.
    pub async fn closed(&self) {
        self.protocol.closed().await
    }
}

impl Drop for Chirp {
    fn drop(&mut self) {
        if !self.protocol.0.borrow().closing {
            slog::warn!(self.logger, "Chirp dropped without an explicit close(); closing now");
            self.protocol.close();
        }
    }
}
