//! The selector-driven event loop.
//!
//! One thread, one selector. Each turn: honor a shutdown request, open
//! queued dials, poll with the nearest timer or idle deadline as the
//! timeout, dispatch readiness by token, run due timers, sweep idle
//! sessions, then drain the executor queue.

mod handle;
mod timer;
mod token;

pub use handle::{Handle, Runtime};
pub use timer::TimerHandle;

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferPool, FileStore, HeapBufferPool, PoolRef, SlabBufferPool, StoreRef};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::{Session, SessionManager, SessionSettings, Side};

use handle::{ConnRequest, Shared};
use timer::{TimerEntry, TimerKind};
use token::TokenKind;

const EVENTS_CAPACITY: usize = 1024;

/// A dial that has been opened but has not reported connectable yet.
///
/// Races against its deadline timer: whichever resolves first cancels
/// the other through the shared flag.
struct PendingConnect {
    stream: TcpStream,
    addr: SocketAddr,
    timeout: Duration,
    cancelled: Arc<AtomicBool>,
}

pub(crate) struct EventLoop {
    config: Config,
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    pool: PoolRef,
    store: StoreRef,
    servers: SessionManager,
    clients: SessionManager,
    pending: Slab<PendingConnect>,
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    local_addr: Option<SocketAddr>,
    destroyed: bool,
}

impl EventLoop {
    pub(crate) fn new(config: Config, poll: Poll, shared: Arc<Shared>) -> Result<Self> {
        let pool: PoolRef = if config.buffer_direct {
            Rc::new(RefCell::new(SlabBufferPool::new(
                config.pool_size,
                config.buffer_size,
            )?))
        } else {
            Rc::new(RefCell::new(HeapBufferPool::new(
                config.pool_size,
                config.buffer_size,
            )?))
        };
        let store: StoreRef = Rc::new(RefCell::new(FileStore::new(
            config.store_size,
            config.buffer_size,
        )?));

        let (listener, local_addr) = if config.server_initializer.is_some() {
            let addr: SocketAddr = format!("{}:{}", config.host, config.port)
                .parse()
                .map_err(|e| Error::Config(format!("bad listen address: {e}")))?;
            let mut listener = TcpListener::from_std(bind_listener(addr, config.backlog)?);
            poll.registry()
                .register(&mut listener, token::LISTENER, Interest::READABLE)?;
            let bound = listener.local_addr()?;
            info!(addr = %bound, backlog = config.backlog, "listening");
            (Some(listener), Some(bound))
        } else {
            (None, None)
        };

        let servers = SessionManager::new(Side::Server, config.max_server_conns);
        let clients = SessionManager::new(Side::Client, config.max_client_conns);
        let clock = Arc::clone(&config.clock);

        Ok(Self {
            config,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            pool,
            store,
            servers,
            clients,
            pending: Slab::new(),
            shared,
            clock,
            local_addr,
            destroyed: false,
        })
    }

    /// Bound listener address, once there is one.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn run(&mut self) {
        if let Some(hook) = &self.config.event_loop_listener {
            hook.on_start();
        }
        info!(name = %self.config.name, "event loop running");
        loop {
            match self.turn() {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "selector failure, terminating loop");
                    if let Some(hook) = &self.config.event_loop_listener {
                        hook.on_error(&e);
                    }
                    break;
                }
            }
        }
        self.destroy();
    }

    /// One loop iteration. `Ok(true)` means shutdown completed.
    fn turn(&mut self) -> Result<bool> {
        let now = self.clock.now();
        if self.shared.is_shutdown() {
            if self.continue_shutdown(now) {
                return Ok(true);
            }
        } else {
            self.drain_connect_requests(now);
        }

        let timeout = self.poll_timeout(self.clock.now());
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let now = self.clock.now();
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();
        for (tok, readable, writable) in ready {
            match token::decode(tok) {
                TokenKind::Waker => {}
                TokenKind::Listener => self.accept_ready(now),
                TokenKind::Pending(key) => self.connect_ready(key, now),
                TokenKind::Session(side, slot) => {
                    self.session_ready(side, slot, readable, writable, now)
                }
            }
        }

        self.run_due_timers();
        self.sweep_idle(self.clock.now());
        self.drain_tasks();
        Ok(false)
    }

    fn manager(&mut self, side: Side) -> &mut SessionManager {
        match side {
            Side::Server => &mut self.servers,
            Side::Client => &mut self.clients,
        }
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            auto_read: self.config.auto_read,
            max_read_buffers: self.config.max_read_buffers,
            max_write_buffers: self.config.max_write_buffers,
            write_spin_count: self.config.write_spin_count,
            read_timeout: self.config.read_timeout,
            write_timeout: self.config.write_timeout,
        }
    }

    /// Stop accepting, cancel pending dials, close sessions with nothing
    /// left to flush. True once both tables are empty.
    fn continue_shutdown(&mut self, now: Instant) -> bool {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            info!("listener closed for shutdown");
        }
        let keys: Vec<usize> = self.pending.iter().map(|(k, _)| k).collect();
        for key in keys {
            if let Some(pc) = self.pending.try_remove(key) {
                pc.cancelled.store(true, Ordering::Relaxed);
                let mut stream = pc.stream;
                let _ = self.poll.registry().deregister(&mut stream);
            }
        }
        for side in [Side::Server, Side::Client] {
            let slots = self.manager(side).occupied_slots();
            for slot in slots {
                if let Some(session) = self.manager(side).get_mut(slot) {
                    if session.output_pending() == 0 {
                        session.request_close();
                    }
                }
                self.finalize_session(side, slot, now);
            }
        }
        self.servers.is_completed() && self.clients.is_completed()
    }

    fn drain_connect_requests(&mut self, now: Instant) {
        loop {
            let req = self.shared.connects.lock().unwrap().pop_front();
            let Some(req) = req else { break };
            self.start_connect(req, now);
        }
    }

    fn start_connect(&mut self, req: ConnRequest, now: Instant) {
        debug!(addr = %req.addr, timeout = ?req.timeout, "dialing");
        match TcpStream::connect(req.addr) {
            Ok(mut stream) => {
                let key = self.pending.vacant_entry().key();
                let tok = token::pending_token(key);
                if let Err(e) = self
                    .poll
                    .registry()
                    .register(&mut stream, tok, Interest::WRITABLE)
                {
                    self.transient_error(Side::Client, Some(stream), e.into(), now);
                    return;
                }
                let cancelled = Arc::new(AtomicBool::new(false));
                if req.timeout > Duration::ZERO {
                    self.shared.timers.schedule(TimerEntry {
                        fire_at: now + req.timeout,
                        period: None,
                        cancelled: Arc::clone(&cancelled),
                        kind: TimerKind::ConnectDeadline(key),
                    });
                }
                self.pending.insert(PendingConnect {
                    stream,
                    addr: req.addr,
                    timeout: req.timeout,
                    cancelled,
                });
            }
            Err(e) => self.transient_error(Side::Client, None, e.into(), now),
        }
    }

    fn accept_ready(&mut self, now: Instant) {
        loop {
            let result = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match result {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted connection");
                    self.open_session(Side::Server, stream, Some(peer), now);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// OP_CONNECT equivalent: the dialed socket reported writable.
    fn connect_ready(&mut self, key: usize, now: Instant) {
        let outcome = {
            let Some(pc) = self.pending.get(key) else { return };
            match pc.stream.take_error() {
                Ok(Some(e)) => Some(Err(e)),
                Ok(None) => match pc.stream.peer_addr() {
                    Ok(peer) => Some(Ok(peer)),
                    // Spurious wakeup; the dial is still in flight.
                    Err(ref e) if e.kind() == io::ErrorKind::NotConnected => None,
                    Err(e) => Some(Err(e)),
                },
                Err(e) => Some(Err(e)),
            }
        };
        let Some(outcome) = outcome else { return };

        let PendingConnect {
            mut stream,
            addr,
            timeout: _,
            cancelled,
        } = self.pending.remove(key);
        cancelled.store(true, Ordering::Relaxed);
        let _ = self.poll.registry().deregister(&mut stream);

        match outcome {
            Ok(peer) => self.open_session(Side::Client, stream, Some(peer), now),
            Err(e) => {
                debug!(addr = %addr, error = %e, "dial failed");
                self.transient_error(Side::Client, Some(stream), e.into(), now);
            }
        }
    }

    /// Allocate a session for a connected socket and fire `on_connected`.
    fn open_session(&mut self, side: Side, stream: TcpStream, peer: Option<SocketAddr>, now: Instant) {
        let initializer = match side {
            Side::Server => self.config.server_initializer.clone(),
            Side::Client => self.config.client_initializer.clone(),
        };
        let settings = self.session_settings();
        let pool = Rc::clone(&self.pool);
        let store = Rc::clone(&self.store);

        let slot = match self.manager(side).allocate_slot() {
            Ok(slot) => slot,
            Err(e) => {
                warn!(side = ?side, error = %e, "session allocation failed");
                self.transient_error(side, Some(stream), e, now);
                return;
            }
        };
        let id = self.manager(side).next_session_id();
        let tok = token::session_token(side, slot);
        let mut session =
            Session::new(id, slot, side, tok, stream, peer, pool, store, settings, now);
        if let Some(init) = &initializer {
            init(session.pipeline_mut());
        }
        if let Err(e) = session.open() {
            warn!(session = id, error = %e, "session open failed");
            session.fire_error(e);
            session.close(self.poll.registry());
            return;
        }
        self.manager(side).place(slot, session);
        if let Some(session) = self.manager(side).get_mut(slot) {
            session.fire_connected();
        }
        self.finalize_session(side, slot, now);
    }

    fn session_ready(&mut self, side: Side, slot: usize, readable: bool, writable: bool, now: Instant) {
        {
            let mgr = self.manager(side);
            let Some(session) = mgr.get_mut(slot) else { return };
            if readable {
                if let Err(e) = session.handle_readable(now) {
                    session.fire_error(e);
                }
            }
            if writable && session.is_open() && !session.close_requested() {
                if let Err(e) = session.handle_writable(now) {
                    session.fire_error(e);
                }
            }
        }
        self.finalize_session(side, slot, now);
    }

    /// Settle a session after dispatch: honor close and flush requests,
    /// then reconcile its selector registration.
    fn finalize_session(&mut self, side: Side, slot: usize, now: Instant) {
        let shutting_down = self.shared.is_shutdown();
        let registry = self.poll.registry();
        let mgr = match side {
            Side::Server => &mut self.servers,
            Side::Client => &mut self.clients,
        };
        loop {
            let Some(session) = mgr.get_mut(slot) else { return };
            if session.close_requested() {
                session.close(registry);
                mgr.release(slot);
                return;
            }
            if session.take_flush_request() {
                if let Err(e) = session.flush(now) {
                    session.fire_error(e);
                }
                continue;
            }
            if shutting_down && session.output_pending() == 0 {
                session.request_close();
                continue;
            }
            if let Err(e) = session.sync_interest(registry) {
                warn!(session = session.id(), error = %e, "interest sync failed, closing");
                session.close(registry);
                mgr.release(slot);
            }
            return;
        }
    }

    /// Deliver an error that has no live session: build a transient one
    /// around the channel just to run `on_error`, per the side's
    /// initializer. Falls back to the loop listener hook.
    fn transient_error(&mut self, side: Side, stream: Option<TcpStream>, error: Error, now: Instant) {
        let initializer = match side {
            Side::Server => self.config.server_initializer.clone(),
            Side::Client => self.config.client_initializer.clone(),
        };
        match (initializer, stream) {
            (Some(init), Some(stream)) => {
                debug!(side = ?side, error = %error, "routing error through transient session");
                let settings = self.session_settings();
                let mut session = Session::new(
                    0,
                    usize::MAX,
                    side,
                    Token(usize::MAX),
                    stream,
                    None,
                    Rc::clone(&self.pool),
                    Rc::clone(&self.store),
                    settings,
                    now,
                );
                init(session.pipeline_mut());
                session.fire_error(error);
                session.close(self.poll.registry());
            }
            (_, stream) => {
                warn!(side = ?side, error = %error, "undeliverable error");
                if let Some(hook) = &self.config.event_loop_listener {
                    hook.on_error(&error);
                }
                drop(stream);
            }
        }
    }

    fn run_due_timers(&mut self) {
        let now = self.clock.now();
        for entry in self.shared.timers.take_due(now) {
            match entry.kind {
                TimerKind::Task(mut task) => {
                    if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                        error!("timer task panicked, dropping");
                        continue;
                    }
                    if let Some(period) = entry.period {
                        if !entry.cancelled.load(Ordering::Relaxed) {
                            self.shared.timers.schedule(TimerEntry {
                                fire_at: entry.fire_at + period,
                                period: Some(period),
                                cancelled: entry.cancelled,
                                kind: TimerKind::Task(task),
                            });
                        }
                    }
                }
                TimerKind::ConnectDeadline(key) => self.connect_deadline(key, now),
            }
        }
    }

    /// The dial lost the race against its deadline: close the channel
    /// and surface a connect timeout.
    fn connect_deadline(&mut self, key: usize, now: Instant) {
        let Some(pc) = self.pending.try_remove(key) else { return };
        let PendingConnect {
            mut stream,
            addr,
            timeout,
            cancelled,
        } = pc;
        cancelled.store(true, Ordering::Relaxed);
        let _ = self.poll.registry().deregister(&mut stream);
        warn!(addr = %addr, timeout = ?timeout, "connect timed out");
        self.transient_error(Side::Client, Some(stream), Error::ConnectTimeout(timeout), now);
    }

    fn sweep_idle(&mut self, now: Instant) {
        for side in [Side::Server, Side::Client] {
            let slots = self.manager(side).occupied_slots();
            for slot in slots {
                if let Some(session) = self.manager(side).get_mut(slot) {
                    session.check_idle(now);
                }
                self.finalize_session(side, slot, now);
            }
        }
    }

    fn drain_tasks(&mut self) {
        loop {
            let task = self.shared.tasks.lock().unwrap().pop_front();
            let Some(task) = task else { break };
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("executor task panicked");
            }
        }
    }

    /// Nearest deadline across timers and session idle bounds, as a poll
    /// timeout. `None` blocks until readiness or a wakeup.
    fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        let mut nearest = self.shared.timers.next_deadline();
        for mgr in [&self.servers, &self.clients] {
            for session in mgr.iter() {
                if let Some(deadline) = session.next_idle_deadline() {
                    nearest = Some(match nearest {
                        Some(n) => n.min(deadline),
                        None => deadline,
                    });
                }
            }
        }
        nearest.map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Terminal cleanup: close everything, delete the spill file, notify
    /// the listener hook exactly once.
    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let registry = self.poll.registry();
        for mgr in [&mut self.servers, &mut self.clients] {
            for slot in mgr.occupied_slots() {
                if let Some(mut session) = mgr.release(slot) {
                    session.close(registry);
                }
            }
        }
        let keys: Vec<usize> = self.pending.iter().map(|(k, _)| k).collect();
        for key in keys {
            if let Some(pc) = self.pending.try_remove(key) {
                pc.cancelled.store(true, Ordering::Relaxed);
                let mut stream = pc.stream;
                let _ = registry.deregister(&mut stream);
            }
        }
        if let Some(mut listener) = self.listener.take() {
            let _ = registry.deregister(&mut listener);
        }
        self.pool.borrow_mut().close();
        self.store.borrow_mut().close();
        info!(name = %self.config.name, "event loop destroyed");
        if let Some(hook) = &self.config.event_loop_listener {
            hook.on_destroy();
        }
    }
}

/// Listener socket with the configured backlog and address reuse.
fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    Ok(socket.into())
}
