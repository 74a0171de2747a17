//! The runtime owner and its cross-thread handle.
//!
//! External threads interact with the loop through exactly three entry
//! points — `connect`, `schedule`, and `execute` — plus an idempotent
//! `shutdown`. Each enqueues work and wakes the selector unless invoked
//! from the loop thread itself.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use mio::{Poll, Waker};
use tracing::warn;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::timer::{TimerEntry, TimerHandle, TimerKind, TimerQueue};
use crate::runtime::{token, EventLoop};

pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// A pending dial, enqueued by any thread and opened by the loop.
pub(crate) struct ConnRequest {
    pub addr: SocketAddr,
    pub timeout: Duration,
}

/// State shared between the loop thread and every handle.
pub(crate) struct Shared {
    pub waker: Waker,
    pub connects: Mutex<VecDeque<ConnRequest>>,
    pub timers: TimerQueue,
    pub tasks: Mutex<VecDeque<Task>>,
    pub shutdown: AtomicBool,
    pub loop_thread: OnceLock<ThreadId>,
    pub clock: Arc<dyn Clock>,
    pub connect_timeout: Duration,
}

impl Shared {
    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "selector wakeup failed");
        }
    }

    pub(crate) fn on_loop_thread(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Cloneable cross-thread handle to a running loop.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Dial `addr` with the configured connect timeout.
    pub fn connect(&self, addr: SocketAddr) {
        self.connect_with_timeout(addr, self.shared.connect_timeout);
    }

    /// Dial `addr`; a zero timeout disables the deadline.
    pub fn connect_with_timeout(&self, addr: SocketAddr, timeout: Duration) {
        self.shared
            .connects
            .lock()
            .unwrap()
            .push_back(ConnRequest { addr, timeout });
        if !self.shared.on_loop_thread() {
            self.shared.wake();
        }
    }

    /// Run `task` on the loop after `delay`, repeating every `period`
    /// when one is given. The returned handle cancels lazily.
    pub fn schedule<F>(&self, delay: Duration, period: Option<Duration>, task: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let entry = TimerEntry {
            fire_at: self.shared.clock.now() + delay,
            period,
            cancelled: Arc::new(AtomicBool::new(false)),
            kind: TimerKind::Task(Box::new(task)),
        };
        let handle = entry.handle();
        self.shared.timers.schedule(entry);
        if !self.shared.on_loop_thread() {
            self.shared.wake();
        }
        handle
    }

    /// Run `task` on the loop thread. Inline when already on it;
    /// otherwise enqueued in submission order.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.on_loop_thread() {
            task();
            return;
        }
        self.shared.tasks.lock().unwrap().push_back(Box::new(task));
        self.shared.wake();
    }

    /// Request loop termination. Idempotent; safe from any thread.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            self.shared.wake();
        }
    }
}

/// A running event loop and its thread.
///
/// Non-daemon runtimes shut down and join on drop; daemon runtimes
/// detach, matching the configured thread semantics.
pub struct Runtime {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
    daemon: bool,
    local_addr: Option<SocketAddr>,
}

impl Runtime {
    /// Spawn the loop thread, bind the listener when a server
    /// initializer is configured, and wait for startup to settle.
    pub fn start(config: Config) -> Result<Runtime> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), token::WAKER)?;
        let shared = Arc::new(Shared {
            waker,
            connects: Mutex::new(VecDeque::new()),
            timers: TimerQueue::new(),
            tasks: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
            loop_thread: OnceLock::new(),
            clock: Arc::clone(&config.clock),
            connect_timeout: config.connect_timeout,
        });

        let daemon = config.daemon;
        let thread_name = config.name.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let loop_shared = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let _ = loop_shared.loop_thread.set(thread::current().id());
                match EventLoop::new(config, poll, Arc::clone(&loop_shared)) {
                    Ok(mut event_loop) => {
                        let _ = ready_tx.send(Ok(event_loop.local_addr()));
                        event_loop.run();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(local_addr)) => Ok(Runtime {
                handle: Handle { shared },
                thread: Some(thread),
                daemon,
                local_addr,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Io(io::Error::other(
                    "event loop thread died during startup",
                )))
            }
        }
    }

    /// A cloneable cross-thread handle.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// The bound listener address, when serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connect(&self, addr: SocketAddr) {
        self.handle.connect(addr);
    }

    pub fn connect_with_timeout(&self, addr: SocketAddr, timeout: Duration) {
        self.handle.connect_with_timeout(addr, timeout);
    }

    pub fn schedule<F>(&self, delay: Duration, period: Option<Duration>, task: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.handle.schedule(delay, period, task)
    }

    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.execute(task)
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Wait for the loop thread to exit.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.daemon {
            return;
        }
        self.handle.shutdown();
        self.join();
    }
}
