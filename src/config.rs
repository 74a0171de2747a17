//! Runtime configuration.
//!
//! Builder-style options with build-time validation, plus optional TOML
//! file loading. File values override the current builder state; builder
//! calls made after loading take precedence over the file.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;

/// Hard cap on the spill store, independent of machine size.
pub const MAX_STORE_SIZE: u64 = 1 << 33;

/// Builds the pipeline for each new session of one side.
pub type SessionInitializer = Arc<dyn Fn(&mut Pipeline) + Send + Sync>;

/// Lifecycle hooks for the event loop itself.
pub trait EventLoopListener: Send + Sync {
    /// The loop thread is about to enter its first iteration.
    fn on_start(&self) {}
    /// The loop has terminated and released its resources. Called exactly
    /// once, on both graceful shutdown and fatal selector errors.
    fn on_destroy(&self) {}
    /// An error that could not be delivered to any session pipeline.
    fn on_error(&self, _error: &Error) {}
}

impl<T: EventLoopListener + ?Sized> EventLoopListener for Arc<T> {
    fn on_start(&self) {
        T::on_start(self)
    }
    fn on_destroy(&self) {
        T::on_destroy(self)
    }
    fn on_error(&self, error: &Error) {
        T::on_error(self, error)
    }
}

/// Resolved runtime configuration. Produced by [`Config::builder`].
#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub daemon: bool,
    pub name: String,
    pub max_server_conns: usize,
    pub max_client_conns: usize,
    pub auto_read: bool,
    pub buffer_direct: bool,
    pub buffer_size: usize,
    pub pool_size: usize,
    pub store_size: u64,
    pub max_read_buffers: usize,
    pub max_write_buffers: usize,
    pub write_spin_count: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub server_initializer: Option<SessionInitializer>,
    pub client_initializer: Option<SessionInitializer>,
    pub event_loop_listener: Option<Arc<dyn EventLoopListener>>,
    pub clock: Arc<dyn Clock>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backlog", &self.backlog)
            .field("name", &self.name)
            .field("max_server_conns", &self.max_server_conns)
            .field("max_client_conns", &self.max_client_conns)
            .field("buffer_size", &self.buffer_size)
            .field("pool_size", &self.pool_size)
            .field("store_size", &self.store_size)
            .finish_non_exhaustive()
    }
}

/// Total physical memory, used to size the default pools.
fn physical_memory() -> Option<u64> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages > 0 && page_size > 0 {
        Some(pages as u64 * page_size as u64)
    } else {
        None
    }
}

fn default_pool_size() -> usize {
    let half = physical_memory().map_or(1 << 30, |m| m / 2);
    half.min(usize::MAX as u64) as usize
}

fn default_store_size() -> u64 {
    physical_memory().map_or(MAX_STORE_SIZE, |m| (m * 2).min(MAX_STORE_SIZE))
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    host: String,
    port: u16,
    backlog: u32,
    daemon: bool,
    name: String,
    max_server_conns: usize,
    max_client_conns: usize,
    auto_read: bool,
    buffer_direct: bool,
    buffer_size: usize,
    pool_size: usize,
    store_size: u64,
    max_read_buffers: usize,
    max_write_buffers: usize,
    write_spin_count: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    server_initializer: Option<SessionInitializer>,
    client_initializer: Option<SessionInitializer>,
    event_loop_listener: Option<Arc<dyn EventLoopListener>>,
    clock: Arc<dyn Clock>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9696,
            backlog: 1024,
            daemon: false,
            name: "spillway".to_string(),
            max_server_conns: 1024,
            max_client_conns: 1024,
            auto_read: true,
            buffer_direct: true,
            buffer_size: 8192,
            pool_size: default_pool_size(),
            store_size: default_store_size(),
            max_read_buffers: 8,
            max_write_buffers: 64,
            write_spin_count: 16,
            connect_timeout: Duration::from_millis(30_000),
            read_timeout: Duration::from_millis(30_000),
            write_timeout: Duration::from_millis(60_000),
            server_initializer: None,
            client_initializer: None,
            event_loop_listener: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl ConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Detach the loop thread: dropping the runtime neither shuts it down
    /// nor joins it.
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Name for the loop thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set both session-table capacities at once.
    pub fn max_conns(mut self, max: usize) -> Self {
        self.max_server_conns = max;
        self.max_client_conns = max;
        self
    }

    pub fn max_server_conns(mut self, max: usize) -> Self {
        self.max_server_conns = max;
        self
    }

    pub fn max_client_conns(mut self, max: usize) -> Self {
        self.max_client_conns = max;
        self
    }

    /// Assert read interest automatically when a session opens.
    pub fn auto_read(mut self, on: bool) -> Self {
        self.auto_read = on;
        self
    }

    /// Select the slab-backed pool (true) or per-allocation pool (false).
    pub fn buffer_direct(mut self, direct: bool) -> Self {
        self.buffer_direct = direct;
        self
    }

    /// Size of each pooled buffer in bytes; must be a power of two.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Byte budget for the memory pool.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Byte budget for the spill store; capped at [`MAX_STORE_SIZE`].
    pub fn store_size(mut self, size: u64) -> Self {
        self.store_size = size;
        self
    }

    /// Resident input buffers per session before read backpressure.
    pub fn max_read_buffers(mut self, max: usize) -> Self {
        self.max_read_buffers = max;
        self
    }

    /// Resident output buffers per session before spilling to the store.
    pub fn max_write_buffers(mut self, max: usize) -> Self {
        self.max_write_buffers = max;
        self
    }

    /// Successful socket writes per session per loop turn.
    pub fn write_spin_count(mut self, count: usize) -> Self {
        self.write_spin_count = count;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Pipeline setup for accepted sessions. Enables the listener.
    pub fn server_initializer<F>(mut self, init: F) -> Self
    where
        F: Fn(&mut Pipeline) + Send + Sync + 'static,
    {
        self.server_initializer = Some(Arc::new(init));
        self
    }

    /// Pipeline setup for dialed sessions.
    pub fn client_initializer<F>(mut self, init: F) -> Self
    where
        F: Fn(&mut Pipeline) + Send + Sync + 'static,
    {
        self.client_initializer = Some(Arc::new(init));
        self
    }

    pub fn event_loop_listener(mut self, listener: impl EventLoopListener + 'static) -> Self {
        self.event_loop_listener = Some(Arc::new(listener));
        self
    }

    /// Replace the clock, for deterministic tests.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Fill builder fields from a TOML file.
    pub fn load_toml_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        self.load_toml_str(&contents)
            .map_err(|e| Error::Config(format!("in {}: {e}", path.display())))
    }

    /// Fill builder fields from a TOML document.
    pub fn load_toml_str(mut self, contents: &str) -> Result<Self> {
        let parsed: TomlConfig =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;

        let TomlConfig {
            server,
            limits,
            buffers,
            timeouts,
        } = parsed;

        if let Some(host) = server.host {
            self.host = host;
        }
        if let Some(port) = server.port {
            self.port = port;
        }
        if let Some(backlog) = server.backlog {
            self.backlog = backlog;
        }
        if let Some(name) = server.name {
            self.name = name;
        }
        if let Some(daemon) = server.daemon {
            self.daemon = daemon;
        }
        if let Some(max) = limits.max_conns {
            self.max_server_conns = max;
            self.max_client_conns = max;
        }
        if let Some(max) = limits.max_server_conns {
            self.max_server_conns = max;
        }
        if let Some(max) = limits.max_client_conns {
            self.max_client_conns = max;
        }
        if let Some(direct) = buffers.direct {
            self.buffer_direct = direct;
        }
        if let Some(size) = buffers.buffer_size {
            self.buffer_size = size;
        }
        if let Some(size) = buffers.pool_size {
            self.pool_size = size;
        }
        if let Some(size) = buffers.store_size {
            self.store_size = size;
        }
        if let Some(max) = buffers.max_read_buffers {
            self.max_read_buffers = max;
        }
        if let Some(max) = buffers.max_write_buffers {
            self.max_write_buffers = max;
        }
        if let Some(count) = buffers.write_spin_count {
            self.write_spin_count = count;
        }
        if let Some(ms) = timeouts.connect_ms {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = timeouts.read_ms {
            self.read_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = timeouts.write_ms {
            self.write_timeout = Duration::from_millis(ms);
        }
        Ok(self)
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<Config> {
        if self.server_initializer.is_none() && self.client_initializer.is_none() {
            return Err(Error::Config(
                "at least one of server/client initializer is required".to_string(),
            ));
        }
        if self.host.parse::<IpAddr>().is_err() {
            return Err(Error::Config(format!(
                "host is not an IP address: {}",
                self.host
            )));
        }
        if self.buffer_size == 0 || !self.buffer_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "buffer size must be a power of two, got {}",
                self.buffer_size
            )));
        }
        if self.pool_size < self.buffer_size {
            return Err(Error::Config(format!(
                "pool size {} is below one buffer of {}",
                self.pool_size, self.buffer_size
            )));
        }
        if self.store_size < self.buffer_size as u64 {
            return Err(Error::Config(format!(
                "store size {} is below one region of {}",
                self.store_size, self.buffer_size
            )));
        }
        if self.store_size > MAX_STORE_SIZE {
            return Err(Error::Config(format!(
                "store size {} exceeds the {MAX_STORE_SIZE} cap",
                self.store_size
            )));
        }
        for (field, value) in [
            ("backlog", self.backlog as usize),
            ("max server conns", self.max_server_conns),
            ("max client conns", self.max_client_conns),
            ("max read buffers", self.max_read_buffers),
            ("max write buffers", self.max_write_buffers),
            ("write spin count", self.write_spin_count),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{field} must be positive")));
            }
        }

        Ok(Config {
            host: self.host,
            port: self.port,
            backlog: self.backlog,
            daemon: self.daemon,
            name: self.name,
            max_server_conns: self.max_server_conns,
            max_client_conns: self.max_client_conns,
            auto_read: self.auto_read,
            buffer_direct: self.buffer_direct,
            buffer_size: self.buffer_size,
            pool_size: self.pool_size,
            store_size: self.store_size,
            max_read_buffers: self.max_read_buffers,
            max_write_buffers: self.max_write_buffers,
            write_spin_count: self.write_spin_count,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            server_initializer: self.server_initializer,
            client_initializer: self.client_initializer,
            event_loop_listener: self.event_loop_listener,
            clock: self.clock,
        })
    }
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    limits: LimitsSection,
    #[serde(default)]
    buffers: BuffersSection,
    #[serde(default)]
    timeouts: TimeoutsSection,
}

#[derive(Debug, Deserialize, Default)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
    backlog: Option<u32>,
    name: Option<String>,
    daemon: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitsSection {
    max_conns: Option<usize>,
    max_server_conns: Option<usize>,
    max_client_conns: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct BuffersSection {
    direct: Option<bool>,
    buffer_size: Option<usize>,
    pool_size: Option<usize>,
    store_size: Option<u64>,
    max_read_buffers: Option<usize>,
    max_write_buffers: Option<usize>,
    write_spin_count: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TimeoutsSection {
    connect_ms: Option<u64>,
    read_ms: Option<u64>,
    write_ms: Option<u64>,
}
