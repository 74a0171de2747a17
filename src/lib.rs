//! spillway: a single-threaded non-blocking TCP runtime.
//!
//! One event-loop thread drives every connection through a per-session
//! pipeline of handlers:
//! - Readiness-driven I/O on a single selector; accepted and dialed
//!   sessions live in slotted tables with hard capacity bounds
//! - Tiered buffering: fixed-size pooled memory buffers that spill to a
//!   file-backed region store under write pressure
//! - Read backpressure by interest deassertion once a session holds too
//!   many undrained input buffers
//! - Timed tasks, deferred tasks, connect/read/write timeouts, and
//!   graceful shutdown that lets in-flight flushes finish
//!
//! External threads talk to the loop through [`Handle`]: `connect`,
//! `schedule`, `execute`, and `shutdown`. Everything else — including
//! every [`Handler`] callback — runs on the loop thread.
//!
//! ```no_run
//! use spillway::{Config, Context, Handler, Payload, Result, Runtime};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_read(&mut self, ctx: &mut Context<'_>) -> Result<()> {
//!         let mut data = vec![0u8; ctx.input().available()];
//!         ctx.input().read(&mut data)?;
//!         ctx.write(Payload::Bytes(data.into()));
//!         ctx.flush();
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = Config::builder()
//!         .host("127.0.0.1")
//!         .port(9696)
//!         .server_initializer(|pipeline| pipeline.add_last("echo", Echo))
//!         .build()?;
//!     let mut runtime = Runtime::start(config)?;
//!     runtime.join();
//!     Ok(())
//! }
//! ```

mod buffer;
mod clock;
mod config;
mod error;
mod pipeline;
mod runtime;
mod session;

pub use buffer::{
    Buffer, BufferInputStream, BufferOutputStream, BufferPool, DrainStatus, FileRegion, FileStore,
    FillOutcome, HeapBufferPool, PoolRef, SlabBufferPool, StoreRef,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    Config, ConfigBuilder, EventLoopListener, SessionInitializer, MAX_STORE_SIZE,
};
pub use error::{Error, IdleKind, Result};
pub use pipeline::{Context, Handler, Payload, Pipeline};
pub use runtime::{Handle, Runtime, TimerHandle};
