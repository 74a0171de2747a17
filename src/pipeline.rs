//! Per-session handler pipeline.
//!
//! Handlers sit in a doubly-linked chain between two sentinels. Inbound
//! events (`on_connected`, `on_read`, `on_flushed`, `on_error`) travel
//! head to tail; outbound writes travel tail to head, ending at the head
//! sentinel where the payload must be byte-form and is appended to the
//! session's output stream.
//!
//! Delivery is queued rather than recursive: context helpers enqueue ops
//! and the session drains them in FIFO order, so a handler can re-emit,
//! write, or mutate the pipeline without reentering a node mid-dispatch.

use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use slab::Slab;

use crate::buffer::{Buffer, BufferInputStream};
use crate::error::{Error, Result};
use crate::session::Session;

/// Arena index of the head sentinel.
pub(crate) const HEAD: usize = 0;
/// Arena index of the tail sentinel.
pub(crate) const TAIL: usize = 1;

/// An outbound message travelling tail-to-head through the pipeline.
pub enum Payload {
    /// Byte-form payload, ready for the output stream.
    Bytes(Bytes),
    /// A pooled buffer, typically lifted straight off the input stream.
    Buffer(Buffer),
    /// An application object awaiting encoding by an outbound handler.
    Message(Box<dyn Any>),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Payload::Buffer(b) => f.debug_tuple("Buffer").field(&b.readable()).finish(),
            Payload::Message(_) => f.write_str("Message"),
        }
    }
}

/// A stage in the session pipeline.
///
/// Default bodies forward each event to the neighboring handler, so a
/// stage only overrides what it cares about. Returning `Err` routes
/// `on_error` through the pipeline; an error left unhandled at the tail
/// closes the session.
pub trait Handler {
    fn on_connected(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.fire_connected();
        Ok(())
    }

    /// Inbound bytes are ready on `ctx.input()`.
    fn on_read(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.fire_read();
        Ok(())
    }

    /// An outbound payload passing through on its way to the head.
    fn on_write(&mut self, ctx: &mut Context<'_>, payload: Payload) -> Result<()> {
        ctx.write(payload);
        Ok(())
    }

    /// The output stream just transitioned from non-empty to empty.
    fn on_flushed(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.fire_flushed();
        Ok(())
    }

    fn on_error(&mut self, ctx: &mut Context<'_>, error: Error) -> Result<()> {
        ctx.fire_error(error);
        Ok(())
    }
}

struct Node {
    name: String,
    /// `None` for the sentinels, and transiently while the handler is
    /// being invoked.
    handler: Option<Box<dyn Handler>>,
    prev: usize,
    next: usize,
}

/// The per-session chain of handler nodes.
///
/// Nodes live in an arena and link by index; the sentinels occupy
/// indices 0 and 1 for the life of the session.
pub struct Pipeline {
    nodes: Slab<Node>,
}

impl Pipeline {
    pub(crate) fn new() -> Self {
        let mut nodes = Slab::new();
        let head = nodes.insert(Node {
            name: "head".to_string(),
            handler: None,
            prev: usize::MAX,
            next: usize::MAX,
        });
        let tail = nodes.insert(Node {
            name: "tail".to_string(),
            handler: None,
            prev: usize::MAX,
            next: usize::MAX,
        });
        debug_assert_eq!((head, tail), (HEAD, TAIL));
        nodes[HEAD].next = TAIL;
        nodes[TAIL].prev = HEAD;
        Self { nodes }
    }

    /// Number of user handlers in the chain.
    pub fn len(&self) -> usize {
        self.nodes.len() - 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a handler just before the tail.
    pub fn add_last(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        let prev = self.nodes[TAIL].prev;
        self.insert_between(name.into(), Box::new(handler), prev, TAIL);
    }

    /// Insert a handler just after the head.
    pub fn add_first(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        let next = self.nodes[HEAD].next;
        self.insert_between(name.into(), Box::new(handler), HEAD, next);
    }

    fn insert_between(&mut self, name: String, handler: Box<dyn Handler>, prev: usize, next: usize) {
        let idx = self.nodes.insert(Node {
            name,
            handler: Some(handler),
            prev,
            next,
        });
        self.nodes[prev].next = idx;
        self.nodes[next].prev = idx;
    }

    /// Unlink and drop the named handler. Returns whether it was found.
    pub fn remove(&mut self, name: &str) -> bool {
        let found = self
            .nodes
            .iter()
            .find(|(idx, n)| *idx != HEAD && *idx != TAIL && n.name == name)
            .map(|(idx, _)| idx);
        match found {
            Some(idx) => {
                let node = self.nodes.remove(idx);
                self.nodes[node.prev].next = node.next;
                self.nodes[node.next].prev = node.prev;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes
            .iter()
            .any(|(idx, n)| idx != HEAD && idx != TAIL && n.name == name)
    }

    /// Handler names, head to tail.
    pub fn names(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.len());
        let mut idx = self.nodes[HEAD].next;
        while idx != TAIL {
            out.push(self.nodes[idx].name.as_str());
            idx = self.nodes[idx].next;
        }
        out
    }

    /// First user node (or the tail sentinel when the chain is empty).
    pub(crate) fn first(&self) -> usize {
        self.nodes[HEAD].next
    }

    /// Last user node (or the head sentinel when the chain is empty).
    pub(crate) fn last(&self) -> usize {
        self.nodes[TAIL].prev
    }

    pub(crate) fn next_of(&self, idx: usize) -> usize {
        self.nodes.get(idx).map_or(TAIL, |n| n.next)
    }

    pub(crate) fn prev_of(&self, idx: usize) -> usize {
        self.nodes.get(idx).map_or(HEAD, |n| n.prev)
    }

    pub(crate) fn name_of(&self, idx: usize) -> &str {
        self.nodes.get(idx).map_or("?", |n| n.name.as_str())
    }

    /// Move the handler out for invocation; `restore_handler` puts it
    /// back unless the node was removed meanwhile.
    pub(crate) fn take_handler(&mut self, idx: usize) -> Option<Box<dyn Handler>> {
        self.nodes.get_mut(idx).and_then(|n| n.handler.take())
    }

    pub(crate) fn restore_handler(&mut self, idx: usize, handler: Box<dyn Handler>) {
        if let Some(node) = self.nodes.get_mut(idx) {
            node.handler = Some(handler);
        }
    }
}

/// A queued pipeline event, addressed to an arena node.
#[derive(Debug)]
pub(crate) enum Op {
    Connected(usize),
    Read(usize),
    Write(usize, Payload),
    Flushed(usize),
    Error(usize, Error),
}

/// A handler's view of its session during one event invocation.
///
/// Everything a handler can do goes through here: re-emit events, write
/// and flush, toggle interests, rent buffers, and mutate the pipeline.
pub struct Context<'a> {
    pub(crate) session: &'a mut Session,
    pub(crate) node: usize,
    pub(crate) ops: &'a mut VecDeque<Op>,
}

impl Context<'_> {
    /// Pass `on_connected` to the next handler.
    pub fn fire_connected(&mut self) {
        let next = self.session.pipeline().next_of(self.node);
        self.ops.push_back(Op::Connected(next));
    }

    /// Pass `on_read` to the next handler.
    pub fn fire_read(&mut self) {
        let next = self.session.pipeline().next_of(self.node);
        self.ops.push_back(Op::Read(next));
    }

    /// Pass `on_flushed` to the next handler.
    pub fn fire_flushed(&mut self) {
        let next = self.session.pipeline().next_of(self.node);
        self.ops.push_back(Op::Flushed(next));
    }

    /// Pass an error to the next handler.
    pub fn fire_error(&mut self, error: Error) {
        let next = self.session.pipeline().next_of(self.node);
        self.ops.push_back(Op::Error(next, error));
    }

    /// Send a payload outbound from this point toward the head.
    pub fn write(&mut self, payload: Payload) {
        let prev = self.session.pipeline().prev_of(self.node);
        self.ops.push_back(Op::Write(prev, payload));
    }

    /// Request a drain toward the socket once the current events settle.
    pub fn flush(&mut self) {
        self.session.request_flush();
    }

    /// Close the session once the current events settle.
    pub fn close(&mut self) {
        self.session.request_close();
    }

    /// Enable or suspend read interest for the session.
    pub fn set_read_interest(&mut self, on: bool) {
        self.session.set_read_enabled(on);
    }

    /// Assert or clear write interest directly. Flushing manages this on
    /// its own; explicit control is for protocol handlers that pace
    /// their own drains.
    pub fn set_write_interest(&mut self, on: bool) {
        self.session.set_write_interest(on);
    }

    /// Rent a buffer from the session's memory pool.
    pub fn alloc_buffer(&mut self) -> Result<Buffer> {
        self.session.alloc_buffer()
    }

    /// The session's inbound byte stream.
    pub fn input(&mut self) -> &mut BufferInputStream {
        self.session.input_mut()
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.peer_addr()
    }

    /// Name of the handler node currently executing.
    pub fn handler_name(&self) -> &str {
        self.session.pipeline().name_of(self.node)
    }

    /// The session's pipeline, for live mutation.
    pub fn pipeline(&mut self) -> &mut Pipeline {
        self.session.pipeline_mut()
    }
}
