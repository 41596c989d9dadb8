//! Reactor pool: the selector-thread triplet per reactor (spec.md §3) plus
//! the pool that spreads connections across however many reactors a
//! [`crate::config::ReactorPoolConfig`] asks for.

pub(crate) mod command;
pub(crate) mod registration;
mod thread;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mio::Token;

pub use registration::{Acceptor, ReactorProcessor, WriteOutcome, WriteRearm};

use crate::config::ReactorPoolConfig;
use crate::future::{self, CompletionFuture};
use command::{Command, IoSource};
use thread::{Role, RoleHandle};

/// Three selector threads (ACCEPT/READ/WRITE) and the token allocator shared
/// by every connection this reactor owns. Opaque outside the crate: an
/// `Arc<Reactor>` handed out by [`SelectorPool`] is only ever threaded back
/// into [`crate::acceptor`]/[`crate::channel`] constructors, never driven
/// directly by application code.
pub struct Reactor {
    accept: RoleHandle,
    read: RoleHandle,
    write: RoleHandle,
    next_token: AtomicUsize,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Reactor {
    fn spawn(pool_index: usize) -> io::Result<Self> {
        let (accept, accept_join) = thread::spawn(Role::Accept, pool_index)?;
        let (read, read_join) = thread::spawn(Role::Read, pool_index)?;
        let (write, write_join) = thread::spawn(Role::Write, pool_index)?;
        Ok(Self {
            accept,
            read,
            write,
            next_token: AtomicUsize::new(0),
            threads: vec![accept_join, read_join, write_join],
        })
    }

    /// Allocates a token shared by a connection's read-role and write-role
    /// registrations. Tokens are only ever compared within one role's
    /// registration table, so reuse across roles is safe; sharing the value
    /// just keeps one connection's two keys recognisable as a pair in logs.
    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn bind(&self, source: IoSource, token: Token, acceptor: Arc<dyn Acceptor>) -> CompletionFuture {
        let bound = CompletionFuture::new();
        self.accept.submit(Command::Bind { source, token, acceptor, bound: bound.clone() });
        bound
    }

    pub(crate) fn register_read(&self, source: IoSource, token: Token, processor: Arc<dyn ReactorProcessor>) -> CompletionFuture {
        let completion = CompletionFuture::new();
        self.read.submit(Command::Register { source, token, processor, completion: completion.clone() });
        completion
    }

    pub(crate) fn register_write(&self, source: IoSource, token: Token, processor: Arc<dyn ReactorProcessor>) -> CompletionFuture {
        let completion = CompletionFuture::new();
        self.write.submit(Command::Register { source, token, processor, completion: completion.clone() });
        completion
    }

    /// Registers an in-flight outbound connect on the READ role (spec.md
    /// §4.5's `registered(thread, key, OP_CONNECT)`), settled once
    /// [`ReactorProcessor::on_connectable`] returns.
    pub(crate) fn register_connecting(&self, source: IoSource, token: Token, processor: Arc<dyn ReactorProcessor>) -> CompletionFuture {
        let completion = CompletionFuture::new();
        self.read.submit(Command::RegisterConnecting { source, token, processor, completion: completion.clone() });
        completion
    }

    pub(crate) fn cancel_read(&self, token: Token, task: Option<Box<dyn FnOnce() + Send>>) -> CompletionFuture {
        let completion = CompletionFuture::new();
        self.read.submit(Command::Cancel { token, completion: completion.clone(), task });
        completion
    }

    pub(crate) fn cancel_write(&self, token: Token, task: Option<Box<dyn FnOnce() + Send>>) -> CompletionFuture {
        let completion = CompletionFuture::new();
        self.write.submit(Command::Cancel { token, completion: completion.clone(), task });
        completion
    }

    pub(crate) fn cancel_accept(&self, token: Token, task: Option<Box<dyn FnOnce() + Send>>) -> CompletionFuture {
        let completion = CompletionFuture::new();
        self.accept.submit(Command::Cancel { token, completion: completion.clone(), task });
        completion
    }

    /// Handle a [`ReactorProcessor`] installs as a handoff buffer's wakeup
    /// hook so releasing `chnIn` space rearms this key's `OP_WRITE` directly
    /// (spec.md §4.3 "Write rearm").
    pub(crate) fn write_rearm(&self, token: Token) -> WriteRearm {
        self.write.write_rearm(token)
    }

    pub(crate) fn close(&self) -> CompletionFuture {
        let accept_done = CompletionFuture::new();
        self.accept.submit(Command::Close { completion: accept_done.clone() });
        let read_done = CompletionFuture::new();
        self.read.submit(Command::Close { completion: read_done.clone() });
        let write_done = CompletionFuture::new();
        self.write.submit(Command::Close { completion: write_done.clone() });
        future::merge(vec![accept_done, read_done, write_done])
    }

    /// Blocks until all three selector threads have actually exited. Only
    /// meaningful after [`Reactor::close`]'s future has settled.
    pub(crate) fn join(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

/// Spreads newly accepted/connected channels across `N` reactors (spec.md
/// §3's "pool of reactors", each independently sized by
/// [`ReactorPoolConfig`]).
pub struct SelectorPool {
    reactors: Vec<Arc<Reactor>>,
    next: AtomicUsize,
}

impl SelectorPool {
    pub fn new(config: ReactorPoolConfig) -> io::Result<Self> {
        let count = config.num_reactors.max(1);
        let mut reactors = Vec::with_capacity(count);
        for index in 0..count {
            reactors.push(Arc::new(Reactor::spawn(index)?));
        }
        Ok(Self { reactors, next: AtomicUsize::new(0) })
    }

    /// Round-robin reactor selection for a newly accepted or outbound
    /// connection (spec.md §4.4: "route to the next reactor via the pool's
    /// selection policy").
    pub(crate) fn next_reactor(&self) -> Arc<Reactor> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        self.reactors[index].clone()
    }

    /// Fetches one specific reactor by index (e.g. to pin an acceptor's
    /// ACCEPT role to reactor 0 while connections still fan out across the
    /// whole pool via [`SelectorPool::next_reactor`]-driven routing inside
    /// [`crate::acceptor`]).
    pub fn reactor(&self, index: usize) -> Arc<Reactor> {
        self.reactors[index % self.reactors.len()].clone()
    }

    pub fn num_reactors(&self) -> usize {
        self.reactors.len()
    }

    /// Closes every reactor's three selector threads and waits for them to
    /// exit. Idempotent only in the sense that the underlying completion
    /// futures are; calling this twice submits a second, harmless close to
    /// an already-drained selector.
    pub fn close(&self) -> CompletionFuture {
        let futures = self.reactors.iter().map(|reactor| reactor.close()).collect();
        future::merge(futures)
    }
}
