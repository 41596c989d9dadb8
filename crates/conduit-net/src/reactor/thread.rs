use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use conduit_utils::safe_panic;
use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info_span, warn};

use crate::reactor::command::{Command, IoSource};
use crate::reactor::registration::{Registration, WriteOutcome, WriteRearm, is_close_signal};

/// Which of the three selector threads per reactor this is (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Accept,
    Read,
    Write,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::Accept => "accept",
            Role::Read => "read",
            Role::Write => "write",
        }
    }
}

const WAKE_TOKEN: Token = Token(usize::MAX);

enum RegisteredSource {
    TcpListener(mio::net::TcpListener),
    TcpStream(mio::net::TcpStream),
    UdpSocket(mio::net::UdpSocket),
}

impl RegisteredSource {
    fn register(&mut self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            RegisteredSource::TcpListener(s) => registry.register(s, token, interest),
            RegisteredSource::TcpStream(s) => registry.register(s, token, interest),
            RegisteredSource::UdpSocket(s) => registry.register(s, token, interest),
        }
    }

    fn reregister(&mut self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            RegisteredSource::TcpListener(s) => registry.reregister(s, token, interest),
            RegisteredSource::TcpStream(s) => registry.reregister(s, token, interest),
            RegisteredSource::UdpSocket(s) => registry.reregister(s, token, interest),
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) {
        let _ = match self {
            RegisteredSource::TcpListener(s) => registry.deregister(s),
            RegisteredSource::TcpStream(s) => registry.deregister(s),
            RegisteredSource::UdpSocket(s) => registry.deregister(s),
        };
    }
}

impl From<IoSource> for RegisteredSource {
    fn from(source: IoSource) -> Self {
        match source {
            IoSource::TcpListener(s) => RegisteredSource::TcpListener(s),
            IoSource::TcpStream(s) => RegisteredSource::TcpStream(s),
            IoSource::UdpSocket(s) => RegisteredSource::UdpSocket(s),
        }
    }
}

struct Entry {
    source: RegisteredSource,
    registration: Registration,
    /// READ role only: `true` while watching for connect completion via
    /// `Interest::WRITABLE` rather than ordinary readability.
    connecting: bool,
    /// WRITE role only: whether this key currently holds a live kernel
    /// registration. `wakeupWriter()` (spec.md §4.3) only re-registers when
    /// this is `false`; the write path clears it when `chnIn` runs dry.
    write_armed: bool,
}

/// One selector thread: owns a `mio::Poll`, a command queue, and (for the
/// WRITE role) the set of keys pending an `OP_WRITE` rearm. Spec.md §4.3's
/// "uniform main loop across roles" lives in [`SelectorThread::run`].
pub(crate) struct SelectorThread {
    role: Role,
    pool_index: usize,
    poll: Poll,
    waker: Arc<mio::Waker>,
    commands: Receiver<Command>,
    pending: Arc<AtomicBool>,
    rearm_set: Arc<Mutex<HashSet<Token>>>,
    registrations: HashMap<Token, Entry>,
}

/// Submission side of a [`SelectorThread`]'s command queue, handed to
/// acceptors/processors/channels. Cloneable and cheap: every clone shares
/// the same queue and waker.
#[derive(Clone)]
pub(crate) struct RoleHandle {
    pub(crate) role: Role,
    sender: Sender<Command>,
    pending: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
    rearm_set: Arc<Mutex<HashSet<Token>>>,
}

impl RoleHandle {
    /// Submits `command`; wakes the selector thread if this is the first
    /// command enqueued since its last drain (spec.md §4.3: "setting the
    /// flag atomically, first writer only").
    pub(crate) fn submit(&self, command: Command) {
        let _ = self.sender.send(command);
        if !self.pending.swap(true, Ordering::AcqRel) {
            let _ = self.waker.wake();
        }
    }

    /// Builds a [`WriteRearm`] handle for `token`. Only meaningful when
    /// `self.role == Role::Write`; constructing one for another role's
    /// handle is harmless but would never be acted on since nothing ever
    /// polls that role's rearm set.
    pub(crate) fn write_rearm(&self, token: Token) -> WriteRearm {
        WriteRearm { token, rearm_set: self.rearm_set.clone(), waker: self.waker.clone() }
    }
}

pub(crate) fn spawn(role: Role, pool_index: usize) -> io::Result<(RoleHandle, std::thread::JoinHandle<()>)> {
    let poll = Poll::new()?;
    let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
    let (tx, rx) = crossbeam_channel::unbounded();
    let pending = Arc::new(AtomicBool::new(false));
    let rearm_set = Arc::new(Mutex::new(HashSet::new()));

    let handle = RoleHandle { role, sender: tx, pending: pending.clone(), waker: waker.clone(), rearm_set: rearm_set.clone() };

    let thread = SelectorThread { role, pool_index, poll, waker, commands: rx, pending, rearm_set, registrations: HashMap::new() };

    let join = std::thread::Builder::new()
        .name(format!("conduit-{}-{}", role.label(), pool_index))
        .spawn(move || {
            conduit_utils::thread_boot(None, conduit_utils::ThreadPriority::OSDefault);
            thread.run();
        })?;

    Ok((handle, join))
}

impl SelectorThread {
    fn run(mut self) {
        let span = info_span!("selector_thread", role = self.role.label(), pool = self.pool_index);
        let _guard = span.enter();
        let mut events = Events::with_capacity(1024);
        let mut closed = false;

        while !closed {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, "selector poll failed, shutting down thread");
                break;
            }

            self.pending.store(false, Ordering::Release);
            closed = self.drain_commands();

            if self.role == Role::Write {
                self.drain_rearm_set();
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                self.dispatch(event.token(), event);
            }
        }

        debug!("selector thread exiting");
    }

    /// Returns `true` once a `Close` command has fully drained the
    /// registration table, signalling the main loop to exit.
    fn drain_commands(&mut self) -> bool {
        let mut closing = false;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Bind { source, token, acceptor, bound } => {
                    let ok = self.register_new(token, source, Registration::Acceptor(acceptor), Interest::READABLE, false, true);
                    bound.complete(if ok { Ok(()) } else { Err(conduit_comm::ChannelError::RegistrationFailed) });
                }
                Command::Register { source, token, processor, completion } => {
                    let interest = if self.role == Role::Write { Interest::WRITABLE } else { Interest::READABLE };
                    let ok = self.register_new(token, source, Registration::Processor(processor), interest, false, self.role == Role::Write);
                    completion.complete(if ok { Ok(()) } else { Err(conduit_comm::ChannelError::RegistrationFailed) });
                }
                Command::RegisterConnecting { source, token, processor, completion } => {
                    let ok = self.register_new(token, source, Registration::Processor(processor), Interest::WRITABLE, true, false);
                    if !ok {
                        completion.complete(Err(conduit_comm::ChannelError::RegistrationFailed));
                    }
                }
                Command::Cancel { token, completion, task } => {
                    self.cancel(token);
                    if let Some(task) = task {
                        task();
                    }
                    completion.complete(Ok(()));
                }
                Command::Close { completion } => {
                    for token in self.registrations.keys().copied().collect::<Vec<_>>() {
                        self.cancel(token);
                    }
                    completion.complete(Ok(()));
                    closing = true;
                }
            }
        }
        closing
    }

    #[allow(clippy::too_many_arguments)]
    fn register_new(
        &mut self,
        token: Token,
        source: IoSource,
        registration: Registration,
        interest: Interest,
        connecting: bool,
        write_armed: bool,
    ) -> bool {
        if self.registrations.contains_key(&token) {
            safe_panic!("bug: duplicate registration for token {:?}", token);
            return false;
        }
        let mut source: RegisteredSource = source.into();
        if let Err(err) = source.register(self.poll.registry(), token, interest) {
            warn!(?err, ?token, "registration failed");
            return false;
        }
        self.registrations.insert(token, Entry { source, registration, connecting, write_armed });
        true
    }

    fn cancel(&mut self, token: Token) {
        if let Some(mut entry) = self.registrations.remove(&token) {
            entry.source.deregister(self.poll.registry());
        }
        self.rearm_set.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&token);
    }

    fn drain_rearm_set(&mut self) {
        let tokens: Vec<Token> = {
            let mut set = self.rearm_set.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            set.drain().collect()
        };
        for token in tokens {
            let Some(entry) = self.registrations.get_mut(&token) else { continue };
            if entry.write_armed {
                continue;
            }
            if let Err(err) = entry.source.register(self.poll.registry(), token, Interest::WRITABLE) {
                warn!(?err, ?token, "write rearm failed");
                continue;
            }
            entry.write_armed = true;
        }
    }

    fn dispatch(&mut self, token: Token, event: &mio::event::Event) {
        match self.role {
            Role::Accept => {
                let close = match self.registrations.get(&token) {
                    Some(Entry { registration: Registration::Acceptor(acceptor), .. }) => {
                        acceptor.accept_ready();
                        false
                    }
                    Some(Entry { registration: Registration::Processor(_), .. }) => {
                        safe_panic!("bug: processor registered on ACCEPT role");
                        true
                    }
                    None => false,
                };
                if close {
                    self.cancel(token);
                }
            }
            Role::Read => {
                let Some(entry) = self.registrations.get_mut(&token) else { return };
                let Registration::Processor(processor) = &entry.registration else {
                    safe_panic!("bug: acceptor registered on READ role");
                    return;
                };
                let processor = processor.clone();
                let close = if entry.connecting {
                    let ok = processor.on_connectable();
                    if ok {
                        entry.connecting = false;
                        let _ = entry.source.reregister(self.poll.registry(), token, Interest::READABLE);
                    }
                    !ok
                } else {
                    is_close_signal(event) || !processor.on_readable()
                };
                if close {
                    self.cancel(token);
                    processor.on_closed_by_reactor();
                }
            }
            Role::Write => {
                let Some(entry) = self.registrations.get(&token) else { return };
                let Registration::Processor(processor) = &entry.registration else {
                    safe_panic!("bug: acceptor registered on WRITE role");
                    return;
                };
                let processor = processor.clone();
                match processor.on_writable() {
                    WriteOutcome::Continue => {}
                    WriteOutcome::Disable => self.disable_write(token),
                    WriteOutcome::Close => {
                        self.cancel(token);
                        processor.on_closed_by_reactor();
                    }
                }
            }
        }
    }

    /// WRITE role only: deregisters `OP_WRITE` for `token` without dropping
    /// its entry, so a later `wakeupWriter()` can cheaply re-register it
    /// (spec.md §4.5.1 "disable OP_WRITE on the write key").
    fn disable_write(&mut self, token: Token) {
        let Some(entry) = self.registrations.get_mut(&token) else { return };
        if !entry.write_armed {
            return;
        }
        entry.source.deregister(self.poll.registry());
        entry.write_armed = false;
    }
}
