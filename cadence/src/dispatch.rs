//! Single-threaded readiness dispatcher.
//!
//! A slot table of handlers keyed by [`mio::Token`] index, driven by one
//! [`mio::Poll`]. Handlers never block: a readable callback consumes what
//! the socket has, a writable callback flushes what the handler buffered.
//! Write interest is armed and disarmed independently of read interest, so
//! an idle session costs nothing on the write side.
//!
//! Handlers run one at a time. During a callback the handler is moved out
//! of its slot; a handler that closes (or fails) is deregistered on the
//! spot and cannot be touched again in the same poll pass. Freeing the
//! highest slot shrinks the table, keeping the high-water mark tight.
//!
//! Structural changes requested from inside a callback (spawning accepted
//! connections, closing, re-arming write interest) are collected in
//! [`Ops`] and applied by the dispatcher after the callback returns.

use crate::trace::{debug, trace};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::time::Duration;

/// A connection or listener owned by the dispatcher.
pub trait Handler {
    /// Shared state passed to every callback.
    type Ctx;

    fn source(&mut self) -> &mut dyn Source;

    fn on_readable(&mut self, ctx: &mut Self::Ctx, ops: &mut Ops<Self>) -> io::Result<()>
    where
        Self: Sized;

    fn on_writable(&mut self, _ctx: &mut Self::Ctx, _ops: &mut Ops<Self>) -> io::Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Deferred actions a callback may request.
pub struct Ops<H> {
    spawn: Vec<H>,
    close: bool,
    write_interest: Option<bool>,
}

impl<H> Ops<H> {
    fn new() -> Self {
        Ops {
            spawn: Vec::new(),
            close: false,
            write_interest: None,
        }
    }

    /// Hands a new handler (an accepted connection) to the dispatcher.
    pub fn register(&mut self, handler: H) {
        self.spawn.push(handler);
    }

    /// Closes this handler once the callback returns.
    pub fn close(&mut self) {
        self.close = true;
    }

    /// Arms or disarms write interest for this handler.
    pub fn set_write_interest(&mut self, armed: bool) {
        self.write_interest = Some(armed);
    }
}

/// Stable identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

struct Slot<H> {
    handler: Option<H>,
    writable: bool,
}

pub struct Dispatcher<H: Handler> {
    poll: Poll,
    events: Events,
    slots: Vec<Slot<H>>,
}

const EVENT_BATCH: usize = 128;

fn interest(writable: bool) -> Interest {
    if writable {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

impl<H: Handler> Dispatcher<H> {
    pub fn new() -> io::Result<Self> {
        Ok(Dispatcher {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_BATCH),
            slots: Vec::new(),
        })
    }

    /// Slots currently allocated; freeing the highest slot shrinks this.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.slots.len()
    }

    /// Registers a handler with read interest.
    pub fn register(&mut self, mut handler: H) -> io::Result<Handle> {
        let idx = match self.slots.iter().position(|s| s.handler.is_none()) {
            Some(free) => free,
            None => {
                self.slots.push(Slot {
                    handler: None,
                    writable: false,
                });
                self.slots.len() - 1
            }
        };
        self.poll
            .registry()
            .register(handler.source(), Token(idx), interest(false))?;
        self.slots[idx] = Slot {
            handler: Some(handler),
            writable: false,
        };
        trace!(slot = idx, "handler registered");
        Ok(Handle(idx))
    }

    /// Removes a handler, returning it to the caller.
    pub fn deregister(&mut self, handle: Handle) -> Option<H> {
        let slot = self.slots.get_mut(handle.0)?;
        let mut handler = slot.handler.take()?;
        slot.writable = false;
        let _ = self.poll.registry().deregister(handler.source());
        self.shrink();
        Some(handler)
    }

    /// Arms or disarms write interest for a handler.
    pub fn set_write_interest(&mut self, handle: Handle, armed: bool) -> io::Result<()> {
        let Some(slot) = self.slots.get_mut(handle.0) else {
            return Ok(());
        };
        let Some(handler) = slot.handler.as_mut() else {
            return Ok(());
        };
        if slot.writable == armed {
            return Ok(());
        }
        slot.writable = armed;
        self.poll
            .registry()
            .reregister(handler.source(), Token(handle.0), interest(armed))
    }

    /// All live handlers, in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut H)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.handler.as_mut().map(|h| (Handle(i), h)))
    }

    fn shrink(&mut self) {
        while self
            .slots
            .last()
            .is_some_and(|s| s.handler.is_none())
        {
            self.slots.pop();
        }
    }

    /// Waits for readiness and runs handler callbacks. Returns after one
    /// poll wakeup (or timeout).
    pub fn poll(&mut self, ctx: &mut H::Ctx, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        let ready: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (ev.token().0, ev.is_readable(), ev.is_writable()))
            .collect();

        for (idx, readable, writable) in ready {
            // A handler closed earlier in this pass leaves an empty slot;
            // never touch it again.
            let Some(mut handler) = self.slots.get_mut(idx).and_then(|s| s.handler.take()) else {
                continue;
            };

            let mut ops = Ops::new();
            let mut failed = false;
            if readable {
                if let Err(_err) = handler.on_readable(ctx, &mut ops) {
                    debug!(slot = idx, err = %_err, "read callback failed");
                    failed = true;
                }
            }
            if writable && !failed && !ops.close {
                if let Err(_err) = handler.on_writable(ctx, &mut ops) {
                    debug!(slot = idx, err = %_err, "write callback failed");
                    failed = true;
                }
            }

            if failed || ops.close {
                let _ = self.poll.registry().deregister(handler.source());
                drop(handler);
                self.shrink();
            } else {
                if let Some(slot) = self.slots.get_mut(idx) {
                    slot.handler = Some(handler);
                }
                if let Some(armed) = ops.write_interest {
                    let _ = self.set_write_interest(Handle(idx), armed);
                }
            }

            for spawned in ops.spawn {
                if let Err(_err) = self.register(spawned) {
                    debug!(err = %_err, "failed to register accepted handler");
                }
            }
        }
        Ok(())
    }
}
