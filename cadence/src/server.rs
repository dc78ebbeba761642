//! Monitor server: listeners, session dispatch, and ring draining.
//!
//! One [`MonitorServer`] per host process serves every registered task.
//! Control sessions arrive on a Unix socket, telemetry sessions on TCP;
//! both are owned by a single [`Dispatcher`] thread. Between poll wakeups
//! the server drains each task's snapshot ring into a per-task
//! [`SliceHistory`] and fans new slices out to the telemetry sessions
//! attached to that task.
//!
//! The server is the exclusive consumer of each ring (attachment is
//! claimed per task); companions multiplex on top of it. A ring overflow
//! is recovered by resetting the ring and announcing the gap on every
//! attached session.

use crate::config::HostConfig;
use crate::dispatch::{Dispatcher, Handle, Handler, Ops};
use crate::error::HostError;
use crate::session::{ControlSession, SessionIo, TelemetrySession, Transport};
use crate::stream::{EventPolicy, SliceHistory, StreamEngine};
use crate::task::{Task, TaskId, TaskRegistry};
use crate::trace::{debug, info, warn};
use mio::event::Source;
use mio::net::{TcpListener, UnixListener};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long one dispatcher wakeup may wait before the rings are drained
/// again.
const POLL_PERIOD: Duration = Duration::from_millis(10);

/// Shared state handed to connection callbacks.
pub struct ServerCtx {
    registry: Arc<TaskRegistry>,
    event_policy: EventPolicy,
}

/// Everything the dispatcher owns: listeners and live sessions.
pub enum Conn {
    ControlListener(UnixListener),
    TelemetryListener(TcpListener),
    Control(ControlSession),
    Telemetry(TelemetrySession),
}

fn apply_io(io_state: SessionIo, ops: &mut Ops<Conn>) {
    if io_state.closed {
        ops.close();
    } else {
        ops.set_write_interest(io_state.wants_write);
    }
}

impl Handler for Conn {
    type Ctx = ServerCtx;

    fn source(&mut self) -> &mut dyn Source {
        match self {
            Conn::ControlListener(l) => l,
            Conn::TelemetryListener(l) => l,
            Conn::Control(s) => s.source(),
            Conn::Telemetry(s) => s.source(),
        }
    }

    fn on_readable(&mut self, ctx: &mut ServerCtx, ops: &mut Ops<Self>) -> io::Result<()> {
        match self {
            Conn::ControlListener(listener) => loop {
                match listener.accept() {
                    Ok((sock, _)) => {
                        let session = ControlSession::new(Transport::Unix(sock));
                        debug!(session = %session.id(), "control session accepted");
                        ops.register(Conn::Control(session));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err),
                }
            },
            Conn::TelemetryListener(listener) => loop {
                match listener.accept() {
                    Ok((sock, _peer)) => {
                        let session = TelemetrySession::new(
                            Transport::Tcp(sock),
                            StreamEngine::new(ctx.event_policy),
                        );
                        debug!(session = %session.id(), peer = %_peer, "telemetry session accepted");
                        ops.register(Conn::Telemetry(session));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err),
                }
            },
            Conn::Control(session) => {
                let io_state = session.on_readable(&ctx.registry)?;
                apply_io(io_state, ops);
                Ok(())
            }
            Conn::Telemetry(session) => {
                let io_state = session.on_readable(&ctx.registry)?;
                apply_io(io_state, ops);
                Ok(())
            }
        }
    }

    fn on_writable(&mut self, _ctx: &mut ServerCtx, ops: &mut Ops<Self>) -> io::Result<()> {
        let io_state = match self {
            Conn::Control(session) => session.on_writable()?,
            Conn::Telemetry(session) => session.on_writable()?,
            Conn::ControlListener(_) | Conn::TelemetryListener(_) => return Ok(()),
        };
        apply_io(io_state, ops);
        Ok(())
    }
}

/// Per-task drain state: the read cursor and the in-process slice history
/// the streaming side gathers from.
struct TaskDrain {
    task: Arc<Task>,
    hist: SliceHistory,
    rp: usize,
    scratch: Vec<u8>,
}

pub struct MonitorServer {
    dispatcher: Dispatcher<Conn>,
    ctx: ServerCtx,
    drains: HashMap<u16, TaskDrain>,
    telemetry_addr: SocketAddr,
    control_path: PathBuf,
}

impl MonitorServer {
    /// Binds both listeners per the registry's configuration. A stale
    /// control socket file from a previous run is removed first.
    pub fn new(registry: Arc<TaskRegistry>) -> io::Result<Self> {
        let config: &HostConfig = registry.config();
        let control_path = config.control_path.clone();
        let _ = std::fs::remove_file(&control_path);
        let control = UnixListener::bind(&control_path)?;
        let telemetry = TcpListener::bind(config.telemetry_addr)?;
        let telemetry_addr = telemetry.local_addr()?;

        let mut dispatcher = Dispatcher::new()?;
        dispatcher.register(Conn::ControlListener(control))?;
        dispatcher.register(Conn::TelemetryListener(telemetry))?;

        info!(
            telemetry = %telemetry_addr,
            control = %control_path.display(),
            "monitor server listening"
        );
        Ok(MonitorServer {
            dispatcher,
            ctx: ServerCtx {
                event_policy: registry.config().event_policy,
                registry,
            },
            drains: HashMap::new(),
            telemetry_addr,
            control_path,
        })
    }

    /// The telemetry address actually bound (resolves port 0).
    #[must_use]
    pub fn telemetry_addr(&self) -> SocketAddr {
        self.telemetry_addr
    }

    /// Serves until `shutdown` becomes true.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        while !shutdown.load(Ordering::Acquire) {
            self.poll_once()?;
        }
        info!("monitor server stopping");
        Ok(())
    }

    /// One dispatcher wakeup plus a ring drain pass.
    pub fn poll_once(&mut self) -> io::Result<()> {
        self.dispatcher.poll(&mut self.ctx, Some(POLL_PERIOD))?;
        self.sync_drains();
        self.drain_rings();
        Ok(())
    }

    /// Claims newly registered tasks as this server's ring consumers and
    /// releases tasks that disappeared from the registry.
    fn sync_drains(&mut self) {
        for task in self.ctx.registry.active() {
            let key = task.id().as_raw();
            if self.drains.contains_key(&key) {
                continue;
            }
            match task.attach_consumer() {
                Ok(()) => {
                    let slice_len = task.slice_len();
                    let capacity = task.ring().capacity();
                    self.drains.insert(
                        key,
                        TaskDrain {
                            hist: SliceHistory::new(slice_len, task.state_image_size(), capacity),
                            rp: 0,
                            scratch: vec![0u8; slice_len],
                            task,
                        },
                    );
                }
                Err(HostError::Busy(_)) => {
                    warn!(task = %task.name(), "ring already claimed by another consumer");
                }
                Err(_) => {}
            }
        }
        self.drains.retain(|&key, drain| {
            let alive = self.ctx.registry.get(TaskId::from_raw(key)).is_some();
            if !alive {
                drain.task.detach_consumer();
            }
            alive
        });
    }

    fn drain_rings(&mut self) {
        let mut arm: Vec<Handle> = Vec::new();
        for drain in self.drains.values_mut() {
            loop {
                let limit = match drain.task.ring().current_write_offset() {
                    Ok(limit) => limit,
                    Err(HostError::Overflow) => {
                        warn!(task = %drain.task.name(), "snapshot ring overflowed, resetting");
                        drain.rp = drain.task.ring().reset();
                        for (_, conn) in self.dispatcher.iter_mut() {
                            if let Conn::Telemetry(session) = conn {
                                if session.attached() == Some(drain.task.id()) {
                                    session.note_ring_overflow();
                                }
                            }
                        }
                        break;
                    }
                    Err(_) => break,
                };
                if drain.rp == limit {
                    break;
                }
                let mut wrapped = false;
                while drain.rp < limit {
                    if drain
                        .task
                        .ring()
                        .read_slice(drain.rp, &mut drain.scratch)
                        .is_err()
                    {
                        break;
                    }
                    let fill = drain.task.ring().fill_percent();
                    let seq = drain.hist.push(&drain.scratch);
                    drain.rp = drain.task.ring().set_read_offset(drain.rp + 1);

                    for (handle, conn) in self.dispatcher.iter_mut() {
                        if let Conn::Telemetry(session) = conn {
                            if session.attached() == Some(drain.task.id()) {
                                session.on_slice(&drain.hist, seq, fill);
                                if session.wants_write() && !arm.contains(&handle) {
                                    arm.push(handle);
                                }
                            }
                        }
                    }

                    if drain.rp == 0 {
                        wrapped = true;
                        break;
                    }
                }
                if !wrapped {
                    break;
                }
            }
        }
        for handle in arm {
            let _ = self.dispatcher.set_write_interest(handle, true);
        }
    }
}

impl Drop for MonitorServer {
    fn drop(&mut self) {
        for drain in self.drains.values() {
            drain.task.detach_consumer();
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}
