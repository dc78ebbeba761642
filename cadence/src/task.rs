//! Task descriptors, the task registry, and the per-tick state machine.
//!
//! A task is registered with a descriptor naming its sub-task periods,
//! state image, channels and initial parameter block, plus the step
//! callback the scheduler drives. The registry hands out slot-indexed
//! [`TaskId`]s and owns one [`SliceRing`] per task.
//!
//! Parameter updates follow a two-buffer discipline: control sessions stage
//! a complete block in the pending slot; the fastest sub-task takes it at
//! its next tick boundary and swaps it in as the live block. Locks around
//! both slots guard pointer swaps only, never bulk copies, so the periodic
//! side cannot stall behind a slow control session.

use crate::channel::ChannelDescriptor;
use crate::config::{HostConfig, ResolvedTuning, TaskTuning};
use crate::error::HostError;
use crate::ring::{self, SliceRing};
use crate::shm::{Creator, SharedRegion, ShmError};
use crate::trace::{info, warn};
use minstant::Instant;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Most tasks a registry will hold at once.
pub const MAX_TASKS: usize = 32;

/// Slot index of a registered task; stable for the task's lifetime and
/// reusable after deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u16);

impl TaskId {
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        TaskId(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-sub-task timing statistics, appended after the state image in every
/// ring slice.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Wall-clock seconds of the last tick.
    pub seconds: u64,
    /// Wall-clock nanoseconds of the last tick.
    pub nanos: u32,
    /// Execution time of the last step, nanoseconds.
    pub exec_ns: u32,
    /// Measured distance between the last two ticks, nanoseconds.
    pub period_ns: u32,
    /// Cumulative deadline overruns.
    pub overruns: u32,
}

/// Encoded size of [`TaskStats`] in a ring slice.
pub const STATS_LEN: usize = 24;

impl TaskStats {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; STATS_LEN] {
        let mut out = [0u8; STATS_LEN];
        out[0..8].copy_from_slice(&self.seconds.to_le_bytes());
        out[8..12].copy_from_slice(&self.nanos.to_le_bytes());
        out[12..16].copy_from_slice(&self.exec_ns.to_le_bytes());
        out[16..20].copy_from_slice(&self.period_ns.to_le_bytes());
        out[20..24].copy_from_slice(&self.overruns.to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < STATS_LEN {
            return None;
        }
        let u64_at = |o: usize| -> Option<u64> { Some(u64::from_le_bytes(raw.get(o..o + 8)?.try_into().ok()?)) };
        let u32_at = |o: usize| -> Option<u32> { Some(u32::from_le_bytes(raw.get(o..o + 4)?.try_into().ok()?)) };
        Some(TaskStats {
            seconds: u64_at(0)?,
            nanos: u32_at(8)?,
            exec_ns: u32_at(12)?,
            period_ns: u32_at(16)?,
            overruns: u32_at(20)?,
        })
    }
}

/// A failed step; the message is latched as the task's abort reason.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StepFault(pub String);

/// The computation a task performs each tick.
///
/// `sub_task` indexes the descriptor's period table; `image` is the task's
/// state image, `params` the live parameter block frozen for this tick.
pub trait TaskStep: Send {
    fn step(&mut self, sub_task: usize, image: &mut [u8], params: &[u8])
    -> Result<(), StepFault>;
}

/// Everything a registrant declares about a task.
pub struct TaskDescriptor {
    pub name: String,
    /// Task-specific revision string checked by companion `check_version`.
    pub version: String,
    /// Host interface revision the descriptor was built against; must match
    /// [`crate::INTERFACE_REVISION`].
    pub interface_revision: String,
    /// Sub-task periods, fastest first; slower periods must be integer
    /// multiples of the fastest.
    pub periods: Vec<Duration>,
    pub state_image_size: usize,
    pub signals: Vec<ChannelDescriptor>,
    pub parameters: Vec<ChannelDescriptor>,
    pub initial_params: Vec<u8>,
    pub tuning: TaskTuning,
    pub step: Box<dyn TaskStep>,
}

impl TaskDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        periods: Vec<Duration>,
        state_image_size: usize,
        step: Box<dyn TaskStep>,
    ) -> Self {
        TaskDescriptor {
            name: name.into(),
            version: version.into(),
            interface_revision: crate::INTERFACE_REVISION.to_owned(),
            periods,
            state_image_size,
            signals: Vec::new(),
            parameters: Vec::new(),
            initial_params: Vec::new(),
            tuning: TaskTuning::default(),
            step,
        }
    }
}

/// Registration failures.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("interface revision mismatch: host `{host}`, descriptor `{descriptor}`")]
    Revision { host: String, descriptor: String },

    #[error("task table full ({MAX_TASKS} tasks)")]
    TableFull,

    #[error("invalid descriptor: {0}")]
    Invalid(String),

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("failed to spawn scheduler thread")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
enum RunState {
    Running,
    Aborted(String),
}

struct TaskCore {
    step: Box<dyn TaskStep>,
    image: Box<[u8]>,
    /// Fastest-sub-task ticks until the next snapshot.
    snap_countdown: u32,
}

struct StatTable {
    stats: Vec<TaskStats>,
    last_tick: Vec<Option<Instant>>,
}

/// A registered task.
pub struct Task {
    id: TaskId,
    name: String,
    version: String,
    periods: Vec<Duration>,
    state_image_size: usize,
    param_size: usize,
    signals: Vec<ChannelDescriptor>,
    parameters: Vec<ChannelDescriptor>,
    tuning: ResolvedTuning,
    ring: SliceRing,
    core: Mutex<TaskCore>,
    live_params: Mutex<Arc<[u8]>>,
    pending_params: Mutex<Option<Box<[u8]>>>,
    stats: Mutex<StatTable>,
    state: Mutex<RunState>,
    stop: AtomicBool,
    consumer_attached: AtomicBool,
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Task {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn periods(&self) -> &[Duration] {
        &self.periods
    }

    #[must_use]
    pub fn sub_task_count(&self) -> usize {
        self.periods.len()
    }

    #[must_use]
    pub fn state_image_size(&self) -> usize {
        self.state_image_size
    }

    #[must_use]
    pub fn param_block_size(&self) -> usize {
        self.param_size
    }

    #[must_use]
    pub fn signals(&self) -> &[ChannelDescriptor] {
        &self.signals
    }

    #[must_use]
    pub fn parameters(&self) -> &[ChannelDescriptor] {
        &self.parameters
    }

    #[must_use]
    pub fn tuning(&self) -> ResolvedTuning {
        self.tuning
    }

    #[must_use]
    pub fn ring(&self) -> &SliceRing {
        &self.ring
    }

    /// Bytes per ring slice: state image plus one stats trailer per
    /// sub-task.
    #[must_use]
    pub fn slice_len(&self) -> usize {
        self.state_image_size + self.periods.len() * STATS_LEN
    }

    /// The latched abort reason, if the task has aborted.
    #[must_use]
    pub fn abort_reason(&self) -> Option<String> {
        match &*lock_ignore_poison(&self.state) {
            RunState::Running => None,
            RunState::Aborted(reason) => Some(reason.clone()),
        }
    }

    fn check_alive(&self) -> Result<(), HostError> {
        match self.abort_reason() {
            None => Ok(()),
            Some(reason) => Err(HostError::Aborted(reason)),
        }
    }

    /// Latches an abort reason, closes the ring and stops the scheduler
    /// threads. The first reason wins.
    pub(crate) fn abort(&self, reason: &str) {
        {
            let mut state = lock_ignore_poison(&self.state);
            if matches!(*state, RunState::Aborted(_)) {
                return;
            }
            *state = RunState::Aborted(reason.to_owned());
        }
        warn!(task = %self.name, reason, "task aborted");
        self.ring.close();
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Exclusive consumer attachment for the snapshot ring.
    pub(crate) fn attach_consumer(&self) -> Result<(), HostError> {
        if self.consumer_attached.swap(true, Ordering::AcqRel) {
            Err(HostError::Busy("snapshot ring already has a consumer"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn detach_consumer(&self) {
        self.consumer_attached.store(false, Ordering::Release);
    }

    /// Snapshot of the current live parameter block. The lock is held only
    /// for the reference-count bump.
    pub fn get_parameters(&self) -> Result<Arc<[u8]>, HostError> {
        self.check_alive()?;
        Ok(Arc::clone(&lock_ignore_poison(&self.live_params)))
    }

    /// Stages a complete replacement parameter block; it becomes live at
    /// the fastest sub-task's next tick boundary.
    pub fn set_parameters(&self, block: &[u8]) -> Result<(), HostError> {
        self.check_alive()?;
        if self.param_size == 0 {
            return Err(HostError::NotSupported("task has no parameters"));
        }
        if block.len() != self.param_size {
            return Err(HostError::out_of_range(format!(
                "parameter block of {} bytes, task declares {}",
                block.len(),
                self.param_size
            )));
        }
        let staged: Box<[u8]> = block.into();
        // Pointer swap only.
        *lock_ignore_poison(&self.pending_params) = Some(staged);
        Ok(())
    }

    /// Stages byte-range edits copied out of `block` on top of the current
    /// staged (or live) parameters. All ranges are validated first; any
    /// out-of-range edit rejects the whole patch and leaves the pending
    /// slot untouched.
    pub fn patch_parameters(
        &self,
        block: &[u8],
        ranges: &[(u32, u32)],
    ) -> Result<(), HostError> {
        self.check_alive()?;
        if self.param_size == 0 {
            return Err(HostError::NotSupported("task has no parameters"));
        }
        if block.len() != self.param_size {
            return Err(HostError::out_of_range(format!(
                "parameter block of {} bytes, task declares {}",
                block.len(),
                self.param_size
            )));
        }
        for &(offset, len) in ranges {
            let end = (offset as usize).checked_add(len as usize);
            if !end.is_some_and(|end| end <= self.param_size) {
                return Err(HostError::out_of_range(format!(
                    "patch range {offset}+{len} exceeds {}-byte block",
                    self.param_size
                )));
            }
        }

        // Build the candidate outside both locks, then swap it in.
        let mut candidate: Box<[u8]> = match lock_ignore_poison(&self.pending_params).as_deref() {
            Some(staged) => staged.into(),
            None => self.get_parameters()?.as_ref().into(),
        };
        for &(offset, len) in ranges {
            let (start, end) = (offset as usize, offset as usize + len as usize);
            candidate[start..end].copy_from_slice(&block[start..end]);
        }
        *lock_ignore_poison(&self.pending_params) = Some(candidate);
        Ok(())
    }

    fn apply_pending(&self) {
        // Take under the lock, convert outside it.
        let staged = lock_ignore_poison(&self.pending_params).take();
        if let Some(staged) = staged {
            let fresh: Arc<[u8]> = Arc::from(staged);
            *lock_ignore_poison(&self.live_params) = fresh;
        }
    }

    fn record_tick(&self, sub_task: usize, exec: Duration, now: Instant) {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let mut table = lock_ignore_poison(&self.stats);
        let period_ns = match table.last_tick[sub_task] {
            Some(prev) => now.duration_since(prev).as_nanos().min(u128::from(u32::MAX)) as u32,
            None => self.periods[sub_task].as_nanos().min(u128::from(u32::MAX)) as u32,
        };
        table.last_tick[sub_task] = Some(now);
        let slot = &mut table.stats[sub_task];
        slot.seconds = wall.as_secs();
        slot.nanos = wall.subsec_nanos();
        slot.exec_ns = exec.as_nanos().min(u128::from(u32::MAX)) as u32;
        slot.period_ns = period_ns;
    }

    /// Bumps the overrun counter for a sub-task, returning the new total.
    pub(crate) fn note_overrun(&self, sub_task: usize) -> u32 {
        let mut table = lock_ignore_poison(&self.stats);
        table.stats[sub_task].overruns += 1;
        table.stats[sub_task].overruns
    }

    fn stats_trailer(&self) -> Vec<u8> {
        let table = lock_ignore_poison(&self.stats);
        let mut out = Vec::with_capacity(table.stats.len() * STATS_LEN);
        for stat in &table.stats {
            out.extend_from_slice(&stat.to_bytes());
        }
        out
    }

    /// Runs one tick of `sub_task`: apply staged parameters (fastest
    /// sub-task only), step, record stats, and on the fastest sub-task
    /// count down to the next snapshot.
    pub(crate) fn tick(&self, sub_task: usize) -> Result<(), HostError> {
        self.check_alive()?;
        if sub_task == 0 {
            self.apply_pending();
        }
        let params = Arc::clone(&lock_ignore_poison(&self.live_params));

        let mut core = lock_ignore_poison(&self.core);
        let started = Instant::now();
        let TaskCore {
            step,
            image,
            snap_countdown,
        } = &mut *core;
        if let Err(fault) = step.step(sub_task, image, &params) {
            drop(core);
            self.abort(&fault.0);
            return Err(HostError::Aborted(fault.0));
        }
        let exec = started.elapsed();
        self.record_tick(sub_task, exec, started);

        if sub_task == 0 {
            *snap_countdown -= 1;
            if *snap_countdown == 0 {
                *snap_countdown = self.tuning.decimation;
                let trailer = self.stats_trailer();
                self.ring.write(&[&image[..], &trailer])?;
            }
        }
        Ok(())
    }
}

/// Slot table of registered tasks.
pub struct TaskRegistry {
    slots: Mutex<Vec<Option<Arc<Task>>>>,
    config: HostConfig,
}

impl TaskRegistry {
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        TaskRegistry {
            slots: Mutex::new(Vec::new()),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn validate(desc: &TaskDescriptor) -> Result<(), RegisterError> {
        if desc.interface_revision != crate::INTERFACE_REVISION {
            return Err(RegisterError::Revision {
                host: crate::INTERFACE_REVISION.to_owned(),
                descriptor: desc.interface_revision.clone(),
            });
        }
        if desc.name.is_empty() {
            return Err(RegisterError::Invalid("task name is empty".into()));
        }
        if desc.state_image_size == 0 {
            return Err(RegisterError::Invalid("state image is empty".into()));
        }
        let Some(&base) = desc.periods.first() else {
            return Err(RegisterError::Invalid("no sub-task periods".into()));
        };
        if base.is_zero() {
            return Err(RegisterError::Invalid("fastest period is zero".into()));
        }
        for (i, period) in desc.periods.iter().enumerate() {
            if period.as_nanos() % base.as_nanos() != 0 {
                return Err(RegisterError::Invalid(format!(
                    "sub-task {i} period {period:?} is not a multiple of the fastest {base:?}"
                )));
            }
        }
        for ch in &desc.signals {
            if !ch.fits_within(desc.state_image_size) {
                return Err(RegisterError::Invalid(format!(
                    "signal `{}` exceeds the state image",
                    ch.path
                )));
            }
        }
        for ch in &desc.parameters {
            if !ch.fits_within(desc.initial_params.len()) {
                return Err(RegisterError::Invalid(format!(
                    "parameter `{}` exceeds the parameter block",
                    ch.path
                )));
            }
        }
        Ok(())
    }

    /// Registers a task and builds its snapshot ring.
    pub fn register(&self, desc: TaskDescriptor) -> Result<Arc<Task>, RegisterError> {
        Self::validate(&desc)?;
        let tuning = desc.tuning.resolve(&self.config);

        let mut slots = lock_ignore_poison(&self.slots);
        let slot = match slots.iter().position(Option::is_none) {
            Some(free) => free,
            None if slots.len() < MAX_TASKS => {
                slots.push(None);
                slots.len() - 1
            }
            None => return Err(RegisterError::TableFull),
        };

        let sub_count = desc.periods.len();
        let slice_len = desc.state_image_size + sub_count * STATS_LEN;
        let snap_period = desc.periods[0] * tuning.decimation;
        let capacity = ring::capacity_for(tuning.buffer_time, snap_period);
        let ring = match &self.config.shm_prefix {
            Some(prefix) => {
                let path = format!("/{prefix}-{}", desc.name);
                let region = SharedRegion::<Creator>::create(&path, slice_len * capacity)?;
                SliceRing::in_shared(region, slice_len)?
            }
            None => SliceRing::in_memory(slice_len, capacity)?,
        };

        let task = Arc::new(Task {
            id: TaskId(slot as u16),
            name: desc.name,
            version: desc.version,
            state_image_size: desc.state_image_size,
            param_size: desc.initial_params.len(),
            signals: desc.signals,
            parameters: desc.parameters,
            tuning,
            ring,
            core: Mutex::new(TaskCore {
                step: desc.step,
                image: vec![0u8; desc.state_image_size].into_boxed_slice(),
                snap_countdown: 1,
            }),
            live_params: Mutex::new(Arc::from(desc.initial_params)),
            pending_params: Mutex::new(None),
            stats: Mutex::new(StatTable {
                stats: vec![TaskStats::default(); sub_count],
                last_tick: vec![None; sub_count],
            }),
            state: Mutex::new(RunState::Running),
            stop: AtomicBool::new(false),
            consumer_attached: AtomicBool::new(false),
            periods: desc.periods,
        });
        slots[slot] = Some(Arc::clone(&task));
        info!(
            task = %task.name,
            id = %task.id,
            sub_tasks = sub_count,
            ring_slices = capacity,
            "task registered"
        );
        Ok(task)
    }

    /// Removes a task from the table, stopping its producer side. Scheduler
    /// threads holding the `Arc` wind down on their own.
    pub fn deregister(&self, id: TaskId) -> Option<Arc<Task>> {
        let removed = lock_ignore_poison(&self.slots)
            .get_mut(id.as_raw() as usize)
            .and_then(Option::take);
        if let Some(task) = &removed {
            task.request_stop();
            task.ring().close();
            info!(task = %task.name, id = %task.id, "task deregistered");
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        lock_ignore_poison(&self.slots)
            .get(id.as_raw() as usize)
            .and_then(Clone::clone)
    }

    /// All registered tasks, in slot order.
    #[must_use]
    pub fn active(&self) -> Vec<Arc<Task>> {
        lock_ignore_poison(&self.slots)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Bitmask of occupied slots, bit N for task id N.
    #[must_use]
    pub fn active_mask(&self) -> u32 {
        lock_ignore_poison(&self.slots)
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .fold(0u32, |mask, (i, _)| mask | (1 << i))
    }
}
