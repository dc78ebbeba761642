//! Periodic real-time task host with snapshot streaming.
//!
//! A [`Host`] runs registered tasks on fixed tick grids, publishes each
//! tick's state image into a per-task snapshot ring, and serves two
//! socket surfaces on top of it: a binary control protocol on a Unix
//! socket (discovery, properties, parameter get/set/patch) and a
//! text telemetry protocol on TCP (channel subscription and streaming).

pub mod channel;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod ring;
pub mod sched;
pub mod server;
pub mod session;
pub mod shm;
pub mod stream;
pub mod task;
pub mod trace;

/// Revision of the host/task interface. A descriptor built against a
/// different revision is rejected at registration, and control clients
/// verify it with `CHECK_VERSION` before trusting any other reply.
pub const INTERFACE_REVISION: &str = "cadence-if-3";

pub use channel::{ChannelDescriptor, ChannelSpace, ElemType};
pub use config::{HostConfig, TaskTuning};
pub use error::HostError;
pub use host::Host;
pub use server::MonitorServer;
pub use task::{StepFault, TaskDescriptor, TaskId, TaskRegistry, TaskStep};
