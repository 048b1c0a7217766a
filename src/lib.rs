//! # dagflow - Task-Based Dataflow Runtime
//!
//! A runtime core for executing directed acyclic graphs of fine-grained
//! tasks across a heterogeneous machine: CPU cores grouped into NUMA
//! "virtual processes" and one or more accelerator devices with private
//! memory.
//!
//! ## Architecture
//!
//! Two tightly coupled subsystems make up the runtime:
//!
//! - **CPU scheduler**: per-worker bounded priority buffers with
//!   locality-ordered work stealing derived from the hardware topology,
//!   backed by a shared per-NUMA-domain system queue
//! - **Offload engine**: per-device memory arena, host/device copy
//!   coherence, LRU-based reuse under memory pressure, and a pipeline of
//!   asynchronous device streams polled through completion events
//!
//! ## Example
//!
//! ```no_run
//! use dagflow::{Engine, EngineConfig, SchedulerKind, TaskFunction, Task};
//! use std::sync::Arc;
//!
//! let engine = Engine::build(EngineConfig::new(4, SchedulerKind::Pbq));
//!
//! let noop = Arc::new(TaskFunction::cpu_only("noop", vec![], |_task| {}));
//! let task = Task::new(noop).with_priority(5);
//!
//! engine.schedule(0, task, 0);
//! engine.progress(0);
//! assert_eq!(engine.executed_tasks(), 1);
//! ```

pub mod config;
pub mod counter;
pub mod data;
pub mod device;
pub mod engine;
pub mod error;
pub mod hbbuffer;
pub mod sched;
pub mod task;
pub mod topology;
pub mod worker;

pub use config::{DeviceConfig, EngineConfig};
pub use counter::Counter;
pub use data::{Coherency, CopyRef, DataKey, TransferStatus};
pub use device::backend::{DeviceBackend, SimBackend};
pub use engine::Engine;
pub use error::{DeviceError, EngineError};
pub use sched::SchedulerKind;
pub use task::{DeviceClass, Flow, FlowFlags, Incarnation, Task, TaskFunction, TaskStatus};
pub use topology::Topology;
