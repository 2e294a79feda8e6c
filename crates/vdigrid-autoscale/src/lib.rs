//! vdigrid-autoscale — headroom-driven scaling for desktop application clusters.
//!
//! Each application cluster keeps a configured amount of spare session
//! capacity ("headroom"). A scale cycle runs per application on its own
//! cadence and reconciles the fleet against that target.
//!
//! # Architecture
//!
//! ```text
//! Trigger (fixed tick)
//!   └── per due application, single flight
//!       └── ScaleCycle
//!           ├── ClusterView        booting / active / shutting_down, inuse_map
//!           ├── Reachability       resolve + TCP connect on booting nodes
//!           ├── SessionInspector   live sessions per node
//!           ├── FleetDriver        start / list / terminate
//!           └── RecordStore        instance state transitions
//! ```
//!
//! # Lifecycle
//!
//! `Booting → Active → ShuttingDown → Terminated`. A node becomes active once
//! its management port answers, is drained from the newest end of the
//! waterfall when the cluster has a whole node of surplus, and is only
//! terminated after a session query confirms it is empty.

pub mod cluster;
pub mod cycle;
pub mod error;
pub mod fleet;
pub mod headroom;
pub mod trigger;

pub use cluster::ClusterView;
pub use cycle::{CycleReport, CycleSettings, ScaleCycle, ScheduledJob};
pub use error::{AutoscaleError, AutoscaleResult};
pub use fleet::{
    ConnectionProcessor, Credential, DriverError, DriverResult, FleetDriver, IdleSessionReaper,
    InspectError, NodeInfo, NoopHooks, SessionInspector,
};
pub use trigger::Trigger;
