//! Worker fleet management.
//!
//! The fleet mixes two kinds of workers:
//! - **Static** workers are pre-provisioned with fixed capacity and live for
//!   the lifetime of the deployment.
//! - **Elastic** workers are provisioned on demand and go through
//!   PROVISIONING → READY, or → UNREACHABLE if they never come up.
//!
//! # Components
//!
//! - [`WorkerRegistry`]: capacity accounting, heartbeats, and selection
//! - [`heartbeat`]: worker capacity reports and the channel that feeds them in
//! - [`AnalysisLauncher`]: hands a running job to its worker
//! - [`ElasticProvisioner`]: starts machines for elastic worker records

pub mod heartbeat;
pub mod launcher;
pub mod provisioner;
pub mod record;
pub mod registry;

pub use heartbeat::{HeartbeatReceiver, HeartbeatReport};
pub use launcher::{AnalysisLauncher, LoggingLauncher};
pub use provisioner::{CommandProvisioner, ElasticProvisioner};
pub use record::{ElasticState, WorkerId, WorkerKind, WorkerRecord};
pub use registry::{CapacityError, WorkerRegistry};
