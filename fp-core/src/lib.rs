//! fpinstall Core Library
//!
//! Installation pipeline and fallback management for the FPC fingerprint
//! reader (`10a5:9201`) found in Xiaomi laptops.
//!
//! # Module Structure
//!
//! - `host/` - Every side effect on the machine ([`Host`], [`LinuxHost`], [`FakeHost`])
//! - `data/` - Result records, configuration, durable fallback state
//! - `fallback/` - Fallback Strategy Manager and the strategies
//! - `pipeline/` - Orchestrator and run report
//!
//! # Example
//!
//! ```no_run
//! use fp_core::{InstallerConfig, LinuxHost, Orchestrator, PipelineOptions, StateLayout};
//!
//! let host = LinuxHost::new();
//! let report = Orchestrator::new(&host, StateLayout::system(), InstallerConfig::default())
//!     .run(PipelineOptions::default());
//! println!("success: {}", report.success);
//! ```

// Grouped modules
pub mod data;
pub mod fallback;
pub mod host;
pub mod pipeline;

// Standalone modules
pub mod constants;
pub mod deps;
pub mod driver;
pub mod error;
pub mod gate;
pub mod rules;
pub mod service;
pub mod system;
pub mod verify;

pub use data::{
    load_installer_config, save_installer_config, BackupSnapshot, Completion, FallbackConfig, FallbackState,
    InstallerConfig, Outcome, SnapshotMeta, StageResult, StateLayout, StateLock, StateRecord, StateStore,
};
pub use deps::DependencySet;
pub use driver::DriverArtifact;
pub use error::{FpError, Result};
pub use fallback::{
    FallbackManager, FallbackStatus, Health, Strategy, StrategyContext, StrategyInfo, TestReport, Verdict,
};
pub use gate::{CompatibilityCheck, CompatibilityGate, GateReport};
pub use host::{CommandOutput, FakeHost, Host, HostCommand, LinuxHost, ModuleLoad, ServiceStatus, ServiceUnit};
pub use pipeline::{Orchestrator, PipelineOptions, PipelineReport};
pub use service::InitSystem;
pub use system::{PackageManager, SystemProfile};
pub use verify::{RunMode, Verifier};
