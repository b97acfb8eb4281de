//! meshrun — launcher and supervisor for mesh proxy sidecars.
//!
//! The launch sequence is strictly ordered: resolve identity and discovery
//! configuration from the environment and platform metadata, bootstrap
//! credentials, decide between transparent traffic interception and whitebox
//! proxying, then hand the fully assembled environment to the process
//! supervisor which owns the agent/application lifecycle through shutdown.
//!
//! Only the supervisor has externally observable side effects; everything
//! before it accumulates state into an [`envset::EnvSet`] with strict
//! first-writer-wins semantics, so operators can pin any derived value by
//! pre-setting the corresponding variable.

pub mod agent;
pub mod banner;
pub mod bootstrap;
pub mod cli;
pub mod color;
pub mod discovery;
pub mod doctor;
pub mod envset;
pub mod errors;
pub mod exec;
pub mod identity;
pub mod intercept;
pub mod lock;
pub mod mesh;
pub mod paths;
pub mod supervisor;
pub mod telemetry;
pub mod util;

pub use color::{color_enabled_stderr, ColorMode};
pub use envset::EnvSet;
pub use identity::RuntimeIdentity;
pub use intercept::InterceptionState;
pub use lock::{acquire_lock, acquire_lock_at, should_acquire_lock};
pub use paths::MeshPaths;
pub use supervisor::{LifecycleState, Supervisor};
