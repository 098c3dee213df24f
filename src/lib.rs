//! SwarmSH: a file-based coordination kernel for distributed agent swarms.
//!
//! The crate is organized bottom-up: [`clock`] and [`model`] have no
//! dependencies on the rest of the tree; [`store`] persists tables and
//! journals to disk; [`mutator`] makes table writes atomic; [`kernel`]
//! implements the coordination state machine on top of the mutator;
//! [`fast_path`], [`control`], [`worker`], and [`projections`] build on
//! the kernel; [`telemetry`] instruments all of the above.

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod fast_path;
pub mod kernel;
pub mod model;
pub mod mutator;
pub mod projections;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use config::KernelConfig;
pub use error::{SwarmError, SwarmResult};
pub use kernel::CoordinationKernel;
