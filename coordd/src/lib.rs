//! coordd: one primary per rendezvous name supervises every other instance
//! on the host, reaps orphaned workers and owns the shared settings.

pub mod control;
pub mod exit;
pub mod instance;
pub mod negotiator;
pub mod primary;
pub mod registry;
pub mod settings;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use exit::ExitKind;
pub use instance::{run, InstanceOptions, Signals};
pub use negotiator::{InstanceIdentity, NegotiationError, Negotiator, Role};
