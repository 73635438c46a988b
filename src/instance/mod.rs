//! Sub-instance management.
//!
//! Layout on disk:
//! - subs/{id}/ - provisioned workspace the child runs in
//! - cache/ - template archives while they are being unpacked
//! - instances.toml - instance records and remote links

mod crud;
mod deploy;
mod lifecycle;
mod types;

pub use deploy::{Provisioner, TemplateProvisioner};
pub use lifecycle::InstanceController;
pub use types::{
    Actor, InstanceDetail, InstancePatch, InstanceStatus, InstanceSummary, RuntimeInfo,
    StartOutcome, StopOutcome,
};
