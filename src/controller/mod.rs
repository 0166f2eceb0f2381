//! Reconcilers for worker MachineSets and their Machines
//!
//! The MachineSet reconciler owns every write. The Machine reconciler only
//! watches availability and re-queues the owning MachineSet through a
//! [`MachineSetTrigger`] when a node comes or goes. Deletions it sees are
//! shared through [`DrainActivity`].

pub mod machine;
pub mod machine_set;

pub use machine::{DrainActivity, MachineContext, MachinePhase, MachineSetRef, MachineSetTrigger};
pub use machine_set::{
    decide, Context, ContextBuilder, KubeMachineSetStore, MachineSetStore, PendingScaleDown,
    ReconciliationDecision,
};
