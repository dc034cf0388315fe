// crates/weavecore/src/events/mod.rs

mod base;
mod bus;

pub use base::{EventKind, Hook, HookError, WorkflowEvent};
pub use bus::{HookBus, SubscriptionId};
