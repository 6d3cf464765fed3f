mod base;

pub use base::{Event, EventBus, EventKind, RunNotice, RunSubscription};
