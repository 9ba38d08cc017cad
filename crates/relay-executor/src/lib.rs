//! Dispatcher: walks a fallback chain with rotated credentials, compacting
//! context as needed, against a pluggable backend invoker.

pub mod dispatcher;
pub mod events;
pub mod invoker;

pub use dispatcher::{DispatchReport, DispatchState, DispatchSuccess, Dispatcher};
pub use events::{DispatchEvent, EVENT_CHANNEL_CAPACITY, EventBus};
pub use invoker::{BackendFailure, BackendInvoker, BackendResponse, PreparedRequest};
