//! Network-facing message dispatch.

pub mod dispatcher;

pub use dispatcher::{DispatchError, Dispatcher, NetMessage, Subscriber};
