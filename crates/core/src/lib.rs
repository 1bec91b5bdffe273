pub mod barge_in;
pub mod dispatcher;
pub mod generic_types;
pub mod store;

pub use barge_in::BargeInDetector;
pub use dispatcher::{DispatchError, FunctionDispatcher};
pub use generic_types::{AudioFrame, ControlEvent, Direction};
pub use store::{BackendStore, InMemoryStore, StoreError};
