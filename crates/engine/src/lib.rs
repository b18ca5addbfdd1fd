pub mod echo;
pub mod registry;
pub mod traits;

pub use echo::EchoEngine;
pub use registry::EngineRegistry;
pub use traits::{CancelHandle, Engine, EventSink, FlagCancelHandle, SteerOutcome, StartedRun};
