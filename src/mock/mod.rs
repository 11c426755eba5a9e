//! In-process transport, state machine and callbacks for tests and demos.

mod callbacks;
mod network;
mod state_machine;

pub use callbacks::MockCallbacks;
pub use network::{MockNetworkConfig, MockNetworkHub, MockNodeNetwork, into_event};
pub use state_machine::{AppliedBlock, MemoryState, MemoryStateMachine};
