//! Remote GPU machines as the scheduler sees them.
//!
//! - [`UtilizationSampler`]: rolling utilization histories and the idle verdict
//! - [`Machine`]: the job slot state machine (`Empty -> Dispatching -> Running -> Empty`)
//!   plus outcomes waiting to be delivered
//! - [`MachineHandle`]: shared handle that drives a `Machine` through remote calls
//! - [`MachinePoller`]: the per-machine polling loop

pub mod handle;
pub mod poller;
pub mod sampler;
pub mod state;

pub use handle::{DispatchResult, MachineHandle};
pub use poller::MachinePoller;
pub use sampler::UtilizationSampler;
pub use state::{JobSlot, Machine};
