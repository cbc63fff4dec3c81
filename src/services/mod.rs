pub mod admission;
pub mod coordinator;
pub mod poller;
#[cfg(test)]
pub mod test_support;

pub use admission::AdmissionGuard;
pub use coordinator::{CoordinatorSettings, ExecutionCoordinator};
pub use poller::JobPoller;
