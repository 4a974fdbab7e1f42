pub mod manager;
pub mod state;

pub use manager::AllocationManager;
pub use state::{
    AllocationFailureReason, AllocationId, AllocationRecord, AllocationRegistry,
    AllocationRequest, AllocationStatus,
};
