//! Room membership bookkeeping shared by mesh signaling and the SFU

mod registry;

pub use registry::{
    JoinOutcome, LeaveOutcome, MembershipObserver, RegistryError, RoomRegistry, RoomSummary,
};
