pub mod courier;

pub use courier::{Capability, CourierProfile, PermissionSet, PrincipalRecord, Role};
