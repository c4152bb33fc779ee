//! gmcast-core — shared types and wire format for the gmcast membership
//! transport. All other gmcast crates depend on this one.

pub mod addr;
pub mod link;
pub mod view;
pub mod wire;

pub use addr::{Addr, AddrError};
pub use link::LinkMap;
pub use view::{NodeInfo, View, ViewKind};

pub use uuid::Uuid;
