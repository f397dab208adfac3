//! EscrowSettle Common Types
//!
//! This crate contains shared types used across EscrowSettle, including
//! identifiers, monetary types, the booking state machine and dispute records.

pub mod identifiers;
pub mod monetary;
pub mod booking;
pub mod dispute;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use booking::*;
pub use dispute::*;
pub use error::*;
pub use time::*;
