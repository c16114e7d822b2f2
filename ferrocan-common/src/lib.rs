#![cfg_attr(not(feature = "std"), no_std)]
//! Shared types for the ferrocan SDO client stack
//!
//! This crate holds everything that is meaningful on both sides of the bus:
//! CAN message types, the SDO command codec, and the object dictionary
//! access trait used to configure client slots.

mod atomic_cell;
pub use atomic_cell::AtomicCell;
pub mod constants;
pub mod messages;
pub mod objects;
pub mod sdo;
pub mod traits;

pub use messages::{CanId, CanMessage};
pub use objects::ObjectId;
