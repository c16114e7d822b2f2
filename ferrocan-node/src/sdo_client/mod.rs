//! Client SDO protocol implementation

mod sdo_client;
mod transfer;

pub use sdo_client::SdoClient;
pub use transfer::{RequestError, TransferCallback, TransferResult};

/// Maximum number of segments in a block transfer sub-block
pub const MAX_BLOCK_SIZE: u8 = 127;
