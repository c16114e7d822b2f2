//! SDO client parameter record
//!
//! The engine reads its per-slot configuration from object dictionary
//! records at `0x1280+n`. This module provides the record type applications
//! place in their OD table.

use ferrocan_common::{
    objects::ObjectRawAccess,
    sdo::AbortCode,
};

/// The SDO client parameter record stored at `0x1280+n`
///
/// Sub 1 holds the client-to-server COB-ID, sub 2 the server-to-client
/// COB-ID, and sub 3 the server node id. The server node id is added to
/// both COB-IDs when the slot is enabled, following the convention of the
/// default 0x600/0x580 bases. Setting bit 31 of either COB-ID leaves the
/// slot disabled.
#[derive(Clone, Copy, Debug)]
pub struct SdoClientParams {
    /// COB-ID used for client requests (sub 1)
    pub cob_id_client_to_server: u32,
    /// COB-ID used for server responses (sub 2)
    pub cob_id_server_to_client: u32,
    /// Node ID of the server this slot talks to (sub 3)
    pub server_node_id: u8,
}

impl SdoClientParams {
    /// Create a record using the default request/response COB-ID bases
    pub const fn new(server_node_id: u8) -> Self {
        Self {
            cob_id_client_to_server: ferrocan_common::constants::SDO_REQ_BASE as u32,
            cob_id_server_to_client: ferrocan_common::constants::SDO_RESP_BASE as u32,
            server_node_id,
        }
    }

    /// Create a disabled record
    pub const fn disabled() -> Self {
        Self {
            cob_id_client_to_server: ferrocan_common::constants::cob_id_flags::INVALID,
            cob_id_server_to_client: ferrocan_common::constants::cob_id_flags::INVALID,
            server_node_id: 0,
        }
    }
}

impl ObjectRawAccess for SdoClientParams {
    fn read(&self, sub: u8, buf: &mut [u8]) -> Result<(), AbortCode> {
        match sub {
            0 => {
                if buf.len() != 1 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                buf[0] = 3;
            }
            1 | 2 => {
                if buf.len() != 4 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                let value = if sub == 1 {
                    self.cob_id_client_to_server
                } else {
                    self.cob_id_server_to_client
                };
                buf.copy_from_slice(&value.to_le_bytes());
            }
            3 => {
                if buf.len() != 1 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                buf[0] = self.server_node_id;
            }
            _ => return Err(AbortCode::NoSuchSubIndex),
        }
        Ok(())
    }
}
