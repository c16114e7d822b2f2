//! Constants defining standard object indices and COB-ID encoding

/// Object indices for standard objects
pub mod object_ids {
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// Base index of the SDO client parameter records
    ///
    /// Record `n` lives at `SDO_CLIENT_PARAM_BASE + n`, with sub 1 holding
    /// the client-to-server COB-ID, sub 2 the server-to-client COB-ID, and
    /// sub 3 the server node id.
    pub const SDO_CLIENT_PARAM_BASE: u16 = 0x1280;
}

/// Bit layout of COB-ID entries in the object dictionary
pub mod cob_id_flags {
    /// When set, the COB-ID is disabled and must not be used
    pub const INVALID: u32 = 1 << 31;
    /// When set, the COB-ID is a 29-bit extended identifier
    pub const EXTENDED: u32 = 1 << 29;
}

/// The default base ID for sending SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The default base ID for sending SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;
