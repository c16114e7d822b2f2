//! Object dictionary access types
//!
//! The client engine touches the local object dictionary only to read its
//! own configuration records, so the trait here is the minimal read-only
//! surface required for that.

use crate::sdo::AbortCode;

/// Identifies a sub-object in the dictionary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObjectId {
    /// The object index
    pub index: u16,
    /// The sub-object index
    pub sub: u8,
}

impl ObjectId {
    /// Create a new ObjectId
    pub const fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }

    /// Decode a packed key: index in bits 16..32, sub in bits 8..16
    pub const fn from_raw(key: u32) -> Self {
        Self {
            index: (key >> 16) as u16,
            sub: (key >> 8) as u8,
        }
    }

    /// Encode to the packed key format
    pub const fn raw(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8)
    }
}

/// Read access to the sub-objects of a dictionary object
pub trait ObjectRawAccess: Sync {
    /// Read the value of a sub-object into `buf`
    ///
    /// Fails with [`AbortCode::NoSuchSubIndex`] if the sub-object does not
    /// exist, or [`AbortCode::DataTypeMismatch`] if its size does not match
    /// the buffer.
    fn read(&self, sub: u8, buf: &mut [u8]) -> Result<(), AbortCode>;

    /// Read a sub-object as a little-endian u32
    fn read_u32(&self, sub: u8) -> Result<u32, AbortCode> {
        let mut buf = [0; 4];
        self.read(sub, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a sub-object as a u8
    fn read_u8(&self, sub: u8) -> Result<u8, AbortCode> {
        let mut buf = [0; 1];
        self.read(sub, &mut buf)?;
        Ok(buf[0])
    }
}

/// An entry in an object dictionary table
///
/// Tables are expected to be sorted by index.
pub struct ODEntry<'a> {
    /// The object index
    pub index: u16,
    /// Accessor for the object value
    pub data: &'a dyn ObjectRawAccess,
}

/// Look up an object in a dictionary table by index
pub fn find_object<'a>(table: &[ODEntry<'a>], index: u16) -> Option<&'a dyn ObjectRawAccess> {
    table
        .binary_search_by_key(&index, |e| e.index)
        .ok()
        .map(|i| table[i].data)
}
