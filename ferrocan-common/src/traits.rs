//! Common traits

use crate::messages::CanMessage;

/// A synchronous CAN sender
///
/// The engine sends frames through this trait and treats failures as lost
/// frames; the transfer timeout recovers from them.
pub trait CanSender {
    /// Send a message to the bus
    ///
    /// On failure the message is handed back to the caller.
    fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage>;
}
