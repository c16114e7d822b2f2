//! Implements the core Node object

use defmt_or_log::debug;
use ferrocan_common::{
    objects::{ODEntry, ObjectId},
    traits::CanSender,
};
use snafu::Snafu;

use crate::{
    node_mbox::NodeMbox,
    sdo_client::{RequestError, SdoClient, TransferCallback},
    timer::{TimerError, TimerPool},
};

/// Faults the node records while servicing slots
#[derive(Clone, Copy, Debug, PartialEq, Snafu)]
pub enum NodeError {
    /// A slot's timeout could not be cancelled during reset
    #[snafu(display("Failed cancelling a slot timeout: {source}"))]
    TimerCancel {
        /// The underlying timer pool error
        source: TimerError,
    },
}

/// A CANopen node hosting `N` SDO client slots
///
/// The node owns the slot array, the timeout pool, and a reference to the
/// object dictionary holding the slot configuration records. It is driven
/// from two directions: inbound frames land in the [`NodeMbox`] (usually
/// from the CAN receive IRQ), and the application calls [`Node::process`]
/// with the current time to run the protocol.
#[allow(missing_debug_implementations)]
pub struct Node<const N: usize> {
    slots: [SdoClient; N],
    timers: TimerPool,
    mbox: &'static NodeMbox<N>,
    od: &'static [ODEntry<'static>],
    error: Option<NodeError>,
}

impl<const N: usize> Node<N> {
    /// Create a node and bring up its client slots
    ///
    /// Each slot is configured from the dictionary record at `0x1280 + n`.
    /// Slots whose record is missing or disabled stay unconfigured; that is
    /// not an error, they are simply not found by [`Node::client`].
    pub fn init(mbox: &'static NodeMbox<N>, od: &'static [ODEntry<'static>]) -> Self {
        let slots = core::array::from_fn(|n| SdoClient::new(n as u8));
        let mut node = Self {
            slots,
            timers: TimerPool::new(),
            mbox,
            od,
            error: None,
        };
        for n in 0..N {
            node.reset(n);
            node.enable(n);
        }
        debug!(
            "SDO client engine up, {} of {} slots enabled",
            node.slots.iter().filter(|s| s.is_enabled()).count(),
            N
        );
        node
    }

    /// Abort anything in flight on a slot and deconfigure it
    ///
    /// A transfer in progress finalizes with the device-state abort code,
    /// so its callback still fires. Timer faults are recorded and readable
    /// through [`Node::take_error`].
    pub fn reset(&mut self, num: usize) {
        if let Some(slot) = self.slots.get_mut(num) {
            if let Err(source) = slot.reset(&mut self.timers) {
                self.error = Some(NodeError::TimerCancel { source });
            }
            self.mbox.set_filter(num, None);
        }
    }

    /// Configure a slot from its dictionary record
    pub fn enable(&mut self, num: usize) {
        if let Some(slot) = self.slots.get_mut(num) {
            slot.enable(self.od);
            self.mbox.set_filter(num, slot.rx_id());
        }
    }

    /// Look up an enabled client slot
    ///
    /// Returns `None` for out-of-range numbers and for slots that are not
    /// configured.
    pub fn client(&mut self, num: usize) -> Option<SdoClientRef<'_>> {
        let slot = self.slots.get_mut(num)?;
        if !slot.is_enabled() {
            return None;
        }
        Some(SdoClientRef {
            slot,
            timers: &mut self.timers,
        })
    }

    /// Inspect a slot without taking it
    pub fn slot(&self, num: usize) -> Option<&SdoClient> {
        self.slots.get(num)
    }

    /// Run the engine
    ///
    /// Drains queued response frames into their slots, then fires any
    /// expired transfer timeouts. `now_ms` must be monotonic.
    pub fn process(&mut self, now_ms: u64, sender: &mut dyn CanSender) {
        self.timers.advance(now_ms);

        while let Some(msg) = self.mbox.pop() {
            // Bind the frame to the busy slot listening on its COB-ID.
            // Without a match the frame is dropped: an idle slot is no
            // longer interested in late responses.
            if let Some(slot) = self.slots.iter_mut().find(|s| s.wants(msg.id())) {
                slot.handle_response(msg, sender, &mut self.timers);
            }
        }

        for slot in self.slots.iter_mut() {
            if slot.timer_expired(&self.timers) {
                slot.timeout(sender, &mut self.timers);
            }
        }
    }

    /// Take the most recent recorded fault, if any
    pub fn take_error(&mut self) -> Option<NodeError> {
        self.error.take()
    }
}

/// An enabled client slot together with the node services it needs
///
/// Obtained from [`Node::client`]; the request methods mirror the slot API
/// with the timeout pool already bound.
#[allow(missing_debug_implementations)]
pub struct SdoClientRef<'a> {
    slot: &'a mut SdoClient,
    timers: &'a mut TimerPool,
}

impl SdoClientRef<'_> {
    /// Start reading an object from the server (expedited or segmented)
    pub fn request_upload(
        &mut self,
        sender: &mut dyn CanSender,
        key: ObjectId,
        buf: &'static mut [u8],
        callback: TransferCallback,
        timeout_ms: u32,
    ) -> Result<(), RequestError> {
        self.slot
            .request_upload(sender, self.timers, key, buf, callback, timeout_ms)
    }

    /// Start reading an object from the server using the block protocol
    #[allow(clippy::too_many_arguments)]
    pub fn request_upload_block(
        &mut self,
        sender: &mut dyn CanSender,
        key: ObjectId,
        buf: &'static mut [u8],
        callback: TransferCallback,
        timeout_ms: u32,
        crc: bool,
        blksize: u8,
        pst: u8,
    ) -> Result<(), RequestError> {
        self.slot.request_upload_block(
            sender, self.timers, key, buf, callback, timeout_ms, crc, blksize, pst,
        )
    }

    /// Start writing an object to the server (expedited or segmented)
    pub fn request_download(
        &mut self,
        sender: &mut dyn CanSender,
        key: ObjectId,
        buf: &'static mut [u8],
        callback: TransferCallback,
        timeout_ms: u32,
    ) -> Result<(), RequestError> {
        self.slot
            .request_download(sender, self.timers, key, buf, callback, timeout_ms)
    }

    /// Start writing an object to the server using the block protocol
    pub fn request_download_block(
        &mut self,
        sender: &mut dyn CanSender,
        key: ObjectId,
        buf: &'static mut [u8],
        callback: TransferCallback,
        timeout_ms: u32,
        crc: bool,
    ) -> Result<(), RequestError> {
        self.slot
            .request_download_block(sender, self.timers, key, buf, callback, timeout_ms, crc)
    }

    /// Returns true while a transfer is in flight on this slot
    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }
}
