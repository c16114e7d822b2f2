//! Implements the mailbox for receiving CAN frames
//!
//! The mailbox sits between the CAN receive path (typically an interrupt
//! handler) and the [`Node`](crate::Node) processing loop. It filters
//! frames by the receive COB-IDs of the enabled client slots and queues
//! matches until [`Node::process`](crate::Node::process) drains them. The
//! queue depth covers a burst of responses arriving while the application
//! thread is away.

use core::cell::RefCell;

use critical_section::Mutex;
use defmt_or_log::warn;
use ferrocan_common::{
    messages::{CanId, CanMessage},
    AtomicCell,
};
use heapless::Deque;

const QUEUE_DEPTH: usize = 16;

/// A data structure to be shared between a receiving thread (e.g. a CAN
/// controller IRQ) and the [`Node`](crate::Node) object
///
/// Incoming frames should be passed to [`NodeMbox::store_message`]. `N` is
/// the number of client slots served.
#[allow(missing_debug_implementations)]
pub struct NodeMbox<const N: usize> {
    /// Accepted receive COB-ID per client slot, None while disabled
    filters: [AtomicCell<Option<CanId>>; N],
    queue: Mutex<RefCell<Deque<CanMessage, QUEUE_DEPTH>>>,
    notify_cb: AtomicCell<Option<&'static (dyn Fn() + Sync)>>,
}

impl<const N: usize> NodeMbox<N> {
    /// Create a new NodeMbox
    pub const fn new() -> Self {
        Self {
            filters: [const { AtomicCell::new(None) }; N],
            queue: Mutex::new(RefCell::new(Deque::new())),
            notify_cb: AtomicCell::new(None),
        }
    }

    /// Set a callback for notification when a frame is queued and requires
    /// processing
    ///
    /// It must be static. Usually this will be a static fn, but in some
    /// circumstances it may be desirable to use Box::leak to pass a heap
    /// allocated closure instead.
    pub fn set_process_notify_callback(&self, callback: &'static (dyn Fn() + Sync)) {
        self.notify_cb.store(Some(callback));
    }

    fn notify(&self) {
        if let Some(notify_cb) = self.notify_cb.load() {
            notify_cb();
        }
    }

    pub(crate) fn set_filter(&self, slot: usize, cob_id: Option<CanId>) {
        self.filters[slot].store(cob_id);
    }

    pub(crate) fn pop(&self) -> Option<CanMessage> {
        critical_section::with(|cs| self.queue.borrow_ref_mut(cs).pop_front())
    }

    /// Store a received CAN frame
    ///
    /// Returns the frame back when it does not match any enabled slot, or
    /// when the queue is full.
    pub fn store_message(&self, msg: CanMessage) -> Result<(), CanMessage> {
        let id = msg.id();
        if !self.filters.iter().any(|f| f.load() == Some(id)) {
            return Err(msg);
        }
        let stored = critical_section::with(|cs| {
            self.queue.borrow_ref_mut(cs).push_back(msg).is_ok()
        });
        if stored {
            self.notify();
            Ok(())
        } else {
            warn!("SDO client mailbox overrun");
            Err(msg)
        }
    }
}

impl<const N: usize> Default for NodeMbox<N> {
    fn default() -> Self {
        Self::new()
    }
}
