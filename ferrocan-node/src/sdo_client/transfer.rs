//! Per-transfer state carried by a busy client slot

use ferrocan_common::messages::CanId;
use snafu::Snafu;

use crate::timer::TimerHandle;

/// Callback invoked exactly once when a transfer terminates
///
/// The callback runs after the slot has returned to idle, so the
/// application is free to launch its next transfer from inside it. It must
/// be static; use a static fn, or Box::leak a closure where allocation is
/// available.
pub type TransferCallback = &'static (dyn Fn(TransferResult) + Sync);

/// The outcome of a transfer, delivered to the completion callback
pub struct TransferResult {
    /// Index of the object the transfer addressed
    pub index: u16,
    /// Sub-index of the object the transfer addressed
    pub sub: u8,
    /// 0 on success, otherwise the CiA 301 abort code
    pub code: u32,
    /// The buffer lent to the engine for the transfer's duration
    pub buffer: &'static mut [u8],
    /// Bytes transferred. On failure the buffer contents are undefined.
    pub len: usize,
}

impl TransferResult {
    /// Returns true when the transfer completed successfully
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// The transferred bytes, valid on success
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

/// Error returned when a transfer request cannot be accepted
#[derive(Clone, Copy, Debug, PartialEq, Snafu)]
pub enum RequestError {
    /// An argument is invalid (empty buffer, block size out of range)
    BadArg,
    /// The client slot is not configured
    Disabled,
    /// The client slot already has a transfer in flight
    Busy,
}

/// The sub-protocol a transfer is using
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum TransferKind {
    UploadExpedited,
    UploadSegmented,
    DownloadExpedited,
    DownloadSegmented,
    UploadBlock,
    DownloadBlock,
}

/// Progress of a block transfer through its three phases
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum BlockStage {
    /// Init request sent, awaiting the server's init response
    Init,
    /// Sub-blocks are moving
    Transfer,
    /// End handshake in progress
    End,
}

/// Block transfer bookkeeping, meaningful only for the block kinds
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockContext {
    pub stage: BlockStage,
    /// Segments per sub-block, 1..=127, chosen by the server on download
    /// and by us on upload
    pub block_size: u8,
    /// Buffer position at the start of the current sub-block; advanced only
    /// when an ack arrives, so an unacknowledged sub-block is re-read from
    /// the buffer for retransmission
    pub block_offset: usize,
    /// Data bytes (1..=7) of the last segment sent or stored
    pub last_seg_bytes: u8,
    /// Upload receive progress: last in-order sequence number accepted
    pub last_seqnum: u8,
    /// The final segment (c=1) has been seen and accepted
    pub complete: bool,
    /// Both sides support CRC, so the end handshake carries one
    pub crc_enabled: bool,
    /// Protocol switch threshold offered at upload init
    pub pst: u8,
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            stage: BlockStage::Init,
            block_size: 0,
            block_offset: 0,
            last_seg_bytes: 0,
            last_seqnum: 0,
            complete: false,
            crc_enabled: false,
            pst: 0,
        }
    }
}

/// All state belonging to one in-flight transfer
///
/// Exists only while the owning slot is busy; dropping back to idle and
/// invoking the callback are a single operation on this type.
pub(crate) struct TransferContext {
    pub kind: TransferKind,
    pub index: u16,
    pub sub: u8,
    /// Captured at request time; the slot's identifiers cannot change while
    /// a transfer is in flight
    pub tx_id: CanId,
    /// Caller-owned storage, returned through the callback
    pub buf: &'static mut [u8],
    /// Bytes to transfer. Starts as the buffer capacity for uploads and is
    /// narrowed when the server declares a size.
    pub size: usize,
    /// Bytes transferred so far
    pub cursor: usize,
    pub toggle: bool,
    pub timeout_ms: u32,
    pub timer: Option<TimerHandle>,
    pub callback: TransferCallback,
    /// 0 while in progress, otherwise the abort code the callback will see
    pub abort_code: u32,
    pub block: BlockContext,
}

impl TransferContext {
    pub fn new(
        kind: TransferKind,
        index: u16,
        sub: u8,
        tx_id: CanId,
        buf: &'static mut [u8],
        callback: TransferCallback,
        timeout_ms: u32,
    ) -> Self {
        let size = buf.len();
        Self {
            kind,
            index,
            sub,
            tx_id,
            buf,
            size,
            cursor: 0,
            toggle: false,
            timeout_ms,
            timer: None,
            callback,
            abort_code: 0,
            block: BlockContext::default(),
        }
    }
}
