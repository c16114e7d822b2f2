use defmt_or_log::{debug, warn};

use ferrocan_common::{
    constants::{cob_id_flags, object_ids},
    messages::{CanId, CanMessage},
    objects::{find_object, ODEntry, ObjectId},
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
    traits::CanSender,
};

use crate::timer::{TimerError, TimerPool};

use super::{
    transfer::{BlockStage, TransferContext, TransferKind},
    RequestError, TransferCallback, TransferResult, MAX_BLOCK_SIZE,
};

/// Lifecycle state of a client slot
///
/// The transfer context exists exactly while the slot is busy, which makes
/// "context is live iff a transfer is in flight" structural.
enum ClientState {
    /// Not configured; no dictionary entry, or its COB-IDs are disabled
    Invalid,
    /// Configured and ready to accept a request
    Idle,
    /// A transfer is in flight
    Busy(TransferContext),
}

/// The outcome of one dispatch step
enum Step {
    /// The transfer continues; the context goes back into the slot
    Continue(TransferContext),
    /// The transfer reached a terminal event and must be finalized
    Done(TransferContext),
}

/// One SDO client slot
///
/// Each slot is an independent protocol instance bound to one remote SDO
/// server through the COB-ID pair configured in the object dictionary at
/// `0x1280 + num`. A slot runs a single transfer at a time; the request is
/// accepted synchronously and the outcome is delivered through the
/// completion callback once the wire protocol terminates.
pub struct SdoClient {
    num: u8,
    rx_id: Option<CanId>,
    tx_id: Option<CanId>,
    state: ClientState,
}

impl SdoClient {
    pub(crate) fn new(num: u8) -> Self {
        Self {
            num,
            rx_id: None,
            tx_id: None,
            state: ClientState::Invalid,
        }
    }

    /// The slot number, i.e. the `n` in `0x1280 + n`
    pub fn num(&self) -> u8 {
        self.num
    }

    /// Returns true when the slot is configured
    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, ClientState::Invalid)
    }

    /// Returns true while a transfer is in flight
    pub fn is_busy(&self) -> bool {
        matches!(self.state, ClientState::Busy(_))
    }

    /// The COB-ID this slot listens on, once enabled
    pub fn rx_id(&self) -> Option<CanId> {
        self.rx_id
    }

    /// The COB-ID this slot transmits on, once enabled
    pub fn tx_id(&self) -> Option<CanId> {
        self.tx_id
    }

    /// Abort any in-flight transfer and deconfigure the slot
    ///
    /// A busy slot finalizes with the device-state abort code, so the
    /// pending callback still fires exactly once. A failed timer cancel is
    /// reported but does not prevent the reset.
    pub(crate) fn reset(&mut self, timers: &mut TimerPool) -> Result<(), TimerError> {
        let mut result = Ok(());
        if let ClientState::Busy(mut ctx) = core::mem::replace(&mut self.state, ClientState::Invalid)
        {
            ctx.abort_code = AbortCode::CantStore as u32;
            if let Some(handle) = ctx.timer.take() {
                result = timers.cancel(handle);
            }
            Self::finalize(ctx, timers);
        }
        self.rx_id = None;
        self.tx_id = None;
        result
    }

    /// Configure the slot from its dictionary record
    ///
    /// Reads `0x1280 + num` subs 1..3 and derives the COB-ID pair by adding
    /// the server node id to the configured bases. A missing record, failed
    /// read, or disabled COB-ID leaves the slot unconfigured.
    pub(crate) fn enable(&mut self, od: &[ODEntry]) {
        self.rx_id = None;
        self.tx_id = None;
        self.state = ClientState::Invalid;

        let index = object_ids::SDO_CLIENT_PARAM_BASE + self.num as u16;
        let Some(obj) = find_object(od, index) else {
            return;
        };
        let Ok(tx_cob) = obj.read_u32(1) else {
            return;
        };
        let Ok(rx_cob) = obj.read_u32(2) else {
            return;
        };
        let Ok(node_id) = obj.read_u8(3) else {
            return;
        };

        if (tx_cob | rx_cob) & cob_id_flags::INVALID != 0 {
            return;
        }
        let Some(tx_id) = CanId::from_cob_id(tx_cob + node_id as u32) else {
            return;
        };
        let Some(rx_id) = CanId::from_cob_id(rx_cob + node_id as u32) else {
            return;
        };

        self.tx_id = Some(tx_id);
        self.rx_id = Some(rx_id);
        self.state = ClientState::Idle;
        debug!("SDO client {} enabled for server {}", self.num, node_id);
    }

    /// Returns true if a frame with this id should be dispatched here
    ///
    /// An idle slot is not interested in responses; it either never asked,
    /// or the transfer already timed out.
    pub(crate) fn wants(&self, id: CanId) -> bool {
        self.is_busy() && self.rx_id == Some(id)
    }

    pub(crate) fn timer_expired(&self, timers: &TimerPool) -> bool {
        if let ClientState::Busy(ctx) = &self.state {
            ctx.timer.map(|h| timers.expired(h)).unwrap_or(false)
        } else {
            false
        }
    }

    fn check_ready(&self, buf: &[u8]) -> Result<CanId, RequestError> {
        if buf.is_empty() {
            return Err(RequestError::BadArg);
        }
        match &self.state {
            ClientState::Invalid => Err(RequestError::Disabled),
            ClientState::Busy(_) => Err(RequestError::Busy),
            ClientState::Idle => self.tx_id.ok_or(RequestError::Disabled),
        }
    }

    /// Mark the slot busy and put the initiating frame on the wire
    fn launch(
        &mut self,
        mut ctx: TransferContext,
        msg: CanMessage,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) {
        Self::rearm(&mut ctx, timers);
        self.state = ClientState::Busy(ctx);
        sender.send(msg).ok();
    }

    /// Start reading an object from the server
    ///
    /// The server picks the expedited protocol for values of up to 4 bytes
    /// and the segmented protocol beyond that; this slot accepts either.
    pub(crate) fn request_upload(
        &mut self,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
        key: ObjectId,
        buf: &'static mut [u8],
        callback: TransferCallback,
        timeout_ms: u32,
    ) -> Result<(), RequestError> {
        let tx_id = self.check_ready(buf)?;
        let kind = if buf.len() <= 4 {
            TransferKind::UploadExpedited
        } else {
            TransferKind::UploadSegmented
        };
        let ctx = TransferContext::new(kind, key.index, key.sub, tx_id, buf, callback, timeout_ms);
        let msg = SdoRequest::initiate_upload(key.index, key.sub).to_can_message(tx_id);
        self.launch(ctx, msg, sender, timers);
        Ok(())
    }

    /// Start reading an object from the server using the block protocol
    ///
    /// `blksize` is the number of segments per sub-block we offer the
    /// server (1..=127). With a nonzero `pst`, the server may answer with a
    /// plain upload response instead, and the transfer silently continues
    /// as segmented or expedited.
    pub(crate) fn request_upload_block(
        &mut self,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
        key: ObjectId,
        buf: &'static mut [u8],
        callback: TransferCallback,
        timeout_ms: u32,
        crc: bool,
        blksize: u8,
        pst: u8,
    ) -> Result<(), RequestError> {
        if blksize == 0 || blksize > MAX_BLOCK_SIZE {
            return Err(RequestError::BadArg);
        }
        let tx_id = self.check_ready(buf)?;
        let mut ctx = TransferContext::new(
            TransferKind::UploadBlock,
            key.index,
            key.sub,
            tx_id,
            buf,
            callback,
            timeout_ms,
        );
        ctx.block.crc_enabled = crc;
        ctx.block.block_size = blksize;
        ctx.block.pst = pst;
        let msg = SdoRequest::initiate_block_upload(key.index, key.sub, crc, blksize, pst)
            .to_can_message(tx_id);
        self.launch(ctx, msg, sender, timers);
        Ok(())
    }

    /// Start writing an object to the server
    ///
    /// Buffers of up to 4 bytes go out as a single expedited frame; larger
    /// ones use the segmented protocol.
    pub(crate) fn request_download(
        &mut self,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
        key: ObjectId,
        buf: &'static mut [u8],
        callback: TransferCallback,
        timeout_ms: u32,
    ) -> Result<(), RequestError> {
        let tx_id = self.check_ready(buf)?;
        let size = buf.len();
        let (kind, msg) = if size <= 4 {
            let msg = SdoRequest::expedited_download(key.index, key.sub, buf).to_can_message(tx_id);
            (TransferKind::DownloadExpedited, msg)
        } else {
            let msg = SdoRequest::initiate_download(key.index, key.sub, Some(size as u32))
                .to_can_message(tx_id);
            (TransferKind::DownloadSegmented, msg)
        };
        let mut ctx =
            TransferContext::new(kind, key.index, key.sub, tx_id, buf, callback, timeout_ms);
        if kind == TransferKind::DownloadExpedited {
            // All data left in the initiating frame
            ctx.cursor = size;
        }
        self.launch(ctx, msg, sender, timers);
        Ok(())
    }

    /// Start writing an object to the server using the block protocol
    pub(crate) fn request_download_block(
        &mut self,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
        key: ObjectId,
        buf: &'static mut [u8],
        callback: TransferCallback,
        timeout_ms: u32,
        crc: bool,
    ) -> Result<(), RequestError> {
        let tx_id = self.check_ready(buf)?;
        let size = buf.len();
        let mut ctx = TransferContext::new(
            TransferKind::DownloadBlock,
            key.index,
            key.sub,
            tx_id,
            buf,
            callback,
            timeout_ms,
        );
        ctx.block.crc_enabled = crc;
        let msg = SdoRequest::initiate_block_download(key.index, key.sub, crc, size as u32)
            .to_can_message(tx_id);
        self.launch(ctx, msg, sender, timers);
        Ok(())
    }

    /// Process a response frame already matched to this slot
    pub(crate) fn handle_response(
        &mut self,
        msg: CanMessage,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) {
        let ctx = match core::mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Busy(ctx) => ctx,
            other => {
                self.state = other;
                return;
            }
        };
        match Self::drive(ctx, msg, sender, timers) {
            Step::Continue(ctx) => self.state = ClientState::Busy(ctx),
            // The slot is already idle, so the callback may launch the next
            // transfer right away
            Step::Done(ctx) => Self::finalize(ctx, timers),
        }
    }

    /// The in-flight transfer timed out
    ///
    /// The timeout abort is the one local abort that also goes on the wire.
    pub(crate) fn timeout(&mut self, sender: &mut dyn CanSender, timers: &mut TimerPool) {
        match core::mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Busy(ctx) => {
                if let Step::Done(ctx) = Self::local_abort(ctx, AbortCode::SdoTimeout, sender) {
                    Self::finalize(ctx, timers);
                }
            }
            other => self.state = other,
        }
    }

    /// Classify an inbound frame and advance the state machine one step
    fn drive(
        mut ctx: TransferContext,
        msg: CanMessage,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        // While a block upload is receiving sub-blocks, frames carry a bare
        // sequence number instead of a command specifier. An abort frame is
        // still recognizable: its first byte (0x80) would decode as the
        // illegal sequence number 0.
        if ctx.kind == TransferKind::UploadBlock
            && ctx.block.stage == BlockStage::Transfer
            && msg.data[0] != 0x80
        {
            return Self::upload_block_segment(ctx, msg, sender, timers);
        }

        let resp = match SdoResponse::try_from(msg) {
            Ok(resp) => resp,
            Err(_) => return Self::local_abort(ctx, AbortCode::InvalidCommandSpecifier, sender),
        };

        // Abort protocol: terminate if it names the in-flight object,
        // otherwise the frame is ignored
        if let SdoResponse::Abort {
            index,
            sub,
            abort_code,
        } = resp
        {
            if index == ctx.index && sub == ctx.sub {
                warn!(
                    "SDO client: server aborted {:x}sub{}: {:x}",
                    index, sub, abort_code
                );
                ctx.abort_code = abort_code;
                return Step::Done(ctx);
            }
            return Step::Continue(ctx);
        }

        match ctx.kind {
            TransferKind::UploadExpedited | TransferKind::UploadSegmented => match resp {
                SdoResponse::ConfirmUpload {
                    n, e: true, s, data, ..
                } => Self::upload_expedited(ctx, n, s, data, sender),
                SdoResponse::ConfirmUpload {
                    e: false,
                    s,
                    index,
                    sub,
                    data,
                    ..
                } => Self::init_upload_segmented(ctx, s, index, sub, data, sender, timers),
                SdoResponse::UploadSegment { t, n, c, data }
                    if ctx.kind == TransferKind::UploadSegmented =>
                {
                    Self::upload_segment(ctx, t, n, c, data, sender, timers)
                }
                _ => Self::local_abort(ctx, AbortCode::InvalidCommandSpecifier, sender),
            },
            TransferKind::DownloadExpedited => match resp {
                SdoResponse::ConfirmDownload { .. } => Step::Done(ctx),
                _ => Self::local_abort(ctx, AbortCode::InvalidCommandSpecifier, sender),
            },
            TransferKind::DownloadSegmented => match resp {
                SdoResponse::ConfirmDownload { index, sub } => {
                    Self::init_download_segmented(ctx, index, sub, sender, timers)
                }
                SdoResponse::ConfirmDownloadSegment { t } => {
                    Self::download_segment_ack(ctx, t, sender, timers)
                }
                _ => Self::local_abort(ctx, AbortCode::InvalidCommandSpecifier, sender),
            },
            TransferKind::UploadBlock => match (ctx.block.stage, resp) {
                (
                    BlockStage::Init,
                    SdoResponse::ConfirmBlockUpload {
                        sc,
                        s,
                        index,
                        sub,
                        size,
                    },
                ) => Self::init_upload_block(ctx, sc, s, index, sub, size, sender, timers),
                // Protocol switch: size at or below the offered threshold
                // lets the server fall back to the plain upload protocols
                (
                    BlockStage::Init,
                    SdoResponse::ConfirmUpload {
                        n, e: true, s, data, ..
                    },
                ) => {
                    debug!("SDO client: server switched block upload to expedited");
                    ctx.kind = TransferKind::UploadExpedited;
                    Self::upload_expedited(ctx, n, s, data, sender)
                }
                (
                    BlockStage::Init,
                    SdoResponse::ConfirmUpload {
                        e: false,
                        s,
                        index,
                        sub,
                        data,
                        ..
                    },
                ) => {
                    debug!("SDO client: server switched block upload to segmented");
                    ctx.kind = TransferKind::UploadSegmented;
                    Self::init_upload_segmented(ctx, s, index, sub, data, sender, timers)
                }
                (BlockStage::End, SdoResponse::BlockUploadEnd { n, crc }) => {
                    Self::upload_block_end(ctx, n, crc, sender)
                }
                _ => Self::local_abort(ctx, AbortCode::InvalidCommandSpecifier, sender),
            },
            TransferKind::DownloadBlock => match (ctx.block.stage, resp) {
                (
                    BlockStage::Init,
                    SdoResponse::ConfirmBlockDownload {
                        sc,
                        index,
                        sub,
                        blksize,
                    },
                ) => Self::init_download_block(ctx, sc, index, sub, blksize, sender, timers),
                (BlockStage::Transfer, SdoResponse::ConfirmBlock { ackseq, blksize }) => {
                    Self::download_block_ack(ctx, ackseq, blksize, sender, timers)
                }
                (BlockStage::End, SdoResponse::ConfirmBlockDownloadEnd) => Step::Done(ctx),
                _ => Self::local_abort(ctx, AbortCode::InvalidCommandSpecifier, sender),
            },
        }
    }

    /// Expedited upload response: up to 4 data bytes in the init frame
    fn upload_expedited(
        mut ctx: TransferContext,
        n: u8,
        s: bool,
        data: [u8; 4],
        sender: &mut dyn CanSender,
    ) -> Step {
        let width = if s { 4 - n as usize } else { 4 };
        if width > ctx.buf.len() {
            return Self::local_abort(ctx, AbortCode::OutOfMemory, sender);
        }
        ctx.buf[..width].copy_from_slice(&data[..width]);
        ctx.cursor = width;
        ctx.size = width;
        Step::Done(ctx)
    }

    /// Segmented upload accepted; request the first segment
    fn init_upload_segmented(
        mut ctx: TransferContext,
        s: bool,
        index: u16,
        sub: u8,
        data: [u8; 4],
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        if index != ctx.index || sub != ctx.sub {
            return Self::local_abort(ctx, AbortCode::DataTypeMismatch, sender);
        }
        if s {
            let declared = u32::from_le_bytes(data) as usize;
            if declared == 0 || declared > ctx.buf.len() {
                return Self::local_abort(ctx, AbortCode::DataTypeMismatch, sender);
            }
            ctx.size = declared;
        }
        ctx.kind = TransferKind::UploadSegmented;
        ctx.toggle = false;
        let msg = SdoRequest::upload_segment_request(false).to_can_message(ctx.tx_id);
        Self::rearm(&mut ctx, timers);
        sender.send(msg).ok();
        Step::Continue(ctx)
    }

    /// Store one upload segment and request the next, or finish on c=1
    fn upload_segment(
        mut ctx: TransferContext,
        t: bool,
        n: u8,
        c: bool,
        data: [u8; 7],
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        if t != ctx.toggle {
            return Self::local_abort(ctx, AbortCode::ToggleNotAlternated, sender);
        }
        let remaining = ctx.size - ctx.cursor;
        if remaining == 0 && !c {
            // Server keeps sending past the declared size
            return Self::local_abort(ctx, AbortCode::DataTypeMismatch, sender);
        }
        let count = (7 - n as usize).min(remaining);
        ctx.buf[ctx.cursor..ctx.cursor + count].copy_from_slice(&data[..count]);
        ctx.cursor += count;

        if c {
            // A server that declared no size up front ends the transfer here
            ctx.size = ctx.cursor;
            return Step::Done(ctx);
        }
        ctx.toggle = !ctx.toggle;
        let msg = SdoRequest::upload_segment_request(ctx.toggle).to_can_message(ctx.tx_id);
        Self::rearm(&mut ctx, timers);
        sender.send(msg).ok();
        Step::Continue(ctx)
    }

    /// Segmented download accepted; send the first data segment
    fn init_download_segmented(
        ctx: TransferContext,
        index: u16,
        sub: u8,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        if index != ctx.index || sub != ctx.sub {
            return Self::local_abort(ctx, AbortCode::IncompatibleParameter, sender);
        }
        Self::send_download_segment(ctx, sender, timers)
    }

    fn send_download_segment(
        mut ctx: TransferContext,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        let width = (ctx.size - ctx.cursor).min(7);
        let last = ctx.cursor + width == ctx.size;
        let msg = SdoRequest::download_segment(
            ctx.toggle,
            last,
            &ctx.buf[ctx.cursor..ctx.cursor + width],
        )
        .to_can_message(ctx.tx_id);
        ctx.cursor += width;
        Self::rearm(&mut ctx, timers);
        sender.send(msg).ok();
        Step::Continue(ctx)
    }

    /// Server acknowledged a download segment
    fn download_segment_ack(
        mut ctx: TransferContext,
        t: bool,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        if ctx.cursor >= ctx.size {
            // That was the ack for the final segment
            return Step::Done(ctx);
        }
        if t != ctx.toggle {
            return Self::local_abort(ctx, AbortCode::ToggleNotAlternated, sender);
        }
        ctx.toggle = !ctx.toggle;
        Self::send_download_segment(ctx, sender, timers)
    }

    /// Block download accepted; send the first sub-block
    fn init_download_block(
        mut ctx: TransferContext,
        sc: bool,
        index: u16,
        sub: u8,
        blksize: u8,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        if index != ctx.index || sub != ctx.sub {
            return Self::local_abort(ctx, AbortCode::IncompatibleParameter, sender);
        }
        if blksize == 0 || blksize > MAX_BLOCK_SIZE {
            return Self::local_abort(ctx, AbortCode::InvalidBlockSize, sender);
        }
        ctx.block.crc_enabled = ctx.block.crc_enabled && sc;
        ctx.block.block_size = blksize;
        ctx.block.stage = BlockStage::Transfer;
        Self::send_download_sub_block(ctx, sender, timers)
    }

    /// Burst out one sub-block of numbered segments
    ///
    /// Only the final segment of the sub-block expects a response, so the
    /// timeout is refreshed once after the burst.
    fn send_download_sub_block(
        mut ctx: TransferContext,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        ctx.block.block_offset = ctx.cursor;
        for seqnum in 1..=ctx.block.block_size {
            let width = (ctx.size - ctx.cursor).min(7);
            let c = ctx.cursor + width == ctx.size;
            let mut data = [0u8; 7];
            data[..width].copy_from_slice(&ctx.buf[ctx.cursor..ctx.cursor + width]);
            ctx.cursor += width;
            ctx.block.last_seg_bytes = width as u8;
            sender
                .send(BlockSegment { c, seqnum, data }.to_can_message(ctx.tx_id))
                .ok();
            if c {
                break;
            }
        }
        Self::rearm(&mut ctx, timers);
        Step::Continue(ctx)
    }

    /// Server acknowledged a sub-block; resume after the confirmed bytes
    fn download_block_ack(
        mut ctx: TransferContext,
        ackseq: u8,
        blksize: u8,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        let sent = (ctx.cursor - ctx.block.block_offset).div_ceil(7);
        if ackseq as usize > sent {
            return Self::local_abort(ctx, AbortCode::InvalidSequenceNumber, sender);
        }
        let confirmed = ctx.block.block_offset + ackseq as usize * 7;
        if confirmed >= ctx.size {
            // Everything reached the server; run the end handshake
            ctx.cursor = ctx.size;
            ctx.block.stage = BlockStage::End;
            let crc = if ctx.block.crc_enabled {
                crc16::State::<crc16::XMODEM>::calculate(&ctx.buf[..ctx.size])
            } else {
                0
            };
            let n = 7 - ctx.block.last_seg_bytes;
            let msg = SdoRequest::end_block_download(n, crc).to_can_message(ctx.tx_id);
            Self::rearm(&mut ctx, timers);
            sender.send(msg).ok();
            return Step::Continue(ctx);
        }
        if blksize == 0 || blksize > MAX_BLOCK_SIZE {
            return Self::local_abort(ctx, AbortCode::InvalidBlockSize, sender);
        }
        // A partial ack rewinds the cursor; the unacknowledged tail is
        // re-read from the buffer and resent as a fresh sub-block
        ctx.cursor = confirmed;
        ctx.block.block_size = blksize;
        Self::send_download_sub_block(ctx, sender, timers)
    }

    /// Block upload accepted; tell the server to start sending
    #[allow(clippy::too_many_arguments)]
    fn init_upload_block(
        mut ctx: TransferContext,
        sc: bool,
        s: bool,
        index: u16,
        sub: u8,
        size: u32,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        if index != ctx.index || sub != ctx.sub {
            return Self::local_abort(ctx, AbortCode::IncompatibleParameter, sender);
        }
        ctx.block.crc_enabled = ctx.block.crc_enabled && sc;
        if s {
            let declared = size as usize;
            if declared == 0 || declared > ctx.buf.len() {
                return Self::local_abort(ctx, AbortCode::OutOfMemory, sender);
            }
            ctx.size = declared;
        }
        ctx.block.stage = BlockStage::Transfer;
        ctx.block.last_seqnum = 0;
        let msg = SdoRequest::StartBlockUpload.to_can_message(ctx.tx_id);
        Self::rearm(&mut ctx, timers);
        sender.send(msg).ok();
        Step::Continue(ctx)
    }

    /// One numbered segment of an upload sub-block
    ///
    /// Out-of-order segments are not stored; the ack at the sub-block
    /// boundary tells the server where to resume, and the resend arrives as
    /// a fresh 1-based sub-block.
    fn upload_block_segment(
        mut ctx: TransferContext,
        msg: CanMessage,
        sender: &mut dyn CanSender,
        timers: &mut TimerPool,
    ) -> Step {
        let segment = match BlockSegment::try_from(msg.data()) {
            Ok(segment) => segment,
            Err(_) => return Step::Continue(ctx),
        };
        if segment.seqnum == 0 {
            return Step::Continue(ctx);
        }

        if !ctx.block.complete && segment.seqnum == ctx.block.last_seqnum + 1 {
            let count = (ctx.buf.len() - ctx.cursor).min(7);
            if count < 7 && !segment.c {
                // More segments coming than the buffer can hold
                return Self::local_abort(ctx, AbortCode::OutOfMemory, sender);
            }
            if count == 0 {
                return Self::local_abort(ctx, AbortCode::OutOfMemory, sender);
            }
            ctx.buf[ctx.cursor..ctx.cursor + count].copy_from_slice(&segment.data[..count]);
            ctx.cursor += count;
            ctx.block.last_seqnum = segment.seqnum;
            ctx.block.last_seg_bytes = count as u8;
            if segment.c {
                ctx.block.complete = true;
            }
        }

        // Sub-block boundary: window exhausted, or the final segment is on
        // the wire (even when a gap means we could not accept it yet)
        if segment.c || segment.seqnum >= ctx.block.block_size {
            let ack = SdoRequest::confirm_block(ctx.block.last_seqnum, ctx.block.block_size)
                .to_can_message(ctx.tx_id);
            ctx.block.block_offset = ctx.cursor;
            ctx.block.last_seqnum = 0;
            if ctx.block.complete {
                ctx.block.stage = BlockStage::End;
            }
            Self::rearm(&mut ctx, timers);
            sender.send(ack).ok();
        } else {
            // No response due mid sub-block, but a stalled server must
            // still trip the timeout
            Self::rearm(&mut ctx, timers);
        }
        Step::Continue(ctx)
    }

    /// Server closed the block upload: trim padding, check CRC, confirm
    fn upload_block_end(
        mut ctx: TransferContext,
        n: u8,
        crc: u16,
        sender: &mut dyn CanSender,
    ) -> Step {
        let valid = 7 - n.min(6) as usize;
        let stored = ctx.block.last_seg_bytes as usize;
        if valid > stored {
            // The tail of the final segment did not fit the buffer
            return Self::local_abort(ctx, AbortCode::OutOfMemory, sender);
        }
        ctx.cursor -= stored - valid;
        if ctx.block.crc_enabled {
            let calc = crc16::State::<crc16::XMODEM>::calculate(&ctx.buf[..ctx.cursor]);
            if calc != crc {
                return Self::local_abort(ctx, AbortCode::CrcError, sender);
            }
        }
        ctx.size = ctx.cursor;
        sender
            .send(SdoRequest::EndBlockUpload.to_can_message(ctx.tx_id))
            .ok();
        Step::Done(ctx)
    }

    /// Abort locally detected failures
    ///
    /// Only the timeout abort is transmitted; all other local aborts just
    /// record the code for the callback and drop the transfer.
    fn local_abort(
        mut ctx: TransferContext,
        code: AbortCode,
        sender: &mut dyn CanSender,
    ) -> Step {
        warn!(
            "SDO client: aborting transfer of {:x}sub{}: {:x}",
            ctx.index, ctx.sub, code as u32
        );
        ctx.abort_code = code as u32;
        if code == AbortCode::SdoTimeout {
            let msg =
                SdoRequest::abort(ctx.index, ctx.sub, code as u32).to_can_message(ctx.tx_id);
            sender.send(msg).ok();
        }
        Step::Done(ctx)
    }

    /// Refresh the transfer timeout: cancel the armed timer, start a new one
    fn rearm(ctx: &mut TransferContext, timers: &mut TimerPool) {
        if let Some(handle) = ctx.timer.take() {
            timers.cancel(handle).ok();
        }
        ctx.timer = timers.create(ctx.timeout_ms).ok();
    }

    /// Single funnel for every terminal event
    ///
    /// The caller has already returned the slot to idle; this releases the
    /// timer and hands the buffer back through the callback.
    fn finalize(mut ctx: TransferContext, timers: &mut TimerPool) {
        if let Some(handle) = ctx.timer.take() {
            timers.cancel(handle).ok();
        }
        let result = TransferResult {
            index: ctx.index,
            sub: ctx.sub,
            code: ctx.abort_code,
            len: ctx.cursor,
            buffer: ctx.buf,
        };
        (ctx.callback)(result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::object_dict::SdoClientParams;

    use super::*;

    const SERVER_NODE: u8 = 5;
    const TX_ID: u16 = 0x605;
    const RX_ID: u16 = 0x585;

    #[derive(Default)]
    struct FrameLog(Vec<CanMessage>);

    impl CanSender for FrameLog {
        fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
            self.0.push(msg);
            Ok(())
        }
    }

    /// Records every callback invocation: (index, sub, code, data)
    #[derive(Default)]
    struct CallbackSpy {
        results: Mutex<Vec<(u16, u8, u32, Vec<u8>)>>,
    }

    impl CallbackSpy {
        fn leak() -> (&'static Self, TransferCallback) {
            let spy: &'static CallbackSpy = Box::leak(Box::new(CallbackSpy::default()));
            let cb: TransferCallback = Box::leak(Box::new(move |r: TransferResult| {
                spy.results
                    .lock()
                    .unwrap()
                    .push((r.index, r.sub, r.code, r.buffer[..r.len].to_vec()));
            }));
            (spy, cb)
        }

        fn count(&self) -> usize {
            self.results.lock().unwrap().len()
        }

        fn last(&self) -> (u16, u8, u32, Vec<u8>) {
            self.results.lock().unwrap().last().unwrap().clone()
        }
    }

    fn test_od() -> &'static [ODEntry<'static>] {
        let params = Box::leak(Box::new(SdoClientParams::new(SERVER_NODE)));
        Box::leak(Box::new([ODEntry {
            index: 0x1280,
            data: params,
        }]))
    }

    fn leak_buf(data: &[u8]) -> &'static mut [u8] {
        Box::leak(data.to_vec().into_boxed_slice())
    }

    struct Harness {
        slot: SdoClient,
        timers: TimerPool,
        sender: FrameLog,
    }

    impl Harness {
        fn new() -> Self {
            let mut slot = SdoClient::new(0);
            slot.enable(test_od());
            assert!(slot.is_enabled());
            assert_eq!(Some(CanId::Std(TX_ID)), slot.tx_id());
            assert_eq!(Some(CanId::Std(RX_ID)), slot.rx_id());
            Self {
                slot,
                timers: TimerPool::new(),
                sender: FrameLog::default(),
            }
        }

        /// Deliver a server response to the slot
        fn respond(&mut self, resp: SdoResponse) {
            self.respond_msg(resp.to_can_message(CanId::Std(RX_ID)));
        }

        fn respond_raw(&mut self, data: [u8; 8]) {
            self.respond_msg(CanMessage::new(CanId::Std(RX_ID), &data));
        }

        fn respond_msg(&mut self, msg: CanMessage) {
            assert!(self.slot.wants(msg.id()));
            self.slot
                .handle_response(msg, &mut self.sender, &mut self.timers);
        }

        /// Drain the frames the slot has emitted so far
        fn sent(&mut self) -> Vec<CanMessage> {
            std::mem::take(&mut self.sender.0)
        }
    }

    #[test]
    fn test_expedited_upload() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();

        h.slot
            .request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x1018, 1),
                leak_buf(&[0; 4]),
                cb,
                100,
            )
            .unwrap();
        assert!(h.slot.is_busy());

        let sent = h.sent();
        assert_eq!(1, sent.len());
        assert_eq!([0x40, 0x18, 0x10, 0x01, 0, 0, 0, 0], sent[0].data);

        h.respond_raw([0x43, 0x18, 0x10, 0x01, 0x78, 0x56, 0x34, 0x12]);

        assert_eq!(1, spy.count());
        let (index, sub, code, data) = spy.last();
        assert_eq!((0x1018, 1, 0), (index, sub, code));
        assert_eq!(vec![0x78, 0x56, 0x34, 0x12], data);
        assert!(!h.slot.is_busy());
        assert!(h.slot.is_enabled());
    }

    #[test]
    fn test_expedited_download() {
        for size in 1..=4usize {
            let mut h = Harness::new();
            let (spy, cb) = CallbackSpy::leak();
            let data: Vec<u8> = (1..=size as u8).collect();

            h.slot
                .request_download(
                    &mut h.sender,
                    &mut h.timers,
                    ObjectId::new(0x2000, 2),
                    leak_buf(&data),
                    cb,
                    100,
                )
                .unwrap();

            let sent = h.sent();
            assert_eq!(1, sent.len());
            let expected_cmd = 0x23 | ((4 - size as u8) << 2);
            assert_eq!(expected_cmd, sent[0].data[0]);
            assert_eq!([0x00, 0x20, 2], sent[0].data[1..4]);
            assert_eq!(data, sent[0].data[4..4 + size]);

            h.respond(SdoResponse::download_acknowledge(0x2000, 2));
            assert_eq!(1, spy.count());
            assert_eq!(0, spy.last().2);
            assert!(!h.slot.is_busy());
        }
    }

    #[test]
    fn test_segmented_download() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();
        let data: Vec<u8> = (0..10).collect();

        h.slot
            .request_download(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&data),
                cb,
                100,
            )
            .unwrap();

        let sent = h.sent();
        assert_eq!([0x21, 0x00, 0x20, 1, 10, 0, 0, 0], sent[0].data);

        // Init ack produces the first segment: toggle 0, 7 bytes, c=0
        h.respond(SdoResponse::download_acknowledge(0x2000, 1));
        let sent = h.sent();
        assert_eq!(1, sent.len());
        assert_eq!(0x00, sent[0].data[0]);
        assert_eq!(data[0..7], sent[0].data[1..8]);

        // Segment ack produces the final segment: toggle 1, n=4, c=1
        h.respond(SdoResponse::download_segment_acknowledge(false));
        let sent = h.sent();
        assert_eq!(1, sent.len());
        assert_eq!(0x19, sent[0].data[0]);
        assert_eq!(data[7..10], sent[0].data[1..4]);

        h.respond(SdoResponse::download_segment_acknowledge(true));
        assert!(h.sent().is_empty());
        assert_eq!(1, spy.count());
        assert_eq!(0, spy.last().2);
    }

    #[test]
    fn test_segmented_upload() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();
        let data: Vec<u8> = (10..20).collect();

        h.slot
            .request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 10]),
                cb,
                100,
            )
            .unwrap();
        assert_eq!(0x40, h.sent()[0].data[0]);

        h.respond(SdoResponse::upload_acknowledge(0x2000, 1, Some(10)));
        // First segment request has toggle 0
        assert_eq!(0x60, h.sent()[0].data[0]);

        h.respond(SdoResponse::upload_segment(false, false, &data[0..7]));
        // Toggle alternates on the next request
        assert_eq!(0x70, h.sent()[0].data[0]);

        h.respond(SdoResponse::upload_segment(true, true, &data[7..10]));
        assert!(h.sent().is_empty());

        assert_eq!(1, spy.count());
        let (_, _, code, received) = spy.last();
        assert_eq!(0, code);
        assert_eq!(data, received);
    }

    #[test]
    fn test_segmented_upload_unknown_size() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();

        h.slot
            .request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 32]),
                cb,
                100,
            )
            .unwrap();
        h.sent();

        // No size declared; the c bit alone ends the transfer
        h.respond(SdoResponse::upload_acknowledge(0x2000, 1, None));
        h.sent();
        h.respond(SdoResponse::upload_segment(false, false, &[1, 2, 3, 4, 5, 6, 7]));
        h.sent();
        h.respond(SdoResponse::upload_segment(true, true, &[8, 9]));

        let (_, _, code, received) = spy.last();
        assert_eq!(0, code);
        assert_eq!(vec![1, 2, 3, 4, 5, 6, 7, 8, 9], received);
    }

    #[test]
    fn test_segmented_upload_toggle_error() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();

        h.slot
            .request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 10]),
                cb,
                100,
            )
            .unwrap();
        h.respond(SdoResponse::upload_acknowledge(0x2000, 1, Some(10)));
        h.sent();

        // Segment arrives with the wrong toggle value
        h.respond(SdoResponse::upload_segment(true, false, &[0; 7]));

        assert_eq!(1, spy.count());
        assert_eq!(AbortCode::ToggleNotAlternated as u32, spy.last().2);
        assert!(!h.slot.is_busy());
        // Local aborts other than timeout stay off the wire
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_upload_declared_size_exceeds_buffer() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();

        h.slot
            .request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 10]),
                cb,
                100,
            )
            .unwrap();
        h.respond(SdoResponse::upload_acknowledge(0x2000, 1, Some(20)));

        assert_eq!(AbortCode::DataTypeMismatch as u32, spy.last().2);
    }

    #[test]
    fn test_block_download() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();
        let data: Vec<u8> = (0..50).map(|i| i as u8).collect();

        h.slot
            .request_download_block(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 3),
                leak_buf(&data),
                cb,
                100,
                true,
            )
            .unwrap();

        let sent = h.sent();
        assert_eq!([0xC6, 0x00, 0x20, 3, 50, 0, 0, 0], sent[0].data);

        // Server grants a 7 segment window
        h.respond(SdoResponse::block_download_acknowledge(true, 0x2000, 3, 7));
        let sent = h.sent();
        assert_eq!(7, sent.len());
        for (i, msg) in sent.iter().enumerate() {
            // 49 bytes fit the window, so no segment carries the c bit
            assert_eq!(1 + i as u8, msg.data[0]);
            assert_eq!(data[i * 7..(i + 1) * 7], msg.data[1..8]);
        }

        // Full ack; one final segment with the last byte remains
        h.respond(SdoResponse::confirm_block(7, 7));
        let sent = h.sent();
        assert_eq!(1, sent.len());
        assert_eq!(0x81, sent[0].data[0]);
        assert_eq!(49, sent[0].data[1]);

        // Ack of the final sub-block triggers the end request
        h.respond(SdoResponse::confirm_block(1, 7));
        let sent = h.sent();
        assert_eq!(1, sent.len());
        // n = 7 - 1 data byte in the final segment
        assert_eq!(0xC0 | (6 << 2) | 1, sent[0].data[0]);
        let crc = crc16::State::<crc16::XMODEM>::calculate(&data);
        assert_eq!(crc.to_le_bytes(), sent[0].data[1..3]);

        h.respond(SdoResponse::ConfirmBlockDownloadEnd);
        assert_eq!(1, spy.count());
        assert_eq!(0, spy.last().2);
        assert!(!h.slot.is_busy());
    }

    #[test]
    fn test_block_download_partial_ack_retransmits() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();
        let data: Vec<u8> = (0..21).map(|i| i as u8).collect();

        h.slot
            .request_download_block(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 3),
                leak_buf(&data),
                cb,
                100,
                false,
            )
            .unwrap();
        h.sent();

        h.respond(SdoResponse::block_download_acknowledge(false, 0x2000, 3, 127));
        let sent = h.sent();
        assert_eq!(3, sent.len());
        assert!(sent[2].data[0] & 0x80 != 0);

        // Server only saw the first segment; the rest returns as a fresh
        // sub-block numbered from 1
        h.respond(SdoResponse::confirm_block(1, 127));
        let sent = h.sent();
        assert_eq!(2, sent.len());
        assert_eq!(1, sent[0].data[0]);
        assert_eq!(data[7..14], sent[0].data[1..8]);
        assert_eq!(0x82, sent[1].data[0]);
        assert_eq!(data[14..21], sent[1].data[1..8]);

        h.respond(SdoResponse::confirm_block(2, 127));
        // End frame: final segment was full, so n = 0
        let sent = h.sent();
        assert_eq!(0xC1, sent[0].data[0]);

        h.respond(SdoResponse::ConfirmBlockDownloadEnd);
        assert_eq!(0, spy.last().2);
    }

    #[test]
    fn test_block_download_single_segment_window() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();
        let data: Vec<u8> = (0..10).collect();

        h.slot
            .request_download_block(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 3),
                leak_buf(&data),
                cb,
                100,
                false,
            )
            .unwrap();
        h.sent();

        // blksize 1: every segment is its own sub-block
        h.respond(SdoResponse::block_download_acknowledge(false, 0x2000, 3, 1));
        assert_eq!(1, h.sent().len());
        h.respond(SdoResponse::confirm_block(1, 1));
        let sent = h.sent();
        assert_eq!(1, sent.len());
        assert_eq!(0x81, sent[0].data[0]);
        h.respond(SdoResponse::confirm_block(1, 1));
        assert_eq!(0xC0 | (4 << 2) | 1, h.sent()[0].data[0]);
        h.respond(SdoResponse::ConfirmBlockDownloadEnd);
        assert_eq!(0, spy.last().2);
    }

    #[test]
    fn test_block_upload() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();
        let data: Vec<u8> = (100..112).collect();

        h.slot
            .request_upload_block(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 4),
                leak_buf(&[0; 12]),
                cb,
                100,
                true,
                5,
                0,
            )
            .unwrap();
        let sent = h.sent();
        assert_eq!([0xA4, 0x00, 0x20, 4, 5, 0, 0, 0], sent[0].data);

        h.respond(SdoResponse::block_upload_acknowledge(true, 0x2000, 4, Some(12)));
        // Client commands the server to start streaming
        assert_eq!(0xA3, h.sent()[0].data[0]);

        let mut seg1 = [0u8; 8];
        seg1[0] = 1;
        seg1[1..8].copy_from_slice(&data[0..7]);
        h.respond_raw(seg1);
        assert!(h.sent().is_empty());

        let mut seg2 = [0u8; 8];
        seg2[0] = 0x80 | 2;
        seg2[1..6].copy_from_slice(&data[7..12]);
        h.respond_raw(seg2);
        let sent = h.sent();
        assert_eq!(1, sent.len());
        assert_eq!([0xA2, 2, 5], sent[0].data[0..3]);

        let crc = crc16::State::<crc16::XMODEM>::calculate(&data);
        h.respond(SdoResponse::block_upload_end(2, crc));
        let sent = h.sent();
        assert_eq!(0xA1, sent[0].data[0]);

        assert_eq!(1, spy.count());
        let (_, _, code, received) = spy.last();
        assert_eq!(0, code);
        assert_eq!(data, received);
    }

    #[test]
    fn test_block_upload_gap_causes_retransmit() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();
        let data: Vec<u8> = (0..14).collect();

        h.slot
            .request_upload_block(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 4),
                leak_buf(&[0; 14]),
                cb,
                100,
                false,
                127,
                0,
            )
            .unwrap();
        h.sent();
        h.respond(SdoResponse::block_upload_acknowledge(false, 0x2000, 4, Some(14)));
        h.sent();

        // Segment 1 arrives, segment 2 is lost, the c segment shows up as 3
        let mut seg = [0u8; 8];
        seg[0] = 1;
        seg[1..8].copy_from_slice(&data[0..7]);
        h.respond_raw(seg);

        let mut seg = [0u8; 8];
        seg[0] = 0x80 | 3;
        h.respond_raw(seg);
        // Ack reports only segment 1 received
        let sent = h.sent();
        assert_eq!([0xA2, 1, 127], sent[0].data[0..3]);

        // Server resends the tail as a fresh sub-block
        let mut seg = [0u8; 8];
        seg[0] = 0x80 | 1;
        seg[1..8].copy_from_slice(&data[7..14]);
        h.respond_raw(seg);
        let sent = h.sent();
        assert_eq!([0xA2, 1, 127], sent[0].data[0..3]);

        h.respond(SdoResponse::block_upload_end(0, 0));
        let (_, _, code, received) = spy.last();
        assert_eq!(0, code);
        assert_eq!(data, received);
    }

    #[test]
    fn test_block_upload_crc_mismatch() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();

        h.slot
            .request_upload_block(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 4),
                leak_buf(&[0; 7]),
                cb,
                100,
                true,
                127,
                0,
            )
            .unwrap();
        h.respond(SdoResponse::block_upload_acknowledge(true, 0x2000, 4, Some(7)));
        let mut seg = [0u8; 8];
        seg[0] = 0x80 | 1;
        seg[1..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        h.respond_raw(seg);

        h.respond(SdoResponse::block_upload_end(0, 0xBAD0));
        assert_eq!(AbortCode::CrcError as u32, spy.last().2);
    }

    #[test]
    fn test_block_upload_protocol_switch_to_segmented() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();
        let data: Vec<u8> = (0..6).collect();

        h.slot
            .request_upload_block(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 4),
                leak_buf(&[0; 6]),
                cb,
                100,
                true,
                127,
                10,
            )
            .unwrap();
        h.sent();

        // Server elects the segmented protocol instead of block
        h.respond(SdoResponse::upload_acknowledge(0x2000, 4, Some(6)));
        assert_eq!(0x60, h.sent()[0].data[0]);
        h.respond(SdoResponse::upload_segment(false, true, &data));

        let (_, _, code, received) = spy.last();
        assert_eq!(0, code);
        assert_eq!(data, received);
    }

    #[test]
    fn test_block_upload_protocol_switch_to_expedited() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();

        h.slot
            .request_upload_block(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 4),
                leak_buf(&[0; 4]),
                cb,
                100,
                true,
                127,
                10,
            )
            .unwrap();
        h.sent();

        h.respond(SdoResponse::expedited_upload(0x2000, 4, &[0xAA, 0xBB]));

        let (_, _, code, received) = spy.last();
        assert_eq!(0, code);
        assert_eq!(vec![0xAA, 0xBB], received);
    }

    #[test]
    fn test_timeout_sends_abort_frame() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();

        h.slot
            .request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 10]),
                cb,
                100,
            )
            .unwrap();
        h.sent();

        h.timers.advance(99);
        assert!(!h.slot.timer_expired(&h.timers));
        h.timers.advance(100);
        assert!(h.slot.timer_expired(&h.timers));

        h.slot.timeout(&mut h.sender, &mut h.timers);
        let sent = h.sent();
        assert_eq!(1, sent.len());
        assert_eq!(0x80, sent[0].data[0]);
        assert_eq!(
            (AbortCode::SdoTimeout as u32).to_le_bytes(),
            sent[0].data[4..8]
        );
        assert_eq!(1, spy.count());
        assert_eq!(AbortCode::SdoTimeout as u32, spy.last().2);
        assert!(!h.slot.is_busy());
    }

    #[test]
    fn test_timer_refreshed_on_each_exchange() {
        let mut h = Harness::new();
        let (_spy, cb) = CallbackSpy::leak();

        h.slot
            .request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 14]),
                cb,
                100,
            )
            .unwrap();

        h.timers.advance(90);
        h.respond(SdoResponse::upload_acknowledge(0x2000, 1, Some(14)));
        h.timers.advance(120);
        // The exchange at t=90 rearmed the timeout to t=190
        assert!(!h.slot.timer_expired(&h.timers));
        h.timers.advance(191);
        assert!(h.slot.timer_expired(&h.timers));
    }

    #[test]
    fn test_peer_abort() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();
        let data: Vec<u8> = (0..10).collect();

        h.slot
            .request_download(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&data),
                cb,
                100,
            )
            .unwrap();
        h.sent();

        // An abort for a different object is ignored
        h.respond_raw([0x80, 0x01, 0x20, 1, 0x21, 0x00, 0x04, 0x06]);
        assert!(h.slot.is_busy());
        assert_eq!(0, spy.count());

        // The matching abort terminates the transfer without a response
        h.respond_raw([0x80, 0x00, 0x20, 1, 0x21, 0x00, 0x04, 0x06]);
        assert!(!h.slot.is_busy());
        assert!(h.sent().is_empty());
        assert_eq!(1, spy.count());
        assert_eq!(0x0604_0021, spy.last().2);
    }

    #[test]
    fn test_unexpected_command_aborts() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();

        h.slot
            .request_download(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 10]),
                cb,
                100,
            )
            .unwrap();
        h.sent();

        // An upload segment makes no sense during a download
        h.respond(SdoResponse::upload_segment(false, false, &[0; 7]));
        assert_eq!(AbortCode::InvalidCommandSpecifier as u32, spy.last().2);
        assert!(!h.slot.is_busy());
    }

    #[test]
    fn test_request_validation() {
        let mut h = Harness::new();
        let (_spy, cb) = CallbackSpy::leak();

        assert_eq!(
            Err(RequestError::BadArg),
            h.slot.request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[]),
                cb,
                100
            )
        );
        assert_eq!(
            Err(RequestError::BadArg),
            h.slot.request_upload_block(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 10]),
                cb,
                100,
                false,
                128,
                0
            )
        );

        h.slot
            .request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 4]),
                cb,
                100,
            )
            .unwrap();
        assert_eq!(
            Err(RequestError::Busy),
            h.slot.request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 4]),
                cb,
                100
            )
        );

        let mut disabled = SdoClient::new(3);
        disabled.enable(test_od());
        assert!(!disabled.is_enabled());
        assert_eq!(
            Err(RequestError::Disabled),
            disabled.request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 4]),
                cb,
                100
            )
        );
    }

    #[test]
    fn test_reset_busy_slot_runs_callback() {
        let mut h = Harness::new();
        let (spy, cb) = CallbackSpy::leak();

        h.slot
            .request_upload(
                &mut h.sender,
                &mut h.timers,
                ObjectId::new(0x2000, 1),
                leak_buf(&[0; 10]),
                cb,
                100,
            )
            .unwrap();

        h.slot.reset(&mut h.timers).unwrap();
        assert_eq!(1, spy.count());
        assert_eq!(AbortCode::CantStore as u32, spy.last().2);
        assert!(!h.slot.is_enabled());

        // Re-enabling brings the slot back to idle
        h.slot.enable(test_od());
        assert!(h.slot.is_enabled());
        assert!(!h.slot.is_busy());
    }

    #[test]
    fn test_reset_idle_slot_is_silent() {
        let mut h = Harness::new();
        h.slot.reset(&mut h.timers).unwrap();
        assert!(!h.slot.is_enabled());
    }

    #[test]
    fn test_enable_respects_disabled_cob_id() {
        let params = Box::leak(Box::new(SdoClientParams {
            cob_id_client_to_server: 0x8000_0600,
            cob_id_server_to_client: 0x580,
            server_node_id: 5,
        }));
        let od = Box::leak(Box::new([ODEntry {
            index: 0x1280,
            data: params,
        }]));
        let mut slot = SdoClient::new(0);
        slot.enable(od);
        assert!(!slot.is_enabled());
    }
}
