//! A simulated CiA 301 SDO server
//!
//! Plays the peer for the client engine in integration tests. Objects are
//! plain byte vectors; the server speaks the expedited, segmented, and
//! block protocols, including the protocol switch on block uploads with a
//! nonzero threshold.

use std::collections::HashMap;

use ferrocan_common::{
    messages::{CanId, CanMessage},
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
    traits::CanSender,
};

/// A CAN sender that simply collects outbound frames
#[derive(Default)]
pub struct FrameSink(pub Vec<CanMessage>);

impl FrameSink {
    pub fn take(&mut self) -> Vec<CanMessage> {
        std::mem::take(&mut self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl CanSender for FrameSink {
    fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        self.0.push(msg);
        Ok(())
    }
}

enum State {
    Idle,
    UploadSegmented {
        toggle: bool,
        data: Vec<u8>,
        pos: usize,
    },
    DownloadSegmented {
        index: u16,
        sub: u8,
        toggle: bool,
        data: Vec<u8>,
    },
    DownloadBlock {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        data: Vec<u8>,
        next_seq: u8,
        finished: bool,
    },
    DownloadBlockEnd {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        data: Vec<u8>,
    },
    /// Block upload accepted, waiting for the start command
    UploadBlockStart {
        crc_enabled: bool,
        blksize: u8,
        data: Vec<u8>,
    },
    /// Sub-blocks are being sent, waiting for acks
    UploadBlockSending {
        crc_enabled: bool,
        blksize: u8,
        data: Vec<u8>,
        block_start: usize,
    },
    /// End response sent, waiting for the client to close
    UploadBlockEnd,
}

/// An in-process SDO server bound to one node id
pub struct SimServer {
    node_id: u8,
    /// Window granted to clients on block downloads
    blksize: u8,
    crc_support: bool,
    objects: HashMap<(u16, u8), Vec<u8>>,
    state: State,
}

impl SimServer {
    pub fn new(node_id: u8, blksize: u8, crc_support: bool) -> Self {
        Self {
            node_id,
            blksize,
            crc_support,
            objects: HashMap::new(),
            state: State::Idle,
        }
    }

    pub fn set_object(&mut self, index: u16, sub: u8, data: &[u8]) {
        self.objects.insert((index, sub), data.to_vec());
    }

    pub fn object(&self, index: u16, sub: u8) -> Option<&Vec<u8>> {
        self.objects.get(&(index, sub))
    }

    fn resp_id(&self) -> CanId {
        CanId::Std(0x580 + self.node_id as u16)
    }

    fn respond(&self, resp: SdoResponse) -> Vec<CanMessage> {
        vec![resp.to_can_message(self.resp_id())]
    }

    fn abort(&mut self, index: u16, sub: u8, code: AbortCode) -> Vec<CanMessage> {
        self.state = State::Idle;
        self.respond(SdoResponse::abort(index, sub, code))
    }

    /// Send one sub-block of an upload, starting at `block_start`
    fn upload_sub_block(&self, data: &[u8], block_start: usize, blksize: u8) -> Vec<CanMessage> {
        let mut frames = Vec::new();
        for seqnum in 1..=blksize {
            let start = block_start + (seqnum - 1) as usize * 7;
            if start >= data.len() {
                break;
            }
            let chunk = (data.len() - start).min(7);
            let c = start + chunk == data.len();
            let mut seg = [0u8; 7];
            seg[..chunk].copy_from_slice(&data[start..start + chunk]);
            frames.push(
                BlockSegment {
                    c,
                    seqnum,
                    data: seg,
                }
                .to_can_message(self.resp_id()),
            );
            if c {
                break;
            }
        }
        frames
    }

    /// Process one frame from the client, producing the server's responses
    pub fn handle(&mut self, msg: CanMessage) -> Vec<CanMessage> {
        if msg.id() != CanId::Std(0x600 + self.node_id as u16) {
            return Vec::new();
        }

        // Mid block download the wire carries bare numbered segments
        if let State::DownloadBlock { .. } = &self.state {
            if msg.data[0] != 0x80 {
                return self.download_block_segment(msg);
            }
        }

        let req = match SdoRequest::try_from(msg.data()) {
            Ok(req) => req,
            Err(code) => return self.abort(0, 0, code),
        };

        match req {
            SdoRequest::InitiateUpload { index, sub } => self.start_upload(index, sub),
            SdoRequest::ReqUploadSegment { t } => self.upload_segment(t),
            SdoRequest::InitiateDownload {
                n,
                e,
                s: _,
                index,
                sub,
                data,
            } => {
                if e {
                    let len = 4 - n as usize;
                    self.objects.insert((index, sub), data[..len].to_vec());
                    self.respond(SdoResponse::download_acknowledge(index, sub))
                } else {
                    self.state = State::DownloadSegmented {
                        index,
                        sub,
                        toggle: false,
                        data: Vec::new(),
                    };
                    self.respond(SdoResponse::download_acknowledge(index, sub))
                }
            }
            SdoRequest::DownloadSegment { t, n, c, data } => self.download_segment(t, n, c, data),
            SdoRequest::InitiateBlockDownload {
                cc,
                s: _,
                index,
                sub,
                size: _,
            } => {
                self.state = State::DownloadBlock {
                    index,
                    sub,
                    crc_enabled: cc && self.crc_support,
                    data: Vec::new(),
                    next_seq: 1,
                    finished: false,
                };
                self.respond(SdoResponse::block_download_acknowledge(
                    self.crc_support,
                    index,
                    sub,
                    self.blksize,
                ))
            }
            SdoRequest::EndBlockDownload { n, crc } => self.end_block_download(n, crc),
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                let Some(data) = self.objects.get(&(index, sub)).cloned() else {
                    return self.abort(index, sub, AbortCode::NoSuchObject);
                };
                // Protocol switch threshold: small objects may fall back to
                // the plain upload protocols
                if pst > 0 && data.len() <= pst as usize {
                    return self.start_upload(index, sub);
                }
                self.state = State::UploadBlockStart {
                    crc_enabled: cc && self.crc_support,
                    blksize,
                    data: data.clone(),
                };
                self.respond(SdoResponse::block_upload_acknowledge(
                    self.crc_support,
                    index,
                    sub,
                    Some(data.len() as u32),
                ))
            }
            SdoRequest::StartBlockUpload => {
                if let State::UploadBlockStart {
                    crc_enabled,
                    blksize,
                    data,
                } = std::mem::replace(&mut self.state, State::Idle)
                {
                    let frames = self.upload_sub_block(&data, 0, blksize);
                    self.state = State::UploadBlockSending {
                        crc_enabled,
                        blksize,
                        data,
                        block_start: 0,
                    };
                    frames
                } else {
                    Vec::new()
                }
            }
            SdoRequest::ConfirmBlock { ackseq, blksize } => self.block_confirmed(ackseq, blksize),
            SdoRequest::EndBlockUpload => {
                self.state = State::Idle;
                Vec::new()
            }
            SdoRequest::Abort { .. } => {
                self.state = State::Idle;
                Vec::new()
            }
        }
    }

    fn start_upload(&mut self, index: u16, sub: u8) -> Vec<CanMessage> {
        let Some(data) = self.objects.get(&(index, sub)).cloned() else {
            return self.abort(index, sub, AbortCode::NoSuchObject);
        };
        if data.len() <= 4 {
            self.respond(SdoResponse::expedited_upload(index, sub, &data))
        } else {
            let size = data.len() as u32;
            self.state = State::UploadSegmented {
                toggle: false,
                data,
                pos: 0,
            };
            self.respond(SdoResponse::upload_acknowledge(index, sub, Some(size)))
        }
    }

    fn upload_segment(&mut self, t: bool) -> Vec<CanMessage> {
        let State::UploadSegmented { toggle, data, pos } = &mut self.state else {
            return self.abort(0, 0, AbortCode::InvalidCommandSpecifier);
        };
        if t != *toggle {
            return self.abort(0, 0, AbortCode::ToggleNotAlternated);
        }
        let chunk = (data.len() - *pos).min(7);
        let c = *pos + chunk == data.len();
        let resp = SdoResponse::upload_segment(t, c, &data[*pos..*pos + chunk]);
        *pos += chunk;
        *toggle = !*toggle;
        if c {
            self.state = State::Idle;
        }
        self.respond(resp)
    }

    fn download_segment(&mut self, t: bool, n: u8, c: bool, seg: [u8; 7]) -> Vec<CanMessage> {
        let State::DownloadSegmented {
            index,
            sub,
            toggle,
            data,
        } = &mut self.state
        else {
            return self.abort(0, 0, AbortCode::InvalidCommandSpecifier);
        };
        if t != *toggle {
            let (index, sub) = (*index, *sub);
            return self.abort(index, sub, AbortCode::ToggleNotAlternated);
        }
        data.extend_from_slice(&seg[..7 - n as usize]);
        *toggle = !*toggle;
        let resp = SdoResponse::download_segment_acknowledge(t);
        if c {
            let (index, sub) = (*index, *sub);
            let data = std::mem::take(data);
            self.objects.insert((index, sub), data);
            self.state = State::Idle;
        }
        self.respond(resp)
    }

    fn download_block_segment(&mut self, msg: CanMessage) -> Vec<CanMessage> {
        let State::DownloadBlock {
            data,
            next_seq,
            finished,
            ..
        } = &mut self.state
        else {
            return Vec::new();
        };
        let Ok(segment) = BlockSegment::try_from(msg.data()) else {
            return Vec::new();
        };
        if segment.seqnum == *next_seq && !*finished {
            data.extend_from_slice(&segment.data);
            *next_seq += 1;
            if segment.c {
                *finished = true;
            }
        }
        // Sub-block boundary
        if segment.c || segment.seqnum >= self.blksize {
            let ackseq = *next_seq - 1;
            *next_seq = 1;
            let resp = SdoResponse::confirm_block(ackseq, self.blksize);
            if *finished {
                if let State::DownloadBlock {
                    index,
                    sub,
                    crc_enabled,
                    data,
                    ..
                } = std::mem::replace(&mut self.state, State::Idle)
                {
                    self.state = State::DownloadBlockEnd {
                        index,
                        sub,
                        crc_enabled,
                        data,
                    };
                }
            }
            return self.respond(resp);
        }
        Vec::new()
    }

    fn end_block_download(&mut self, n: u8, crc: u16) -> Vec<CanMessage> {
        let State::DownloadBlockEnd {
            index,
            sub,
            crc_enabled,
            mut data,
        } = std::mem::replace(&mut self.state, State::Idle)
        else {
            return self.abort(0, 0, AbortCode::InvalidCommandSpecifier);
        };
        data.truncate(data.len() - n as usize);
        if crc_enabled {
            let calc = crc16::State::<crc16::XMODEM>::calculate(&data);
            if calc != crc {
                return self.abort(index, sub, AbortCode::CrcError);
            }
        }
        self.objects.insert((index, sub), data);
        self.respond(SdoResponse::ConfirmBlockDownloadEnd)
    }

    fn block_confirmed(&mut self, ackseq: u8, new_blksize: u8) -> Vec<CanMessage> {
        let State::UploadBlockSending {
            crc_enabled,
            data,
            block_start,
            ..
        } = std::mem::replace(&mut self.state, State::Idle)
        else {
            return Vec::new();
        };
        let confirmed = block_start + ackseq as usize * 7;
        if confirmed >= data.len() {
            let n = ((7 - data.len() % 7) % 7) as u8;
            let crc = if crc_enabled {
                crc16::State::<crc16::XMODEM>::calculate(&data)
            } else {
                0
            };
            self.state = State::UploadBlockEnd;
            return self.respond(SdoResponse::block_upload_end(n, crc));
        }
        let frames = self.upload_sub_block(&data, confirmed, new_blksize);
        self.state = State::UploadBlockSending {
            crc_enabled,
            blksize: new_blksize,
            data,
            block_start: confirmed,
        };
        frames
    }
}
