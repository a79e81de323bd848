mod downloader;
mod uploader;

use tracing::{debug, info};

pub use downloader::*;
pub use uploader::*;

/// Shared by both endpoints of one logical connection; positive.
pub type SessionId = i32;

#[derive(Debug, Clone, Copy)]
pub struct SessionBuilder {
    pub max_raw_snd_buf_len: usize,
    pub auto_ack_len: u64,
    pub blk_hint: usize,
}

impl SessionBuilder {
    #[must_use]
    pub fn build(self, sid: SessionId) -> Session {
        let uploader = UploaderBuilder {
            sid,
            max_raw_snd_buf_len: self.max_raw_snd_buf_len,
            blk_hint: self.blk_hint,
        }
        .build();
        let downloader = DownloaderBuilder {
            sid,
            auto_ack_len: self.auto_ack_len,
            blk_hint: self.blk_hint,
        }
        .build();
        debug!(sid, "create session");
        Session {
            sid,
            enabled: true,
            uploader,
            downloader,
        }
    }

    pub fn default() -> Self {
        SessionBuilder {
            max_raw_snd_buf_len: 1024 * 64,
            auto_ack_len: 1024 * 10,
            blk_hint: 1024 * 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disabled,
    Enabled,
    /// Reconnected; the next ack from the peer triggers the resend.
    AwaitingAck,
}

/// One resumable reliable channel.
///
/// The host moves bytes between the session and its transport: whatever [`Session::pullup_framed`]
/// returns goes to the peer, whatever the peer sent goes into [`Session::input`].
pub struct Session {
    sid: SessionId,
    enabled: bool,
    uploader: Uploader,
    downloader: Downloader,
}

impl Session {
    #[must_use]
    #[inline]
    pub fn sid(&self) -> SessionId {
        self.sid
    }

    #[must_use]
    pub fn state(&self) -> State {
        if !self.enabled {
            State::Disabled
        } else if self.uploader.awaiting_reconnect() {
            State::AwaitingAck
        } else {
            State::Enabled
        }
    }

    #[must_use]
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the previous value.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        let old = self.enabled;
        self.enabled = enabled;
        debug!(sid = self.sid, enabled, old, "change enabled flag");
        old
    }

    #[must_use]
    #[inline]
    pub fn need_ack(&self) -> bool {
        self.uploader.need_ack()
    }

    /// Returns the previous value.
    ///
    /// Only clears or sets the flag; the resend on the next ack is armed by [`Session::reconnect`].
    pub fn set_need_ack(&mut self, need_ack: bool) -> bool {
        self.uploader.set_need_ack(need_ack)
    }

    pub fn configure(&mut self, max_raw_snd_buf_len: usize, auto_ack_len: u64) {
        self.uploader.set_max_raw_snd_buf_len(max_raw_snd_buf_len);
        self.downloader.set_auto_ack_len(auto_ack_len);
        debug!(
            sid = self.sid,
            max_raw_snd_buf_len, auto_ack_len, "configure session"
        );
    }

    #[must_use]
    #[inline]
    pub fn rcv_raw_offset(&self) -> u64 {
        self.downloader.rcv_raw_offset()
    }

    #[must_use]
    #[inline]
    pub fn remote_rcv_raw_offset(&self) -> u64 {
        self.uploader.remote_rcv_raw_offset()
    }

    /// Bytes sent but not acknowledged yet.
    #[must_use]
    #[inline]
    pub fn raw_snd_len(&self) -> usize {
        self.uploader.raw_len()
    }

    pub fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        self.uploader.send(data)
    }

    pub fn send_message(&mut self, msg: &[u8]) -> Result<(), SendError> {
        self.uploader.send_message(msg)
    }

    /// Announces everything received so far and restarts the auto-ack count.
    pub fn send_ack(&mut self) {
        let offset = self.downloader.take_ack();
        self.uploader.send_ack(offset);
    }

    pub fn push_raw(&mut self) -> usize {
        self.uploader.push_raw()
    }

    /// A malformed header still leaves the effects of the packets before it, reconnect included;
    /// see [`InputError::report`].
    pub fn input(&mut self, data: &[u8]) -> Result<InputReport, InputError> {
        let res = self.downloader.input(data, &mut self.uploader);
        let report = match &res {
            Ok(report) => report,
            Err(e) => e.report(),
        };
        if report.reconnected {
            info!(
                sid = self.sid,
                remote_rcv_raw_offset = self.uploader.remote_rcv_raw_offset(),
                "reconnected"
            );
        }
        res
    }

    /// Resumes the session over a new transport.
    ///
    /// Framed output meant for the old transport is dropped and our receive offset is announced.
    /// The unacknowledged bytes are resent once the peer answers with its own offset.
    pub fn reconnect(&mut self) {
        self.enabled = true;
        self.uploader.arm_reconnect();
        self.send_ack();
        info!(
            sid = self.sid,
            rcv_raw_offset = self.rcv_raw_offset(),
            raw_snd_len = self.raw_snd_len(),
            "reconnect"
        );
    }

    /// Empties the framed, unacknowledged and delivered buffers. Offsets are kept.
    pub fn reset(&mut self) {
        self.uploader.reset();
        self.downloader.reset();
        debug!(sid = self.sid, "reset session");
    }

    #[must_use]
    #[inline]
    pub fn framed_len(&self) -> usize {
        self.uploader.framed_len()
    }

    #[must_use]
    pub fn pullup_framed(&mut self) -> &[u8] {
        self.uploader.pullup_framed()
    }

    pub fn drain_framed(&mut self, len: usize) -> usize {
        self.uploader.drain_framed(len)
    }

    #[must_use]
    #[inline]
    pub fn delivered_len(&self) -> usize {
        self.downloader.delivered_len()
    }

    #[must_use]
    pub fn pullup_delivered(&mut self) -> &[u8] {
        self.downloader.pullup_delivered()
    }

    pub fn drain_delivered(&mut self, len: usize) -> usize {
        self.downloader.drain_delivered(len)
    }

    #[must_use]
    pub fn recv_message(&mut self) -> Option<Vec<u8>> {
        self.downloader.recv_message()
    }

    #[must_use]
    pub fn stat(&self) -> Stat {
        Stat {
            sid: self.sid,
            state: self.state(),
            upload: self.uploader.stat(),
            download: self.downloader.stat(),
        }
    }

    pub fn dump(&self) {
        let stat = self.stat();
        debug!(sid = self.sid, ?stat, "dump session");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub sid: SessionId,
    pub state: State,
    pub upload: UploadStat,
    pub download: DownloadStat,
}
