use tracing::{debug, info, trace, warn};

use crate::{
    protocol::{message, packet_hdr::PacketHeaderBuilder},
    utils::buf::ChainedBuf,
};

use super::SessionId;

/// Send half of a session.
///
/// `raw` holds exactly the bytes sent but not yet acknowledged by the peer, so its length is
/// always the last sent offset minus `remote_rcv_raw_offset`.
pub struct Uploader {
    sid: SessionId,

    // wire-ready packets waiting to be polled
    framed: ChainedBuf,
    // resend reservoir, never framed itself
    raw: ChainedBuf,

    // modified by acks
    remote_rcv_raw_offset: u64,
    need_ack: bool,
    resend_on_ack: bool,

    stat: LocalStat,

    // const
    max_raw_snd_buf_len: usize,
    blk_hint: usize,
}

pub struct UploaderBuilder {
    pub sid: SessionId,
    pub max_raw_snd_buf_len: usize,
    pub blk_hint: usize,
}

impl UploaderBuilder {
    #[must_use]
    pub fn build(self) -> Uploader {
        let this = Uploader {
            sid: self.sid,
            framed: ChainedBuf::new(self.blk_hint),
            raw: ChainedBuf::new(self.blk_hint),
            remote_rcv_raw_offset: 0,
            need_ack: false,
            resend_on_ack: false,
            stat: LocalStat::default(),
            max_raw_snd_buf_len: self.max_raw_snd_buf_len,
            blk_hint: self.blk_hint,
        };
        this.check_rep();
        this
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The unacknowledged bytes plus `len` would reach `cap`.
    BufferOverflow { raw_len: usize, len: usize, cap: usize },
    /// A message longer than its length prefix can describe.
    TooLong { len: usize },
}

#[derive(Debug, PartialEq, Eq)]
pub enum AckError {
    /// The peer acknowledged less than it already had.
    Regression { remote_rcv_raw_offset: u64, offset: u64 },
    /// The peer acknowledged bytes that were never sent.
    BeyondSent {
        remote_rcv_raw_offset: u64,
        offset: u64,
        raw_len: usize,
    },
}

/// Effect of an accepted ack.
#[derive(Debug, PartialEq, Eq)]
pub struct Acked {
    /// Bytes released from the resend reservoir; `0` for a duplicate.
    pub delta: u64,
    /// This ack completed a reconnect and the backlog was resent.
    pub reconnected: bool,
}

impl Uploader {
    #[inline]
    fn check_rep(&self) {}

    #[must_use]
    #[inline]
    pub fn framed_len(&self) -> usize {
        self.framed.len()
    }

    #[must_use]
    #[inline]
    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    #[must_use]
    #[inline]
    pub fn remote_rcv_raw_offset(&self) -> u64 {
        self.remote_rcv_raw_offset
    }

    #[must_use]
    #[inline]
    pub fn need_ack(&self) -> bool {
        self.need_ack
    }

    /// A reconnect is armed and waits for the peer's ack to resend.
    #[must_use]
    #[inline]
    pub fn awaiting_reconnect(&self) -> bool {
        self.need_ack && self.resend_on_ack
    }

    /// Returns the previous value.
    pub fn set_need_ack(&mut self, need_ack: bool) -> bool {
        let old = self.need_ack;
        self.need_ack = need_ack;
        debug!(sid = self.sid, need_ack, old, "change need_ack flag");
        old
    }

    pub fn set_max_raw_snd_buf_len(&mut self, max_raw_snd_buf_len: usize) {
        self.max_raw_snd_buf_len = max_raw_snd_buf_len;
    }

    /// Frames `data` as one packet and keeps a copy for resending. Nothing is queued on error.
    pub fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        if data.is_empty() {
            return Ok(());
        }
        let raw_len = self.raw.len();
        if raw_len + data.len() >= self.max_raw_snd_buf_len {
            debug!(
                sid = self.sid,
                raw_len,
                len = data.len(),
                "raw_snd_buf overflow"
            );
            return Err(SendError::BufferOverflow {
                raw_len,
                len: data.len(),
                cap: self.max_raw_snd_buf_len,
            });
        }

        PacketHeaderBuilder {
            ack: 0,
            data_len: data.len() as u64,
        }
        .build()
        .append_to(&mut self.framed);
        self.framed.append(data);
        self.raw.append(data);
        self.stat.sends += 1;

        debug!(
            sid = self.sid,
            raw_len = self.raw.len(),
            len = data.len(),
            "send data"
        );
        self.check_rep();
        Ok(())
    }

    /// Sends `msg` behind a length prefix so the peer can pick whole messages off the stream.
    pub fn send_message(&mut self, msg: &[u8]) -> Result<(), SendError> {
        if msg.is_empty() {
            return Ok(());
        }
        let bytes = message::encode(msg).map_err(|_e| SendError::TooLong { len: msg.len() })?;
        self.send(&bytes)
    }

    /// Frames an ack-only packet announcing `rcv_raw_offset`.
    pub fn send_ack(&mut self, rcv_raw_offset: u64) {
        PacketHeaderBuilder {
            ack: rcv_raw_offset,
            data_len: 0,
        }
        .build()
        .append_to(&mut self.framed);
        self.stat.acks_sent += 1;
        debug!(sid = self.sid, rcv_raw_offset, "send ack");
    }

    /// Replaces whatever is framed with one packet carrying the whole resend reservoir.
    ///
    /// Returns the number of bytes resent.
    pub fn push_raw(&mut self) -> usize {
        let len = self.raw.len();
        if len == 0 {
            return 0;
        }

        self.framed.reset(self.blk_hint);
        PacketHeaderBuilder {
            ack: 0,
            data_len: len as u64,
        }
        .build()
        .append_to(&mut self.framed);
        let backlog = self.raw.pullup();
        self.framed.append(backlog);
        self.stat.resends += 1;

        info!(
            sid = self.sid,
            raw_len = len,
            remote_rcv_raw_offset = self.remote_rcv_raw_offset,
            "push raw"
        );
        self.check_rep();
        len
    }

    /// Applies an ack for `offset` received from the peer.
    pub fn on_ack(&mut self, offset: u64) -> Result<Acked, AckError> {
        if offset < self.remote_rcv_raw_offset {
            warn!(
                sid = self.sid,
                remote_rcv_raw_offset = self.remote_rcv_raw_offset,
                offset,
                "remote ack smaller than local"
            );
            self.stat.rejected_acks += 1;
            return Err(AckError::Regression {
                remote_rcv_raw_offset: self.remote_rcv_raw_offset,
                offset,
            });
        }

        let delta = offset - self.remote_rcv_raw_offset;
        if delta > self.raw.len() as u64 {
            warn!(
                sid = self.sid,
                remote_rcv_raw_offset = self.remote_rcv_raw_offset,
                offset,
                delta,
                raw_len = self.raw.len(),
                "remote ack: not enough data for ack"
            );
            self.stat.rejected_acks += 1;
            return Err(AckError::BeyondSent {
                remote_rcv_raw_offset: self.remote_rcv_raw_offset,
                offset,
                raw_len: self.raw.len(),
            });
        }

        if delta == 0 {
            trace!(sid = self.sid, offset, "remote repeat ack");
            self.stat.duplicate_acks += 1;
        } else {
            let drained = self.raw.drain(delta as usize);
            assert_eq!(drained as u64, delta);
            self.remote_rcv_raw_offset = offset;
            self.stat.acks += 1;
            debug!(sid = self.sid, offset, delta, "remote ack offset");
        }

        // the first ack after a reconnect, duplicate or not, tells where the peer stands
        let mut reconnected = false;
        if self.need_ack {
            if self.resend_on_ack {
                self.push_raw();
                reconnected = true;
            }
            self.need_ack = false;
            self.resend_on_ack = false;
        }

        self.check_rep();
        Ok(Acked { delta, reconnected })
    }

    /// Drops stale framed output and waits for the peer's next ack before resending.
    pub fn arm_reconnect(&mut self) {
        self.need_ack = true;
        self.resend_on_ack = true;
        let stale = self.framed.drain(self.framed.len());
        debug!(sid = self.sid, stale, "drop framed output for reconnect");
    }

    #[must_use]
    pub fn pullup_framed(&mut self) -> &[u8] {
        self.framed.pullup()
    }

    pub fn drain_framed(&mut self, len: usize) -> usize {
        self.framed.drain(len)
    }

    pub fn reset(&mut self) {
        self.framed.reset(self.blk_hint);
        self.raw.reset(self.blk_hint);
        self.check_rep();
    }

    #[must_use]
    pub fn stat(&self) -> UploadStat {
        UploadStat {
            framed_len: self.framed.len(),
            raw_len: self.raw.len(),
            remote_rcv_raw_offset: self.remote_rcv_raw_offset,
            sends: self.stat.sends,
            acks_sent: self.stat.acks_sent,
            resends: self.stat.resends,
            acks: self.stat.acks,
            duplicate_acks: self.stat.duplicate_acks,
            rejected_acks: self.stat.rejected_acks,
        }
    }
}

#[derive(Default)]
struct LocalStat {
    sends: u64,
    acks_sent: u64,
    resends: u64,
    acks: u64,
    duplicate_acks: u64,
    rejected_acks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStat {
    pub framed_len: usize,
    pub raw_len: usize,
    pub remote_rcv_raw_offset: u64,
    pub sends: u64,
    pub acks_sent: u64,
    pub resends: u64,
    pub acks: u64,
    pub duplicate_acks: u64,
    pub rejected_acks: u64,
}

#[cfg(test)]
mod tests {
    use crate::protocol::packet_hdr::{Decoded, PacketHeader};

    use super::*;

    fn upload(max_raw_snd_buf_len: usize) -> Uploader {
        UploaderBuilder {
            sid: 1,
            max_raw_snd_buf_len,
            blk_hint: 64,
        }
        .build()
    }

    #[test]
    fn test_send_frames_and_keeps_raw() {
        let mut upload = upload(1024);
        upload.send(&[0, 1, 2]).unwrap();
        assert_eq!(upload.pullup_framed(), vec![0x01, 3, 0, 1, 2]);
        assert_eq!(upload.raw_len(), 3);
    }

    #[test]
    fn test_send_empty() {
        let mut upload = upload(1024);
        upload.send(&[]).unwrap();
        assert_eq!(upload.framed_len(), 0);
        assert_eq!(upload.raw_len(), 0);
    }

    #[test]
    fn test_overflow_leaves_buffers() {
        let mut upload = upload(10);
        upload.send(&[0; 6]).unwrap();
        let framed_len = upload.framed_len();
        // 6 + 4 reaches the cap
        assert_eq!(
            upload.send(&[0; 4]),
            Err(SendError::BufferOverflow {
                raw_len: 6,
                len: 4,
                cap: 10
            })
        );
        assert_eq!(upload.framed_len(), framed_len);
        assert_eq!(upload.raw_len(), 6);
        upload.send(&[0; 3]).unwrap();
        assert_eq!(upload.raw_len(), 9);
    }

    #[test]
    fn test_send_ack() {
        let mut upload = upload(1024);
        upload.send_ack(0);
        upload.send_ack(300);
        let mut expected = vec![0x00, 0x20];
        expected.extend(300u16.to_ne_bytes());
        assert_eq!(upload.pullup_framed(), expected);
        assert_eq!(upload.raw_len(), 0);
    }

    #[test]
    fn test_ack_drains_raw() {
        let mut upload = upload(1024);
        upload.send(&[0, 1, 2, 3]).unwrap();
        upload.send(&[4, 5]).unwrap();

        let acked = upload.on_ack(3).unwrap();
        assert_eq!(
            acked,
            Acked {
                delta: 3,
                reconnected: false
            }
        );
        assert_eq!(upload.raw_len(), 3);
        assert_eq!(upload.remote_rcv_raw_offset(), 3);

        // at most once
        let acked = upload.on_ack(3).unwrap();
        assert_eq!(acked.delta, 0);
        assert_eq!(upload.raw_len(), 3);
        assert_eq!(upload.stat().duplicate_acks, 1);
    }

    #[test]
    fn test_ack_regression() {
        let mut upload = upload(1024);
        upload.send(&[0; 8]).unwrap();
        upload.on_ack(5).unwrap();
        assert_eq!(
            upload.on_ack(4),
            Err(AckError::Regression {
                remote_rcv_raw_offset: 5,
                offset: 4
            })
        );
        assert_eq!(upload.remote_rcv_raw_offset(), 5);
        assert_eq!(upload.raw_len(), 3);
    }

    #[test]
    fn test_ack_beyond_sent() {
        let mut upload = upload(1024);
        upload.send(&[0; 8]).unwrap();
        assert!(matches!(
            upload.on_ack(9),
            Err(AckError::BeyondSent { raw_len: 8, .. })
        ));
        assert_eq!(upload.remote_rcv_raw_offset(), 0);
        assert_eq!(upload.raw_len(), 8);
        assert_eq!(upload.stat().rejected_acks, 1);
    }

    #[test]
    fn test_push_raw_resends_backlog() {
        let mut upload = upload(1024);
        upload.send(&[0, 1, 2]).unwrap();
        upload.send(&[3, 4]).unwrap();
        upload.on_ack(1).unwrap();

        assert_eq!(upload.push_raw(), 4);
        let framed = upload.pullup_framed().to_vec();
        let packet = match PacketHeader::decode(&framed).unwrap() {
            Decoded::Packet(x) => x,
            Decoded::Insufficient => panic!(),
        };
        assert_eq!(packet.len, framed.len());
        assert_eq!(framed[packet.data], [1, 2, 3, 4]);
        // the reservoir is kept until acked
        assert_eq!(upload.raw_len(), 4);
    }

    #[test]
    fn test_push_raw_empty() {
        let mut upload = upload(1024);
        upload.send_ack(7);
        assert_eq!(upload.push_raw(), 0);
        assert_eq!(upload.framed_len(), 2);
    }

    #[test]
    fn test_reconnect_resends_once() {
        let mut upload = upload(1024);
        upload.send(&[0; 5]).unwrap();
        upload.arm_reconnect();
        assert_eq!(upload.framed_len(), 0);
        assert!(upload.need_ack());

        let acked = upload.on_ack(0).unwrap();
        assert!(acked.reconnected);
        assert!(!upload.need_ack());
        assert_eq!(upload.framed_len(), 2 + 5);

        upload.drain_framed(upload.framed_len());
        let acked = upload.on_ack(2).unwrap();
        assert!(!acked.reconnected);
        assert_eq!(upload.framed_len(), 0);
    }

    #[test]
    fn test_rejected_ack_keeps_reconnect_armed() {
        let mut upload = upload(1024);
        upload.send(&[0; 5]).unwrap();
        upload.on_ack(2).unwrap();
        upload.arm_reconnect();

        assert!(matches!(
            upload.on_ack(9),
            Err(AckError::BeyondSent { raw_len: 3, .. })
        ));
        assert!(matches!(upload.on_ack(1), Err(AckError::Regression { .. })));
        assert!(upload.need_ack());
        assert!(upload.awaiting_reconnect());
        assert_eq!(upload.stat().resends, 0);
        assert_eq!(upload.framed_len(), 0);

        let acked = upload.on_ack(2).unwrap();
        assert!(acked.reconnected);
        assert!(!upload.awaiting_reconnect());
        assert_eq!(upload.stat().resends, 1);
    }

    #[test]
    fn test_need_ack_without_reconnect() {
        let mut upload = upload(1024);
        upload.send(&[0; 5]).unwrap();
        upload.set_need_ack(true);
        let acked = upload.on_ack(5).unwrap();
        assert!(!acked.reconnected);
        assert!(!upload.need_ack());
    }
}
