use tracing::{debug, trace, warn};

use crate::{
    protocol::{
        message,
        packet_hdr::{Decoded, DecodedPacket, PacketHeader, PACKET_HDR_LEN},
        DecodingError,
    },
    utils::buf::ChainedBuf,
};

use super::{SessionId, Uploader};

/// Receive half of a session.
pub struct Downloader {
    sid: SessionId,
    // partial packet carried over between inputs
    reassembly: ChainedBuf,
    delivery: Delivery,
    stat: LocalStat,

    // const
    blk_hint: usize,
}

struct Delivery {
    delivered: ChainedBuf,
    rcv_raw_offset: u64,
    auto_ack_count: u64,
    auto_ack_len: u64,
}

pub struct DownloaderBuilder {
    pub sid: SessionId,
    pub auto_ack_len: u64,
    pub blk_hint: usize,
}

impl DownloaderBuilder {
    #[must_use]
    pub fn build(self) -> Downloader {
        let this = Downloader {
            sid: self.sid,
            reassembly: ChainedBuf::new(self.blk_hint),
            delivery: Delivery {
                delivered: ChainedBuf::new(self.blk_hint),
                rcv_raw_offset: 0,
                auto_ack_count: 0,
                auto_ack_len: self.auto_ack_len,
            },
            stat: LocalStat::default(),
            blk_hint: self.blk_hint,
        };
        this.check_rep();
        this
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum InputError {
    /// A header named an unknown width class. The rest of the input was dropped; `report` covers
    /// the packets applied before it.
    Malformed {
        field: &'static str,
        class: u8,
        report: InputReport,
    },
}

impl InputError {
    /// What the input did before it failed.
    #[must_use]
    pub fn report(&self) -> &InputReport {
        match self {
            InputError::Malformed { report, .. } => report,
        }
    }
}

/// What one call to [`Downloader::input`] did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InputReport {
    pub packets: usize,
    /// Payload bytes appended to the delivered buffer.
    pub data_len: usize,
    pub acks: usize,
    pub rejected_acks: usize,
    /// An ack completed a reconnect and the unacknowledged backlog was resent.
    pub reconnected: bool,
    /// Bytes of an incomplete packet kept for the next input.
    pub buffered: usize,
}

impl Downloader {
    #[inline]
    fn check_rep(&self) {}

    #[must_use]
    #[inline]
    pub fn rcv_raw_offset(&self) -> u64 {
        self.delivery.rcv_raw_offset
    }

    #[must_use]
    #[inline]
    pub fn delivered_len(&self) -> usize {
        self.delivery.delivered.len()
    }

    #[must_use]
    #[inline]
    pub fn reassembly_len(&self) -> usize {
        self.reassembly.len()
    }

    pub fn set_auto_ack_len(&mut self, auto_ack_len: u64) {
        self.delivery.auto_ack_len = auto_ack_len;
    }

    /// Resets the auto-ack counter and returns the offset to announce.
    pub fn take_ack(&mut self) -> u64 {
        self.delivery.take_ack()
    }

    /// Feeds bytes received from the transport.
    ///
    /// Whole packets are applied in order: acks go to `uploader`, payloads are appended to the
    /// delivered buffer. A trailing partial packet is kept and completed by later inputs.
    pub fn input(
        &mut self,
        data: &[u8],
        uploader: &mut Uploader,
    ) -> Result<InputReport, InputError> {
        trace!(sid = self.sid, len = data.len(), "input data");

        let use_buf = !self.reassembly.is_empty();
        let window = if use_buf {
            self.reassembly.append(data);
            self.reassembly.pullup()
        } else {
            data
        };

        let mut report = InputReport::default();
        let mut pos = 0;
        let mut malformed = None;
        while window.len() - pos >= PACKET_HDR_LEN {
            match PacketHeader::decode(&window[pos..]) {
                Ok(Decoded::Packet(packet)) => {
                    let payload = &window[pos..][packet.data.clone()];
                    self.delivery
                        .on_packet(self.sid, &packet, payload, uploader, &mut report);
                    pos += packet.len;
                }
                Ok(Decoded::Insufficient) => break,
                Err(DecodingError::Malformed { field, class }) => {
                    malformed = Some((field, class));
                    break;
                }
            }
        }
        self.stat.packets += report.packets as u64;
        self.stat.ack_records += (report.acks + report.rejected_acks) as u64;
        self.stat.data_len += report.data_len as u64;

        if let Some((field, class)) = malformed {
            self.stat.decoding_errors += 1;
            let dropped = if use_buf {
                let len = self.reassembly.len() - pos;
                self.reassembly.drain(self.reassembly.len());
                len
            } else {
                data.len() - pos
            };
            warn!(sid = self.sid, field, class, dropped, "parse header error");
            return Err(InputError::Malformed {
                field,
                class,
                report,
            });
        }

        if use_buf {
            self.reassembly.drain(pos);
        } else if pos < data.len() {
            self.reassembly.append(&data[pos..]);
        }
        report.buffered = self.reassembly.len();

        self.check_rep();
        Ok(report)
    }

    #[must_use]
    pub fn pullup_delivered(&mut self) -> &[u8] {
        self.delivery.delivered.pullup()
    }

    pub fn drain_delivered(&mut self, len: usize) -> usize {
        self.delivery.delivered.drain(len)
    }

    /// Takes the next whole length-prefixed message off the delivered bytes.
    #[must_use]
    pub fn recv_message(&mut self) -> Option<Vec<u8>> {
        let view = self.delivery.delivered.pullup();
        let (body, len) = message::decode(view)?;
        let msg = view[body].to_vec();
        self.delivery.delivered.drain(len);
        Some(msg)
    }

    pub fn reset(&mut self) {
        self.delivery.delivered.reset(self.blk_hint);
        self.check_rep();
    }

    #[must_use]
    pub fn stat(&self) -> DownloadStat {
        DownloadStat {
            reassembly_len: self.reassembly.len(),
            delivered_len: self.delivery.delivered.len(),
            rcv_raw_offset: self.delivery.rcv_raw_offset,
            packets: self.stat.packets,
            ack_records: self.stat.ack_records,
            data_len: self.stat.data_len,
            decoding_errors: self.stat.decoding_errors,
        }
    }
}

impl Delivery {
    #[inline]
    fn take_ack(&mut self) -> u64 {
        self.auto_ack_count = 0;
        self.rcv_raw_offset
    }

    fn on_packet(
        &mut self,
        sid: SessionId,
        packet: &DecodedPacket,
        payload: &[u8],
        uploader: &mut Uploader,
        report: &mut InputReport,
    ) {
        report.packets += 1;

        // a packet without payload is an ack; a missing field announces offset 0
        if packet.has_ack || payload.is_empty() {
            match uploader.on_ack(packet.hdr.ack()) {
                Ok(acked) => {
                    report.acks += 1;
                    report.reconnected |= acked.reconnected;
                }
                Err(_) => report.rejected_acks += 1,
            }
        }

        if !payload.is_empty() {
            self.delivered.append(payload);
            self.rcv_raw_offset += payload.len() as u64;
            self.auto_ack_count += payload.len() as u64;
            report.data_len += payload.len();
            debug!(
                sid,
                rcv_raw_offset = self.rcv_raw_offset,
                len = payload.len(),
                "recv data"
            );

            if self.auto_ack_count >= self.auto_ack_len {
                let offset = self.take_ack();
                uploader.send_ack(offset);
            }
        }
    }
}

#[derive(Default)]
struct LocalStat {
    packets: u64,
    ack_records: u64,
    data_len: u64,
    decoding_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadStat {
    pub reassembly_len: usize,
    pub delivered_len: usize,
    pub rcv_raw_offset: u64,
    pub packets: u64,
    pub ack_records: u64,
    /// Payload bytes delivered over the session's lifetime.
    pub data_len: u64,
    pub decoding_errors: u64,
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::{layer::UploaderBuilder, protocol::packet_hdr::PacketHeaderBuilder};

    use super::*;

    fn upload() -> Uploader {
        UploaderBuilder {
            sid: 1,
            max_raw_snd_buf_len: 1024 * 64,
            blk_hint: 16,
        }
        .build()
    }

    fn download(auto_ack_len: u64) -> Downloader {
        DownloaderBuilder {
            sid: 1,
            auto_ack_len,
            blk_hint: 16,
        }
        .build()
    }

    fn ack(offset: u64) -> Vec<u8> {
        PacketHeaderBuilder {
            ack: offset,
            data_len: 0,
        }
        .build()
        .to_bytes()
    }

    /// Data packets, acks for the local side's 10 sent bytes and a long payload in between.
    fn stream() -> Vec<u8> {
        let mut remote = upload();
        remote.send(&[0, 1, 2]).unwrap();
        let mut wire = remote.pullup_framed().to_vec();
        wire.extend(ack(4));
        let long: Vec<u8> = (0..300).map(|x| x as u8).collect();
        remote.drain_framed(remote.framed_len());
        remote.send(&long).unwrap();
        wire.extend(remote.pullup_framed());
        wire.extend(ack(10));
        wire
    }

    fn expected_delivered() -> Vec<u8> {
        let mut data = vec![0, 1, 2];
        data.extend((0..300).map(|x| x as u8));
        data
    }

    /// Feeds `chunks` into a fresh receiver whose own uploader has 10 bytes in flight.
    fn feed<'a>(chunks: impl Iterator<Item = &'a [u8]>) -> (Uploader, Downloader) {
        let mut local = upload();
        local.send(&[5; 10]).unwrap();
        local.drain_framed(local.framed_len());
        let mut download = download(u64::MAX);
        for chunk in chunks {
            download.input(chunk, &mut local).unwrap();
        }
        (local, download)
    }

    fn assert_fed(local: &Uploader, download: &mut Downloader) {
        assert_eq!(download.pullup_delivered(), expected_delivered());
        assert_eq!(download.rcv_raw_offset(), 303);
        assert_eq!(download.reassembly_len(), 0);
        assert_eq!(local.remote_rcv_raw_offset(), 10);
        assert_eq!(local.raw_len(), 0);
    }

    #[test]
    fn test_input_whole() {
        let wire = stream();
        let mut local = upload();
        local.send(&[5; 10]).unwrap();
        let mut download = download(u64::MAX);
        let report = download.input(&wire, &mut local).unwrap();
        assert_eq!(
            report,
            InputReport {
                packets: 4,
                data_len: 303,
                acks: 2,
                rejected_acks: 0,
                reconnected: false,
                buffered: 0,
            }
        );
        assert_fed(&local, &mut download);
    }

    #[test]
    fn test_input_split_everywhere() {
        let wire = stream();
        for i in 0..=wire.len() {
            let (a, b) = wire.split_at(i);
            let (local, mut download) = feed([a, b].into_iter());
            assert_fed(&local, &mut download);
        }
    }

    #[test]
    fn test_input_random_chunks() {
        let wire = stream();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let mut chunks = vec![];
            let mut rest = &wire[..];
            while !rest.is_empty() {
                let len = rng.gen_range(0..=rest.len().min(8));
                let (chunk, tail) = rest.split_at(len);
                chunks.push(chunk);
                rest = tail;
            }
            let (local, mut download) = feed(chunks.into_iter());
            assert_fed(&local, &mut download);
        }
    }

    #[test]
    fn test_partial_is_buffered() {
        let mut local = upload();
        let mut download = download(u64::MAX);
        let report = download.input(&[0x01, 3, 9], &mut local).unwrap();
        assert_eq!(report.packets, 0);
        assert_eq!(report.buffered, 3);
        assert_eq!(download.delivered_len(), 0);

        let report = download.input(&[9, 9, 0x01], &mut local).unwrap();
        assert_eq!(report.packets, 1);
        assert_eq!(report.buffered, 1);
        assert_eq!(download.pullup_delivered(), [9, 9, 9]);
    }

    #[test]
    fn test_auto_ack() {
        let mut local = upload();
        let mut download = download(4);
        download.input(&[0x01, 3, 0, 0, 0], &mut local).unwrap();
        assert_eq!(local.framed_len(), 0);

        download.input(&[0x01, 2, 0, 0], &mut local).unwrap();
        assert_eq!(local.pullup_framed(), [0x10, 5]);
        assert_eq!(local.stat().acks_sent, 1);

        // the counter restarted
        local.drain_framed(2);
        download.input(&[0x01, 3, 0, 0, 0], &mut local).unwrap();
        assert_eq!(local.framed_len(), 0);
    }

    #[test]
    fn test_empty_packet_acks_zero() {
        let mut local = upload();
        let mut download = download(u64::MAX);
        let report = download.input(&[0x00], &mut local).unwrap();
        assert_eq!(report.packets, 1);
        assert_eq!(report.acks, 1);
        assert_eq!(report.buffered, 0);
        assert_eq!(local.stat().duplicate_acks, 1);
    }

    #[test]
    fn test_rejected_ack() {
        let mut local = upload();
        let mut download = download(u64::MAX);
        let report = download.input(&ack(100), &mut local).unwrap();
        assert_eq!(report.acks, 0);
        assert_eq!(report.rejected_acks, 1);
        assert_eq!(local.remote_rcv_raw_offset(), 0);
    }

    #[test]
    fn test_malformed_direct() {
        let mut local = upload();
        let mut download = download(u64::MAX);
        let res = download.input(&[0x01, 2, 7, 7, 0x50, 0x01, 1, 7], &mut local);
        assert_eq!(
            res,
            Err(InputError::Malformed {
                field: "ack",
                class: 5,
                report: InputReport {
                    packets: 1,
                    data_len: 2,
                    ..Default::default()
                },
            })
        );
        // the packet before the bad header still counts
        assert_eq!(download.pullup_delivered(), [7, 7]);
        assert_eq!(download.reassembly_len(), 0);
        assert_eq!(download.stat().decoding_errors, 1);
    }

    #[test]
    fn test_malformed_after_reconnect_ack() {
        let mut local = upload();
        local.send(&[1, 2, 3]).unwrap();
        local.arm_reconnect();
        let mut download = download(u64::MAX);

        let res = download.input(&[0x00, 0x00, 0x60], &mut local);
        let e = res.unwrap_err();
        assert_eq!(e.report().acks, 2);
        assert!(e.report().reconnected);
        assert_eq!(local.stat().resends, 1);
        assert!(!local.need_ack());
    }

    #[test]
    fn test_malformed_buffered() {
        let mut local = upload();
        let mut download = download(u64::MAX);
        download.input(&[0x01, 3, 9], &mut local).unwrap();
        let res = download.input(&[9, 9, 0x0f, 1, 2], &mut local);
        assert_eq!(
            res,
            Err(InputError::Malformed {
                field: "data_len",
                class: 15,
                report: InputReport {
                    packets: 1,
                    data_len: 3,
                    ..Default::default()
                },
            })
        );
        assert_eq!(download.pullup_delivered(), [9, 9, 9]);
        assert_eq!(download.reassembly_len(), 0);

        // the next input starts clean
        download.input(&[0x01, 1, 4], &mut local).unwrap();
        assert_eq!(download.rcv_raw_offset(), 4);
    }

    #[test]
    fn test_recv_message() {
        let mut remote = upload();
        remote.send_message(&[7, 8]).unwrap();
        remote.send_message(&[9]).unwrap();
        let wire = remote.pullup_framed().to_vec();

        let mut local = upload();
        let mut download = download(u64::MAX);
        let (a, b) = wire.split_at(wire.len() - 1);
        download.input(a, &mut local).unwrap();
        assert_eq!(download.recv_message(), Some(vec![7, 8]));
        assert_eq!(download.recv_message(), None);

        download.input(b, &mut local).unwrap();
        assert_eq!(download.recv_message(), Some(vec![9]));
        assert_eq!(download.recv_message(), None);
        assert_eq!(download.delivered_len(), 0);
    }
}
