//! The packet-accounting transfer engine.
//!
//! A transfer is moved one buffer at a time: each access binds the pipe to its FIFO port and
//! moves at most one pipe buffer worth of data.  The outcome of every access tells the caller
//! whether the transfer is finished, and how.

use crate::fifo::FifoPorts;
use crate::fmt::{trace, warn};
use crate::hw::{AccessWidth, Fifo, FifoDirection, Hardware};

/// Result of one buffer access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Outcome {
    /// More data remains to be moved.
    Continue,
    /// The transfer ended exactly on a packet boundary.
    End,
    /// The transfer ended with a short (or zero-length) packet.
    Short,
    /// The host sent more data than was requested.  The excess was discarded.
    Overrun,
    /// The pipe could not be bound to its FIFO port.
    Error,
}

impl Outcome {
    #[cfg(test)]
    pub(crate) fn is_final(self) -> bool {
        self != Outcome::Continue
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Access {
    pub(crate) outcome: Outcome,
    pub(crate) bytes: usize,
}

impl Access {
    const fn error() -> Self {
        Self {
            outcome: Outcome::Error,
            bytes: 0,
        }
    }
}

/// The pipe parameters the engine needs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Geometry {
    pub(crate) pipe: usize,
    pub(crate) fifo: Fifo,
    pub(crate) buffer_size: usize,
    pub(crate) max_packet_size: usize,
}

/// Write the next buffer of an IN transfer.
///
/// `data` holds the bytes not yet sent.  A final access that only partially fills the buffer
/// commits it, so that the host does not have to wait for data that will never come.
pub(crate) fn write_access<H: Hardware>(
    hw: &mut H,
    ports: &mut FifoPorts,
    geometry: &Geometry,
    data: &[u8],
) -> Access {
    let remaining = data.len();
    let chunk = remaining.min(geometry.buffer_size);
    let last = remaining <= geometry.buffer_size;

    if ports
        .bind(hw, geometry.fifo, geometry.pipe, FifoDirection::Write)
        .is_err()
    {
        warn!("pipe {}: FIFO bind failed on write", geometry.pipe);
        return Access::error();
    }

    write_bytes(hw, geometry.fifo, &data[..chunk]);

    let outcome = if !last {
        Outcome::Continue
    } else if remaining == 0 || remaining % geometry.max_packet_size != 0 {
        Outcome::Short
    } else {
        Outcome::End
    };
    if last && chunk < geometry.buffer_size {
        hw.fifo_commit(geometry.fifo);
    }
    trace!(
        "pipe {}: wrote {} of {} bytes: {:?}",
        geometry.pipe,
        chunk,
        remaining,
        outcome
    );
    Access {
        outcome,
        bytes: chunk,
    }
}

/// Read the next received buffer of an OUT transfer.
///
/// `remaining` is the number of bytes still requested.  `dst` receives them, or the data is
/// discarded when it is `None`; when present it must be at least `remaining` bytes long.
pub(crate) fn read_access<H: Hardware>(
    hw: &mut H,
    ports: &mut FifoPorts,
    geometry: &Geometry,
    remaining: usize,
    dst: Option<&mut [u8]>,
) -> Access {
    if ports
        .bind(hw, geometry.fifo, geometry.pipe, FifoDirection::Read)
        .is_err()
    {
        warn!("pipe {}: FIFO bind failed on read", geometry.pipe);
        return Access::error();
    }

    let received = hw.fifo_data_len(geometry.fifo);
    if received > remaining {
        warn!(
            "pipe {}: host sent {} bytes, only {} requested",
            geometry.pipe,
            received,
            remaining
        );
        read_bytes(hw, geometry.fifo, remaining, dst);
        hw.fifo_clear(geometry.fifo);
        return Access {
            outcome: Outcome::Overrun,
            bytes: remaining,
        };
    }

    if received == 0 {
        // Zero-length packets have to be released explicitly.
        hw.fifo_clear(geometry.fifo);
    } else {
        read_bytes(hw, geometry.fifo, received, dst);
    }

    let outcome = if received == 0 || received % geometry.max_packet_size != 0 {
        Outcome::Short
    } else if received == remaining {
        Outcome::End
    } else {
        Outcome::Continue
    };
    trace!(
        "pipe {}: read {} of {} bytes: {:?}",
        geometry.pipe,
        received,
        remaining,
        outcome
    );
    Access {
        outcome,
        bytes: received,
    }
}

/// Pick the widest access allowed by the alignment of `addr` and the bytes left.
fn access_width(addr: usize, len: usize) -> AccessWidth {
    if addr % 4 == 0 && len >= 4 {
        AccessWidth::Word
    } else if addr % 2 == 0 && len >= 2 {
        AccessWidth::Half
    } else {
        AccessWidth::Byte
    }
}

fn write_bytes<H: Hardware>(hw: &mut H, fifo: Fifo, mut data: &[u8]) {
    while !data.is_empty() {
        let width = access_width(data.as_ptr() as usize, data.len());
        let (head, tail) = data.split_at(width.bytes());
        let value = match width {
            AccessWidth::Word => bytemuck::pod_read_unaligned::<u32>(head),
            AccessWidth::Half => bytemuck::pod_read_unaligned::<u16>(head) as u32,
            AccessWidth::Byte => head[0] as u32,
        };
        hw.fifo_write(fifo, width, value);
        data = tail;
    }
}

fn read_bytes<H: Hardware>(hw: &mut H, fifo: Fifo, len: usize, dst: Option<&mut [u8]>) {
    match dst {
        Some(dst) => {
            let mut dst = &mut dst[..len];
            while !dst.is_empty() {
                let width = access_width(dst.as_ptr() as usize, dst.len());
                let value = hw.fifo_read(fifo, width);
                let (head, tail) = core::mem::take(&mut dst).split_at_mut(width.bytes());
                match width {
                    AccessWidth::Word => head.copy_from_slice(bytemuck::bytes_of(&value)),
                    AccessWidth::Half => {
                        head.copy_from_slice(bytemuck::bytes_of(&(value as u16)))
                    }
                    AccessWidth::Byte => head[0] = value as u8,
                }
                dst = tail;
            }
        }
        None => {
            let mut left = len;
            while left > 0 {
                let width = access_width(0, left);
                hw.fifo_read(fifo, width);
                left -= width.bytes();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::tests::BULK_IN_RECORD;
    use crate::endpoint::PipeConfig;
    use crate::sim::SimHardware;

    fn bulk_in(max_packet_size: usize) -> (SimHardware, Geometry) {
        let mut hw = SimHardware::new();
        hw.configure_pipe(&PipeConfig::from_record(&BULK_IN_RECORD).unwrap());
        let geometry = Geometry {
            pipe: 2,
            fifo: Fifo::D1,
            buffer_size: 512,
            max_packet_size,
        };
        (hw, geometry)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    // Drive a whole write, returning every access.
    fn write_all(hw: &mut SimHardware, geometry: &Geometry, data: &[u8]) -> Vec<Access> {
        let mut ports = FifoPorts::new();
        let mut accesses = Vec::new();
        let mut offset = 0;
        loop {
            let access = write_access(hw, &mut ports, geometry, &data[offset..]);
            offset += access.bytes;
            accesses.push(access);
            if access.outcome.is_final() {
                return accesses;
            }
        }
    }

    #[test]
    fn write_access_count_and_short_classification() {
        for mps in [64, 512] {
            for len in [0, 1, 63, 64, 65, 511, 512, 513, 1000, 1024, 1500] {
                let (mut hw, geometry) = bulk_in(mps);
                let data = pattern(len);
                let accesses = write_all(&mut hw, &geometry, &data);

                let expected = core::cmp::max(1, (len + 511) / 512);
                assert_eq!(accesses.len(), expected, "len {} mps {}", len, mps);
                let last = accesses.last().unwrap().outcome;
                if len == 0 || len % mps != 0 {
                    assert_eq!(last, Outcome::Short, "len {} mps {}", len, mps);
                } else {
                    assert_eq!(last, Outcome::End, "len {} mps {}", len, mps);
                }
                assert!(accesses[..accesses.len() - 1]
                    .iter()
                    .all(|a| a.outcome == Outcome::Continue));
                assert_eq!(hw.sent(2), data);
            }
        }
    }

    #[test]
    fn thousand_byte_write_is_two_accesses() {
        let (mut hw, geometry) = bulk_in(512);
        let accesses = write_all(&mut hw, &geometry, &pattern(1000));
        assert_eq!(
            accesses,
            [
                Access {
                    outcome: Outcome::Continue,
                    bytes: 512
                },
                Access {
                    outcome: Outcome::Short,
                    bytes: 488
                },
            ]
        );
        assert_eq!(hw.in_packets[2].len(), 2);
        assert_eq!(hw.in_packets[2][1].len(), 488);
    }

    #[test]
    fn zero_length_write_commits_empty_packet() {
        let (mut hw, geometry) = bulk_in(512);
        let accesses = write_all(&mut hw, &geometry, &[]);
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].outcome, Outcome::Short);
        assert_eq!(hw.in_packets[2].len(), 1);
        assert!(hw.in_packets[2][0].is_empty());
    }

    #[test]
    fn short_read_stops_early() {
        let (mut hw, mut geometry) = bulk_in(512);
        geometry.pipe = 1;
        geometry.fifo = Fifo::D0;
        hw.host_out(1, &pattern(100));

        let mut buf = [0u8; 512];
        let access = read_access(
            &mut hw,
            &mut FifoPorts::new(),
            &geometry,
            buf.len(),
            Some(&mut buf),
        );
        assert_eq!(access.outcome, Outcome::Short);
        assert_eq!(access.bytes, 100);
        assert_eq!(&buf[..100], &pattern(100)[..]);
        assert!(buf[100..].iter().all(|&b| b == 0));
        assert!(hw.out_packets[1].is_empty());
    }

    #[test]
    fn full_packets_continue_until_requested_length() {
        let (mut hw, mut geometry) = bulk_in(64);
        geometry.pipe = 1;
        geometry.fifo = Fifo::D0;
        geometry.buffer_size = 64;
        let data = pattern(128);
        hw.host_out(1, &data[..64]);
        hw.host_out(1, &data[64..]);

        let mut ports = FifoPorts::new();
        let mut buf = [0u8; 128];
        let first = read_access(&mut hw, &mut ports, &geometry, 128, Some(&mut buf[..]));
        assert_eq!(first.outcome, Outcome::Continue);
        let second = read_access(&mut hw, &mut ports, &geometry, 64, Some(&mut buf[64..]));
        assert_eq!(second.outcome, Outcome::End);
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn overrun_never_writes_past_destination() {
        let (mut hw, mut geometry) = bulk_in(64);
        geometry.pipe = 1;
        geometry.fifo = Fifo::D0;
        hw.host_out(1, &pattern(64));
        hw.host_out(1, &[0x55; 8]);

        let mut buf = [0xaau8; 16];
        let access = read_access(
            &mut hw,
            &mut FifoPorts::new(),
            &geometry,
            10,
            Some(&mut buf[..10]),
        );
        assert_eq!(access.outcome, Outcome::Overrun);
        assert_eq!(access.bytes, 10);
        assert_eq!(&buf[..10], &pattern(64)[..10]);
        assert!(buf[10..].iter().all(|&b| b == 0xaa));
        // The rest of the oversized packet was dropped; the next one is intact.
        assert_eq!(hw.out_packets[1].len(), 1);
        assert_eq!(hw.out_packets[1][0], [0x55u8; 8]);
    }

    #[test]
    fn zero_length_read_is_short_and_released() {
        let (mut hw, mut geometry) = bulk_in(64);
        geometry.pipe = 1;
        geometry.fifo = Fifo::D0;
        hw.host_out(1, &[]);

        let mut buf = [0u8; 64];
        let access = read_access(
            &mut hw,
            &mut FifoPorts::new(),
            &geometry,
            64,
            Some(&mut buf),
        );
        assert_eq!(access.outcome, Outcome::Short);
        assert_eq!(access.bytes, 0);
        assert!(hw.out_packets[1].is_empty());
        assert!(hw.accesses.is_empty());
    }

    #[test]
    fn discard_read_consumes_packet() {
        let (mut hw, mut geometry) = bulk_in(64);
        geometry.pipe = 1;
        geometry.fifo = Fifo::D0;
        hw.host_out(1, &pattern(7));

        let access = read_access(&mut hw, &mut FifoPorts::new(), &geometry, 64, None);
        assert_eq!(access.outcome, Outcome::Short);
        assert_eq!(access.bytes, 7);
        assert!(hw.out_packets[1].is_empty());
        assert_eq!(
            hw.accesses
                .iter()
                .map(|(_, w)| *w)
                .collect::<Vec<_>>(),
            [AccessWidth::Word, AccessWidth::Half, AccessWidth::Byte]
        );
    }

    #[test]
    fn access_width_follows_alignment() {
        let (mut hw, geometry) = bulk_in(64);
        let storage = [0u32; 4];
        let bytes: &[u8] = bytemuck::cast_slice(&storage);
        // Start one byte into a word-aligned buffer.
        write_all(&mut hw, &geometry, &bytes[1..12]);
        let widths: Vec<_> = hw.accesses.iter().map(|(_, w)| *w).collect();
        assert_eq!(
            widths,
            [
                AccessWidth::Byte,
                AccessWidth::Half,
                AccessWidth::Word,
                AccessWidth::Word
            ]
        );
    }

    #[test]
    fn failed_bind_is_an_error() {
        let (mut hw, geometry) = bulk_in(512);
        hw.bind_fail = true;
        let access = write_access(&mut hw, &mut FifoPorts::new(), &geometry, &pattern(10));
        assert_eq!(access.outcome, Outcome::Error);
        assert_eq!(access.bytes, 0);
        assert!(hw.accesses.is_empty());
    }
}
