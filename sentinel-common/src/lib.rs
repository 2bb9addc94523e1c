#![no_std]

use core::mem;

pub mod classify;
pub mod packet;

pub use classify::{classify, Denylist, EventSink};
pub use packet::{PacketView, ParseError};

/// Name of the XDP program inside the compiled eBPF object.
pub const PROGRAM_NAME: &str = "sentinel";

/// Source addresses to drop. Key is the IPv4 source in host byte order,
/// value is a presence flag.
pub const DENYLIST_MAP: &str = "DENYLIST";
pub const DENYLIST_MAX_ENTRIES: u32 = 1024;
/// Flag written by the control plane. The classifier only checks presence.
pub const DENYLIST_BLOCKED: u8 = 1;

/// Ring buffer carrying [`Event`] records to userspace.
pub const EVENTS_MAP: &str = "EVENTS";
pub const EVENTS_BYTE_SIZE: u32 = 256 * 1024;

/// Per-CPU counters indexed by [`Outcome`].
pub const STATS_MAP: &str = "STATS";

/// Metadata exported for every accepted TCP packet.
///
/// The layout is part of the wire contract with the consumer: 12 bytes, no
/// padding, every field in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

const _: () = assert!(mem::size_of::<Event>() == 12);

impl Event {
    pub const LEN: usize = mem::size_of::<Event>();

    /// Serializes in the in-memory `repr(C)` layout, as the kernel ring
    /// buffer carries it.
    pub fn to_bytes(&self) -> [u8; Event::LEN] {
        let mut out = [0u8; Event::LEN];
        out[0..4].copy_from_slice(&self.src_addr.to_ne_bytes());
        out[4..8].copy_from_slice(&self.dst_addr.to_ne_bytes());
        out[8..10].copy_from_slice(&self.src_port.to_ne_bytes());
        out[10..12].copy_from_slice(&self.dst_port.to_ne_bytes());
        out
    }

    /// Returns `None` when `buf` is shorter than one record. Trailing bytes
    /// (ring buffer alignment) are ignored.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Event::LEN {
            return None;
        }
        Some(Self {
            src_addr: u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            dst_addr: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
            src_port: u16::from_ne_bytes([buf[8], buf[9]]),
            dst_port: u16::from_ne_bytes([buf[10], buf[11]]),
        })
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Event {}

/// Forwarding verdict for a single frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Pass,
    Drop,
}

/// Terminal state reached by the classifier for one frame.
///
/// The discriminant doubles as the index into the per-CPU `STATS` array.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
#[cfg_attr(feature = "user", serde(rename_all = "snake_case"))]
pub enum Outcome {
    /// A header layer was cut short.
    Malformed = 0,
    /// Not an IPv4 frame.
    Unsupported = 1,
    /// Source address found in the denylist.
    Denylisted = 2,
    /// IPv4 but not TCP.
    NonTcp = 3,
    /// TCP, event published.
    Exported = 4,
    /// TCP, ring buffer full so the event was dropped.
    ExportSkipped = 5,
}

impl Outcome {
    pub const COUNT: u32 = 6;

    pub const ALL: [Outcome; Outcome::COUNT as usize] = [
        Outcome::Malformed,
        Outcome::Unsupported,
        Outcome::Denylisted,
        Outcome::NonTcp,
        Outcome::Exported,
        Outcome::ExportSkipped,
    ];

    #[inline(always)]
    pub fn disposition(self) -> Disposition {
        match self {
            Outcome::Denylisted => Disposition::Drop,
            _ => Disposition::Pass,
        }
    }

    #[inline(always)]
    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Outcome::Malformed => "malformed",
            Outcome::Unsupported => "unsupported",
            Outcome::Denylisted => "denylisted",
            Outcome::NonTcp => "non_tcp",
            Outcome::Exported => "exported",
            Outcome::ExportSkipped => "export_skipped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_layout_is_twelve_bytes() {
        assert_eq!(Event::LEN, 12);
        assert_eq!(mem::align_of::<Event>(), 4);
    }

    #[test]
    fn event_bytes_match_repr_c_layout() {
        let event = Event {
            src_addr: u32::from_be_bytes([10, 0, 0, 1]),
            dst_addr: u32::from_be_bytes([192, 168, 1, 100]),
            src_port: 40000,
            dst_port: 443,
        };
        let bytes = event.to_bytes();
        let raw = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Event) };
        assert_eq!(raw, event);
        assert_eq!(Event::from_bytes(&bytes), Some(event));
    }

    #[test]
    fn event_from_short_buffer() {
        assert_eq!(Event::from_bytes(&[0u8; 11]), None);
        assert!(Event::from_bytes(&[0u8; 16]).is_some());
    }

    #[test]
    fn only_denylisted_drops() {
        for outcome in Outcome::ALL {
            let expected = if outcome == Outcome::Denylisted {
                Disposition::Drop
            } else {
                Disposition::Pass
            };
            assert_eq!(outcome.disposition(), expected, "{}", outcome.name());
        }
    }

    #[test]
    fn outcome_indices_are_dense() {
        for (i, outcome) in Outcome::ALL.iter().enumerate() {
            assert_eq!(outcome.index() as usize, i);
        }
    }
}
