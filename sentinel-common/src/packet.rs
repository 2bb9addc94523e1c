//! Bounds-checked header parsing.
//!
//! Each layer is a single fixed-size step: the full extent of the header is
//! compared against the end of the frame before any of its fields is read.
//! There are no loops, so the same code verifies inside the eBPF program and
//! runs unchanged over a byte slice on the host.

use core::{marker::PhantomData, mem, ptr};

use network_types::{
    eth::{EthHdr, EtherType},
    ip::{IpProto, Ipv4Hdr},
    tcp::TcpHdr,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The frame ends inside the header being parsed.
    Truncated,
    /// The frame carries a protocol the classifier does not interpret.
    Unsupported,
}

/// Read-only window `[cursor, end)` over a single frame.
#[derive(Clone, Copy)]
pub struct PacketView<'a> {
    cursor: usize,
    end: usize,
    _frame: PhantomData<&'a [u8]>,
}

impl<'a> PacketView<'a> {
    /// Builds a view over raw packet bounds, as handed out by the XDP context.
    ///
    /// # Safety
    ///
    /// `data..data_end` must stay readable for `'a`.
    #[inline(always)]
    pub unsafe fn new(data: usize, data_end: usize) -> Self {
        Self {
            cursor: data,
            end: data_end,
            _frame: PhantomData,
        }
    }

    #[inline(always)]
    pub fn from_slice(frame: &'a [u8]) -> Self {
        let data = frame.as_ptr() as usize;
        Self {
            cursor: data,
            end: data + frame.len(),
            _frame: PhantomData,
        }
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.cursor)
    }

    /// Splits a `T`-sized header off the front of the view.
    ///
    /// The returned pointer is only handed out once `cursor + size_of::<T>()`
    /// is known to be within the frame.
    #[inline(always)]
    fn take<T>(self) -> Result<(*const T, PacketView<'a>), ParseError> {
        let start = self.cursor;
        let next = start + mem::size_of::<T>();
        if next > self.end {
            return Err(ParseError::Truncated);
        }
        Ok((
            start as *const T,
            PacketView {
                cursor: next,
                end: self.end,
                _frame: PhantomData,
            },
        ))
    }
}

/// IPv4 fields the classifier needs, in network byte order as on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Fields {
    pub proto: u8,
    pub src_addr: u32,
    pub dst_addr: u32,
}

impl Ipv4Fields {
    /// Source address in host byte order, the denylist key.
    #[inline(always)]
    pub fn source(&self) -> u32 {
        u32::from_be(self.src_addr)
    }

    #[inline(always)]
    pub fn is_tcp(&self) -> bool {
        self.proto == IpProto::Tcp as u8
    }
}

/// TCP ports in network byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpFields {
    pub source: u16,
    pub dest: u16,
}

/// Consumes the Ethernet header and returns the view positioned at L3.
///
/// Anything other than IPv4 is [`ParseError::Unsupported`].
#[inline(always)]
pub fn parse_ethernet(view: PacketView<'_>) -> Result<PacketView<'_>, ParseError> {
    let (eth, rest) = view.take::<EthHdr>()?;
    // Read as a plain u16: arbitrary wire values are not all `EtherType`
    // variants.
    let ether_type = unsafe { ptr::read_unaligned(ptr::addr_of!((*eth).ether_type) as *const u16) };
    if ether_type != EtherType::Ipv4 as u16 {
        return Err(ParseError::Unsupported);
    }
    Ok(rest)
}

/// Consumes the fixed 20-byte IPv4 header. Options are not interpreted: the
/// returned view starts right after the minimum header.
#[inline(always)]
pub fn parse_ipv4(view: PacketView<'_>) -> Result<(Ipv4Fields, PacketView<'_>), ParseError> {
    let (ip, rest) = view.take::<Ipv4Hdr>()?;
    let fields = unsafe {
        Ipv4Fields {
            proto: ptr::read_unaligned(ptr::addr_of!((*ip).proto) as *const u8),
            src_addr: ptr::read_unaligned(ptr::addr_of!((*ip).src_addr)),
            dst_addr: ptr::read_unaligned(ptr::addr_of!((*ip).dst_addr)),
        }
    };
    Ok((fields, rest))
}

/// Consumes the fixed 20-byte TCP header. Options are ignored.
#[inline(always)]
pub fn parse_tcp(view: PacketView<'_>) -> Result<(TcpFields, PacketView<'_>), ParseError> {
    let (tcp, rest) = view.take::<TcpHdr>()?;
    let fields = unsafe {
        TcpFields {
            source: ptr::read_unaligned(ptr::addr_of!((*tcp).source)),
            dest: ptr::read_unaligned(ptr::addr_of!((*tcp).dest)),
        }
    };
    Ok((fields, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ETH_LEN: usize = 14;
    const IP_LEN: usize = 20;
    const TCP_LEN: usize = 20;

    fn frame(ether_type: [u8; 2], proto: u8) -> [u8; 54] {
        let mut buf = [0u8; 54];
        buf[12..14].copy_from_slice(&ether_type);
        buf[ETH_LEN] = 0x45;
        buf[ETH_LEN + 9] = proto;
        buf[ETH_LEN + 12..ETH_LEN + 16].copy_from_slice(&[10, 1, 2, 3]);
        buf[ETH_LEN + 16..ETH_LEN + 20].copy_from_slice(&[172, 16, 0, 9]);
        let tcp = ETH_LEN + IP_LEN;
        buf[tcp..tcp + 2].copy_from_slice(&51000u16.to_be_bytes());
        buf[tcp + 2..tcp + 4].copy_from_slice(&22u16.to_be_bytes());
        buf
    }

    #[test]
    fn header_sizes() {
        assert_eq!(EthHdr::LEN, ETH_LEN);
        assert_eq!(Ipv4Hdr::LEN, IP_LEN);
        assert_eq!(TcpHdr::LEN, TCP_LEN);
    }

    #[test]
    fn walks_all_three_layers() {
        let buf = frame([0x08, 0x00], 6);
        let view = PacketView::from_slice(&buf);
        assert_eq!(view.remaining(), 54);

        let l3 = parse_ethernet(view).unwrap();
        assert_eq!(l3.remaining(), 40);

        let (ip, l4) = parse_ipv4(l3).unwrap();
        assert!(ip.is_tcp());
        assert_eq!(ip.source(), u32::from_be_bytes([10, 1, 2, 3]));
        assert_eq!(u32::from_be(ip.dst_addr), u32::from_be_bytes([172, 16, 0, 9]));
        assert_eq!(l4.remaining(), 20);

        let (tcp, rest) = parse_tcp(l4).unwrap();
        assert_eq!(u16::from_be(tcp.source), 51000);
        assert_eq!(u16::from_be(tcp.dest), 22);
        assert_eq!(rest.remaining(), 0);
    }

    #[test]
    fn rejects_non_ipv4_ether_types() {
        // ARP, IPv6, VLAN and a value that is not an EtherType variant.
        for ether_type in [[0x08, 0x06], [0x86, 0xdd], [0x81, 0x00], [0xde, 0xad]] {
            let buf = frame(ether_type, 6);
            assert_eq!(
                parse_ethernet(PacketView::from_slice(&buf)).err(),
                Some(ParseError::Unsupported)
            );
        }
    }

    #[test]
    fn truncation_fails_closed_at_every_layer() {
        let buf = frame([0x08, 0x00], 6);
        for len in 0..ETH_LEN {
            let view = PacketView::from_slice(&buf[..len]);
            assert_eq!(parse_ethernet(view).err(), Some(ParseError::Truncated), "len {len}");
        }
        for len in ETH_LEN..ETH_LEN + IP_LEN {
            let l3 = parse_ethernet(PacketView::from_slice(&buf[..len])).unwrap();
            assert_eq!(parse_ipv4(l3).err(), Some(ParseError::Truncated), "len {len}");
        }
        for len in ETH_LEN + IP_LEN..ETH_LEN + IP_LEN + TCP_LEN {
            let l3 = parse_ethernet(PacketView::from_slice(&buf[..len])).unwrap();
            let (_, l4) = parse_ipv4(l3).unwrap();
            assert_eq!(parse_tcp(l4).err(), Some(ParseError::Truncated), "len {len}");
        }
    }

    #[test]
    fn reads_unaligned_frames() {
        let mut shifted = [0u8; 55];
        shifted[1..].copy_from_slice(&frame([0x08, 0x00], 6));
        let l3 = parse_ethernet(PacketView::from_slice(&shifted[1..])).unwrap();
        let (ip, l4) = parse_ipv4(l3).unwrap();
        let (tcp, _) = parse_tcp(l4).unwrap();
        assert_eq!(ip.source(), u32::from_be_bytes([10, 1, 2, 3]));
        assert_eq!(u16::from_be(tcp.dest), 22);
    }
}
