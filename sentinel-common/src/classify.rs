//! Per-packet decision pipeline: parse, check the denylist, encode, export.

use crate::{
    packet::{parse_ethernet, parse_ipv4, parse_tcp, Ipv4Fields, PacketView, ParseError, TcpFields},
    Event, Outcome,
};

/// Read-only point lookup into the source-address denylist.
///
/// Writers live outside the classifier and may change entries at any time;
/// a lookup only has to observe some consistent value for its own key.
pub trait Denylist {
    /// `addr` is the IPv4 source in host byte order.
    fn contains(&self, addr: u32) -> bool;
}

/// Best-effort telemetry export.
pub trait EventSink {
    /// Reserves space for one event and publishes it. Returns `false` without
    /// waiting when no space is available.
    fn publish(&self, event: &Event) -> bool;
}

impl Event {
    /// Builds the exported record from validated headers, converting every
    /// field from network to host byte order.
    #[inline(always)]
    pub fn encode(ip: &Ipv4Fields, tcp: &TcpFields) -> Self {
        Self {
            src_addr: u32::from_be(ip.src_addr),
            dst_addr: u32::from_be(ip.dst_addr),
            src_port: u16::from_be(tcp.source),
            dst_port: u16::from_be(tcp.dest),
        }
    }
}

impl From<ParseError> for Outcome {
    #[inline(always)]
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Truncated => Outcome::Malformed,
            ParseError::Unsupported => Outcome::Unsupported,
        }
    }
}

/// Runs one frame through the pipeline.
///
/// Malformed and unsupported frames fail open. The denylist is consulted
/// right after the IPv4 header, before the protocol is looked at, so a
/// denylisted source is dropped whatever it carries.
#[inline(always)]
pub fn classify<D, S>(frame: PacketView<'_>, denylist: &D, sink: &S) -> Outcome
where
    D: Denylist + ?Sized,
    S: EventSink + ?Sized,
{
    match try_classify(frame, denylist, sink) {
        Ok(outcome) => outcome,
        Err(err) => err.into(),
    }
}

#[inline(always)]
fn try_classify<D, S>(frame: PacketView<'_>, denylist: &D, sink: &S) -> Result<Outcome, ParseError>
where
    D: Denylist + ?Sized,
    S: EventSink + ?Sized,
{
    let l3 = parse_ethernet(frame)?;
    let (ip, l4) = parse_ipv4(l3)?;

    if denylist.contains(ip.source()) {
        return Ok(Outcome::Denylisted);
    }
    if !ip.is_tcp() {
        return Ok(Outcome::NonTcp);
    }

    let (tcp, _) = parse_tcp(l4)?;
    let event = Event::encode(&ip, &tcp);
    if sink.publish(&event) {
        Ok(Outcome::Exported)
    } else {
        Ok(Outcome::ExportSkipped)
    }
}
