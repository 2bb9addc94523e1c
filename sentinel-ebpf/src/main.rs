#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{HashMap, PerCpuArray, RingBuf},
    programs::XdpContext,
};
use core::ptr;
use sentinel_common::{
    classify, Denylist, Disposition, Event, EventSink, Outcome, PacketView, DENYLIST_MAX_ENTRIES,
    EVENTS_BYTE_SIZE,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

/// Source addresses to drop, written by userspace only.
#[map]
static DENYLIST: HashMap<u32, u8> = HashMap::with_max_entries(DENYLIST_MAX_ENTRIES, 0);

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_BYTE_SIZE, 0);

#[map]
static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(Outcome::COUNT, 0);

struct KernelDenylist;

impl Denylist for KernelDenylist {
    #[inline(always)]
    fn contains(&self, addr: u32) -> bool {
        unsafe { DENYLIST.get(&addr) }.is_some()
    }
}

struct KernelEvents;

impl EventSink for KernelEvents {
    /// Fields are written one by one: a whole-struct write lowers to a
    /// `memcpy` call, which the verifier cannot follow.
    #[inline(always)]
    fn publish(&self, event: &Event) -> bool {
        let Some(mut entry) = EVENTS.reserve::<Event>(0) else {
            return false;
        };
        let p = entry.as_mut_ptr();
        unsafe {
            ptr::write(ptr::addr_of_mut!((*p).src_addr), event.src_addr);
            ptr::write(ptr::addr_of_mut!((*p).dst_addr), event.dst_addr);
            ptr::write(ptr::addr_of_mut!((*p).src_port), event.src_port);
            ptr::write(ptr::addr_of_mut!((*p).dst_port), event.dst_port);
        }
        entry.submit(0);
        true
    }
}

/// XDP entry point. Every path ends in `XDP_PASS` except a denylist hit.
#[xdp]
pub fn sentinel(ctx: XdpContext) -> u32 {
    let frame = unsafe { PacketView::new(ctx.data(), ctx.data_end()) };
    let outcome = classify(frame, &KernelDenylist, &KernelEvents);

    if let Some(counter) = STATS.get_ptr_mut(outcome.index()) {
        unsafe { *counter += 1 };
    }

    match outcome.disposition() {
        Disposition::Drop => xdp_action::XDP_DROP,
        Disposition::Pass => xdp_action::XDP_PASS,
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
