#![no_std]
#![no_main]

// Accounting and uid owner programs
//
// Maps are not declared here. Every map pointer is a fixed placeholder
// constant, loaded with `ld_imm64` into the first helper argument, which the
// userspace loader rewrites to the fd of the pinned map before loading. The
// loader copies program sections verbatim, so everything a program calls
// must be inlined into it.

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

use core::ffi::c_void;
use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::bindings::{__sk_buff, BPF_NOEXIST};
use aya_ebpf::helpers::{
    bpf_get_socket_cookie, bpf_get_socket_uid, bpf_map_lookup_elem, bpf_map_update_elem,
};
use trafficd_common::{
    APP_UID_STATS_MAP_PLACEHOLDER, BPF_DROP, BPF_MATCH, BPF_PASS, COOKIE_TAG_MAP_PLACEHOLDER,
    DOZABLE_UID_MAP_PLACEHOLDER, IFACE_STATS_MAP_PLACEHOLDER, MIN_APP_UID,
    POWERSAVE_UID_MAP_PLACEHOLDER, STANDBY_UID_MAP_PLACEHOLDER, StatsKey, StatsValue,
    TAG_STATS_MAP_PLACEHOLDER, UID_COUNTERSET_MAP_PLACEHOLDER, UID_MAP_ENABLED,
    UID_STATS_MAP_PLACEHOLDER, UidTag,
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ingress,
    Egress,
}

#[inline(always)]
fn map(placeholder: u64) -> *mut c_void {
    placeholder as *mut c_void
}

#[inline(always)]
unsafe fn lookup<K, V>(placeholder: u64, key: &K) -> Option<&'static mut V> {
    let value = unsafe { bpf_map_lookup_elem(map(placeholder), key as *const K as *const c_void) };
    unsafe { (value as *mut V).as_mut() }
}

/// Counters of `key`, inserting a zeroed row first if there is none
#[inline(always)]
unsafe fn stats_row<K>(placeholder: u64, key: &K) -> Option<&'static mut StatsValue> {
    if let Some(value) = unsafe { lookup::<K, StatsValue>(placeholder, key) } {
        return Some(value);
    }
    let zero = StatsValue::new();
    unsafe {
        bpf_map_update_elem(
            map(placeholder),
            key as *const K as *const c_void,
            &zero as *const StatsValue as *const c_void,
            BPF_NOEXIST as u64,
        );
        lookup::<K, StatsValue>(placeholder, key)
    }
}

#[inline(always)]
fn add(counter: &mut u64, n: u64) {
    // SAFETY: the row lives in a map shared with other CPUs
    let counter = unsafe { AtomicU64::from_ptr(counter) };
    counter.fetch_add(n, Ordering::Relaxed);
}

#[inline(always)]
unsafe fn update_stats<K>(placeholder: u64, key: &K, direction: Direction, bytes: u64) {
    let Some(value) = (unsafe { stats_row(placeholder, key) }) else {
        return;
    };
    match direction {
        Direction::Ingress => {
            add(&mut value.rx_bytes, bytes);
            add(&mut value.rx_packets, 1);
        }
        Direction::Egress => {
            add(&mut value.tx_bytes, bytes);
            add(&mut value.tx_packets, 1);
        }
    }
}

/// Whether the chain behind `placeholder` is switched on
#[inline(always)]
unsafe fn chain_enabled(placeholder: u64) -> bool {
    unsafe { lookup::<u32, u8>(placeholder, &UID_MAP_ENABLED) }.is_some_and(|flag| *flag == 1)
}

/// Uid owner verdict: dozable and powersave let through only listed uids,
/// standby drops only listed uids
#[inline(always)]
unsafe fn owner_match(uid: u32) -> i32 {
    if uid < MIN_APP_UID {
        return BPF_PASS as i32;
    }

    unsafe {
        for whitelist in [DOZABLE_UID_MAP_PLACEHOLDER, POWERSAVE_UID_MAP_PLACEHOLDER] {
            if chain_enabled(whitelist) {
                match lookup::<u32, u8>(whitelist, &uid) {
                    Some(verdict) if *verdict == BPF_PASS => {}
                    _ => return BPF_DROP as i32,
                }
            }
        }

        if chain_enabled(STANDBY_UID_MAP_PLACEHOLDER)
            && lookup::<u32, u8>(STANDBY_UID_MAP_PLACEHOLDER, &uid)
                .is_some_and(|verdict| *verdict == BPF_DROP)
        {
            return BPF_DROP as i32;
        }
    }

    BPF_PASS as i32
}

#[inline(always)]
unsafe fn traffic_account(skb: *mut __sk_buff, direction: Direction) -> i32 {
    unsafe {
        let sock_uid = bpf_get_socket_uid(skb);
        let verdict = owner_match(sock_uid);
        if direction == Direction::Egress && verdict == BPF_DROP as i32 {
            // Dropped egress packets never hit the wire, keep them out of stats
            return verdict;
        }

        let cookie = bpf_get_socket_cookie(skb as *mut c_void);
        let (uid, tag) = match lookup::<u64, UidTag>(COOKIE_TAG_MAP_PLACEHOLDER, &cookie) {
            Some(owner) => (owner.uid, owner.tag),
            None => (sock_uid, 0),
        };
        let counter_set = lookup::<u32, u8>(UID_COUNTERSET_MAP_PLACEHOLDER, &uid)
            .map(|set| *set as u32)
            .unwrap_or(0);

        let bytes = (*skb).len as u64;
        let mut key = StatsKey {
            uid,
            tag,
            counter_set,
            iface_index: (*skb).ifindex,
        };

        if tag != 0 {
            update_stats(TAG_STATS_MAP_PLACEHOLDER, &key, direction, bytes);
        }
        key.tag = 0;
        update_stats(UID_STATS_MAP_PLACEHOLDER, &key, direction, bytes);
        update_stats(APP_UID_STATS_MAP_PLACEHOLDER, &uid, direction, bytes);

        verdict
    }
}

#[inline(always)]
unsafe fn iface_account(skb: *mut __sk_buff, direction: Direction) -> i32 {
    unsafe {
        let ifindex = (*skb).ifindex;
        update_stats(IFACE_STATS_MAP_PLACEHOLDER, &ifindex, direction, (*skb).len as u64);
    }
    BPF_MATCH
}

#[unsafe(no_mangle)]
#[unsafe(link_section = "cgroup_ingress_prog")]
pub extern "C" fn cgroup_ingress(skb: *mut __sk_buff) -> i32 {
    unsafe { traffic_account(skb, Direction::Ingress) }
}

#[unsafe(no_mangle)]
#[unsafe(link_section = "cgroup_egress_prog")]
pub extern "C" fn cgroup_egress(skb: *mut __sk_buff) -> i32 {
    unsafe { traffic_account(skb, Direction::Egress) }
}

#[unsafe(no_mangle)]
#[unsafe(link_section = "xt_ingress_prog")]
pub extern "C" fn xt_ingress(skb: *mut __sk_buff) -> i32 {
    unsafe { iface_account(skb, Direction::Ingress) }
}

#[unsafe(no_mangle)]
#[unsafe(link_section = "xt_egress_prog")]
pub extern "C" fn xt_egress(skb: *mut __sk_buff) -> i32 {
    unsafe { iface_account(skb, Direction::Egress) }
}

#[unsafe(no_mangle)]
#[unsafe(link_section = "license")]
pub static LICENSE: [u8; 4] = *b"GPL\0";
