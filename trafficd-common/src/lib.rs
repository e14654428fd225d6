#![no_std]

/// Interface name capacity, including the trailing NUL
pub const IFNAMSIZ: usize = 16;

/// Counter set that is out of range for userspace assignment
pub const OVERFLOW_COUNTERSET: u32 = 2;

/// Key in each firewall chain map holding the chain-enabled flag
pub const UID_MAP_ENABLED: u32 = u32::MAX;

/// Cookie reported for a socket the kernel could not identify
pub const NONEXISTENT_COOKIE: u64 = 0;

/// cgroup skb verdicts
pub const BPF_PASS: u8 = 1;
pub const BPF_DROP: u8 = 0;

/// xt_bpf verdict for a matched packet
pub const BPF_MATCH: i32 = 1;

/// Uids below this are system uids and always pass the chains
pub const MIN_APP_UID: u32 = 10000;

// Placeholder immediates the loader swaps for real map fds. Bit-exact, the
// kernel object references maps only through these.
pub const COOKIE_TAG_MAP_PLACEHOLDER: u64 = 0xbfceaaffffffffff;
pub const UID_COUNTERSET_MAP_PLACEHOLDER: u64 = 0xbfdceeafffffffff;
pub const APP_UID_STATS_MAP_PLACEHOLDER: u64 = 0xbfa1daafffffffff;
pub const UID_STATS_MAP_PLACEHOLDER: u64 = 0xbfdaafffffffffff;
pub const TAG_STATS_MAP_PLACEHOLDER: u64 = 0xbfaaafffffffffff;
pub const IFACE_STATS_MAP_PLACEHOLDER: u64 = 0xbf1faceaafffffff;
pub const DOZABLE_UID_MAP_PLACEHOLDER: u64 = 0xbfdddddddddddddd;
pub const STANDBY_UID_MAP_PLACEHOLDER: u64 = 0xbfeeeeeeeeeeeeee;
pub const POWERSAVE_UID_MAP_PLACEHOLDER: u64 = 0xbfffffffffffffff;

/// Owner of a tagged socket, stored under the socket cookie
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UidTag {
    pub uid: u32,
    pub tag: u32,
}

// SAFETY: UidTag is a plain old data type with two u32 fields
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for UidTag {}

/// Key of the per-uid and per-tag stats maps
///
/// `tag == 0` is the untagged aggregate bucket for the uid.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatsKey {
    pub uid: u32,
    pub tag: u32,
    pub counter_set: u32,
    pub iface_index: u32,
}

// SAFETY: StatsKey is a plain old data type with all u32 fields
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for StatsKey {}

/// Byte and packet counters, only ever incremented by the kernel programs
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsValue {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

// SAFETY: StatsValue is a plain old data type with all u64 fields
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for StatsValue {}

impl StatsValue {
    pub const fn new() -> Self {
        Self {
            rx_bytes: 0,
            rx_packets: 0,
            tx_bytes: 0,
            tx_packets: 0,
        }
    }

    /// Field-wise sum, saturating
    pub const fn combine(&self, other: &StatsValue) -> StatsValue {
        StatsValue {
            rx_bytes: self.rx_bytes.saturating_add(other.rx_bytes),
            rx_packets: self.rx_packets.saturating_add(other.rx_packets),
            tx_bytes: self.tx_bytes.saturating_add(other.tx_bytes),
            tx_packets: self.tx_packets.saturating_add(other.tx_packets),
        }
    }
}

/// NUL padded interface name keyed by interface index
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IfaceValue {
    pub name: [u8; IFNAMSIZ],
}

// SAFETY: IfaceValue is a fixed-size byte array
#[cfg(feature = "userspace")]
unsafe impl aya::Pod for IfaceValue {}

impl IfaceValue {
    /// Copies `name` into a NUL padded buffer. Returns None when it does not
    /// fit alongside its terminator.
    pub fn from_name(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.len() >= IFNAMSIZ {
            return None;
        }
        let mut buf = [0u8; IFNAMSIZ];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self { name: buf })
    }

    /// Name bytes up to the first NUL
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IFNAMSIZ);
        &self.name[..end]
    }
}
