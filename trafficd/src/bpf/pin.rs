// Well-known pin locations and access rights of the shared maps

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use aya::Pod;
use nix::unistd::{Gid, Uid, chown};
use trafficd_common::{
    APP_UID_STATS_MAP_PLACEHOLDER, COOKIE_TAG_MAP_PLACEHOLDER, DOZABLE_UID_MAP_PLACEHOLDER,
    IFACE_STATS_MAP_PLACEHOLDER, POWERSAVE_UID_MAP_PLACEHOLDER, STANDBY_UID_MAP_PLACEHOLDER,
    TAG_STATS_MAP_PLACEHOLDER, UID_COUNTERSET_MAP_PLACEHOLDER, UID_STATS_MAP_PLACEHOLDER,
};

use super::attach::Hook;
use super::map::{MapError, TypedMap};
use crate::config::Config;
use crate::sys::BPF_MAP_TYPE_HASH;

const AID_ROOT: u32 = 0;

/// Every map the controller shares with the kernel programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinnedMap {
    CookieTag,
    UidCounterSet,
    AppUidStats,
    UidStats,
    TagStats,
    IfaceIndexName,
    IfaceStats,
    Dozable,
    Standby,
    Powersave,
}

/// Who may read a pinned map besides its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Owner only (0700)
    OwnerOnly,
    /// Readable by the accounting group (0740)
    Accounting,
    /// Readable by the stats group (0740)
    Stats,
}

impl PinnedMap {
    pub const ALL: [PinnedMap; 10] = [
        PinnedMap::CookieTag,
        PinnedMap::UidCounterSet,
        PinnedMap::AppUidStats,
        PinnedMap::UidStats,
        PinnedMap::TagStats,
        PinnedMap::IfaceIndexName,
        PinnedMap::IfaceStats,
        PinnedMap::Dozable,
        PinnedMap::Standby,
        PinnedMap::Powersave,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            PinnedMap::CookieTag => "traffic_cookie_tag_map",
            PinnedMap::UidCounterSet => "traffic_uid_counterSet_map",
            PinnedMap::AppUidStats => "traffic_app_uid_stats_map",
            PinnedMap::UidStats => "traffic_uid_stats_map",
            PinnedMap::TagStats => "traffic_tag_stats_map",
            PinnedMap::IfaceIndexName => "traffic_iface_index_name_map",
            PinnedMap::IfaceStats => "traffic_iface_stats_map",
            PinnedMap::Dozable => "traffic_dozable_uid_map",
            PinnedMap::Standby => "traffic_standby_uid_map",
            PinnedMap::Powersave => "traffic_powersave_uid_map",
        }
    }

    pub fn max_entries(self) -> u32 {
        match self {
            PinnedMap::CookieTag => 10000,
            PinnedMap::UidCounterSet => 2000,
            PinnedMap::AppUidStats | PinnedMap::UidStats | PinnedMap::TagStats => 10000,
            PinnedMap::IfaceIndexName | PinnedMap::IfaceStats => 1000,
            PinnedMap::Dozable | PinnedMap::Standby | PinnedMap::Powersave => 2000,
        }
    }

    pub fn access(self) -> Access {
        match self {
            PinnedMap::CookieTag | PinnedMap::UidCounterSet => Access::Accounting,
            PinnedMap::AppUidStats
            | PinnedMap::UidStats
            | PinnedMap::TagStats
            | PinnedMap::IfaceIndexName
            | PinnedMap::IfaceStats => Access::Stats,
            PinnedMap::Dozable | PinnedMap::Standby | PinnedMap::Powersave => Access::OwnerOnly,
        }
    }

    /// Placeholder the kernel object uses for this map, if it references it
    pub fn placeholder(self) -> Option<u64> {
        match self {
            PinnedMap::CookieTag => Some(COOKIE_TAG_MAP_PLACEHOLDER),
            PinnedMap::UidCounterSet => Some(UID_COUNTERSET_MAP_PLACEHOLDER),
            PinnedMap::AppUidStats => Some(APP_UID_STATS_MAP_PLACEHOLDER),
            PinnedMap::UidStats => Some(UID_STATS_MAP_PLACEHOLDER),
            PinnedMap::TagStats => Some(TAG_STATS_MAP_PLACEHOLDER),
            PinnedMap::IfaceIndexName => None,
            PinnedMap::IfaceStats => Some(IFACE_STATS_MAP_PLACEHOLDER),
            PinnedMap::Dozable => Some(DOZABLE_UID_MAP_PLACEHOLDER),
            PinnedMap::Standby => Some(STANDBY_UID_MAP_PLACEHOLDER),
            PinnedMap::Powersave => Some(POWERSAVE_UID_MAP_PLACEHOLDER),
        }
    }
}

/// Resolves pin paths under the bpf filesystem root and hands out maps with
/// their access rights applied
#[derive(Debug, Clone)]
pub struct MapRegistry {
    root: PathBuf,
    owner: Option<u32>,
    accounting_group: Option<u32>,
    stats_group: Option<u32>,
}

impl MapRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            owner: None,
            accounting_group: None,
            stats_group: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.bpf_root.clone(),
            owner: config.map_owner,
            accounting_group: config.accounting_group,
            stats_group: config.stats_group,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn map_path(&self, map: PinnedMap) -> PathBuf {
        self.root.join(map.file_name())
    }

    pub fn prog_path(&self, hook: Hook) -> PathBuf {
        self.root.join(hook.pin_name())
    }

    /// Adopts or creates the map, then sets owner and mode on its pin
    pub fn open<K: Pod, V: Pod>(&self, map: PinnedMap) -> Result<TypedMap<K, V>, MapError> {
        let path = self.map_path(map);
        let typed = TypedMap::get_or_create(map.max_entries(), &path, BPF_MAP_TYPE_HASH)?;
        self.apply_access(&path, map.access())
            .map_err(|io_error| MapError::AccessError {
                path: path.clone(),
                io_error,
            })?;
        Ok(typed)
    }

    /// Opens the map only if it is already pinned
    pub fn open_existing<K: Pod, V: Pod>(
        &self,
        map: PinnedMap,
    ) -> Result<TypedMap<K, V>, MapError> {
        TypedMap::from_pinned(&self.map_path(map))
    }

    fn group_for(&self, access: Access) -> Option<u32> {
        match access {
            Access::OwnerOnly => Some(AID_ROOT),
            Access::Accounting => self.accounting_group,
            Access::Stats => self.stats_group,
        }
    }

    fn apply_access(&self, path: &Path, access: Access) -> io::Result<()> {
        if let Some(owner) = self.owner {
            let group = self.group_for(access);
            chown(path, Some(Uid::from_raw(owner)), group.map(Gid::from_raw))
                .map_err(io::Error::from)?;
        }

        let mode = match access {
            Access::OwnerOnly => 0o700,
            Access::Accounting | Access::Stats => 0o740,
        };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::fake::FakeKernel;

    #[test]
    fn test_paths_under_root() {
        let registry = MapRegistry::new("/sys/fs/bpf");
        assert_eq!(
            registry.map_path(PinnedMap::UidCounterSet),
            PathBuf::from("/sys/fs/bpf/traffic_uid_counterSet_map")
        );
        assert_eq!(
            registry.prog_path(Hook::XtEgress),
            PathBuf::from("/sys/fs/bpf/xt_bpf_egress_prog")
        );
    }

    #[test]
    fn test_firewall_maps_are_owner_only() {
        let _kernel = FakeKernel::install();
        let dir = tempfile::tempdir().unwrap();
        let registry = MapRegistry::new(dir.path());

        let _dozable: TypedMap<u32, u8> = registry.open(PinnedMap::Dozable).unwrap();

        let mode = |map: PinnedMap| {
            fs::metadata(registry.map_path(map))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };
        assert_eq!(mode(PinnedMap::Dozable), 0o700);
    }

    #[test]
    fn test_stats_maps_are_group_readable() {
        let _kernel = FakeKernel::install();
        let dir = tempfile::tempdir().unwrap();
        let registry = MapRegistry::new(dir.path());

        let _tags: TypedMap<u64, trafficd_common::UidTag> =
            registry.open(PinnedMap::CookieTag).unwrap();
        let mode = fs::metadata(registry.map_path(PinnedMap::CookieTag))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o740);
    }

    #[test]
    fn test_open_existing_requires_pin() {
        let _kernel = FakeKernel::install();
        let dir = tempfile::tempdir().unwrap();
        let registry = MapRegistry::new(dir.path());

        let err = registry
            .open_existing::<u32, u8>(PinnedMap::Standby)
            .unwrap_err();
        assert!(err.is_not_found());

        let _created: TypedMap<u32, u8> = registry.open(PinnedMap::Standby).unwrap();
        assert!(registry.open_existing::<u32, u8>(PinnedMap::Standby).is_ok());
    }

    #[test]
    fn test_every_kernel_map_has_a_distinct_placeholder() {
        let mut seen: Vec<u64> = PinnedMap::ALL
            .iter()
            .filter_map(|m| m.placeholder())
            .collect();
        assert_eq!(seen.len(), 9);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 9);
    }
}
