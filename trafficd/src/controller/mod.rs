// Per-uid accounting and firewall controller
//
// Owns every shared map, keeps the cross-map invariants, and wires the kernel
// programs up at start. Only the three firewall chain maps sit behind a
// userspace lock; all other tables rely on the kernel's per-row atomicity.

mod dump;
pub mod firewall;
pub mod stats;

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};

use aya::Pod;
use trafficd_common::{
    IfaceValue, NONEXISTENT_COOKIE, OVERFLOW_COUNTERSET, StatsKey, StatsValue, UID_MAP_ENABLED,
    UidTag,
};

use crate::bpf::loader::embedded_object;
use crate::bpf::{
    BpfMode, Hook, HookState, MapError, MapRegistry, PinnedMap, ProgramAttacher, ProgramObject,
    TypedMap, UpdatePolicy, support,
};
use crate::config::Config;
use crate::error::TrafficError;
use crate::legacy::QtaguidCtrl;
use crate::sys;

pub use firewall::{ChildChain, FirewallRule, FirewallType};
pub use stats::{SET_ALL, StatsFilter, StatsLine, UID_ALL};

/// The chain maps, guarded together by one mutex
#[derive(Debug, Default)]
pub(crate) struct OwnerMaps {
    pub(crate) dozable: TypedMap<u32, u8>,
    pub(crate) standby: TypedMap<u32, u8>,
    pub(crate) powersave: TypedMap<u32, u8>,
}

#[derive(Debug)]
pub(crate) struct Maps {
    pub(crate) cookie_tag: TypedMap<u64, UidTag>,
    pub(crate) uid_counter_set: TypedMap<u32, u8>,
    pub(crate) app_uid_stats: TypedMap<u32, StatsValue>,
    pub(crate) uid_stats: TypedMap<StatsKey, StatsValue>,
    pub(crate) tag_stats: TypedMap<StatsKey, StatsValue>,
    pub(crate) iface_index_name: TypedMap<u32, IfaceValue>,
    pub(crate) iface_stats: TypedMap<u32, StatsValue>,
    pub(crate) owner: Mutex<OwnerMaps>,
}

impl Maps {
    /// Adopts or creates every map with its access rights applied
    fn open(registry: &MapRegistry) -> Result<Self, MapError> {
        Ok(Self {
            cookie_tag: registry.open(PinnedMap::CookieTag)?,
            uid_counter_set: registry.open(PinnedMap::UidCounterSet)?,
            app_uid_stats: registry.open(PinnedMap::AppUidStats)?,
            uid_stats: registry.open(PinnedMap::UidStats)?,
            tag_stats: registry.open(PinnedMap::TagStats)?,
            iface_index_name: registry.open(PinnedMap::IfaceIndexName)?,
            iface_stats: registry.open(PinnedMap::IfaceStats)?,
            owner: Mutex::new(OwnerMaps {
                dozable: registry.open(PinnedMap::Dozable)?,
                standby: registry.open(PinnedMap::Standby)?,
                powersave: registry.open(PinnedMap::Powersave)?,
            }),
        })
    }

    /// Opens whatever is already pinned; anything else stays invalid
    fn adopt(registry: &MapRegistry) -> Self {
        Self {
            cookie_tag: adopt_one(registry, PinnedMap::CookieTag),
            uid_counter_set: adopt_one(registry, PinnedMap::UidCounterSet),
            app_uid_stats: adopt_one(registry, PinnedMap::AppUidStats),
            uid_stats: adopt_one(registry, PinnedMap::UidStats),
            tag_stats: adopt_one(registry, PinnedMap::TagStats),
            iface_index_name: adopt_one(registry, PinnedMap::IfaceIndexName),
            iface_stats: adopt_one(registry, PinnedMap::IfaceStats),
            owner: Mutex::new(OwnerMaps {
                dozable: adopt_one(registry, PinnedMap::Dozable),
                standby: adopt_one(registry, PinnedMap::Standby),
                powersave: adopt_one(registry, PinnedMap::Powersave),
            }),
        }
    }

    pub(crate) fn owner(&self) -> MutexGuard<'_, OwnerMaps> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (placeholder, fd) pairs for patching the kernel programs
    fn placeholder_fds(&self) -> Vec<(u64, RawFd)> {
        let owner = self.owner();
        let fds = [
            (PinnedMap::CookieTag, self.cookie_tag.fd()),
            (PinnedMap::UidCounterSet, self.uid_counter_set.fd()),
            (PinnedMap::AppUidStats, self.app_uid_stats.fd()),
            (PinnedMap::UidStats, self.uid_stats.fd()),
            (PinnedMap::TagStats, self.tag_stats.fd()),
            (PinnedMap::IfaceStats, self.iface_stats.fd()),
            (PinnedMap::Dozable, owner.dozable.fd()),
            (PinnedMap::Standby, owner.standby.fd()),
            (PinnedMap::Powersave, owner.powersave.fd()),
        ];

        fds.into_iter()
            .filter_map(|(map, fd)| Some((map.placeholder()?, fd.ok()?.as_raw_fd())))
            .collect()
    }
}

fn adopt_one<K: Pod, V: Pod>(registry: &MapRegistry, map: PinnedMap) -> TypedMap<K, V> {
    registry.open_existing(map).unwrap_or_else(|e| {
        log::debug!("{} unavailable: {}", map.file_name(), e);
        TypedMap::default()
    })
}

/// Deletes every row `matches` selects, collecting keys before deleting any.
/// Row-level failures are logged; only a failed walk is returned.
fn delete_matching<K: Pod, V: Pod>(
    map: &TypedMap<K, V>,
    name: &str,
    matches: impl Fn(&K, &V) -> bool,
) -> Result<usize, MapError> {
    let mut doomed = Vec::new();
    for key in map.keys() {
        let key = key?;
        match map.read_value(&key) {
            Ok(value) if matches(&key, &value) => doomed.push(key),
            Ok(_) | Err(MapError::NotFound) => {}
            Err(e) => log::error!("Failed to read row of {}: {}", name, e),
        }
    }

    let mut deleted = 0;
    for key in &doomed {
        match map.delete_value(key) {
            Ok(()) => deleted += 1,
            Err(MapError::NotFound) => {}
            Err(e) => log::error!("Failed to delete row from {}: {}", name, e),
        }
    }
    Ok(deleted)
}

enum Backend {
    Bpf(Maps),
    Legacy(QtaguidCtrl),
}

pub struct TrafficController {
    bpf_enabled: bool,
    registry: MapRegistry,
    backend: Backend,
    hooks: Vec<(Hook, HookState)>,
}

impl TrafficController {
    /// Detects BPF support, sets up the maps and brings the four hooks up.
    /// A hook that fails is recorded in its state and does not stop the
    /// others.
    pub fn start(config: &Config, mode: BpfMode) -> Result<Self, TrafficError> {
        let registry = MapRegistry::from_config(config);
        let bpf_enabled = support::detect(mode, config.platform_api_level);
        let not_loaded = Hook::ALL.map(|hook| (hook, HookState::NotLoaded)).to_vec();

        if !bpf_enabled {
            log::info!(
                "BPF accounting unavailable, using qtaguid at {}",
                config.qtaguid_ctrl.display()
            );
            return Ok(Self {
                bpf_enabled,
                registry,
                backend: Backend::Legacy(QtaguidCtrl::new(&config.qtaguid_ctrl)),
                hooks: not_loaded,
            });
        }

        let maps = Maps::open(&registry)?;
        {
            let owner = maps.owner();
            for chain in ChildChain::ALL {
                owner
                    .chain(chain)
                    .write_value(&UID_MAP_ENABLED, &0, UpdatePolicy::Any)?;
            }
        }

        if config.sync_interfaces {
            sync_interfaces(&maps);
        }

        let object = load_object(config);
        let attacher = ProgramAttacher::new(&registry, &config.cgroup_root);
        let fds = maps.placeholder_fds();
        let hooks = Hook::ALL
            .iter()
            .map(|&hook| {
                let state = match attacher.install(hook, object.as_ref(), &fds) {
                    Ok(()) => HookState::Attached,
                    Err(e) => {
                        log::error!("Failed to bring up {}: {}", hook, e);
                        HookState::Failed(e.to_string())
                    }
                };
                (hook, state)
            })
            .collect();

        log::info!("Traffic controller started with BPF accounting");
        Ok(Self {
            bpf_enabled,
            registry,
            backend: Backend::Bpf(maps),
            hooks,
        })
    }

    /// Attaches to maps a running daemon already pinned, without creating
    /// or loading anything
    pub fn open_pinned(config: &Config, mode: BpfMode) -> Self {
        let registry = MapRegistry::from_config(config);
        let bpf_enabled = support::detect(mode, config.platform_api_level);
        let backend = if bpf_enabled {
            Backend::Bpf(Maps::adopt(&registry))
        } else {
            Backend::Legacy(QtaguidCtrl::new(&config.qtaguid_ctrl))
        };

        Self {
            bpf_enabled,
            registry,
            backend,
            hooks: Hook::ALL.map(|hook| (hook, HookState::NotLoaded)).to_vec(),
        }
    }

    pub fn check_bpf_stats_enable(&self) -> bool {
        self.bpf_enabled
    }

    pub fn registry(&self) -> &MapRegistry {
        &self.registry
    }

    pub fn hook_state(&self, hook: Hook) -> HookState {
        self.hooks
            .iter()
            .find(|(h, _)| *h == hook)
            .map(|(_, state)| state.clone())
            .unwrap_or(HookState::NotLoaded)
    }

    pub(crate) fn maps(&self) -> Option<&Maps> {
        match &self.backend {
            Backend::Bpf(maps) => Some(maps),
            Backend::Legacy(_) => None,
        }
    }

    /// Records `{uid, tag}` as the owner of the socket behind `fd`
    pub fn tag_socket(&self, fd: BorrowedFd<'_>, tag: u32, uid: u32) -> Result<(), TrafficError> {
        let maps = match &self.backend {
            Backend::Bpf(maps) => maps,
            Backend::Legacy(ctrl) => return ctrl.tag_socket(fd.as_raw_fd(), tag, uid),
        };

        let cookie = socket_cookie(fd)?;
        maps.cookie_tag
            .write_value(&cookie, &UidTag { uid, tag }, UpdatePolicy::Any)?;
        log::debug!("Tagged socket cookie {} with uid {} tag {}", cookie, uid, tag);
        Ok(())
    }

    pub fn untag_socket(&self, fd: BorrowedFd<'_>) -> Result<(), TrafficError> {
        let maps = match &self.backend {
            Backend::Bpf(maps) => maps,
            Backend::Legacy(ctrl) => return ctrl.untag_socket(fd.as_raw_fd()),
        };

        let cookie = socket_cookie(fd)?;
        match maps.cookie_tag.delete_value(&cookie) {
            Ok(()) => Ok(()),
            Err(MapError::NotFound) => {
                log::debug!("Socket cookie {} was not tagged", cookie);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Moves `uid` into `counter_set`. The default set 0 is stored as the
    /// absence of a row.
    pub fn set_counter_set(&self, counter_set: u32, uid: u32) -> Result<(), TrafficError> {
        if counter_set >= OVERFLOW_COUNTERSET {
            return Err(TrafficError::invalid(format!(
                "counter set {} out of range [0, {})",
                counter_set, OVERFLOW_COUNTERSET
            )));
        }

        let maps = match &self.backend {
            Backend::Bpf(maps) => maps,
            Backend::Legacy(ctrl) => return ctrl.set_counter_set(counter_set, uid),
        };

        if counter_set == 0 {
            return match maps.uid_counter_set.delete_value(&uid) {
                Ok(()) | Err(MapError::NotFound) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        maps.uid_counter_set
            .write_value(&uid, &(counter_set as u8), UpdatePolicy::Any)?;
        Ok(())
    }

    /// Forgets `uid`'s data for `tag`, or all of it when `tag` is 0
    ///
    /// Each table is cleaned in its own pass; a pass that fails does not
    /// stop the others. The first failed walk is returned after all passes
    /// ran.
    pub fn delete_tag_data(&self, tag: u32, uid: u32) -> Result<(), TrafficError> {
        let maps = match &self.backend {
            Backend::Bpf(maps) => maps,
            Backend::Legacy(ctrl) => return ctrl.delete_tag_data(tag, uid),
        };

        let mut first_error: Option<MapError> = None;
        let mut record = |name: &str, result: Result<usize, MapError>| match result {
            Ok(n) => log::debug!("Deleted {} rows of uid {} from {}", n, uid, name),
            Err(e) => {
                log::error!("Failed to walk {} for uid {}: {}", name, uid, e);
                first_error.get_or_insert(e);
            }
        };

        record(
            "cookie tag map",
            delete_matching(&maps.cookie_tag, "cookie tag map", |_, v| {
                v.uid == uid && (tag == 0 || v.tag == tag)
            }),
        );
        record(
            "tag stats map",
            delete_matching(&maps.tag_stats, "tag stats map", |k, _| {
                k.uid == uid && (tag == 0 || k.tag == tag)
            }),
        );

        if tag == 0 {
            match maps.uid_counter_set.delete_value(&uid) {
                Ok(()) | Err(MapError::NotFound) => {}
                Err(e) => log::error!("Failed to delete counter set of uid {}: {}", uid, e),
            }
            record(
                "uid stats map",
                delete_matching(&maps.uid_stats, "uid stats map", |k, _| k.uid == uid),
            );
            match maps.app_uid_stats.delete_value(&uid) {
                Ok(()) | Err(MapError::NotFound) => {}
                Err(e) => log::error!("Failed to delete app stats of uid {}: {}", uid, e),
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Registers `name` for interface `index` so stats can be reported by name
    pub fn add_interface(&self, name: &str, index: u32) -> Result<(), TrafficError> {
        if index == 0 {
            return Err(TrafficError::invalid(format!(
                "interface {} has index 0",
                name
            )));
        }
        let value = IfaceValue::from_name(name).ok_or_else(|| {
            TrafficError::invalid(format!("interface name {:?} is too long", name))
        })?;

        let Some(maps) = self.maps() else {
            return Ok(());
        };
        maps.iface_index_name
            .write_value(&index, &value, UpdatePolicy::Any)?;
        log::debug!("Registered interface {} at index {}", name, index);
        Ok(())
    }

    /// Drops the tag of a socket the kernel just destroyed
    pub fn on_socket_destroyed(&self, cookie: u64) {
        let Some(maps) = self.maps() else {
            return;
        };
        match maps.cookie_tag.delete_value(&cookie) {
            Ok(()) => log::trace!("Dropped tag of destroyed socket {}", cookie),
            Err(MapError::NotFound) => {}
            Err(e) => log::warn!("Failed to drop tag of socket {}: {}", cookie, e),
        }
    }
}

fn socket_cookie(fd: BorrowedFd<'_>) -> Result<u64, TrafficError> {
    match sys::sock_cookie(fd.as_fd()) {
        Ok(NONEXISTENT_COOKIE) => Err(TrafficError::SocketCookie {
            io_error: io::Error::from_raw_os_error(libc::EIO),
        }),
        Ok(cookie) => Ok(cookie),
        Err((_, io_error)) => Err(TrafficError::SocketCookie { io_error }),
    }
}

/// Registers every interface the system currently has
fn sync_interfaces(maps: &Maps) {
    let interfaces = match nix::net::if_::if_nameindex() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            log::warn!("Failed to list network interfaces: {}", e);
            return;
        }
    };

    for iface in interfaces.iter() {
        let name = iface.name().to_string_lossy();
        let Some(value) = IfaceValue::from_name(&name) else {
            log::warn!("Skipping interface with oversized name {:?}", name);
            continue;
        };
        if let Err(e) = maps
            .iface_index_name
            .write_value(&iface.index(), &value, UpdatePolicy::Any)
        {
            log::warn!("Failed to register interface {}: {}", name, e);
        }
    }
}

/// The configured object file, else the one built into the binary
fn load_object(config: &Config) -> Option<ProgramObject> {
    if config.bpf_object.exists() {
        return match ProgramObject::from_file(&config.bpf_object) {
            Ok(object) => Some(object),
            Err(e) => {
                log::error!("{}", e);
                None
            }
        };
    }

    let bytes = embedded_object()?;
    match ProgramObject::parse(bytes) {
        Ok(object) => {
            log::debug!("Using embedded BPF object ({} bytes)", bytes.len());
            Some(object)
        }
        Err(e) => {
            log::error!("Embedded BPF object is invalid: {}", e);
            None
        }
    }
}
