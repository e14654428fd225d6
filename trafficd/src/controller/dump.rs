// Diagnostic dump of controller state. Never mutates anything.

use std::io::{self, Write};
use std::path::Path;

use aya::Pod;

use super::{Backend, TrafficController};
use crate::bpf::map::path_to_cstring;
use crate::bpf::{Hook, PinnedMap, TypedMap};
use crate::sys::bpf_obj_get;

fn pin_present(path: &Path) -> bool {
    path_to_cstring(path)
        .ok()
        .is_some_and(|c_path| bpf_obj_get(&c_path).is_ok())
}

fn map_status<K: Pod, V: Pod>(map: &TypedMap<K, V>, path: &Path) -> String {
    if !map.is_valid() {
        return "map fd lost".to_string();
    }
    if !pin_present(path) {
        return format!("map not pinned to location: {}", path.display());
    }
    "OK".to_string()
}

fn prog_status(path: &Path) -> String {
    if pin_present(path) {
        "OK".to_string()
    } else {
        format!("program is missing at: {}", path.display())
    }
}

/// Writes every row through `row`; a failing walk is reported inline
fn dump_rows<K: Pod, V: Pod>(
    w: &mut dyn Write,
    map: &TypedMap<K, V>,
    row: impl Fn(&K, &V) -> String,
) -> io::Result<()> {
    for key in map.keys() {
        let line = key
            .and_then(|key| map.read_value(&key).map(|value| row(&key, &value)))
            .unwrap_or_else(|e| format!("error: {}", e));
        writeln!(w, "    {}", line)?;
    }
    Ok(())
}

fn dump_map<K: Pod, V: Pod>(
    w: &mut dyn Write,
    controller: &TrafficController,
    which: PinnedMap,
    map: &TypedMap<K, V>,
    verbose: bool,
    row: impl Fn(&K, &V) -> String,
) -> io::Result<()> {
    let path = controller.registry.map_path(which);
    writeln!(w, "  {}: {}", which.file_name(), map_status(map, &path))?;
    if verbose && map.is_valid() {
        dump_rows(w, map, row)?;
    }
    Ok(())
}

impl TrafficController {
    pub fn dump(&self, w: &mut dyn Write, verbose: bool) -> io::Result<()> {
        writeln!(w, "TrafficController")?;
        writeln!(
            w,
            "  BPF module status: {}",
            if self.bpf_enabled { "ON" } else { "OFF" }
        )?;

        let maps = match &self.backend {
            Backend::Bpf(maps) => maps,
            Backend::Legacy(ctrl) => {
                writeln!(w, "  qtaguid ctrl: {}", ctrl.path().display())?;
                return Ok(());
            }
        };

        dump_map(w, self, PinnedMap::CookieTag, &maps.cookie_tag, verbose, |cookie, v| {
            format!("cookie={} tag={:#x} uid={}", cookie, v.tag, v.uid)
        })?;
        dump_map(w, self, PinnedMap::UidCounterSet, &maps.uid_counter_set, verbose, |uid, set| {
            format!("uid={} set={}", uid, set)
        })?;
        dump_map(w, self, PinnedMap::AppUidStats, &maps.app_uid_stats, verbose, |uid, v| {
            format!(
                "uid={} rxBytes={} rxPackets={} txBytes={} txPackets={}",
                uid, v.rx_bytes, v.rx_packets, v.tx_bytes, v.tx_packets
            )
        })?;

        let names = &maps.iface_index_name;
        let stats_row = |k: &trafficd_common::StatsKey, v: &trafficd_common::StatsValue| {
            let iface = names
                .read_value(&k.iface_index)
                .map(|n| String::from_utf8_lossy(n.name_bytes()).into_owned())
                .unwrap_or_else(|_| "?".to_string());
            format!(
                "{} {} uid={} tag={:#x} set={} rxBytes={} rxPackets={} txBytes={} txPackets={}",
                k.iface_index,
                iface,
                k.uid,
                k.tag,
                k.counter_set,
                v.rx_bytes,
                v.rx_packets,
                v.tx_bytes,
                v.tx_packets
            )
        };
        dump_map(w, self, PinnedMap::UidStats, &maps.uid_stats, verbose, stats_row)?;
        dump_map(w, self, PinnedMap::TagStats, &maps.tag_stats, verbose, stats_row)?;

        dump_map(w, self, PinnedMap::IfaceIndexName, names, verbose, |index, v| {
            format!("ifaceIndex={} ifaceName={}", index, String::from_utf8_lossy(v.name_bytes()))
        })?;
        dump_map(w, self, PinnedMap::IfaceStats, &maps.iface_stats, verbose, |index, v| {
            format!(
                "ifaceIndex={} rxBytes={} rxPackets={} txBytes={} txPackets={}",
                index, v.rx_bytes, v.rx_packets, v.tx_bytes, v.tx_packets
            )
        })?;

        {
            let owner = maps.owner();
            let verdict = |uid: &u32, v: &u8| format!("uid={} verdict={}", uid, v);
            dump_map(w, self, PinnedMap::Dozable, &owner.dozable, verbose, verdict)?;
            dump_map(w, self, PinnedMap::Standby, &owner.standby, verbose, verdict)?;
            dump_map(w, self, PinnedMap::Powersave, &owner.powersave, verbose, verdict)?;
        }

        for hook in Hook::ALL {
            writeln!(
                w,
                "  {}: {}",
                hook.pin_name(),
                prog_status(&self.registry.prog_path(hook))
            )?;
        }
        Ok(())
    }
}
