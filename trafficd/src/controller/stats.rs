// Read-side reports over the stats maps

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use trafficd_common::{StatsKey, StatsValue};

use super::{Maps, TrafficController};
use crate::bpf::{MapError, TypedMap};
use crate::error::TrafficError;

/// uid of a line that aggregates every uid
pub const UID_ALL: i64 = -1;
/// Counter set of a line that aggregates every set
pub const SET_ALL: i64 = -1;

/// One row of a detail or per-interface report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsLine {
    pub iface: String,
    pub uid: i64,
    pub set: i64,
    pub tag: u32,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

impl StatsLine {
    fn new(iface: String, uid: i64, set: i64, tag: u32, value: &StatsValue) -> Self {
        Self {
            iface,
            uid,
            set,
            tag,
            rx_bytes: value.rx_bytes,
            rx_packets: value.rx_packets,
            tx_bytes: value.tx_bytes,
            tx_packets: value.tx_packets,
        }
    }

    fn value(&self) -> StatsValue {
        StatsValue {
            rx_bytes: self.rx_bytes,
            rx_packets: self.rx_packets,
            tx_bytes: self.tx_bytes,
            tx_packets: self.tx_packets,
        }
    }
}

/// Restricts `network_stats_detail`. Empty `ifaces` and `None` match all.
#[derive(Debug, Clone, Default)]
pub struct StatsFilter {
    pub ifaces: Vec<String>,
    pub tag: Option<u32>,
    pub uid: Option<u32>,
}

impl StatsFilter {
    fn matches(&self, iface: &str, key: &StatsKey) -> bool {
        if !self.ifaces.is_empty() && !self.ifaces.iter().any(|i| i == iface) {
            return false;
        }
        if self.tag.is_some_and(|tag| tag != key.tag) {
            return false;
        }
        if self.uid.is_some_and(|uid| uid != key.uid) {
            return false;
        }
        true
    }
}

/// Index -> name snapshot of the interface map
fn iface_names(maps: &Maps) -> Result<HashMap<u32, String>, MapError> {
    let mut names = HashMap::new();
    maps.iface_index_name
        .iterate_with_value(|index, value, _| -> Result<(), MapError> {
            names.insert(
                *index,
                String::from_utf8_lossy(value.name_bytes()).into_owned(),
            );
            Ok(())
        })?;
    Ok(names)
}

/// Sums lines sharing `(iface, uid, set, tag)`, ordered by that tuple
fn group_lines(lines: Vec<StatsLine>) -> Vec<StatsLine> {
    let mut grouped: BTreeMap<(String, i64, i64, u32), StatsValue> = BTreeMap::new();
    for line in lines {
        let value = line.value();
        grouped
            .entry((line.iface, line.uid, line.set, line.tag))
            .and_modify(|total| *total = total.combine(&value))
            .or_insert(value);
    }
    grouped
        .into_iter()
        .map(|((iface, uid, set, tag), value)| StatsLine::new(iface, uid, set, tag, &value))
        .collect()
}

fn collect_detail(
    map: &TypedMap<StatsKey, StatsValue>,
    names: &HashMap<u32, String>,
    filter: &StatsFilter,
    lines: &mut Vec<StatsLine>,
) -> Result<(), MapError> {
    map.iterate_with_value(|key, value, _| -> Result<(), MapError> {
        let Some(iface) = names.get(&key.iface_index) else {
            log::trace!("Skipping stats of unknown interface {}", key.iface_index);
            return Ok(());
        };
        if filter.matches(iface, key) {
            lines.push(StatsLine::new(
                iface.clone(),
                i64::from(key.uid),
                i64::from(key.counter_set),
                key.tag,
                value,
            ));
        }
        Ok(())
    })
}

impl TrafficController {
    /// Lifetime totals of `uid`, zero when it never sent or received
    pub fn uid_stats(&self, uid: u32) -> Result<StatsValue, TrafficError> {
        let Some(maps) = self.maps() else {
            return Ok(StatsValue::new());
        };
        match maps.app_uid_stats.read_value(&uid) {
            Ok(value) => Ok(value),
            Err(MapError::NotFound) => Ok(StatsValue::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Totals of the interface called `iface`, or of every interface
    pub fn iface_stats(&self, iface: Option<&str>) -> Result<StatsValue, TrafficError> {
        let Some(maps) = self.maps() else {
            return Ok(StatsValue::new());
        };
        let names = iface_names(maps)?;

        let mut total = StatsValue::new();
        maps.iface_stats
            .iterate_with_value(|index, value, _| -> Result<(), MapError> {
                let Some(name) = names.get(index) else {
                    return Ok(());
                };
                if iface.is_none_or(|wanted| wanted == name) {
                    total = total.combine(value);
                }
                Ok(())
            })?;
        Ok(total)
    }

    /// Per uid, tag and counter set lines from the tag stats map followed by
    /// the uid stats map
    pub fn network_stats_detail(
        &self,
        filter: &StatsFilter,
    ) -> Result<Vec<StatsLine>, TrafficError> {
        let Some(maps) = self.maps() else {
            return Ok(Vec::new());
        };
        let names = iface_names(maps)?;

        let mut lines = Vec::new();
        collect_detail(&maps.tag_stats, &names, filter, &mut lines)?;
        collect_detail(&maps.uid_stats, &names, filter, &mut lines)?;
        Ok(group_lines(lines))
    }

    /// One summary line per interface
    pub fn network_stats_dev(&self) -> Result<Vec<StatsLine>, TrafficError> {
        let Some(maps) = self.maps() else {
            return Ok(Vec::new());
        };
        let names = iface_names(maps)?;

        let mut lines = Vec::new();
        maps.iface_stats
            .iterate_with_value(|index, value, _| -> Result<(), MapError> {
                if let Some(name) = names.get(index) {
                    lines.push(StatsLine::new(name.clone(), UID_ALL, SET_ALL, 0, value));
                }
                Ok(())
            })?;
        Ok(group_lines(lines))
    }
}
