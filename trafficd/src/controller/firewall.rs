// Uid owner chains: dozable, standby and powersave
//
// Every chain map is uid -> verdict plus one sentinel row under
// UID_MAP_ENABLED holding whether the kernel enforces the chain at all.

use std::collections::HashSet;
use std::fmt;

use trafficd_common::{BPF_DROP, BPF_PASS, UID_MAP_ENABLED};

use super::{OwnerMaps, TrafficController};
use crate::bpf::{MapError, TypedMap, UpdatePolicy};
use crate::error::TrafficError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildChain {
    Dozable,
    Standby,
    Powersave,
}

impl ChildChain {
    pub const ALL: [ChildChain; 3] = [ChildChain::Dozable, ChildChain::Standby, ChildChain::Powersave];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "fw_dozable" => Some(ChildChain::Dozable),
            "fw_standby" => Some(ChildChain::Standby),
            "fw_powersave" => Some(ChildChain::Powersave),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChildChain::Dozable => "fw_dozable",
            ChildChain::Standby => "fw_standby",
            ChildChain::Powersave => "fw_powersave",
        }
    }
}

impl fmt::Display for ChildChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallRule {
    Allow,
    Deny,
}

/// Whitelist chains drop everything not listed, blacklist chains drop only
/// what is listed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallType {
    Whitelist,
    Blacklist,
}

impl OwnerMaps {
    pub(crate) fn chain(&self, chain: ChildChain) -> &TypedMap<u32, u8> {
        match chain {
            ChildChain::Dozable => &self.dozable,
            ChildChain::Standby => &self.standby,
            ChildChain::Powersave => &self.powersave,
        }
    }
}

/// Brings `uid`'s row in line with `rule` on a chain of type `fw_type`.
/// Rows that would only restate the chain default are removed.
fn apply_rule(
    map: &TypedMap<u32, u8>,
    uid: u32,
    rule: FirewallRule,
    fw_type: FirewallType,
) -> Result<(), MapError> {
    match (rule, fw_type) {
        (FirewallRule::Allow, FirewallType::Whitelist) => {
            map.write_value(&uid, &BPF_PASS, UpdatePolicy::Any)
        }
        (FirewallRule::Deny, FirewallType::Blacklist) => {
            map.write_value(&uid, &BPF_DROP, UpdatePolicy::Any)
        }
        (FirewallRule::Deny, FirewallType::Whitelist)
        | (FirewallRule::Allow, FirewallType::Blacklist) => match map.delete_value(&uid) {
            Ok(()) | Err(MapError::NotFound) => Ok(()),
            Err(e) => Err(e),
        },
    }
}

impl TrafficController {
    pub fn change_uid_owner_rule(
        &self,
        chain: ChildChain,
        uid: u32,
        rule: FirewallRule,
        fw_type: FirewallType,
    ) -> Result<(), TrafficError> {
        if uid == UID_MAP_ENABLED {
            return Err(TrafficError::invalid(format!(
                "uid {} is reserved for the {} enable flag",
                uid, chain
            )));
        }
        let Some(maps) = self.maps() else {
            return Ok(());
        };

        let owner = maps.owner();
        apply_rule(owner.chain(chain), uid, rule, fw_type)?;
        log::debug!("{}: uid {} -> {:?} ({:?})", chain, uid, rule, fw_type);
        Ok(())
    }

    /// Makes the chain called `chain_name` hold exactly `uids`
    ///
    /// Stale uids are removed before the new set is written. The enable
    /// flag is left alone. A row that cannot be removed or written is
    /// logged and skipped; only a failed walk of the chain is returned.
    pub fn replace_uid_owner_map(
        &self,
        chain_name: &str,
        is_whitelist: bool,
        uids: &[u32],
    ) -> Result<(), TrafficError> {
        let chain = ChildChain::from_name(chain_name)
            .ok_or_else(|| TrafficError::invalid(format!("unknown chain {:?}", chain_name)))?;
        if uids.contains(&UID_MAP_ENABLED) {
            return Err(TrafficError::invalid(format!(
                "uid {} is reserved for the {} enable flag",
                UID_MAP_ENABLED, chain
            )));
        }
        let Some(maps) = self.maps() else {
            return Ok(());
        };

        let (rule, fw_type) = if is_whitelist {
            (FirewallRule::Allow, FirewallType::Whitelist)
        } else {
            (FirewallRule::Deny, FirewallType::Blacklist)
        };
        let wanted: HashSet<u32> = uids.iter().copied().collect();

        let owner = maps.owner();
        let map = owner.chain(chain);

        let mut stale = Vec::new();
        for key in map.keys() {
            let uid = key?;
            if uid != UID_MAP_ENABLED && !wanted.contains(&uid) {
                stale.push(uid);
            }
        }
        let mut failed = 0usize;
        for uid in &stale {
            match map.delete_value(uid) {
                Ok(()) | Err(MapError::NotFound) => {}
                Err(e) => {
                    log::error!("{}: failed to remove uid {}: {}", chain, uid, e);
                    failed += 1;
                }
            }
        }

        for &uid in uids {
            if let Err(e) = apply_rule(map, uid, rule, fw_type) {
                log::error!("{}: failed to write uid {}: {}", chain, uid, e);
                failed += 1;
            }
        }

        log::info!(
            "{}: replaced with {} uids ({} removed, {} failed)",
            chain,
            wanted.len(),
            stale.len(),
            failed
        );
        Ok(())
    }

    /// Turns enforcement of `chain` on or off. The enable flag row must
    /// already exist.
    pub fn toggle_uid_owner_map(&self, chain: ChildChain, enable: bool) -> Result<(), TrafficError> {
        let Some(maps) = self.maps() else {
            return Ok(());
        };

        let owner = maps.owner();
        owner
            .chain(chain)
            .write_value(&UID_MAP_ENABLED, &(enable as u8), UpdatePolicy::Exist)?;
        log::info!("{} {}", chain, if enable { "enabled" } else { "disabled" });
        Ok(())
    }
}
