//! Role derivation for linked members.

use gk_core::models::{Rank, RoleId};
use std::collections::{BTreeSet, HashMap};

/// Which roles the bot manages and what qualifies for each.
#[derive(Debug, Clone, Default)]
pub struct RoleLayout {
    /// Granted to every linked member.
    pub verified: Option<RoleId>,
    /// Granted for an exact rank match.
    pub ranks: HashMap<Rank, RoleId>,
}

impl RoleLayout {
    /// Every role the bot may add or take away.
    pub fn managed(&self) -> BTreeSet<RoleId> {
        self.verified.iter().chain(self.ranks.values()).copied().collect()
    }

    /// Roles a member should hold. `None` is an unlinked member.
    pub fn desired(&self, rank: Option<Rank>) -> BTreeSet<RoleId> {
        let Some(rank) = rank else {
            return BTreeSet::new();
        };
        self.verified
            .iter()
            .chain(self.ranks.get(&rank))
            .copied()
            .collect()
    }

    pub fn plan(&self, current: &[RoleId], rank: Option<Rank>) -> RoleDiff {
        let current: BTreeSet<RoleId> = current.iter().copied().collect();
        let desired = self.desired(rank);
        let managed = self.managed();
        RoleDiff {
            add: desired.difference(&current).copied().collect(),
            remove: managed
                .difference(&desired)
                .filter(|role| current.contains(role))
                .copied()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleDiff {
    pub add: Vec<RoleId>,
    pub remove: Vec<RoleId>,
}

impl RoleDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}
