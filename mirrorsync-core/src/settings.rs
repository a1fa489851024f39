//! Layered mirror settings.
//!
//! Precedence for every option, highest first:
//! 1. mirror-level override
//! 2. group-level override, most specific group first, walking up parents
//! 3. pair-level default
//! 4. built-in fallback (only when every tier above is unset)
//!
//! Every option is tri-state: `None` means "unset, ask the next tier", while
//! `Some(false)` is an explicit value and wins like any other.

use serde::{Deserialize, Serialize};

use crate::types::{GroupConfig, MirrorConfig, SyncPair};

/// Tri-state option overrides, shared by mirror, group and pair tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MirrorOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_diverged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_protected_branches: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_divergent_refs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_issues: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_regex: Option<String>,
}

/// Fully resolved options for one mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveSettings {
    pub enabled: bool,
    pub overwrite_diverged: bool,
    pub only_protected_branches: bool,
    pub keep_divergent_refs: bool,
    pub mirror_issues: bool,
    pub trigger_update: bool,
    pub branch_regex: Option<String>,
}

impl Default for EffectiveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            overwrite_diverged: false,
            only_protected_branches: false,
            keep_divergent_refs: false,
            mirror_issues: false,
            trigger_update: true,
            branch_regex: None,
        }
    }
}

/// Resolve effective settings from the three override tiers.
///
/// `groups` must be ordered most specific first; see [`group_chain`].
pub fn resolve(
    mirror: &MirrorOptions,
    groups: &[&MirrorOptions],
    pair: &MirrorOptions,
) -> EffectiveSettings {
    let tiers: Vec<&MirrorOptions> = std::iter::once(mirror)
        .chain(groups.iter().copied())
        .chain(std::iter::once(pair))
        .collect();
    let fallback = EffectiveSettings::default();

    EffectiveSettings {
        enabled: first_set(&tiers, |o| o.enabled).unwrap_or(fallback.enabled),
        overwrite_diverged: first_set(&tiers, |o| o.overwrite_diverged)
            .unwrap_or(fallback.overwrite_diverged),
        only_protected_branches: first_set(&tiers, |o| o.only_protected_branches)
            .unwrap_or(fallback.only_protected_branches),
        keep_divergent_refs: first_set(&tiers, |o| o.keep_divergent_refs)
            .unwrap_or(fallback.keep_divergent_refs),
        mirror_issues: first_set(&tiers, |o| o.mirror_issues).unwrap_or(fallback.mirror_issues),
        trigger_update: first_set(&tiers, |o| o.trigger_update)
            .unwrap_or(fallback.trigger_update),
        branch_regex: first_set(&tiers, |o| o.branch_regex.clone()).or(fallback.branch_regex),
    }
}

/// Group overrides that apply to `group_path`, most specific first.
///
/// For `a/b/c` this yields the entries for `a/b/c`, `a/b`, then `a`, skipping
/// paths that have no configured group.
pub fn group_chain<'a>(groups: &'a [GroupConfig], group_path: Option<&str>) -> Vec<&'a MirrorOptions> {
    let mut chain = Vec::new();
    let mut current = group_path;
    while let Some(path) = current {
        if let Some(group) = groups.iter().find(|g| g.path == path) {
            chain.push(&group.overrides);
        }
        current = path.rsplit_once('/').map(|(parent, _)| parent);
    }
    chain
}

/// Resolve a configured mirror within its pair.
pub fn resolve_for(pair: &SyncPair, mirror: &MirrorConfig) -> EffectiveSettings {
    let chain = group_chain(&pair.groups, mirror.group_path());
    resolve(&mirror.overrides, &chain, &pair.defaults)
}

fn first_set<T>(tiers: &[&MirrorOptions], get: impl Fn(&MirrorOptions) -> Option<T>) -> Option<T> {
    tiers.iter().find_map(|tier| get(tier))
}
