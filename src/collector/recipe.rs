use std::path::PathBuf;

use crate::config::ProxmoxType;

/// Declarative description of one thing to collect. `critical = true` means
/// a failure here aborts the whole run; otherwise it is logged and counted
/// against `CollectionStats::best_effort_failed`.
#[derive(Debug, Clone)]
pub enum RecipeItem {
    /// A single file, copied as-is.
    File { path: PathBuf, critical: bool },
    /// A directory tree, walked recursively subject to exclusion globs.
    Dir { path: PathBuf, critical: bool },
    /// The captured stdout of a command, written to `dest_name` under the
    /// staging area (e.g. `pveversion -v` -> `pveversion.txt`).
    Command {
        dest_name: &'static str,
        program: &'static str,
        args: &'static [&'static str],
        critical: bool,
    },
}

impl RecipeItem {
    pub fn is_critical(&self) -> bool {
        match self {
            RecipeItem::File { critical, .. } => *critical,
            RecipeItem::Dir { critical, .. } => *critical,
            RecipeItem::Command { critical, .. } => *critical,
        }
    }
}

/// The default PVE/PBS configuration-state recipe. Each of the 23 optional
/// items can be individually switched off by the 23 `collect_*` booleans on
/// `CollectorConfig`; paths that don't exist on this host (e.g. no PBS
/// installed) are skipped rather than treated as failures.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub collect_pve_cluster_config: bool,
    pub collect_pve_storage_config: bool,
    pub collect_pve_firewall: bool,
    pub collect_pve_user_config: bool,
    pub collect_corosync: bool,
    pub collect_network_interfaces: bool,
    pub collect_hosts_and_hostname: bool,
    pub collect_ssh_host_keys: bool,
    pub collect_ssh_authorized_keys: bool,
    pub collect_cron: bool,
    pub collect_apt_sources: bool,
    pub collect_resolv_conf: bool,
    pub collect_fstab: bool,
    pub collect_pbs_config: bool,
    pub collect_pbs_datastore_config: bool,
    pub collect_pbs_user_config: bool,
    pub collect_pbs_acme: bool,
    pub collect_zfs_pool_config: bool,
    pub collect_lvm_config: bool,
    pub collect_pve_version_info: bool,
    pub collect_pvesh_cluster_resources: bool,
    pub collect_ha_manager_status: bool,
    pub collect_pvesm_status: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            collect_pve_cluster_config: true,
            collect_pve_storage_config: true,
            collect_pve_firewall: true,
            collect_pve_user_config: true,
            collect_corosync: true,
            collect_network_interfaces: true,
            collect_hosts_and_hostname: true,
            collect_ssh_host_keys: true,
            collect_ssh_authorized_keys: true,
            collect_cron: true,
            collect_apt_sources: true,
            collect_resolv_conf: true,
            collect_fstab: true,
            collect_pbs_config: true,
            collect_pbs_datastore_config: true,
            collect_pbs_user_config: true,
            collect_pbs_acme: true,
            collect_zfs_pool_config: true,
            collect_lvm_config: true,
            collect_pve_version_info: true,
            collect_pvesh_cluster_resources: true,
            collect_ha_manager_status: true,
            collect_pvesm_status: true,
        }
    }
}

pub fn build(cfg: &CollectorConfig, proxmox_type: ProxmoxType) -> Vec<RecipeItem> {
    let mut items = Vec::new();

    // Always collected, not subject to any opt-out: a backup without the
    // host's kernel/distro identity is unusable for restore triage.
    items.push(RecipeItem::Command {
        dest_name: "uname.txt",
        program: "uname",
        args: &["-a"],
        critical: true,
    });
    items.push(RecipeItem::File {
        path: PathBuf::from("/etc/os-release"),
        critical: true,
    });

    macro_rules! dir {
        ($flag:expr, $path:expr, $critical:expr) => {
            if $flag {
                items.push(RecipeItem::Dir {
                    path: PathBuf::from($path),
                    critical: $critical,
                });
            }
        };
    }
    macro_rules! file {
        ($flag:expr, $path:expr, $critical:expr) => {
            if $flag {
                items.push(RecipeItem::File {
                    path: PathBuf::from($path),
                    critical: $critical,
                });
            }
        };
    }

    dir!(cfg.collect_pve_cluster_config, "/etc/pve", true);
    file!(
        cfg.collect_pve_storage_config,
        "/etc/pve/storage.cfg",
        false
    );
    dir!(cfg.collect_pve_firewall, "/etc/pve/firewall", false);
    file!(cfg.collect_pve_user_config, "/etc/pve/user.cfg", false);
    file!(cfg.collect_corosync, "/etc/corosync/corosync.conf", false);
    file!(
        cfg.collect_network_interfaces,
        "/etc/network/interfaces",
        true
    );
    file!(cfg.collect_hosts_and_hostname, "/etc/hosts", true);
    file!(cfg.collect_hosts_and_hostname, "/etc/hostname", true);
    dir!(cfg.collect_ssh_host_keys, "/etc/ssh", false);
    file!(
        cfg.collect_ssh_authorized_keys,
        "/root/.ssh/authorized_keys",
        false
    );
    dir!(cfg.collect_cron, "/etc/cron.d", false);
    file!(cfg.collect_apt_sources, "/etc/apt/sources.list", false);
    dir!(cfg.collect_apt_sources, "/etc/apt/sources.list.d", false);
    file!(cfg.collect_resolv_conf, "/etc/resolv.conf", false);
    file!(cfg.collect_fstab, "/etc/fstab", true);
    dir!(cfg.collect_pbs_config, "/etc/proxmox-backup", false);
    file!(
        cfg.collect_pbs_datastore_config,
        "/etc/proxmox-backup/datastore.cfg",
        false
    );
    file!(
        cfg.collect_pbs_user_config,
        "/etc/proxmox-backup/user.cfg",
        false
    );
    dir!(cfg.collect_pbs_acme, "/etc/proxmox-backup/acme", false);

    if cfg.collect_pve_version_info {
        match proxmox_type {
            ProxmoxType::Pve => items.push(RecipeItem::Command {
                dest_name: "pveversion.txt",
                program: "pveversion",
                args: &["-v"],
                critical: true,
            }),
            ProxmoxType::Pbs => items.push(RecipeItem::Command {
                dest_name: "proxmox-backup-manager-version.txt",
                program: "proxmox-backup-manager",
                args: &["version"],
                critical: true,
            }),
        }
    }
    if cfg.collect_pvesh_cluster_resources {
        items.push(RecipeItem::Command {
            dest_name: "cluster-resources.json",
            program: "pvesh",
            args: &["get", "/cluster/resources", "--output-format", "json"],
            critical: false,
        });
    }
    if cfg.collect_ha_manager_status {
        items.push(RecipeItem::Command {
            dest_name: "ha-manager-status.txt",
            program: "ha-manager",
            args: &["status"],
            critical: false,
        });
    }
    if cfg.collect_pvesm_status {
        items.push(RecipeItem::Command {
            dest_name: "pvesm-status.txt",
            program: "pvesm",
            args: &["status"],
            critical: false,
        });
    }
    if cfg.collect_zfs_pool_config {
        items.push(RecipeItem::Command {
            dest_name: "zpool-status.txt",
            program: "zpool",
            args: &["status"],
            critical: false,
        });
    }
    if cfg.collect_lvm_config {
        items.push(RecipeItem::Command {
            dest_name: "vgs.txt",
            program: "vgs",
            args: &[],
            critical: false,
        });
    }

    items
}

/// Human-readable names of every target a recipe covers, recorded in the
/// manifest's `proxmox_targets` field.
pub fn target_names(items: &[RecipeItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| match item {
            RecipeItem::File { path, .. } => path.display().to_string(),
            RecipeItem::Dir { path, .. } => path.display().to_string(),
            RecipeItem::Command { dest_name, .. } => dest_name.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_recipe_is_non_empty() {
        let items = build(&CollectorConfig::default(), ProxmoxType::Pve);
        assert!(items.len() > 10);
    }

    #[test]
    fn pbs_type_selects_pbs_version_probe() {
        let items = build(&CollectorConfig::default(), ProxmoxType::Pbs);
        assert!(items.iter().any(|i| matches!(
            i,
            RecipeItem::Command { dest_name: "proxmox-backup-manager-version.txt", .. }
        )));
    }

    #[test]
    fn disabling_every_flag_still_yields_unconditional_critical_items() {
        let cfg = CollectorConfig {
            collect_pve_cluster_config: false,
            collect_pve_storage_config: false,
            collect_pve_firewall: false,
            collect_pve_user_config: false,
            collect_corosync: false,
            collect_network_interfaces: false,
            collect_hosts_and_hostname: false,
            collect_ssh_host_keys: false,
            collect_ssh_authorized_keys: false,
            collect_cron: false,
            collect_apt_sources: false,
            collect_resolv_conf: false,
            collect_fstab: false,
            collect_pbs_config: false,
            collect_pbs_datastore_config: false,
            collect_pbs_user_config: false,
            collect_pbs_acme: false,
            collect_zfs_pool_config: false,
            collect_lvm_config: false,
            collect_pve_version_info: false,
            collect_pvesh_cluster_resources: false,
            collect_ha_manager_status: false,
            collect_pvesm_status: false,
        };
        let items = build(&cfg, ProxmoxType::Pve);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.is_critical()));
    }

    #[test]
    fn critical_items_are_marked() {
        let items = build(&CollectorConfig::default(), ProxmoxType::Pve);
        assert!(items.iter().any(|i| i.is_critical()));
        assert!(items.iter().any(|i| !i.is_critical()));
    }

    #[test]
    fn target_names_cover_every_item() {
        let items = build(&CollectorConfig::default(), ProxmoxType::Pve);
        assert_eq!(target_names(&items).len(), items.len());
    }
}
