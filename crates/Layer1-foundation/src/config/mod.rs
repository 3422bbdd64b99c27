//! Config - unified settings
//!
//! - `burrow.rs` - BurrowConfig and its sections
//! - `store.rs` - config directories and `config.json` loading

mod burrow;
mod store;

pub use burrow::{
    is_secret_setting, BurrowConfig, ContainerDefaults, ProxmoxCredentials, ProxmoxSettings,
    SshSettings, VmidRange, BURROW_CONFIG_FILE, SETTING_BRIDGE, SETTING_CORES, SETTING_DISK, SETTING_MEMORY,
    SETTING_OS_TEMPLATE, SETTING_PROXMOX_HOST, SETTING_PROXMOX_NODE, SETTING_PROXMOX_PORT,
    SETTING_PROXMOX_TOKEN_ID, SETTING_PROXMOX_TOKEN_SECRET, SETTING_STARTING_VMID,
    SETTING_STORAGE, SETTING_TEMPLATE_STORAGE, SETTING_VLAN_TAG, SETTING_VMID_RANGE_END,
};
pub use store::ConfigStore;
