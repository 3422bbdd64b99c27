//! `burrow settings ...`

use crate::app::App;
use crate::output::print_json;
use burrow_foundation::config::{
    SETTING_BRIDGE, SETTING_CORES, SETTING_DISK, SETTING_MEMORY, SETTING_OS_TEMPLATE,
    SETTING_PROXMOX_HOST, SETTING_PROXMOX_NODE, SETTING_PROXMOX_PORT, SETTING_PROXMOX_TOKEN_ID,
    SETTING_PROXMOX_TOKEN_SECRET, SETTING_STARTING_VMID, SETTING_STORAGE,
    SETTING_TEMPLATE_STORAGE, SETTING_VLAN_TAG, SETTING_VMID_RANGE_END,
};
use burrow_foundation::SettingsStore;
use clap::Subcommand;
use std::collections::BTreeMap;

const KNOWN_KEYS: &[&str] = &[
    SETTING_PROXMOX_HOST,
    SETTING_PROXMOX_PORT,
    SETTING_PROXMOX_TOKEN_ID,
    SETTING_PROXMOX_TOKEN_SECRET,
    SETTING_PROXMOX_NODE,
    SETTING_STORAGE,
    SETTING_TEMPLATE_STORAGE,
    SETTING_MEMORY,
    SETTING_CORES,
    SETTING_DISK,
    SETTING_BRIDGE,
    SETTING_VLAN_TAG,
    SETTING_OS_TEMPLATE,
    SETTING_STARTING_VMID,
    SETTING_VMID_RANGE_END,
];

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Show stored settings
    List,
    Get { key: String },
    /// Store a setting; overrides config files, not the environment
    Set { key: String, value: String },
}

pub fn run(app: &App, command: SettingsCommand) -> anyhow::Result<()> {
    match command {
        SettingsCommand::List => {
            let settings: BTreeMap<String, String> = app
                .storage
                .all_settings()?
                .into_iter()
                .map(|(k, v)| {
                    let shown = if k == SETTING_PROXMOX_TOKEN_SECRET { mask(&v) } else { v };
                    (k, shown)
                })
                .collect();
            if app.json {
                return print_json(&settings);
            }
            for (key, value) in settings {
                println!("{} = {}", key, value);
            }
        }
        SettingsCommand::Get { key } => match app.storage.get_setting(&key)? {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("{} is not set", key),
        },
        SettingsCommand::Set { key, value } => {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                anyhow::bail!("unknown setting '{}'; known: {}", key, KNOWN_KEYS.join(", "));
            }
            app.storage.set_setting(&key, &value)?;
            println!("{} updated", key);
        }
    }
    Ok(())
}

fn mask(secret: &str) -> String {
    if secret.len() <= 4 {
        return "****".to_string();
    }
    format!("{}****", secret.get(..4).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        assert_eq!(mask("abc"), "****");
        assert_eq!(mask("abcdef-123"), "abcd****");
    }
}
