//! Shell script generation
//!
//! Every script is plain bash meant to be piped to `bash -s` as root.

use crate::definition::TechStackDefinition;
use crate::error::Result;
use crate::registry::StackRegistry;
use std::fmt::Write;

const STRICT_PREAMBLE: &str = "#!/usr/bin/env bash\n\
set -euo pipefail\n\
export DEBIAN_FRONTEND=noninteractive\n";

/// Base packages every fresh build gets before any stack
pub const CORE_PACKAGES: [&str; 12] = [
    "ca-certificates",
    "curl",
    "wget",
    "git",
    "sudo",
    "unzip",
    "zip",
    "jq",
    "build-essential",
    "locales",
    "openssh-server",
    "gnupg",
];

/// Install script for `ids` and their dependencies, aborting on first failure
pub fn install_script<S: AsRef<str>>(registry: &StackRegistry, ids: &[S]) -> Result<String> {
    let resolved = registry.resolve(ids)?;
    Ok(install_script_for(&resolved))
}

/// Install script for definitions already resolved and filtered by the caller
pub fn install_script_for(resolved: &[&TechStackDefinition]) -> String {
    let mut script = String::from(STRICT_PREAMBLE);
    if resolved.is_empty() {
        script.push_str("echo \"No tech stacks to install\"\n");
        return script;
    }

    script.push_str("apt-get update\n");
    let total = resolved.len();
    for (index, definition) in resolved.iter().enumerate() {
        let _ = write!(
            script,
            "\necho \"==== [{}/{}] {} ({}) ====\"\n{}\necho \"==== {} installed ====\"\n",
            index + 1,
            total,
            definition.name,
            definition.id,
            definition.install_script.trim_end(),
            definition.id,
        );
    }
    script
}

/// Per-stack presence check; prints `id:installed` or `id:missing`, never aborts
pub fn verify_script<S: AsRef<str>>(registry: &StackRegistry, ids: &[S]) -> Result<String> {
    let resolved = registry.resolve(ids)?;
    let mut script = String::from("#!/usr/bin/env bash\nexport PATH=\"$PATH:/usr/local/go/bin:$HOME/.cargo/bin\"\n");
    for definition in resolved {
        let _ = writeln!(
            script,
            "if ( {} ) >/dev/null 2>&1; then echo \"{}:installed\"; else echo \"{}:missing\"; fi",
            definition.verify_command, definition.id, definition.id,
        );
    }
    Ok(script)
}

/// Parse the output of [`verify_script`] into `(id, installed)` pairs
pub fn parse_verify_output(output: &str) -> Vec<(String, bool)> {
    output
        .lines()
        .filter_map(|line| {
            let (id, state) = line.trim().rsplit_once(':')?;
            match state {
                "installed" => Some((id.to_string(), true)),
                "missing" => Some((id.to_string(), false)),
                _ => None,
            }
        })
        .collect()
}

/// Core packages, locale and SSH server for a fresh container
pub fn core_packages_script() -> String {
    let mut script = String::from(STRICT_PREAMBLE);
    script.push_str("echo \"==== Installing core packages ====\"\n");
    script.push_str("apt-get update\n");
    script.push_str("apt-get upgrade -y\n");
    let _ = writeln!(script, "apt-get install -y {}", CORE_PACKAGES.join(" "));
    script.push_str(
        "sed -i 's/^# *en_US.UTF-8/en_US.UTF-8/' /etc/locale.gen\n\
         locale-gen\n\
         update-locale LANG=en_US.UTF-8\n\
         systemctl enable ssh\n\
         echo \"==== Core packages installed ====\"\n",
    );
    script
}

/// Shrink and de-personalize a container before template conversion
pub fn cleanup_script() -> String {
    let mut script = String::from("#!/usr/bin/env bash\nset -uo pipefail\n");
    script.push_str(
        "echo \"==== Cleaning up ====\"\n\
         apt-get autoremove -y || true\n\
         apt-get clean\n\
         rm -rf /var/lib/apt/lists/* /tmp/* /var/tmp/*\n\
         find /var/log -type f -exec truncate -s 0 {} + || true\n\
         rm -f /root/.bash_history\n\
         truncate -s 0 /etc/machine-id\n\
         sync\n\
         echo \"==== Cleanup done ====\"\n",
    );
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::catalog;

    #[test]
    fn test_install_script_order_and_banners() {
        let script = install_script(catalog(), &["claude"]).unwrap();
        assert!(script.starts_with("#!/usr/bin/env bash\nset -euo pipefail\n"));

        let node = script.find("[1/2] Node.js 22 (nodejs)").unwrap();
        let claude = script.find("[2/2] Claude Code (claude)").unwrap();
        assert!(node < claude);
        assert!(script.contains("npm install -g @anthropic-ai/claude-code"));
        assert!(script.contains("==== claude installed ===="));
    }

    #[test]
    fn test_install_script_empty() {
        let script = install_script::<&str>(catalog(), &[]).unwrap();
        assert!(script.contains("No tech stacks to install"));
        assert!(!script.contains("apt-get update"));
    }

    #[test]
    fn test_install_script_unknown_stack() {
        assert!(install_script(catalog(), &["nope"]).is_err());
    }

    #[test]
    fn test_verify_script_never_aborts() {
        let script = verify_script(catalog(), &["uv"]).unwrap();
        assert!(!script.contains("set -e"));
        assert!(script.contains("echo \"python:installed\""));
        assert!(script.contains("echo \"uv:missing\""));
    }

    #[test]
    fn test_parse_verify_output() {
        let parsed = parse_verify_output("nodejs:installed\nclaude:missing\nnoise\n");
        assert_eq!(
            parsed,
            vec![("nodejs".to_string(), true), ("claude".to_string(), false)]
        );
    }

    #[test]
    fn test_core_and_cleanup_scripts() {
        let core = core_packages_script();
        assert!(core.contains("set -euo pipefail"));
        assert!(core.contains("openssh-server"));

        let cleanup = cleanup_script();
        assert!(cleanup.contains("apt-get clean"));
        assert!(cleanup.contains("/etc/machine-id"));
    }
}
