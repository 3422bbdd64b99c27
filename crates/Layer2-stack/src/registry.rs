//! Stack Registry - the built-in catalog and dependency resolution

use crate::definition::{StackCategory, TechStackDefinition};
use crate::error::{Result, StackError};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Built-in catalog
static CATALOG: OnceLock<StackRegistry> = OnceLock::new();

/// Access the built-in catalog
pub fn catalog() -> &'static StackRegistry {
    CATALOG.get_or_init(|| {
        let mut registry = StackRegistry::new();
        registry.register_defaults();
        registry
    })
}

/// Stack definitions keyed by id, listed in registration order
#[derive(Debug, Clone, Default)]
pub struct StackRegistry {
    stacks: HashMap<String, TechStackDefinition>,
    order: Vec<String>,
}

impl StackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a definition
    pub fn register(&mut self, definition: TechStackDefinition) {
        if !self.stacks.contains_key(&definition.id) {
            self.order.push(definition.id.clone());
        }
        self.stacks.insert(definition.id.clone(), definition);
    }

    pub fn get(&self, id: &str) -> Option<&TechStackDefinition> {
        self.stacks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.stacks.contains_key(id)
    }

    pub fn list(&self) -> Vec<&TechStackDefinition> {
        self.order.iter().filter_map(|id| self.stacks.get(id)).collect()
    }

    /// Definitions needed for `ids`, dependencies first, each once
    pub fn resolve<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<&TechStackDefinition>> {
        let mut resolved = Vec::new();
        let mut done = HashSet::new();
        let mut visiting = HashSet::new();
        for id in ids {
            self.visit(id.as_ref(), &mut done, &mut visiting, &mut resolved)?;
        }
        Ok(resolved)
    }

    fn visit<'a>(
        &'a self,
        id: &str,
        done: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        resolved: &mut Vec<&'a TechStackDefinition>,
    ) -> Result<()> {
        if done.contains(id) {
            return Ok(());
        }
        if !visiting.insert(id.to_string()) {
            return Err(StackError::DependencyCycle(id.to_string()));
        }

        let definition = self
            .stacks
            .get(id)
            .ok_or_else(|| StackError::UnknownStack(id.to_string()))?;
        for dep in &definition.dependencies {
            self.visit(dep, done, visiting, resolved)?;
        }

        visiting.remove(id);
        done.insert(id.to_string());
        resolved.push(definition);
        Ok(())
    }

    /// Resolved ids, in install order
    pub fn resolve_ids<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<String>> {
        Ok(self.resolve(ids)?.into_iter().map(|d| d.id.clone()).collect())
    }

    /// True if anything in the closure of `ids` needs nesting
    pub fn requires_nesting<S: AsRef<str>>(&self, ids: &[S]) -> Result<bool> {
        Ok(self.resolve(ids)?.iter().any(|d| d.requires_nesting))
    }

    /// Register the built-in stacks
    pub fn register_defaults(&mut self) {
        // ====================================================================
        // Runtimes & languages
        // ====================================================================
        self.register(TechStackDefinition::new(
            "nodejs",
            "Node.js 22",
            StackCategory::Runtime,
            "curl -fsSL https://deb.nodesource.com/setup_22.x | bash -\n\
             apt-get install -y nodejs",
            "node --version",
        ));

        self.register(TechStackDefinition::new(
            "bun",
            "Bun",
            StackCategory::Runtime,
            "curl -fsSL https://bun.sh/install | BUN_INSTALL=/usr/local bash",
            "bun --version",
        ));

        self.register(TechStackDefinition::new(
            "python",
            "Python 3",
            StackCategory::Language,
            "apt-get install -y python3 python3-pip python3-venv python3-dev",
            "python3 --version",
        ));

        self.register(
            TechStackDefinition::new(
                "uv",
                "uv",
                StackCategory::Tool,
                "curl -LsSf https://astral.sh/uv/install.sh | env UV_INSTALL_DIR=/usr/local/bin sh",
                "uv --version",
            )
            .with_dependency("python"),
        );

        self.register(TechStackDefinition::new(
            "go",
            "Go",
            StackCategory::Language,
            "GO_VERSION=1.23.4\n\
             curl -fsSL \"https://go.dev/dl/go${GO_VERSION}.linux-amd64.tar.gz\" -o /tmp/go.tar.gz\n\
             rm -rf /usr/local/go\n\
             tar -C /usr/local -xzf /tmp/go.tar.gz\n\
             rm -f /tmp/go.tar.gz\n\
             echo 'export PATH=$PATH:/usr/local/go/bin' > /etc/profile.d/go.sh",
            "/usr/local/go/bin/go version",
        ));

        self.register(TechStackDefinition::new(
            "rust",
            "Rust",
            StackCategory::Language,
            "curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | sh -s -- -y --profile minimal\n\
             echo 'export PATH=$PATH:$HOME/.cargo/bin' > /etc/profile.d/rust.sh",
            "$HOME/.cargo/bin/rustc --version",
        ));

        self.register(TechStackDefinition::new(
            "java",
            "Java (OpenJDK)",
            StackCategory::Language,
            "apt-get install -y default-jdk-headless",
            "java -version",
        ));

        // ====================================================================
        // Containers
        // ====================================================================
        self.register(
            TechStackDefinition::new(
                "docker",
                "Docker Engine",
                StackCategory::Container,
                "curl -fsSL https://get.docker.com | sh\n\
                 systemctl enable --now docker",
                "docker --version",
            )
            .with_nesting(),
        );

        // ====================================================================
        // Tools
        // ====================================================================
        self.register(TechStackDefinition::new(
            "github-cli",
            "GitHub CLI",
            StackCategory::Tool,
            "mkdir -p -m 755 /etc/apt/keyrings\n\
             curl -fsSL https://cli.github.com/packages/githubcli-archive-keyring.gpg \
             -o /etc/apt/keyrings/githubcli-archive-keyring.gpg\n\
             chmod go+r /etc/apt/keyrings/githubcli-archive-keyring.gpg\n\
             echo \"deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/githubcli-archive-keyring.gpg] \
             https://cli.github.com/packages stable main\" > /etc/apt/sources.list.d/github-cli.list\n\
             apt-get update\n\
             apt-get install -y gh",
            "gh --version",
        ));

        // ====================================================================
        // AI coding agents
        // ====================================================================
        self.register(
            TechStackDefinition::new(
                "claude",
                "Claude Code",
                StackCategory::Ai,
                "npm install -g @anthropic-ai/claude-code",
                "claude --version",
            )
            .with_dependency("nodejs"),
        );

        self.register(
            TechStackDefinition::new(
                "codex",
                "OpenAI Codex CLI",
                StackCategory::Ai,
                "npm install -g @openai/codex",
                "codex --version",
            )
            .with_dependency("nodejs"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(defs: &[&TechStackDefinition]) -> Vec<String> {
        defs.iter().map(|d| d.id.clone()).collect()
    }

    #[test]
    fn test_resolve_dependencies_first() {
        let resolved = catalog().resolve(&["claude"]).unwrap();
        assert_eq!(ids(&resolved), vec!["nodejs", "claude"]);
    }

    #[test]
    fn test_resolve_shared_dependency_once() {
        let resolved = catalog().resolve(&["claude", "codex", "nodejs"]).unwrap();
        assert_eq!(ids(&resolved), vec!["nodejs", "claude", "codex"]);
    }

    #[test]
    fn test_resolve_unknown() {
        let err = catalog().resolve(&["cobol"]).unwrap_err();
        assert_eq!(err, StackError::UnknownStack("cobol".into()));
    }

    #[test]
    fn test_requires_nesting() {
        assert!(catalog().requires_nesting(&["docker"]).unwrap());
        assert!(!catalog().requires_nesting(&["nodejs"]).unwrap());
        assert!(!catalog().requires_nesting(&["claude"]).unwrap());
        assert!(catalog().requires_nesting(&["python", "docker"]).unwrap());
    }

    #[test]
    fn test_requires_nesting_through_dependency() {
        let mut registry = StackRegistry::new();
        registry.register(
            TechStackDefinition::new("engine", "Engine", StackCategory::Container, "true", "true")
                .with_nesting(),
        );
        registry.register(
            TechStackDefinition::new("compose", "Compose", StackCategory::Tool, "true", "true")
                .with_dependency("engine"),
        );
        assert!(registry.requires_nesting(&["compose"]).unwrap());
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut registry = StackRegistry::new();
        registry.register(
            TechStackDefinition::new("a", "A", StackCategory::Tool, "true", "true")
                .with_dependency("b"),
        );
        registry.register(
            TechStackDefinition::new("b", "B", StackCategory::Tool, "true", "true")
                .with_dependency("a"),
        );
        assert!(matches!(
            registry.resolve(&["a"]),
            Err(StackError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_catalog_dependencies_exist() {
        for definition in catalog().list() {
            for dep in &definition.dependencies {
                assert!(catalog().contains(dep), "{} -> {}", definition.id, dep);
            }
        }
    }

    fn catalog_ids() -> Vec<String> {
        catalog().list().iter().map(|d| d.id.clone()).collect()
    }

    proptest! {
        #[test]
        fn prop_resolve_orders_and_dedups(
            picks in proptest::collection::vec(proptest::sample::select(catalog_ids()), 0..8)
        ) {
            let resolved = catalog().resolve(&picks).unwrap();
            let order = ids(&resolved);

            let unique: HashSet<&String> = order.iter().collect();
            prop_assert_eq!(unique.len(), order.len());

            for (index, definition) in resolved.iter().enumerate() {
                for dep in &definition.dependencies {
                    let dep_index = order.iter().position(|id| id == dep);
                    prop_assert!(matches!(dep_index, Some(i) if i < index));
                }
            }
            for pick in &picks {
                prop_assert!(order.contains(pick));
            }
        }
    }
}
