//! Tech stack definitions

use serde::{Deserialize, Serialize};

/// Broad grouping shown in listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackCategory {
    Runtime,
    Language,
    Container,
    Tool,
    Ai,
}

impl StackCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Language => "language",
            Self::Container => "container",
            Self::Tool => "tool",
            Self::Ai => "ai",
        }
    }
}

/// One installable package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechStackDefinition {
    pub id: String,
    pub name: String,
    pub category: StackCategory,
    /// Bash fragment run as root inside the container
    pub install_script: String,
    /// Exits zero when the stack is present
    pub verify_command: String,
    /// Needs the LXC `nesting` feature (container engines)
    #[serde(default)]
    pub requires_nesting: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TechStackDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: StackCategory,
        install_script: impl Into<String>,
        verify_command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            install_script: install_script.into(),
            verify_command: verify_command.into(),
            requires_nesting: false,
            dependencies: Vec::new(),
        }
    }

    pub fn with_nesting(mut self) -> Self {
        self.requires_nesting = true;
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }
}
