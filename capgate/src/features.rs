//! Tiers, scopes, and the feature registry
//!
//! The registry is the static catalog of everything the core can gate: each
//! feature id (`scope.name`) maps to the requirements a state must satisfy
//! before the feature is admitted. The registry is seeded once at
//! construction and is immutable for the life of the process; removing a
//! feature is a new registry version.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::DenyReason;

/// Subscription tier, totally ordered by rank
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// No subscription
    #[default]
    Free,
    /// Entry paid tier
    Basic,
    /// Professional tier
    Pro,
    /// Developer tier
    Dev,
    /// Enterprise tier
    Enterprise,
}

impl Tier {
    /// All tiers in ascending rank order
    pub const ALL: [Tier; 5] = [
        Tier::Free,
        Tier::Basic,
        Tier::Pro,
        Tier::Dev,
        Tier::Enterprise,
    ];

    /// Numeric rank (free = 0)
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Hardware score floor a device must meet before this tier can take
    /// effect
    pub fn hardware_floor(self) -> u32 {
        match self {
            Tier::Free | Tier::Basic | Tier::Pro => 0,
            Tier::Dev | Tier::Enterprise => 25,
        }
    }

    /// Highest tier whose hardware floor is satisfied by `score`
    pub fn highest_for_score(score: u32) -> Tier {
        let mut best = Tier::Free;
        for tier in Tier::ALL {
            if tier.hardware_floor() <= score {
                best = tier;
            }
        }
        best
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Basic => write!(f, "basic"),
            Self::Pro => write!(f, "pro"),
            Self::Dev => write!(f, "dev"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Feature scope — the leading segment of every feature id
///
/// Declaration order here is the canonical scope order used for delta
/// reporting and feature-set iteration; the UI relies on it for stable
/// layout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Conversational surfaces
    Chat,
    /// Content feeds
    Feed,
    /// Build tooling
    Build,
    /// Document tooling
    Doc,
    /// Domain management
    Domain,
    /// Model access
    Ai,
    /// Core system surfaces
    System,
}

impl Scope {
    /// All scopes in canonical order
    pub const ALL: [Scope; 7] = [
        Scope::Chat,
        Scope::Feed,
        Scope::Build,
        Scope::Doc,
        Scope::Domain,
        Scope::Ai,
        Scope::System,
    ];

    /// Lowercase scope name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Feed => "feed",
            Self::Build => "build",
            Self::Doc => "doc",
            Self::Domain => "domain",
            Self::Ai => "ai",
            Self::System => "system",
        }
    }

    /// Parse a scope from its lowercase name
    pub fn parse(s: &str) -> Option<Scope> {
        Scope::ALL.into_iter().find(|scope| scope.as_str() == s)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Requirements a state must satisfy before a feature is admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRequirement {
    /// Minimum tier rank
    pub required_tier: Tier,

    /// Minimum hardware score, if the feature is hardware-bound
    #[serde(default)]
    pub min_hardware_score: Option<u32>,

    /// Whether the bridge companion must be online
    #[serde(default)]
    pub requires_bridge: bool,

    /// Credentials that must be present in the vault
    #[serde(default)]
    pub required_credentials: Vec<String>,

    /// Optional features are hidden rather than failed when absent
    #[serde(default)]
    pub optional: bool,
}

impl FeatureRequirement {
    /// Requirement gated on tier alone
    pub fn tier(required_tier: Tier) -> Self {
        Self {
            required_tier,
            min_hardware_score: None,
            requires_bridge: false,
            required_credentials: Vec::new(),
            optional: false,
        }
    }

    /// Set the hardware score floor
    pub fn with_min_score(mut self, score: u32) -> Self {
        self.min_hardware_score = Some(score);
        self
    }

    /// Require the bridge to be online
    pub fn with_bridge(mut self) -> Self {
        self.requires_bridge = true;
        self
    }

    /// Require a credential to be present in the vault
    pub fn with_credential(mut self, name: impl Into<String>) -> Self {
        self.required_credentials.push(name.into());
        self
    }

    /// Mark the feature optional (hidden, not failed, when unavailable)
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// One registered feature
#[derive(Debug, Clone)]
pub struct FeatureDef {
    /// Full feature id, `scope.name`
    pub id: String,
    /// Parsed scope prefix
    pub scope: Scope,
    /// Admission requirements
    pub requirement: FeatureRequirement,
}

/// Static, versioned catalog of gateable features
///
/// Lookups are O(1): ids are interned into a dense index at build time.
#[derive(Debug, Clone)]
pub struct FeatureRegistry {
    version: u32,
    defs: Vec<FeatureDef>,
    index: HashMap<String, usize>,
    by_scope: HashMap<Scope, Vec<usize>>,
}

impl FeatureRegistry {
    /// Start building a registry with the given version identifier
    pub fn builder(version: u32) -> FeatureRegistryBuilder {
        FeatureRegistryBuilder {
            version,
            defs: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Registry version identifier (exported, compared on import)
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of registered features
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Look up a feature definition
    pub fn get(&self, feature: &str) -> Option<&FeatureDef> {
        self.index.get(feature).map(|&i| &self.defs[i])
    }

    /// Requirements for a feature id; unknown ids are a distinguished error,
    /// never a default
    pub fn requirements(&self, feature: &str) -> Result<&FeatureRequirement, DenyReason> {
        self.get(feature)
            .map(|def| &def.requirement)
            .ok_or_else(|| DenyReason::UnknownFeature {
                feature: feature.to_string(),
            })
    }

    /// Scope prefix of a feature id
    pub fn scope_of(&self, feature: &str) -> Result<Scope, DenyReason> {
        self.get(feature)
            .map(|def| def.scope)
            .ok_or_else(|| DenyReason::UnknownFeature {
                feature: feature.to_string(),
            })
    }

    /// All feature ids declared under a scope, in declaration order
    pub fn all_in(&self, scope: Scope) -> Vec<&str> {
        self.by_scope
            .get(&scope)
            .map(|indices| indices.iter().map(|&i| self.defs[i].id.as_str()).collect())
            .unwrap_or_default()
    }

    /// Iterate every definition in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &FeatureDef> {
        self.defs.iter()
    }

    /// The built-in catalog
    pub fn standard() -> FeatureRegistry {
        STANDARD.clone()
    }
}

/// Builder for [`FeatureRegistry`]
#[derive(Debug)]
pub struct FeatureRegistryBuilder {
    version: u32,
    defs: Vec<FeatureDef>,
    index: HashMap<String, usize>,
}

/// Error raised while assembling a registry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Feature id is not of the form `scope.name` with a known scope
    #[error("invalid feature id: {0}")]
    InvalidId(String),

    /// Feature id declared twice
    #[error("duplicate feature id: {0}")]
    Duplicate(String),
}

impl FeatureRegistryBuilder {
    /// Declare a feature; declaration order is the catalog order
    pub fn feature(
        mut self,
        id: impl Into<String>,
        requirement: FeatureRequirement,
    ) -> Result<Self, RegistryError> {
        let id = id.into();
        let scope = id
            .split_once('.')
            .filter(|(_, name)| !name.is_empty())
            .and_then(|(prefix, _)| Scope::parse(prefix))
            .ok_or_else(|| RegistryError::InvalidId(id.clone()))?;
        if self.index.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.index.insert(id.clone(), self.defs.len());
        self.defs.push(FeatureDef {
            id,
            scope,
            requirement,
        });
        Ok(self)
    }

    /// Finish the registry
    pub fn build(self) -> FeatureRegistry {
        let mut by_scope: HashMap<Scope, Vec<usize>> = HashMap::new();
        for (i, def) in self.defs.iter().enumerate() {
            by_scope.entry(def.scope).or_default().push(i);
        }
        FeatureRegistry {
            version: self.version,
            defs: self.defs,
            index: self.index,
            by_scope,
        }
    }
}

static STANDARD: Lazy<FeatureRegistry> = Lazy::new(|| {
    let build = || -> Result<FeatureRegistry, RegistryError> {
        Ok(FeatureRegistry::builder(1)
            .feature("chat.basic", FeatureRequirement::tier(Tier::Free))?
            .feature("chat.mcp", FeatureRequirement::tier(Tier::Pro).with_bridge())?
            .feature("feed.rss", FeatureRequirement::tier(Tier::Free))?
            .feature(
                "feed.ipfs",
                FeatureRequirement::tier(Tier::Basic).with_bridge(),
            )?
            .feature(
                "feed.alexandria",
                FeatureRequirement::tier(Tier::Pro).with_bridge(),
            )?
            .feature(
                "feed.kaggle",
                FeatureRequirement::tier(Tier::Basic)
                    .with_credential("KAGGLE_KEY")
                    .optional(),
            )?
            .feature("build.templates", FeatureRequirement::tier(Tier::Basic))?
            .feature(
                "build.goo-field",
                FeatureRequirement::tier(Tier::Dev)
                    .with_min_score(50)
                    .with_bridge(),
            )?
            .feature("doc.editor", FeatureRequirement::tier(Tier::Free))?
            .feature(
                "doc.ged",
                FeatureRequirement::tier(Tier::Pro).with_bridge(),
            )?
            .feature(
                "doc.search",
                FeatureRequirement::tier(Tier::Basic).with_bridge(),
            )?
            .feature(
                "doc.three-chain",
                FeatureRequirement::tier(Tier::Dev).with_bridge(),
            )?
            .feature(
                "domain.lookup",
                FeatureRequirement::tier(Tier::Basic).with_credential("PORKBUN_KEY"),
            )?
            .feature(
                "domain.register",
                FeatureRequirement::tier(Tier::Pro).with_credential("PORKBUN_KEY"),
            )?
            .feature("ai.local", FeatureRequirement::tier(Tier::Free))?
            .feature(
                "ai.huggingface",
                FeatureRequirement::tier(Tier::Basic)
                    .with_credential("HF_TOKEN")
                    .optional(),
            )?
            .feature("system.export", FeatureRequirement::tier(Tier::Free))?
            .feature("system.diagnostics", FeatureRequirement::tier(Tier::Basic))?
            .build())
    };
    match build() {
        Ok(registry) => registry,
        Err(err) => panic!("built-in feature catalog is invalid: {err}"),
    }
});
