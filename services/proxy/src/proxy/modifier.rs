//! Modifier plugins rewrite relayed bytes before they reach the peer.
//!
//! Plugins are registered by kind with a typed parameter struct; a
//! [`ModifierDescriptor`] names an instance and carries its parameters, which
//! are validated when the modifier is added. The chain applies plugins in
//! the order they were added, each one seeing the previous one's output.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use regex::bytes::{NoExpand, Regex};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::analyzer::Direction;
use crate::config::ModifierDescriptor;
use crate::error::ConfigError;
use crate::ids::ConnectionId;

/// One relayed read, as seen by a modifier.
#[derive(Debug, Clone, Copy)]
pub struct UnitContext<'a> {
    pub connection_id: ConnectionId,
    pub direction: Direction,
    pub bytes: &'a [u8],
    /// The unit was read from a TLS-terminated connection.
    pub tls: bool,
}

/// A byte rewriter.
pub trait ModifierPlugin: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Replacement bytes, or `None` to pass the unit through unchanged.
    fn modify(&self, unit: &UnitContext<'_>) -> Option<Bytes>;
}

type Factory = Box<dyn Fn(serde_json::Value) -> Result<Arc<dyn ModifierPlugin>, ConfigError> + Send + Sync>;

/// Maps plugin kinds to constructors taking typed parameters.
pub struct ModifierRegistry {
    factories: HashMap<String, Factory>,
}

impl ModifierRegistry {
    /// Registry without any plugin kinds.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with `replaceContent` and `replaceBytes`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(ReplaceContent::KIND, ReplaceContent::new);
        registry.register(ReplaceBytes::KIND, ReplaceBytes::new);
        registry
    }

    /// Register a plugin kind. `build` receives parameters already
    /// deserialized into `C`.
    pub fn register<C, P, F>(&mut self, kind: &str, build: F)
    where
        C: DeserializeOwned,
        P: ModifierPlugin + 'static,
        F: Fn(C) -> Result<P, ConfigError> + Send + Sync + 'static,
    {
        let kind_name = kind.to_string();
        self.factories.insert(
            kind.to_string(),
            Box::new(move |params| {
                let params = if params.is_null() {
                    serde_json::Value::Object(Default::default())
                } else {
                    params
                };
                let config: C = serde_json::from_value(params)
                    .map_err(|e| ConfigError::invalid(format!("modifiers.{kind_name}.params"), e))?;
                Ok(Arc::new(build(config)?) as Arc<dyn ModifierPlugin>)
            }),
        );
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build(&self, descriptor: &ModifierDescriptor) -> Result<Arc<dyn ModifierPlugin>, ConfigError> {
        let factory = self.factories.get(&descriptor.kind).ok_or_else(|| {
            ConfigError::invalid(
                "modifiers.kind",
                format!("unknown modifier kind `{}` (known: {})", descriptor.kind, self.kinds().join(", ")),
            )
        })?;
        factory(descriptor.params.clone())
    }
}

impl Default for ModifierRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ModifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModifierRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[derive(Clone)]
struct Entry {
    descriptor: ModifierDescriptor,
    plugin: Arc<dyn ModifierPlugin>,
}

/// Modifiers in effect when a connection started.
#[derive(Clone, Default)]
pub struct ModifierSnapshot {
    entries: Arc<Vec<Entry>>,
}

impl ModifierSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `unit` through every plugin in order. Returns the rewritten bytes,
    /// or `None` when no plugin changed anything.
    pub fn apply(&self, unit: &UnitContext<'_>) -> Option<Bytes> {
        let mut current: Option<Bytes> = None;
        for entry in self.entries.iter() {
            let input = current.as_deref().unwrap_or(unit.bytes);
            let ctx = UnitContext { bytes: input, ..*unit };
            if let Some(replaced) = entry.plugin.modify(&ctx) {
                debug!(
                    modifier = %entry.descriptor.name,
                    direction = %unit.direction,
                    before = input.len(),
                    after = replaced.len(),
                    "Modifier rewrote unit"
                );
                current = Some(replaced);
            }
        }
        current
    }
}

/// Ordered, hot-swappable list of modifiers.
pub struct ModifierChain {
    registry: ModifierRegistry,
    entries: ArcSwap<Vec<Entry>>,
}

impl ModifierChain {
    pub fn new(registry: ModifierRegistry) -> Self {
        Self {
            registry,
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Validate and append a modifier; names must be unique.
    pub fn add(&self, descriptor: ModifierDescriptor) -> Result<(), ConfigError> {
        if descriptor.name.trim().is_empty() {
            return Err(ConfigError::invalid("modifiers.name", "must not be empty"));
        }
        let plugin = self.registry.build(&descriptor)?;
        let name = descriptor.name.clone();
        let kind = descriptor.kind.clone();
        let entry = Entry { descriptor, plugin };
        // The check runs inside the update so racing adders see each other.
        let mut duplicate = false;
        self.entries.rcu(|current| {
            duplicate = current.iter().any(|e| e.descriptor.name == name);
            if duplicate {
                return Arc::clone(current);
            }
            let mut next = Vec::clone(current);
            next.push(entry.clone());
            Arc::new(next)
        });
        if duplicate {
            return Err(ConfigError::invalid(
                "modifiers.name",
                format!("modifier `{name}` already exists"),
            ));
        }
        info!(modifier = %name, kind = %kind, "Modifier added");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut existed = false;
        self.entries.rcu(|current| {
            existed = current.iter().any(|e| e.descriptor.name == name);
            if !existed {
                return Arc::clone(current);
            }
            Arc::new(
                current
                    .iter()
                    .filter(|e| e.descriptor.name != name)
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        });
        if existed {
            info!(modifier = %name, "Modifier removed");
        }
        existed
    }

    pub fn descriptors(&self) -> Vec<ModifierDescriptor> {
        self.entries.load().iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn snapshot(&self) -> ModifierSnapshot {
        ModifierSnapshot {
            entries: self.entries.load_full(),
        }
    }
}

impl Default for ModifierChain {
    fn default() -> Self {
        Self::new(ModifierRegistry::with_builtins())
    }
}

fn direction_allows(filter: Option<Direction>, unit: &UnitContext<'_>) -> bool {
    filter.map_or(true, |d| d == unit.direction)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplaceContentConfig {
    pub search: String,
    pub replace: String,
    /// Treat `search` as a regex; `replace` may then use `$1`-style groups.
    #[serde(default)]
    pub regex: bool,
    /// Replace every match instead of only the first.
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub direction: Option<Direction>,
}

/// Replaces text (literal or regex) inside a unit.
#[derive(Debug)]
pub struct ReplaceContent {
    pattern: Regex,
    replace: Vec<u8>,
    expand: bool,
    all: bool,
    direction: Option<Direction>,
}

impl ReplaceContent {
    pub const KIND: &'static str = "replaceContent";

    pub fn new(config: ReplaceContentConfig) -> Result<Self, ConfigError> {
        if config.search.is_empty() {
            return Err(ConfigError::invalid("modifiers.replaceContent.search", "must not be empty"));
        }
        let source = if config.regex {
            config.search.clone()
        } else {
            regex::escape(&config.search)
        };
        let pattern = Regex::new(&source)
            .map_err(|e| ConfigError::invalid("modifiers.replaceContent.search", e))?;
        Ok(Self {
            pattern,
            replace: config.replace.into_bytes(),
            expand: config.regex,
            all: config.all,
            direction: config.direction,
        })
    }
}

impl ModifierPlugin for ReplaceContent {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn modify(&self, unit: &UnitContext<'_>) -> Option<Bytes> {
        if !direction_allows(self.direction, unit) || !self.pattern.is_match(unit.bytes) {
            return None;
        }
        let limit = if self.all { 0 } else { 1 };
        let replaced = if self.expand {
            self.pattern.replacen(unit.bytes, limit, self.replace.as_slice())
        } else {
            self.pattern.replacen(unit.bytes, limit, NoExpand(&self.replace))
        };
        Some(Bytes::from(replaced.into_owned()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplaceBytesConfig {
    /// Hex-encoded byte sequence to find.
    pub search_hex: String,
    /// Hex-encoded replacement.
    pub replace_hex: String,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub direction: Option<Direction>,
}

/// Replaces a raw byte sequence inside a unit.
#[derive(Debug)]
pub struct ReplaceBytes {
    search: Vec<u8>,
    replace: Vec<u8>,
    all: bool,
    direction: Option<Direction>,
}

impl ReplaceBytes {
    pub const KIND: &'static str = "replaceBytes";

    pub fn new(config: ReplaceBytesConfig) -> Result<Self, ConfigError> {
        let search = hex::decode(config.search_hex.trim())
            .map_err(|e| ConfigError::invalid("modifiers.replaceBytes.search_hex", e))?;
        let replace = hex::decode(config.replace_hex.trim())
            .map_err(|e| ConfigError::invalid("modifiers.replaceBytes.replace_hex", e))?;
        if search.is_empty() {
            return Err(ConfigError::invalid("modifiers.replaceBytes.search_hex", "must not be empty"));
        }
        Ok(Self {
            search,
            replace,
            all: config.all,
            direction: config.direction,
        })
    }

    fn find(&self, haystack: &[u8], from: usize) -> Option<usize> {
        haystack[from..]
            .windows(self.search.len())
            .position(|w| w == self.search.as_slice())
            .map(|i| i + from)
    }
}

impl ModifierPlugin for ReplaceBytes {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn modify(&self, unit: &UnitContext<'_>) -> Option<Bytes> {
        if !direction_allows(self.direction, unit) {
            return None;
        }
        let bytes = unit.bytes;
        let mut pos = self.find(bytes, 0)?;
        let mut out = Vec::with_capacity(bytes.len());
        let mut copied = 0;
        loop {
            out.extend_from_slice(&bytes[copied..pos]);
            out.extend_from_slice(&self.replace);
            copied = pos + self.search.len();
            if !self.all {
                break;
            }
            match self.find(bytes, copied) {
                Some(next) => pos = next,
                None => break,
            }
        }
        out.extend_from_slice(&bytes[copied..]);
        Some(Bytes::from(out))
    }
}
