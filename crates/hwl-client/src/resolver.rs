//! Client type resolution under an allow-list policy
//!
//! Instance reports name their client type with a dotted, fully qualified
//! name such as `hwl_client.power.PowerClient`. The part before the last
//! dot is the owning module. A [`TypeRegistry`] maps names to constructor
//! functions; [`TypeRegistry::resolve`] only hands a constructor out when
//! the module passes the [`ResolvePolicy`].

use std::collections::HashMap;
use std::sync::Arc;

use hwl_core::config::DriverPolicyConfig;
use hwl_core::ErrorKind;
use thiserror::Error;

use crate::client::{Client, ClientBase, DriverClient};
use crate::composite::CompositeClient;
use crate::network::NetworkClient;
use crate::power::PowerClient;
use crate::ClientError;

/// Constructor for one client type
pub type ClientFactory = fn(ClientBase) -> Result<Arc<dyn Client>, ClientError>;

/// Errors from type resolution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The name has no module part or is empty
    #[error("Malformed client type name: '{0}'")]
    Malformed(String),

    /// The module is not on the allow-list
    #[error("Client type {type_name} denied: module '{module}' is not in the allow list")]
    NotAllowed { type_name: String, module: String },

    /// No constructor is registered under the name
    #[error("Client type {0} is not registered")]
    NotFound(String),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::NotAllowed { .. } => ErrorKind::Permission,
            ResolveError::Malformed(_) | ResolveError::NotFound(_) => ErrorKind::Config,
        }
    }
}

/// Which modules may provide client types
#[derive(Debug, Clone, Default)]
pub struct ResolvePolicy {
    /// Module names, or globs using `*`
    pub allow: Vec<String>,
    /// Accept any module
    pub unsafe_: bool,
}

impl ResolvePolicy {
    pub fn new(allow: Vec<String>, unsafe_: bool) -> Self {
        Self { allow, unsafe_ }
    }

    /// Whether types from `module` may be loaded
    pub fn permits(&self, module: &str) -> bool {
        self.unsafe_ || self.allow.iter().any(|pattern| glob_match(pattern, module))
    }
}

impl From<&DriverPolicyConfig> for ResolvePolicy {
    fn from(config: &DriverPolicyConfig) -> Self {
        Self::new(config.allow.clone(), config.unsafe_)
    }
}

/// Registry of client constructors keyed by fully qualified type name
#[derive(Clone)]
pub struct TypeRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl TypeRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry holding the client types shipped with this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(DriverClient::TYPE_NAME, DriverClient::construct);
        registry.register(CompositeClient::TYPE_NAME, CompositeClient::construct);
        registry.register(PowerClient::TYPE_NAME, PowerClient::construct);
        registry.register(NetworkClient::TYPE_NAME, NetworkClient::construct);
        registry
    }

    /// Register a constructor, replacing any previous one for the name
    pub fn register(&mut self, type_name: impl Into<String>, factory: ClientFactory) {
        self.factories.insert(type_name.into(), factory);
    }

    /// Registered type names whose module is exactly `module`, sorted
    pub fn types_in(&self, module: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .factories
            .keys()
            .map(String::as_str)
            .filter(|name| module_of(name).is_ok_and(|m| m == module))
            .collect();
        names.sort_unstable();
        names
    }

    /// Look up the constructor for `type_name`, enforcing `policy`
    pub fn resolve(
        &self,
        type_name: &str,
        policy: &ResolvePolicy,
    ) -> Result<ClientFactory, ResolveError> {
        let module = module_of(type_name)?;
        if !policy.permits(module) {
            tracing::warn!("Refusing client type {} from module {}", type_name, module);
            return Err(ResolveError::NotAllowed {
                type_name: type_name.to_string(),
                module: module.to_string(),
            });
        }
        self.factories
            .get(type_name)
            .copied()
            .ok_or_else(|| ResolveError::NotFound(type_name.to_string()))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn module_of(type_name: &str) -> Result<&str, ResolveError> {
    match type_name.rsplit_once('.') {
        Some((module, class)) if !module.is_empty() && !class.is_empty() => Ok(module),
        _ => Err(ResolveError::Malformed(type_name.to_string())),
    }
}

/// Match `text` against `pattern`, where `*` matches any run of characters
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // No `*` at all: exact match
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::with_builtins();
        registry.register("evil.mod.Backdoor", DriverClient::construct);
        registry.register("good.mod.Widget", DriverClient::construct);
        registry
    }

    #[test]
    fn test_allow_list_enforced() {
        let policy = ResolvePolicy::new(vec!["good.mod".to_string()], false);
        let registry = registry();

        assert!(registry.resolve("good.mod.Widget", &policy).is_ok());
        let err = registry.resolve("evil.mod.Backdoor", &policy).unwrap_err();
        assert_eq!(
            err,
            ResolveError::NotAllowed {
                type_name: "evil.mod.Backdoor".to_string(),
                module: "evil.mod".to_string(),
            }
        );
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[test]
    fn test_unsafe_bypasses_allow_list() {
        let policy = ResolvePolicy::new(vec![], true);
        assert!(registry().resolve("evil.mod.Backdoor", &policy).is_ok());
    }

    #[test]
    fn test_unregistered_and_malformed() {
        let policy = ResolvePolicy::new(vec![], true);
        let registry = registry();
        assert_eq!(
            registry.resolve("good.mod.Missing", &policy).unwrap_err(),
            ResolveError::NotFound("good.mod.Missing".to_string())
        );
        assert!(matches!(
            registry.resolve("NoModule", &policy),
            Err(ResolveError::Malformed(_))
        ));
        assert!(matches!(
            registry.resolve("trailing.", &policy),
            Err(ResolveError::Malformed(_))
        ));
    }

    #[test]
    fn test_policy_checked_before_registration() {
        let policy = ResolvePolicy::new(vec!["good.mod".to_string()], false);
        assert!(matches!(
            registry().resolve("evil.mod.NotEvenRegistered", &policy),
            Err(ResolveError::NotAllowed { .. })
        ));
    }

    #[test]
    fn test_glob_patterns() {
        assert!(glob_match("hwl_client.*", "hwl_client.power"));
        assert!(glob_match("hwl_client.*", "hwl_client.power.sub"));
        assert!(!glob_match("hwl_client.*", "hwl_clientx"));
        assert!(glob_match("*.drivers", "vendor.drivers"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("a*c*e", "abcd"));
        assert!(glob_match("good.mod", "good.mod"));
        assert!(!glob_match("good.mod", "good.module"));
        assert!(glob_match("*", "anything.at.all"));
    }

    #[test]
    fn test_default_policy_allows_builtins() {
        let policy = ResolvePolicy::from(&DriverPolicyConfig::default());
        let registry = TypeRegistry::with_builtins();
        assert!(registry.resolve(PowerClient::TYPE_NAME, &policy).is_ok());
        assert!(registry.resolve(CompositeClient::TYPE_NAME, &policy).is_ok());
    }
}
