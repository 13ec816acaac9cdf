//
// The extension registry: the single indirection point through which an
// installation can override named implementations (access policies, metadata
// decorations) without any runtime class swapping.
//
// Implementations register under `(extension, key)`; the `EXTENSIONS` env
// setting is an ordered list of extension names, highest priority first. The
// base implementation registers under the reserved name and always loses
// against a listed extension.
//
use std::collections::HashMap;
use std::sync::RwLock;

use crate::CONFIG;

/// The always-present, lowest-priority pseudo extension.
pub const BASE_EXTENSION: &str = "gridgate";

pub struct ExtensionRegistry<T: 'static> {
    entries: RwLock<HashMap<String, Vec<(String, T)>>>,
}

impl<T: Copy> ExtensionRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, extension: &str, key: &str, value: T) {
        let mut entries = self.entries.write().unwrap();
        entries.entry(key.to_string()).or_default().push((extension.to_string(), value));
    }

    /// Resolves `key` to the implementation from the highest-priority
    /// extension that provides one, the base implementation last.
    pub fn resolve(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().unwrap();
        let candidates = entries.get(key)?;
        for extension in resolution_order() {
            if let Some((_, value)) = candidates.iter().find(|(name, _)| *name == extension) {
                return Some(*value);
            }
        }
        None
    }
}

impl<T: Copy> Default for ExtensionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// `EXTENSIONS` order, then the base.
pub fn resolution_order() -> Vec<String> {
    let mut order = CONFIG.extensions_vec();
    order.push(BASE_EXTENSION.to_string());
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_resolves_when_no_extension_provides() {
        let registry: ExtensionRegistry<u32> = ExtensionRegistry::new();
        registry.register(BASE_EXTENSION, "policy", 1);
        assert_eq!(registry.resolve("policy"), Some(1));
        assert_eq!(registry.resolve("unknown"), None);
    }

    #[test]
    fn listed_extension_shadows_base() {
        // The default EXTENSIONS setting is empty, so only the explicit order
        // below is exercised; precedence itself is what matters here.
        let registry: ExtensionRegistry<u32> = ExtensionRegistry::new();
        registry.register(BASE_EXTENSION, "policy", 1);
        registry.register("lhcb_ext", "policy", 2);

        let entries = registry.entries.read().unwrap();
        let candidates = entries.get("policy").unwrap();
        // Simulated resolution with the extension listed first
        let order = vec!["lhcb_ext".to_string(), BASE_EXTENSION.to_string()];
        let resolved = order
            .iter()
            .find_map(|ext| candidates.iter().find(|(name, _)| name == ext).map(|(_, v)| *v));
        assert_eq!(resolved, Some(2));
    }
}
