// ABOUTME: Shared runtime: module cache, foreign registry, handle IDs

use crate::config::Config;
use crate::env::{Environment, ModuleInfo};
use crate::foreign::{ForeignDecl, ForeignFn};
use crate::object::{Module, Object};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Module cache entry. `Loading` carries the published environment so that
/// circular imports observe the in-progress module through binding refs.
#[derive(Debug, Clone)]
pub enum ModuleSlot {
    Loading(Arc<Environment>, Arc<ModuleInfo>),
    Loaded(Arc<Module>),
}

/// Process-shared interpreter state. The foreign registry is built once at
/// creation and treated as immutable afterwards; every spawned task shares
/// the same Runtime.
#[derive(Debug)]
pub struct Runtime {
    pub config: Config,
    modules: Mutex<HashMap<String, ModuleSlot>>,
    foreign: HashMap<String, Arc<ForeignFn>>,
    /// Prelude bindings visible in every module without an import.
    pub prelude: Arc<Environment>,
    handle_counter: AtomicU64,
}

impl Runtime {
    pub fn new(config: Config) -> Arc<Self> {
        let mut foreign = HashMap::new();
        let prelude = Environment::new_module(None);
        for decl in inventory::iter::<ForeignDecl> {
            let bound = match ForeignFn::from_decl(decl) {
                Ok(f) => Arc::new(f),
                Err(_) => continue,
            };
            if let Some(short) = decl.prelude {
                prelude.define(short, Object::Foreign(bound.clone()), false);
            }
            foreign.insert(decl.fqn.to_string(), bound);
        }
        // the channel empty-marker is an ordinary prelude binding
        prelude.define("closed", Object::Closed, false);
        Arc::new(Runtime {
            config,
            modules: Mutex::new(HashMap::new()),
            foreign,
            prelude,
            handle_counter: AtomicU64::new(0),
        })
    }

    /// 64-bit handle ID: upper bits a monotone counter, lower 16 a random
    /// salt.
    pub fn next_handle_id(&self) -> u64 {
        let counter = self.handle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let salt: u16 = rand::thread_rng().gen();
        (counter << 16) | salt as u64
    }

    pub fn lookup_foreign(&self, fqn: &str) -> Option<Arc<ForeignFn>> {
        self.foreign.get(fqn).cloned()
    }

    pub fn module_slot(&self, fqn: &str) -> Option<ModuleSlot> {
        self.modules.lock().get(fqn).cloned()
    }

    pub fn publish_loading(&self, fqn: &str, env: Arc<Environment>, info: Arc<ModuleInfo>) {
        self.modules
            .lock()
            .insert(fqn.to_string(), ModuleSlot::Loading(env, info));
    }

    pub fn publish_loaded(&self, fqn: &str, module: Arc<Module>) {
        self.modules
            .lock()
            .insert(fqn.to_string(), ModuleSlot::Loaded(module));
    }

    /// Drop a failed load so a later import retries.
    pub fn evict_module(&self, fqn: &str) {
        self.modules.lock().remove(fqn);
    }

    /// Resolution order: `<root>/<fqn-path>.slug`, then
    /// `<home>/lib/<fqn-path>.slug`. First hit wins.
    pub fn resolve_module_path(&self, fqn: &str) -> Option<PathBuf> {
        let rel: PathBuf = fqn.split('.').collect();
        let rel = rel.with_extension(crate::config::SOURCE_EXT);
        let under_root = self.config.root.join(&rel);
        if under_root.is_file() {
            return Some(under_root);
        }
        if let Some(home) = &self.config.home {
            let under_home = home.join("lib").join(&rel);
            if under_home.is_file() {
                return Some(under_home);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ids_are_unique_and_salted() {
        let runtime = Runtime::new(Config::default());
        let a = runtime.next_handle_id();
        let b = runtime.next_handle_id();
        assert_ne!(a, b);
        assert_ne!(a >> 16, b >> 16);
    }

    #[test]
    fn test_prelude_has_core_names() {
        let runtime = Runtime::new(Config::default());
        for name in ["println", "print", "sleep", "len", "type", "close", "closed"] {
            assert!(
                runtime.prelude.get(name).is_some(),
                "prelude missing {}",
                name
            );
        }
    }

    #[test]
    fn test_foreign_registry_lookup() {
        let runtime = Runtime::new(Config::default());
        assert!(runtime.lookup_foreign("slug.fmt.println").is_some());
        assert!(runtime.lookup_foreign("slug.nope.zzz").is_none());
    }

    #[test]
    fn test_module_resolution_order() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        let home = tmp.path().join("home");
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::create_dir_all(home.join("lib/a")).unwrap();
        std::fs::write(root.join("a/b.slug"), "1").unwrap();
        std::fs::write(home.join("lib/a/c.slug"), "2").unwrap();
        let runtime = Runtime::new(Config {
            root: root.clone(),
            home: Some(home.clone()),
            nursery_limit: 4,
        });
        assert_eq!(
            runtime.resolve_module_path("a.b").unwrap(),
            root.join("a/b.slug")
        );
        assert_eq!(
            runtime.resolve_module_path("a.c").unwrap(),
            home.join("lib/a/c.slug")
        );
        assert!(runtime.resolve_module_path("a.d").is_none());
    }
}
