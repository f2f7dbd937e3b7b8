// ABOUTME: Lexical environments: bindings, scopes, deferred statements, frames

use crate::ast::{Block, DeferKind};
use crate::error::EvalFault;
use crate::object::{FunctionGroup, Object, RuntimeErr, TraceFrame};
use crate::token::Position;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Source identity of the module an environment belongs to, used for stack
/// traces and snippet rendering.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub fqn: String,
    pub path: String,
    pub source: String,
}

/// Call-site frame attached to function-entry environments.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub name: String,
    pub pos: Position,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub value: Object,
    pub mutable: bool,
    pub is_import: bool,
    pub is_export: bool,
    /// Set when a module-level binding failed to initialize.
    pub error: Option<Arc<RuntimeErr>>,
}

#[derive(Debug, Clone)]
pub struct Deferred {
    pub kind: DeferKind,
    pub body: Arc<Block>,
}

#[derive(Debug)]
pub struct Environment {
    bindings: RwLock<HashMap<String, Binding>>,
    outer: Option<Arc<Environment>>,
    module: Option<Arc<ModuleInfo>>,
    pub frame: Option<FrameInfo>,
    defers: Mutex<Vec<Deferred>>,
}

impl Environment {
    /// A fresh module (or root) environment.
    pub fn new_module(module: Option<Arc<ModuleInfo>>) -> Arc<Self> {
        Arc::new(Environment {
            bindings: RwLock::new(HashMap::new()),
            outer: None,
            module,
            frame: None,
            defers: Mutex::new(Vec::new()),
        })
    }

    /// A child scope.
    pub fn enclosed(outer: Arc<Environment>) -> Arc<Self> {
        Arc::new(Environment {
            bindings: RwLock::new(HashMap::new()),
            outer: Some(outer),
            module: None,
            frame: None,
            defers: Mutex::new(Vec::new()),
        })
    }

    /// A child module environment: shares the outer chain (for the prelude)
    /// but carries its own module identity.
    pub fn enclosed_module(outer: Arc<Environment>, module: Arc<ModuleInfo>) -> Arc<Self> {
        Arc::new(Environment {
            bindings: RwLock::new(HashMap::new()),
            outer: Some(outer),
            module: Some(module),
            frame: None,
            defers: Mutex::new(Vec::new()),
        })
    }

    /// A function-call scope carrying its call-site frame.
    pub fn for_call(outer: Arc<Environment>, frame: FrameInfo) -> Arc<Self> {
        Arc::new(Environment {
            bindings: RwLock::new(HashMap::new()),
            outer: Some(outer),
            module: None,
            frame: Some(frame),
            defers: Mutex::new(Vec::new()),
        })
    }

    /// A shallow copy for `spawn`: the spawned task sees the same values but
    /// rebinding in the parent (e.g. tail-call argument reuse) cannot race it.
    pub fn shallow_copy(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Environment {
            bindings: RwLock::new(self.bindings.read().clone()),
            outer: self.outer.clone(),
            module: self.module.clone(),
            frame: self.frame.clone(),
            defers: Mutex::new(Vec::new()),
        })
    }

    pub fn outer(&self) -> Option<&Arc<Environment>> {
        self.outer.as_ref()
    }

    /// The nearest module identity up the scope chain.
    pub fn module_info(&self) -> Option<Arc<ModuleInfo>> {
        if let Some(info) = &self.module {
            return Some(info.clone());
        }
        self.outer.as_ref().and_then(|o| o.module_info())
    }

    /// Define a binding in this scope. Defining a function under a name that
    /// already holds a function merges both into a function group.
    pub fn define(&self, name: &str, value: Object, mutable: bool) {
        self.define_flagged(name, value, mutable, false, false)
    }

    pub fn define_flagged(
        &self,
        name: &str,
        value: Object,
        mutable: bool,
        is_import: bool,
        is_export: bool,
    ) {
        let mut bindings = self.bindings.write();
        if value.is_callable() {
            if let Object::Function(f) = &value {
                *f.name.write() = Some(name.to_string());
            }
            if let Some(existing) = bindings.get(name) {
                match &existing.value {
                    // merging into an imported group must not mutate the
                    // source module: compose through a local delegate
                    Object::Group(group) if existing.is_import => {
                        let local = FunctionGroup::new(name);
                        local.add_delegate(group.clone());
                        local.add(value);
                        let merged = Binding {
                            value: Object::Group(Arc::new(local)),
                            mutable: existing.mutable,
                            is_import: false,
                            is_export: existing.is_export || is_export,
                            error: None,
                        };
                        bindings.insert(name.to_string(), merged);
                        return;
                    }
                    Object::Group(group) => {
                        group.add(value);
                        return;
                    }
                    Object::Function(_) | Object::Foreign(_) => {
                        let group = FunctionGroup::new(name);
                        group.add(existing.value.clone());
                        group.add(value);
                        let merged = Binding {
                            value: Object::Group(Arc::new(group)),
                            mutable: existing.mutable,
                            is_import: existing.is_import,
                            is_export: existing.is_export || is_export,
                            error: None,
                        };
                        bindings.insert(name.to_string(), merged);
                        return;
                    }
                    _ => {}
                }
            }
        }
        bindings.insert(
            name.to_string(),
            Binding {
                value,
                mutable,
                is_import,
                is_export,
                error: None,
            },
        );
    }

    /// Pre-declare an export before module evaluation (two-phase load).
    pub fn declare_uninitialized(&self, name: &str, is_export: bool) {
        self.bindings.write().insert(
            name.to_string(),
            Binding {
                value: Object::Uninitialized,
                mutable: false,
                is_import: false,
                is_export,
                error: None,
            },
        );
    }

    pub fn is_uninitialized(&self, name: &str) -> bool {
        matches!(
            self.bindings.read().get(name).map(|b| &b.value),
            Some(Object::Uninitialized)
        )
    }

    pub fn set_binding_error(&self, name: &str, error: Arc<RuntimeErr>) {
        if let Some(binding) = self.bindings.write().get_mut(name) {
            binding.error = Some(error);
        }
    }

    /// Look a name up through the scope chain. `binding-ref` indirections
    /// are dereferenced transparently; an uninitialized target surfaces as
    /// an in-band fault object.
    pub fn get(&self, name: &str) -> Option<Object> {
        // clone out before dereferencing so no lock is held while a
        // binding-ref reads another environment
        let found = self.bindings.read().get(name).cloned();
        if let Some(binding) = found {
            if let Some(err) = &binding.error {
                return Some(Object::Failure(err.clone()));
            }
            return Some(deref(name, binding.value));
        }
        self.outer.as_ref().and_then(|outer| outer.get(name))
    }

    /// Look up an exported name only; used for module member access.
    pub fn get_export(&self, name: &str) -> Option<Object> {
        let binding = self.bindings.read().get(name).cloned()?;
        if !binding.is_export {
            return None;
        }
        if let Some(err) = &binding.error {
            return Some(Object::Failure(err.clone()));
        }
        Some(deref(name, binding.value))
    }

    pub fn exported_names(&self) -> Vec<String> {
        self.bindings
            .read()
            .iter()
            .filter(|(_, b)| b.is_export)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Assign to an existing binding. `val` bindings reject assignment.
    pub fn assign(&self, name: &str, value: Object) -> Result<(), EvalFault> {
        {
            let mut bindings = self.bindings.write();
            if let Some(binding) = bindings.get_mut(name) {
                if !binding.mutable {
                    return Err(EvalFault::ImmutableAssign(name.to_string()));
                }
                binding.value = value;
                return Ok(());
            }
        }
        match &self.outer {
            Some(outer) => outer.assign(name, value),
            None => Err(EvalFault::Undefined(name.to_string())),
        }
    }

    pub fn has_local(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
    }

    pub fn local_names(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    pub fn take_local(&self, name: &str) -> Option<Binding> {
        self.bindings.write().remove(name)
    }

    // ------------------------------------------------------------------
    // Deferred statements
    // ------------------------------------------------------------------

    pub fn push_defer(&self, kind: DeferKind, body: Arc<Block>) {
        self.defers.lock().push(Deferred { kind, body });
    }

    /// Drain registered defers, most recent first.
    pub fn take_defers(&self) -> Vec<Deferred> {
        let mut defers = std::mem::take(&mut *self.defers.lock());
        defers.reverse();
        defers
    }

    pub fn has_defers(&self) -> bool {
        !self.defers.lock().is_empty()
    }

    // ------------------------------------------------------------------
    // Stack capture
    // ------------------------------------------------------------------

    /// Walk the environment chain upward collecting call-site frames.
    pub fn capture_stack(self: &Arc<Self>) -> Vec<TraceFrame> {
        let mut frames = Vec::new();
        let mut env: Option<Arc<Environment>> = Some(self.clone());
        while let Some(current) = env {
            if let Some(frame) = &current.frame {
                let info = current.module_info();
                let source_line = info.as_ref().and_then(|m| {
                    m.source
                        .lines()
                        .nth(frame.pos.line.saturating_sub(1) as usize)
                        .map(|l| l.to_string())
                });
                frames.push(TraceFrame {
                    name: frame.name.clone(),
                    file: info
                        .as_ref()
                        .map(|m| m.path.clone())
                        .unwrap_or_else(|| "<anonymous>".to_string()),
                    pos: frame.pos,
                    source_line,
                });
            }
            env = current.outer.clone();
        }
        frames
    }
}

fn deref(name: &str, value: Object) -> Object {
    match value {
        Object::BindingRef { env, name: target } => match env.get(&target) {
            Some(Object::Uninitialized) | None => {
                Object::Error(EvalFault::UsedBeforeInit(target))
            }
            Some(inner) => inner,
        },
        Object::Uninitialized => Object::Error(EvalFault::UsedBeforeInit(name.to_string())),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::number::Number;

    fn num(s: &str) -> Object {
        Object::Number(Number::parse(s))
    }

    #[test]
    fn test_define_and_get() {
        let env = Environment::new_module(None);
        env.define("x", num("42"), false);
        assert!(env.get("x").unwrap().object_eq(&num("42")));
        assert!(env.get("missing").is_none());
    }

    #[test]
    fn test_shadowing_and_parent_lookup() {
        let parent = Environment::new_module(None);
        parent.define("x", num("1"), false);
        parent.define("y", num("2"), false);
        let child = Environment::enclosed(parent);
        child.define("x", num("10"), false);
        assert!(child.get("x").unwrap().object_eq(&num("10")));
        assert!(child.get("y").unwrap().object_eq(&num("2")));
    }

    #[test]
    fn test_assign_respects_mutability() {
        let env = Environment::new_module(None);
        env.define("a", num("1"), false);
        env.define("b", num("1"), true);
        assert!(matches!(
            env.assign("a", num("2")),
            Err(EvalFault::ImmutableAssign(_))
        ));
        env.assign("b", num("2")).unwrap();
        assert!(env.get("b").unwrap().object_eq(&num("2")));
        assert!(matches!(
            env.assign("zz", num("1")),
            Err(EvalFault::Undefined(_))
        ));
    }

    #[test]
    fn test_assign_walks_to_outer_scope() {
        let parent = Environment::new_module(None);
        parent.define("counter", num("0"), true);
        let child = Environment::enclosed(parent.clone());
        child.assign("counter", num("1")).unwrap();
        assert!(parent.get("counter").unwrap().object_eq(&num("1")));
    }

    #[test]
    fn test_uninitialized_binding_faults() {
        let env = Environment::new_module(None);
        env.declare_uninitialized("pending", true);
        match env.get("pending") {
            Some(Object::Error(EvalFault::UsedBeforeInit(name))) => {
                assert_eq!(name, "pending")
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn test_binding_ref_deref() {
        let target = Environment::new_module(None);
        target.define("inner", num("7"), false);
        let env = Environment::new_module(None);
        env.define(
            "outer",
            Object::BindingRef {
                env: target.clone(),
                name: "inner".to_string(),
            },
            false,
        );
        assert!(env.get("outer").unwrap().object_eq(&num("7")));
    }

    #[test]
    fn test_export_visibility() {
        let env = Environment::new_module(None);
        env.define_flagged("pub", num("1"), false, false, true);
        env.define("hidden", num("2"), false);
        assert!(env.get_export("pub").is_some());
        assert!(env.get_export("hidden").is_none());
    }

    #[test]
    fn test_defers_drain_lifo() {
        use crate::token::Position;
        let env = Environment::new_module(None);
        let block = Arc::new(Block {
            stmts: vec![],
            nursery: None,
            pos: Position::default(),
        });
        env.push_defer(DeferKind::Always, block.clone());
        env.push_defer(DeferKind::OnSuccess, block);
        let drained = env.take_defers();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0].kind, DeferKind::OnSuccess));
        assert!(matches!(drained[1].kind, DeferKind::Always));
        assert!(!env.has_defers());
    }
}
