//! The foreign-function contract: registry entries collected through
//! `inventory`, and the narrow evaluator context native code is handed.

use crate::ast::{Param, Signature};
use crate::config::Config;
use crate::env::Environment;
use crate::error::EvalFault;
use crate::object::Object;
use crate::task::TaskState;
use crossbeam_channel::Receiver;
use std::sync::Arc;

pub mod core;
pub mod fmt;
pub mod fs;
pub mod json;
pub mod time;

/// The narrow contract a foreign function sees. Implemented by the
/// evaluator; foreign code never touches the interpreter internals
/// directly.
pub trait ForeignCtx {
    /// The caller's environment.
    fn env(&self) -> Arc<Environment>;

    /// Runtime configuration (root path, library home, nursery limit).
    fn config(&self) -> &Config;

    /// Allocate a fresh 64-bit handle ID for an external resource.
    fn next_handle_id(&self) -> u64;

    /// Load (or fetch the cached) module by fully-qualified name.
    fn load_module(&mut self, fqn: &str) -> Object;

    /// Build an internal error object; the evaluator promotes it to a
    /// runtime error carrying this function's name.
    fn new_error(&self, message: String) -> Object {
        Object::Error(EvalFault::Message(message))
    }

    fn nil(&self) -> Object {
        Object::Nil
    }

    fn native_bool(&self, value: bool) -> Object {
        Object::Bool(value)
    }

    /// The calling task's state; blocking foreign code selects against
    /// `state.done()` so cancellation can interrupt it.
    fn task_state(&self) -> Arc<TaskState>;

    fn done_signal(&self) -> Receiver<()> {
        self.task_state().done().clone()
    }
}

pub type ForeignEntry = fn(&mut dyn ForeignCtx, Vec<Object>) -> Object;

/// A compile-time registry entry, collected through `inventory` when the
/// Runtime is created. `params` is Slug parameter-list syntax and provides
/// the default signature used for prelude bindings; a `foreign name = fn(…)`
/// declaration in a module overrides it.
pub struct ForeignDecl {
    pub fqn: &'static str,
    pub params: &'static str,
    /// Bind under this short name in every root environment.
    pub prelude: Option<&'static str>,
    pub entry: ForeignEntry,
}

inventory::collect!(ForeignDecl);

/// A bound foreign function: registry entry plus resolved parameters.
#[derive(Debug, Clone)]
pub struct ForeignFn {
    pub fqn: String,
    pub name: String,
    pub params: Vec<Param>,
    pub sig: Signature,
    pub entry: ForeignEntry,
}

impl ForeignFn {
    pub fn from_decl(decl: &ForeignDecl) -> Result<Self, crate::error::ParseError> {
        let (params, sig) = crate::parser::parse_param_list(decl.params)?;
        let name = decl
            .fqn
            .rsplit('.')
            .next()
            .unwrap_or(decl.fqn)
            .to_string();
        Ok(ForeignFn {
            fqn: decl.fqn.to_string(),
            name,
            params,
            sig,
            entry: decl.entry,
        })
    }

    /// Rebind with declaration-site parameters and tags.
    pub fn with_params(&self, params: Vec<Param>, sig: Signature) -> Self {
        ForeignFn {
            fqn: self.fqn.clone(),
            name: self.name.clone(),
            params,
            sig,
            entry: self.entry,
        }
    }
}

/// Register a foreign function with the global registry.
///
/// ```ignore
/// foreign_fn!("slug.fmt.println", "...args", prelude = "println", entry = println);
/// ```
#[macro_export]
macro_rules! foreign_fn {
    ($fqn:literal, $params:literal, prelude = $prelude:literal, entry = $entry:path) => {
        inventory::submit! {
            $crate::foreign::ForeignDecl {
                fqn: $fqn,
                params: $params,
                prelude: Some($prelude),
                entry: $entry,
            }
        }
    };
    ($fqn:literal, $params:literal, entry = $entry:path) => {
        inventory::submit! {
            $crate::foreign::ForeignDecl {
                fqn: $fqn,
                params: $params,
                prelude: None,
                entry: $entry,
            }
        }
    };
}
