// ABOUTME: Pattern matching with destructuring, pinned identifiers, spreads

use crate::ast::{MapKey, Pattern};
use crate::env::Environment;
use crate::error::EvalFault;
use crate::interp::Task;
use crate::object::{HashKey, MapObj, Object};
use std::sync::Arc;

/// Names a pattern would bind, used to pre-declare module exports.
pub fn pattern_names(pattern: &Pattern, out: &mut Vec<String>) {
    match pattern {
        Pattern::Ident { name, .. } => out.push(name.clone()),
        Pattern::Binding { name, inner, .. } => {
            out.push(name.clone());
            pattern_names(inner, out);
        }
        Pattern::Spread { name: Some(n), .. } => out.push(n.clone()),
        Pattern::List { items, .. } => {
            for item in items {
                pattern_names(item, out);
            }
        }
        Pattern::Map { entries, rest, .. } => {
            for (_, p) in entries {
                pattern_names(p, out);
            }
            if let Some(Some(n)) = rest {
                out.push(n.clone());
            }
        }
        Pattern::Struct { fields, .. } => {
            for (_, p) in fields {
                pattern_names(p, out);
            }
        }
        _ => {}
    }
}

pub fn map_key_object(key: &MapKey) -> Object {
    match key {
        MapKey::Str(s) => Object::Str(s.clone()),
        MapKey::Num(n) => Object::Number(n.clone()),
        MapKey::Symbol(s) => Object::Symbol(crate::object::Symbol::intern(s)),
        MapKey::Bool(b) => Object::Bool(*b),
    }
}

impl Task {
    /// Match `value` against `pattern`. Bindings land in `scratch`, a fresh
    /// enclosed environment, so partial bindings vanish on failure; pinned
    /// identifiers resolve in `lexical`, outside the pattern scope.
    ///
    /// `Err` carries an abrupt object from evaluating a literal or a pinned
    /// lookup fault.
    pub fn match_pattern(
        &mut self,
        pattern: &Pattern,
        value: &Object,
        scratch: &Arc<Environment>,
        lexical: &Arc<Environment>,
    ) -> Result<bool, Object> {
        match pattern {
            Pattern::Wildcard { .. } => Ok(true),
            Pattern::Literal { value: lit, .. } => {
                let expected = self.eval_expr(lit, lexical);
                if expected.is_abrupt() {
                    return Err(expected);
                }
                Ok(expected.object_eq(value))
            }
            Pattern::Ident { name, .. } => {
                scratch.define(name, value.clone(), false);
                Ok(true)
            }
            Pattern::Pinned { name, .. } => match lexical.get(name) {
                Some(pinned) => {
                    if pinned.is_abrupt() {
                        return Err(pinned);
                    }
                    Ok(pinned.object_eq(value))
                }
                None => Err(Object::Error(EvalFault::Undefined(name.clone()))),
            },
            Pattern::Binding { name, inner, .. } => {
                if !self.match_pattern(inner, value, scratch, lexical)? {
                    return Ok(false);
                }
                scratch.define(name, value.clone(), false);
                Ok(true)
            }
            Pattern::Spread { name, .. } => {
                // a bare spread outside a list/map context matches anything
                if let Some(n) = name {
                    scratch.define(n, value.clone(), false);
                }
                Ok(true)
            }
            Pattern::List { items, .. } => self.match_list(items, value, scratch, lexical),
            Pattern::Map {
                entries,
                rest,
                select_all,
                ..
            } => self.match_map(entries, rest, *select_all, value, scratch, lexical),
            Pattern::Struct { name, fields, .. } => {
                self.match_struct(name, fields, value, scratch, lexical)
            }
        }
    }

    fn match_list(
        &mut self,
        items: &[Pattern],
        value: &Object,
        scratch: &Arc<Environment>,
        lexical: &Arc<Environment>,
    ) -> Result<bool, Object> {
        let Object::List(values) = value else {
            return Ok(false);
        };
        let has_spread = matches!(items.last(), Some(Pattern::Spread { .. }));
        let fixed = if has_spread {
            items.len() - 1
        } else {
            items.len()
        };
        if has_spread {
            if values.len() < fixed {
                return Ok(false);
            }
        } else if values.len() != fixed {
            return Ok(false);
        }
        for (pattern, item) in items[..fixed].iter().zip(values.iter()) {
            if !self.match_pattern(pattern, item, scratch, lexical)? {
                return Ok(false);
            }
        }
        if has_spread {
            if let Some(Pattern::Spread { name: Some(n), .. }) = items.last() {
                // the trailing spread binds the remaining subsequence
                scratch.define(n, Object::List(values[fixed..].to_vec()), false);
            }
        }
        Ok(true)
    }

    fn match_map(
        &mut self,
        entries: &[(MapKey, Pattern)],
        rest: &Option<Option<String>>,
        select_all: bool,
        value: &Object,
        scratch: &Arc<Environment>,
        lexical: &Arc<Environment>,
    ) -> Result<bool, Object> {
        let Object::Map(map) = value else {
            return Ok(false);
        };
        let mut used: Vec<HashKey> = Vec::new();
        for (key, pattern) in entries {
            let key_obj = map_key_object(key);
            let Some(entry_value) = map.get(&key_obj) else {
                return Ok(false);
            };
            if !self.match_pattern(pattern, &entry_value, scratch, lexical)? {
                return Ok(false);
            }
            if let Some(hk) = key_obj.hash_key() {
                used.push(hk);
            }
        }
        if select_all {
            // bind every string-keyed entry into the surrounding scope
            for (key, entry_value) in map.iter() {
                if let Object::Str(name) = key {
                    scratch.define(name, entry_value.clone(), false);
                }
            }
            return Ok(true);
        }
        match rest {
            Some(bind) => {
                if let Some(name) = bind {
                    let mut remaining = MapObj::new();
                    for (key, entry_value) in map.iter() {
                        let keep = key
                            .hash_key()
                            .map(|hk| !used.contains(&hk))
                            .unwrap_or(true);
                        if keep {
                            let _ = remaining.insert(key.clone(), entry_value.clone());
                        }
                    }
                    scratch.define(name, Object::Map(remaining), false);
                }
                Ok(true)
            }
            None => {
                // exact-key mode: the used keys must equal the map's keys
                Ok(used.len() == map.len())
            }
        }
    }

    fn match_struct(
        &mut self,
        name: &str,
        fields: &[(String, Pattern)],
        value: &Object,
        scratch: &Arc<Environment>,
        lexical: &Arc<Environment>,
    ) -> Result<bool, Object> {
        let Object::Struct(instance) = value else {
            return Ok(false);
        };
        // the pattern name must resolve to the value's exact schema
        let schema = match lexical.get(name) {
            Some(Object::Schema(s)) => s,
            Some(obj) if obj.is_abrupt() => return Err(obj),
            _ => {
                return Err(Object::Error(EvalFault::type_mismatch(
                    "match",
                    "struct schema",
                    name,
                )))
            }
        };
        if !Arc::ptr_eq(&schema, &instance.schema) {
            return Ok(false);
        }
        for (field, pattern) in fields {
            let field_value = {
                let map = instance.fields.read();
                map.get(field).cloned()
            };
            let Some(field_value) = field_value else {
                return Ok(false);
            };
            if !self.match_pattern(pattern, &field_value, scratch, lexical)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Promote bindings from a successful match into the outer scope.
    pub fn promote_bindings(
        &mut self,
        scratch: &Arc<Environment>,
        target: &Arc<Environment>,
        mutable: bool,
        is_import: bool,
        is_export: bool,
    ) {
        for name in scratch.local_names() {
            if let Some(binding) = scratch.take_local(&name) {
                target.define_flagged(&name, binding.value, mutable, is_import, is_export);
            }
        }
    }
}
