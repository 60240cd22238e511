//! Macro table: definitions visible to the expansion engine.
//!
//! The table stores `Arc`-wrapped definitions so lookups hand out cheap
//! clones and the single lock is never held across an await. Redefinition
//! is governed by an explicit policy; it always installs a fresh entry —
//! callers already holding the old `Arc` keep the definition they saw.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::ast::MacroDefinition;
use crate::diag::Diagnostics;
use crate::errors::{PrepError, PrepResult};

/// What happens when a macro name is defined twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redefinition {
    /// Redefinition is an error.
    Error,
    /// Redefinition is accepted with a counted warning.
    #[default]
    Warn,
    /// Redefinition silently shadows the previous entry.
    Shadow,
}

/// Macro definitions for one run (or one file, in per-file scope).
#[derive(Debug, Default)]
pub struct MacroTable {
    defs: HashMap<String, Arc<MacroDefinition>>,
    policy: Redefinition,
}

/// The table as shared between parallel file tasks.
pub type SharedTable = Arc<Mutex<MacroTable>>;

impl MacroTable {
    pub fn new(policy: Redefinition) -> Self {
        Self {
            defs: HashMap::new(),
            policy,
        }
    }

    /// Wrap a table for sharing across tasks.
    pub fn shared(policy: Redefinition) -> SharedTable {
        Arc::new(Mutex::new(Self::new(policy)))
    }

    /// Install a definition, applying the redefinition policy.
    pub fn define(&mut self, def: MacroDefinition, diag: &Diagnostics) -> PrepResult<()> {
        if self.defs.contains_key(&def.name) {
            match self.policy {
                Redefinition::Error => {
                    return Err(PrepError::DirectiveSyntax {
                        pos: def.defined_at.clone(),
                        msg: format!("macro '{}' is already defined", def.name),
                    });
                }
                Redefinition::Warn => {
                    diag.reg_warning();
                    warn!(macro_name = %def.name, at = %def.defined_at, "macro redefined");
                }
                Redefinition::Shadow => {}
            }
        }
        self.defs.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    /// Look up a macro by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<MacroDefinition>> {
        self.defs.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
