//! Engine Modules
//!
//! A module is a unit of periodic work ticked by the master thread.

use std::any::type_name;
use std::borrow::Cow;
use std::fmt;

use crate::error::EngineError;
use crate::thread::WorkerPool;

/// Periodic work driven by the tick scheduler
pub trait EngineModule: Send {
    /// Name used in logs
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    /// Minimum milliseconds between two ticks (0 = every pass)
    fn tick_interval_ms(&self) -> u64;

    /// Called once, right after the module is added to an engine
    fn on_registered(&mut self) {}

    /// Advance the module by `delta_ms`, the time since its previous tick.
    ///
    /// Runs on the master thread. An error stops the pipeline.
    fn on_tick(&mut self, pool: &WorkerPool, delta_ms: u64) -> anyhow::Result<()>;
}

/// Identifies one registered module
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleTag(Cow<'static, str>);

impl ModuleTag {
    /// Tag derived from the module type
    pub fn of<M: ?Sized>() -> Self {
        Self(Cow::Borrowed(type_name::<M>()))
    }

    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for ModuleTag {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl From<String> for ModuleTag {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

/// Registered module in tick order
pub(crate) type RegisteredModule = (ModuleTag, Box<dyn EngineModule>);

/// Modules in registration order.
///
/// Tags outlive the boxed modules: they stay registered while a run has the
/// modules on loan, and a tag is reserved before its module is built.
#[derive(Default)]
pub(crate) struct ModuleRegistry {
    tags: Vec<ModuleTag>,
    modules: Vec<RegisteredModule>,
}

impl ModuleRegistry {
    pub fn contains(&self, tag: &ModuleTag) -> bool {
        self.tags.contains(tag)
    }

    /// Claim `tag` ahead of building its module
    pub fn reserve(&mut self, tag: ModuleTag) -> Result<(), EngineError> {
        if self.contains(&tag) {
            return Err(EngineError::DuplicateModule(tag.to_string()));
        }
        self.tags.push(tag);
        Ok(())
    }

    /// Store the module for a reserved tag
    pub fn fill(&mut self, tag: ModuleTag, module: Box<dyn EngineModule>) {
        debug_assert!(self.contains(&tag));
        self.modules.push((tag, module));
    }

    /// Drop a reservation whose module was never built
    pub fn release(&mut self, tag: &ModuleTag) {
        if self.modules.iter().all(|(existing, _)| existing != tag) {
            self.tags.retain(|existing| existing != tag);
        }
    }

    /// Registered tags, including those whose module is on loan
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Lend the built modules to a scheduler for one run
    pub fn take_all(&mut self) -> Vec<RegisteredModule> {
        std::mem::take(&mut self.modules)
    }

    pub fn restore(&mut self, modules: Vec<RegisteredModule>) {
        debug_assert!(self.modules.is_empty());
        self.modules = modules;
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.tags).finish()
    }
}
