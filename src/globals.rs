use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::trace;

pub type GlobalFn = Rc<dyn Fn(&[String])>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GlobalError {
    #[error("{0} is not a function")]
    NotAFunction(String),
}

#[derive(Clone, Default)]
pub struct GlobalScope {
    slots: Rc<RefCell<BTreeMap<String, GlobalFn>>>,
}

impl std::fmt::Debug for GlobalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalScope")
            .field("names", &self.names())
            .finish()
    }
}

impl GlobalScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, name: &str, function: GlobalFn) {
        trace!(%name, "global defined");
        self.slots.borrow_mut().insert(name.to_string(), function);
    }

    pub fn delete(&self, name: &str) -> bool {
        let existed = self.slots.borrow_mut().remove(name).is_some();
        if existed {
            trace!(%name, "global deleted");
        }
        existed
    }

    pub fn get(&self, name: &str) -> Option<GlobalFn> {
        self.slots.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.borrow().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Invokes the slot by name, the way the third party calls
    /// `window[name](...args)`. The slot is cloned out first so the callee can
    /// redefine or delete globals while running.
    pub fn call(&self, name: &str, args: &[String]) -> Result<(), GlobalError> {
        let function = self
            .get(name)
            .ok_or_else(|| GlobalError::NotAFunction(name.to_string()))?;
        function(args);
        Ok(())
    }
}
