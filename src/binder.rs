use crate::globals::{GlobalFn, GlobalScope};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::debug;

pub type VerifyHandler = Rc<dyn Fn(&str)>;
pub type SignalHandler = Rc<dyn Fn()>;

/// Handlers supplied by the host on every render. Any of them may be absent.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_verify: Option<VerifyHandler>,
    pub on_error: Option<SignalHandler>,
    pub on_expire: Option<SignalHandler>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_verify", &self.on_verify.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_expire", &self.on_expire.is_some())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_verify(mut self, handler: impl Fn(&str) + 'static) -> Self {
        self.on_verify = Some(Rc::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl Fn() + 'static) -> Self {
        self.on_error = Some(Rc::new(handler));
        self
    }

    pub fn on_expire(mut self, handler: impl Fn() + 'static) -> Self {
        self.on_expire = Some(Rc::new(handler));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallbackNames {
    pub verify: String,
    pub error: String,
    pub expire: String,
}

impl CallbackNames {
    pub fn all(&self) -> [&str; 3] {
        [
            self.verify.as_str(),
            self.error.as_str(),
            self.expire.as_str(),
        ]
    }
}

/// Keeps three global slots pointed at the latest [`Callbacks`]. Slots hold
/// forwarders that look the handler up at call time through a weak reference.
pub struct CallbackBinder {
    globals: GlobalScope,
    names: CallbackNames,
    current: Rc<RefCell<Callbacks>>,
    bound: bool,
}

impl std::fmt::Debug for CallbackBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackBinder")
            .field("names", &self.names)
            .field("bound", &self.bound)
            .finish()
    }
}

impl CallbackBinder {
    pub fn new(globals: GlobalScope, names: CallbackNames) -> Self {
        Self {
            globals,
            names,
            current: Rc::new(RefCell::new(Callbacks::default())),
            bound: false,
        }
    }

    pub fn names(&self) -> &CallbackNames {
        &self.names
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Stores `callbacks` as current and re-syncs the three slots: a present
    /// handler gets a forwarder, an absent one leaves its slot undefined.
    pub fn bind(&mut self, callbacks: Callbacks) {
        *self.current.borrow_mut() = callbacks;
        let current = self.current.borrow().clone();
        let weak = Rc::downgrade(&self.current);

        self.assign(
            &self.names.verify,
            current.on_verify.is_some(),
            verify_forwarder(weak.clone()),
        );
        self.assign(
            &self.names.error,
            current.on_error.is_some(),
            signal_forwarder(weak.clone(), |c| c.on_error.clone()),
        );
        self.assign(
            &self.names.expire,
            current.on_expire.is_some(),
            signal_forwarder(weak, |c| c.on_expire.clone()),
        );
        self.bound = true;
        debug!(verify = %self.names.verify, ?current, "callbacks bound");
    }

    pub fn unbind(&mut self) {
        for name in self.names.all() {
            self.globals.delete(name);
        }
        if self.bound {
            debug!(verify = %self.names.verify, "callbacks unbound");
        }
        self.bound = false;
    }

    pub fn rename(&mut self, names: CallbackNames) {
        if names == self.names {
            return;
        }
        let was_bound = self.bound;
        self.unbind();
        self.names = names;
        if was_bound {
            let current = self.current.borrow().clone();
            self.bind(current);
        }
    }

    fn assign(&self, name: &str, present: bool, forwarder: GlobalFn) {
        if present {
            self.globals.define(name, forwarder);
        } else {
            self.globals.delete(name);
        }
    }
}

fn verify_forwarder(current: Weak<RefCell<Callbacks>>) -> GlobalFn {
    Rc::new(move |args: &[String]| {
        let handler = current.upgrade().and_then(|set| {
            let set = set.borrow();
            set.on_verify.clone()
        });
        if let Some(handler) = handler {
            let token = args.first().map(String::as_str).unwrap_or_default();
            handler(token);
        }
    })
}

fn signal_forwarder(
    current: Weak<RefCell<Callbacks>>,
    pick: fn(&Callbacks) -> Option<SignalHandler>,
) -> GlobalFn {
    Rc::new(move |_args: &[String]| {
        let handler = current.upgrade().and_then(|set| {
            let set = set.borrow();
            pick(&set)
        });
        if let Some(handler) = handler {
            handler();
        }
    })
}
