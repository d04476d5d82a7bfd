use crate::dom::Document;
use crate::globals::GlobalScope;
use crate::watcher::ArtifactClaims;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::debug;

/// One browsing context: the document, its global scope, the bootstrap
/// script's user registry and the hidden-container claims. Everything a
/// widget treats as process-wide lives here, so two windows never observe
/// each other.
#[derive(Clone, Debug)]
pub struct Window {
    document: Document,
    globals: GlobalScope,
    bootstrap: BootstrapRegistry,
    claims: ArtifactClaims,
}

impl Window {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            globals: GlobalScope::new(),
            bootstrap: BootstrapRegistry::default(),
            claims: ArtifactClaims::default(),
        }
    }

    pub fn blank() -> Self {
        Self::new(Document::empty())
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn globals(&self) -> &GlobalScope {
        &self.globals
    }

    pub fn bootstrap(&self) -> &BootstrapRegistry {
        &self.bootstrap
    }

    pub fn artifact_claims(&self) -> &ArtifactClaims {
        &self.claims
    }
}

/// Instances currently relying on the bootstrap script. Keyed by instance id
/// rather than counted so a repeated unmount cannot release twice.
#[derive(Clone, Debug, Default)]
pub struct BootstrapRegistry {
    active: Rc<RefCell<BTreeSet<String>>>,
}

impl BootstrapRegistry {
    pub fn enter(&self, instance_id: &str) -> bool {
        let inserted = self.active.borrow_mut().insert(instance_id.to_string());
        debug!(%instance_id, active = self.active(), inserted, "bootstrap user registered");
        inserted
    }

    pub fn leave(&self, instance_id: &str) -> bool {
        let removed = self.active.borrow_mut().remove(instance_id);
        debug!(%instance_id, active = self.active(), removed, "bootstrap user released");
        removed
    }

    pub fn active(&self) -> usize {
        self.active.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.borrow().is_empty()
    }
}
