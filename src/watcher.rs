use crate::dom::{self, Document, MutationRecord, ObserverHandle};
use kuchiki::NodeRef;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info};

/// Structural test for the injected node. Tied to the third party's current
/// markup; swap the implementation when that changes.
pub trait ArtifactSignature {
    fn matches(&self, node: &NodeRef) -> bool;
}

/// `visibility: hidden; top: -10000px; position: absolute`, all three exact.
#[derive(Debug, Clone, Copy, Default)]
pub struct HiddenChallengeSignature;

impl HiddenChallengeSignature {
    pub const DECLARATIONS: [(&'static str, &'static str); 3] = [
        ("visibility", "hidden"),
        ("top", "-10000px"),
        ("position", "absolute"),
    ];
}

impl ArtifactSignature for HiddenChallengeSignature {
    fn matches(&self, node: &NodeRef) -> bool {
        node.as_element().is_some()
            && Self::DECLARATIONS.iter().all(|(property, value)| {
                dom::inline_style(node, property).as_deref() == Some(*value)
            })
    }
}

/// Nodes adopted by any watcher of one window. A node is adopted at most
/// once, so concurrently mounted instances each take their own container.
#[derive(Debug, Clone, Default)]
pub struct ArtifactClaims {
    claimed: Rc<RefCell<Vec<NodeRef>>>,
}

impl ArtifactClaims {
    pub fn claim(&self, node: &NodeRef) -> bool {
        let mut claimed = self.claimed.borrow_mut();
        if claimed.contains(node) {
            return false;
        }
        claimed.push(node.clone());
        true
    }

    pub fn release(&self, node: &NodeRef) {
        self.claimed.borrow_mut().retain(|claimed| claimed != node);
    }

    pub fn len(&self) -> usize {
        self.claimed.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.borrow().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Idle,
    Captured,
    TornDown,
}

enum Capture {
    Idle,
    Captured(NodeRef),
    TornDown,
}

/// Adopts the first unclaimed direct `<body>` child matching the signature.
pub struct MutationWatcher {
    document: Document,
    claims: ArtifactClaims,
    observer: Option<ObserverHandle>,
    capture: Rc<RefCell<Capture>>,
}

impl std::fmt::Debug for MutationWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationWatcher")
            .field("state", &self.state())
            .finish()
    }
}

impl MutationWatcher {
    pub fn attach(
        document: &Document,
        signature: Rc<dyn ArtifactSignature>,
        claims: ArtifactClaims,
    ) -> Self {
        let capture = Rc::new(RefCell::new(Capture::Idle));
        let body = document.body().clone();
        let sink = Rc::clone(&capture);
        let shared = claims.clone();
        let observer = document.observe_child_list(document.body(), move |records| {
            observe_batch(&body, signature.as_ref(), &shared, &sink, records);
        });
        Self {
            document: document.clone(),
            claims,
            observer: Some(observer),
            capture,
        }
    }

    pub fn state(&self) -> WatcherState {
        match &*self.capture.borrow() {
            Capture::Idle => WatcherState::Idle,
            Capture::Captured(_) => WatcherState::Captured,
            Capture::TornDown => WatcherState::TornDown,
        }
    }

    pub fn captured(&self) -> Option<NodeRef> {
        match &*self.capture.borrow() {
            Capture::Captured(node) => Some(node.clone()),
            _ => None,
        }
    }

    /// Disconnects and removes the adopted node if it is still attached.
    /// Returns whether a node was removed. Later calls do nothing.
    pub fn teardown(&mut self) -> bool {
        if let Some(observer) = self.observer.take() {
            observer.disconnect();
        }
        let previous = std::mem::replace(&mut *self.capture.borrow_mut(), Capture::TornDown);
        match previous {
            Capture::Captured(node) => {
                self.claims.release(&node);
                let removed = self.document.remove(&node);
                info!(removed, "hidden challenge container released");
                removed
            }
            Capture::Idle => {
                debug!("watcher torn down without a capture");
                false
            }
            Capture::TornDown => false,
        }
    }
}

fn observe_batch(
    body: &NodeRef,
    signature: &dyn ArtifactSignature,
    claims: &ArtifactClaims,
    capture: &RefCell<Capture>,
    records: &[MutationRecord],
) {
    for record in records {
        if record.target != *body || record.added_nodes.len() != 1 {
            continue;
        }
        let node = &record.added_nodes[0];
        if !signature.matches(node) {
            continue;
        }
        let mut state = capture.borrow_mut();
        if matches!(*state, Capture::Idle) && claims.claim(node) {
            debug!("captured hidden challenge container");
            *state = Capture::Captured(node.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{set_detached_attr, style_text};

    fn styled(document: &Document, declarations: &[(&str, &str)]) -> NodeRef {
        let node = document.create_element("div").unwrap();
        set_detached_attr(&node, "style", &style_text(declarations));
        node
    }

    fn watcher(document: &Document) -> MutationWatcher {
        MutationWatcher::attach(
            document,
            Rc::new(HiddenChallengeSignature),
            ArtifactClaims::default(),
        )
    }

    #[test]
    fn captures_matching_insertion_and_removes_it() {
        let document = Document::empty();
        let mut watcher = watcher(&document);
        let artifact = styled(&document, &HiddenChallengeSignature::DECLARATIONS);
        document.append_child(document.body(), &artifact);
        assert_eq!(watcher.state(), WatcherState::Idle);

        document.deliver_mutations();
        assert_eq!(watcher.state(), WatcherState::Captured);
        assert!(watcher.captured().unwrap() == artifact);

        assert!(watcher.teardown());
        assert!(artifact.parent().is_none());
        assert_eq!(watcher.state(), WatcherState::TornDown);
        assert!(!watcher.teardown());
    }

    #[test]
    fn one_mismatched_property_is_ignored() {
        let document = Document::empty();
        let mut watcher = watcher(&document);
        let lookalike = styled(
            &document,
            &[
                ("visibility", "hidden"),
                ("top", "-10000px"),
                ("position", "static"),
            ],
        );
        document.append_child(document.body(), &lookalike);
        document.deliver_mutations();
        assert_eq!(watcher.state(), WatcherState::Idle);

        assert!(!watcher.teardown());
        assert!(lookalike.parent().is_some());
    }

    #[test]
    fn keeps_first_capture() {
        let document = Document::empty();
        let mut watcher = watcher(&document);
        let first = styled(&document, &HiddenChallengeSignature::DECLARATIONS);
        let second = styled(&document, &HiddenChallengeSignature::DECLARATIONS);
        document.append_child(document.body(), &first);
        document.append_child(document.body(), &second);
        document.deliver_mutations();

        assert!(watcher.captured().unwrap() == first);
        watcher.teardown();
        assert!(first.parent().is_none());
        assert!(second.parent().is_some());
    }

    #[test]
    fn ignores_nodes_nested_below_body_children() {
        let document = Document::empty();
        let watcher = watcher(&document);
        let wrapper = document.create_element("div").unwrap();
        document.append_child(document.body(), &wrapper);
        let artifact = styled(&document, &HiddenChallengeSignature::DECLARATIONS);
        document.append_child(&wrapper, &artifact);
        document.deliver_mutations();
        assert_eq!(watcher.state(), WatcherState::Idle);
    }

    #[test]
    fn teardown_tolerates_already_detached_capture() {
        let document = Document::empty();
        let mut watcher = watcher(&document);
        let artifact = styled(&document, &HiddenChallengeSignature::DECLARATIONS);
        document.append_child(document.body(), &artifact);
        document.deliver_mutations();
        document.remove(&artifact);

        assert!(!watcher.teardown());
        assert_eq!(document.observer_count(), 0);
    }

    #[test]
    fn insertions_before_attach_are_not_seen() {
        let document = Document::empty();
        let artifact = styled(&document, &HiddenChallengeSignature::DECLARATIONS);
        document.append_child(document.body(), &artifact);
        let watcher = watcher(&document);
        document.deliver_mutations();
        assert_eq!(watcher.state(), WatcherState::Idle);
    }

    #[test]
    fn shared_claims_split_containers_between_watchers() {
        let document = Document::empty();
        let claims = ArtifactClaims::default();
        let signature: Rc<dyn ArtifactSignature> = Rc::new(HiddenChallengeSignature);
        let mut a = MutationWatcher::attach(&document, signature.clone(), claims.clone());
        let mut b = MutationWatcher::attach(&document, signature, claims.clone());
        let first = styled(&document, &HiddenChallengeSignature::DECLARATIONS);
        let second = styled(&document, &HiddenChallengeSignature::DECLARATIONS);
        document.append_child(document.body(), &first);
        document.append_child(document.body(), &second);
        document.deliver_mutations();

        assert!(a.captured().unwrap() == first);
        assert!(b.captured().unwrap() == second);
        assert_eq!(claims.len(), 2);

        a.teardown();
        b.teardown();
        assert!(claims.is_empty());
        assert!(first.parent().is_none());
        assert!(second.parent().is_none());
    }

    struct MarkerSignature;

    impl ArtifactSignature for MarkerSignature {
        fn matches(&self, node: &NodeRef) -> bool {
            dom::attr(node, "data-challenge").is_some()
        }
    }

    #[test]
    fn signature_is_swappable() {
        let document = Document::empty();
        let watcher = MutationWatcher::attach(
            &document,
            Rc::new(MarkerSignature),
            ArtifactClaims::default(),
        );
        let node = document.create_element("div").unwrap();
        set_detached_attr(&node, "data-challenge", "1");
        document.append_child(document.body(), &node);
        document.deliver_mutations();
        assert_eq!(watcher.state(), WatcherState::Captured);
    }
}
