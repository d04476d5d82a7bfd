use kuchiki::NodeRef;
use kuchiki::traits::*;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use thiserror::Error;
use tracing::{debug, trace};

const EMPTY_DOCUMENT: &str = "<!DOCTYPE html><html><head></head><body></body></html>";

#[derive(Debug, Error)]
pub enum DomError {
    #[error("invalid tag name: {0:?}")]
    InvalidTag(String),
    #[error("query selector {0} failed")]
    Selector(String),
    #[error("document has no <{0}> element")]
    MissingElement(&'static str),
}

/// A child-list change on `target`. Observation is never subtree-wide.
#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub target: NodeRef,
    pub added_nodes: Vec<NodeRef>,
    pub removed_nodes: Vec<NodeRef>,
}

impl MutationRecord {
    fn child_list(target: &NodeRef, added: Vec<NodeRef>, removed: Vec<NodeRef>) -> Self {
        Self {
            target: target.clone(),
            added_nodes: added,
            removed_nodes: removed,
        }
    }
}

type MutationCallback = Rc<dyn Fn(&[MutationRecord])>;

struct Registration {
    id: u64,
    target: NodeRef,
    callback: MutationCallback,
    connected: Cell<bool>,
    queue: RefCell<Vec<MutationRecord>>,
}

struct DocumentInner {
    root: NodeRef,
    head: NodeRef,
    body: NodeRef,
    observers: RefCell<Vec<Rc<Registration>>>,
    next_observer: Cell<u64>,
}

#[derive(Clone)]
pub struct Document {
    inner: Rc<DocumentInner>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("observers", &self.inner.observers.borrow().len())
            .finish()
    }
}

impl Document {
    pub fn parse(html: &str) -> Result<Self, DomError> {
        let root = kuchiki::parse_html().one(html);
        let head = root
            .select_first("head")
            .map_err(|_| DomError::MissingElement("head"))?
            .as_node()
            .clone();
        let body = root
            .select_first("body")
            .map_err(|_| DomError::MissingElement("body"))?
            .as_node()
            .clone();
        Ok(Self {
            inner: Rc::new(DocumentInner {
                root,
                head,
                body,
                observers: RefCell::new(Vec::new()),
                next_observer: Cell::new(1),
            }),
        })
    }

    pub fn empty() -> Self {
        // The HTML parser always synthesizes <head> and <body>.
        Self::parse(EMPTY_DOCUMENT).expect("empty document always has head and body")
    }

    pub fn root(&self) -> &NodeRef {
        &self.inner.root
    }

    pub fn head(&self) -> &NodeRef {
        &self.inner.head
    }

    pub fn body(&self) -> &NodeRef {
        &self.inner.body
    }

    pub fn create_element(&self, tag: &str) -> Result<NodeRef, DomError> {
        create_element(tag)
    }

    pub fn contains(&self, node: &NodeRef) -> bool {
        node.inclusive_ancestors()
            .any(|ancestor| ancestor == self.inner.root)
    }

    pub fn append_child(&self, parent: &NodeRef, child: &NodeRef) {
        if let Some(old_parent) = child.parent() {
            child.detach();
            self.queue(MutationRecord::child_list(
                &old_parent,
                vec![],
                vec![child.clone()],
            ));
        }
        parent.append(child.clone());
        trace!(tag = %tag_name(child).unwrap_or_default(), "appended child");
        self.queue(MutationRecord::child_list(parent, vec![child.clone()], vec![]));
    }

    pub fn remove(&self, node: &NodeRef) -> bool {
        let Some(parent) = node.parent() else {
            return false;
        };
        node.detach();
        trace!(tag = %tag_name(node).unwrap_or_default(), "removed child");
        self.queue(MutationRecord::child_list(&parent, vec![], vec![node.clone()]));
        true
    }

    /// Attribute writes are not observable; no record is queued.
    pub fn set_attribute(&self, node: &NodeRef, name: &str, value: &str) {
        set_detached_attr(node, name, value);
    }

    pub fn remove_attribute(&self, node: &NodeRef, name: &str) {
        if let Some(element) = node.as_element() {
            element.attributes.borrow_mut().remove(name);
        }
    }

    pub fn replace_children_html(&self, node: &NodeRef, html: &str) -> Result<(), DomError> {
        let existing: Vec<_> = node.children().collect();
        for child in existing {
            self.remove(&child);
        }

        for child in parse_fragment(html)? {
            self.append_child(node, &child);
        }
        Ok(())
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<NodeRef> {
        self.inner
            .root
            .descendants()
            .find(|node| attr(node, "id").as_deref() == Some(id))
    }

    pub fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeRef>, DomError> {
        let nodes = self
            .inner
            .root
            .select(selector)
            .map_err(|_| DomError::Selector(selector.to_string()))?;
        Ok(nodes.map(|n| n.as_node().clone()).collect())
    }

    pub fn scripts(&self) -> Vec<NodeRef> {
        self.inner
            .root
            .descendants()
            .filter(|node| tag_name(node).as_deref() == Some("script"))
            .collect()
    }

    pub fn to_html(&self) -> String {
        self.inner.root.to_string()
    }

    pub fn observe_child_list(
        &self,
        target: &NodeRef,
        callback: impl Fn(&[MutationRecord]) + 'static,
    ) -> ObserverHandle {
        let id = self.inner.next_observer.get();
        self.inner.next_observer.set(id + 1);
        self.inner.observers.borrow_mut().push(Rc::new(Registration {
            id,
            target: target.clone(),
            callback: Rc::new(callback),
            connected: Cell::new(true),
            queue: RefCell::new(Vec::new()),
        }));
        debug!(observer = id, "mutation observer attached");
        ObserverHandle {
            id,
            document: Rc::downgrade(&self.inner),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.borrow().len()
    }

    /// Delivers queued records one batch per observer, repeating until the
    /// callbacks stop producing records.
    pub fn deliver_mutations(&self) -> usize {
        let mut delivered = 0;
        loop {
            let snapshot: Vec<Rc<Registration>> = self.inner.observers.borrow().clone();
            let mut pass = 0;
            for registration in snapshot {
                if !registration.connected.get() {
                    continue;
                }
                let batch = std::mem::take(&mut *registration.queue.borrow_mut());
                if batch.is_empty() {
                    continue;
                }
                pass += batch.len();
                (registration.callback)(&batch);
            }
            if pass == 0 {
                break;
            }
            delivered += pass;
        }
        delivered
    }

    fn queue(&self, record: MutationRecord) {
        for registration in self.inner.observers.borrow().iter() {
            if registration.target == record.target {
                registration.queue.borrow_mut().push(record.clone());
            }
        }
    }
}

#[derive(Debug)]
pub struct ObserverHandle {
    id: u64,
    document: Weak<DocumentInner>,
}

impl ObserverHandle {
    /// Stops observation and drops undelivered records. Safe to call twice.
    pub fn disconnect(&self) {
        let Some(document) = self.document.upgrade() else {
            return;
        };
        let mut observers = document.observers.borrow_mut();
        if let Some(pos) = observers.iter().position(|r| r.id == self.id) {
            let registration = observers.remove(pos);
            registration.connected.set(false);
            registration.queue.borrow_mut().clear();
            debug!(observer = self.id, "mutation observer disconnected");
        }
    }
}

pub fn create_element(tag: &str) -> Result<NodeRef, DomError> {
    if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(DomError::InvalidTag(tag.to_string()));
    }
    let element = parse_fragment(&format!("<{tag}></{tag}>"))?
        .into_iter()
        .find(|node| tag_name(node).is_some_and(|name| name.eq_ignore_ascii_case(tag)))
        .ok_or_else(|| DomError::InvalidTag(tag.to_string()))?;
    Ok(element)
}

/// Top-level nodes of `html` parsed as body content, detached.
fn parse_fragment(html: &str) -> Result<Vec<NodeRef>, DomError> {
    let scratch = kuchiki::parse_html().one(format!("<html><body>{html}</body></html>"));
    let body = scratch
        .select_first("body")
        .map_err(|_| DomError::MissingElement("body"))?;
    let nodes: Vec<NodeRef> = body.as_node().children().collect();
    for node in &nodes {
        node.detach();
    }
    Ok(nodes)
}

pub fn tag_name(node: &NodeRef) -> Option<String> {
    node.as_element().map(|el| el.name.local.to_string())
}

pub fn attr(node: &NodeRef, name: &str) -> Option<String> {
    node.as_element()
        .and_then(|el| el.attributes.borrow().get(name).map(str::to_string))
}

pub fn has_attr(node: &NodeRef, name: &str) -> bool {
    node.as_element()
        .map(|el| el.attributes.borrow().contains(name))
        .unwrap_or(false)
}

pub fn set_detached_attr(node: &NodeRef, name: &str, value: &str) {
    if let Some(element) = node.as_element() {
        element
            .attributes
            .borrow_mut()
            .insert(name, value.to_string());
    }
}

/// Reads one declaration from the inline `style` attribute. The last
/// declaration for a property wins, as in CSS.
pub fn inline_style(node: &NodeRef, property: &str) -> Option<String> {
    let style = attr(node, "style")?;
    style
        .split(';')
        .filter_map(|decl| decl.split_once(':'))
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case(property))
        .map(|(_, value)| value.trim().to_string())
        .last()
}

pub fn style_text(declarations: &[(&str, &str)]) -> String {
    declarations
        .iter()
        .map(|(name, value)| format!("{name}: {value};"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn parses_head_and_body() {
        let doc = Document::parse("<p>hello</p>").unwrap();
        assert_eq!(tag_name(doc.body()).as_deref(), Some("body"));
        assert_eq!(tag_name(doc.head()).as_deref(), Some("head"));
        assert_eq!(doc.query_selector_all("p").unwrap().len(), 1);
    }

    #[test]
    fn rejects_bad_tag_names() {
        assert!(matches!(
            create_element("div onclick"),
            Err(DomError::InvalidTag(_))
        ));
        assert!(create_element("").is_err());
        let script = create_element("script").unwrap();
        assert_eq!(tag_name(&script).as_deref(), Some("script"));
        assert!(script.parent().is_none());
    }

    #[test]
    fn reads_inline_style_declarations() {
        let node = create_element("div").unwrap();
        set_detached_attr(
            &node,
            "style",
            "Visibility: hidden ; top:-10000px; position: static; position: absolute",
        );
        assert_eq!(inline_style(&node, "visibility").as_deref(), Some("hidden"));
        assert_eq!(inline_style(&node, "top").as_deref(), Some("-10000px"));
        assert_eq!(inline_style(&node, "position").as_deref(), Some("absolute"));
        assert_eq!(inline_style(&node, "left"), None);
    }

    #[test]
    fn delivers_child_list_records_in_batches() {
        let doc = Document::empty();
        let seen: Rc<RefCell<Vec<usize>>> = Rc::default();
        let sink = seen.clone();
        let handle = doc.observe_child_list(doc.body(), move |records| {
            sink.borrow_mut().push(records.len());
        });

        let a = doc.create_element("div").unwrap();
        let b = doc.create_element("span").unwrap();
        doc.append_child(doc.body(), &a);
        doc.append_child(doc.body(), &b);
        assert!(seen.borrow().is_empty(), "delivery waits for the checkpoint");

        assert_eq!(doc.deliver_mutations(), 2);
        assert_eq!(*seen.borrow(), vec![2]);

        doc.remove(&a);
        handle.disconnect();
        handle.disconnect();
        assert_eq!(doc.deliver_mutations(), 0);
        assert_eq!(doc.observer_count(), 0);
    }

    #[test]
    fn ignores_grandchild_insertions() {
        let doc = Document::empty();
        let count = Rc::new(Cell::new(0));
        let sink = count.clone();
        let _handle = doc.observe_child_list(doc.body(), move |records| {
            sink.set(sink.get() + records.len());
        });
        let outer = doc.create_element("div").unwrap();
        doc.append_child(doc.body(), &outer);
        let inner = doc.create_element("div").unwrap();
        doc.append_child(&outer, &inner);
        doc.deliver_mutations();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn attribute_writes_queue_no_records() {
        let doc = Document::empty();
        let count = Rc::new(Cell::new(0));
        let sink = count.clone();
        let _handle = doc.observe_child_list(doc.body(), move |records| {
            sink.set(sink.get() + records.len());
        });
        doc.set_attribute(doc.body(), "data-x", "1");
        doc.remove_attribute(doc.body(), "data-x");
        assert_eq!(doc.deliver_mutations(), 0);
        assert_eq!(count.get(), 0);
        assert!(!has_attr(doc.body(), "data-x"));
    }

    #[test]
    fn remove_is_noop_for_detached_nodes() {
        let doc = Document::empty();
        let node = doc.create_element("div").unwrap();
        assert!(!doc.remove(&node));
        doc.append_child(doc.body(), &node);
        assert!(doc.contains(&node));
        assert!(doc.remove(&node));
        assert!(!doc.contains(&node));
        assert!(!doc.remove(&node));
    }

    #[test]
    fn replaces_children_with_fragment() {
        let doc = Document::parse("<div id=\"target\">old</div>").unwrap();
        let target = doc.get_element_by_id("target").unwrap();
        doc.replace_children_html(&target, "<iframe title=\"w\"></iframe>")
            .unwrap();
        let html = doc.to_html();
        assert!(html.contains("<iframe title=\"w\"></iframe>"));
        assert!(!html.contains("old"));
    }
}
