use crate::config::WidgetSettings;
use crate::dom::{self, Document};
use crate::window::Window;
use kuchiki::NodeRef;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptPresence {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub bootstrap_removed: bool,
    pub versioned_removed: usize,
}

/// Owns the bootstrap `<script>` for a window: inserts it at most once and
/// removes it together with any version-pinned script it pulled in.
#[derive(Debug, Clone)]
pub struct ScriptLoader {
    script_url: String,
    script_id: String,
    versioned: Option<Regex>,
}

impl ScriptLoader {
    pub fn new(settings: &WidgetSettings) -> Self {
        let versioned = match settings.versioned_regex() {
            Ok(re) => Some(re),
            Err(err) => {
                warn!(?err, "versioned script pattern unusable; only the bootstrap will be removed");
                None
            }
        };
        Self {
            script_url: settings.script_url.to_string(),
            script_id: settings.script_id.clone(),
            versioned,
        }
    }

    pub fn script_url(&self) -> &str {
        &self.script_url
    }

    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    /// Reserved id first, then any script whose `src` is the bootstrap URL
    /// (another integration may have loaded it under its own id).
    pub fn find_bootstrap(&self, document: &Document) -> Option<NodeRef> {
        if let Some(node) = document.get_element_by_id(&self.script_id)
            && dom::tag_name(&node).as_deref() == Some("script")
        {
            return Some(node);
        }
        document
            .scripts()
            .into_iter()
            .find(|script| self.is_bootstrap_src(script))
    }

    pub fn versioned_scripts(&self, document: &Document) -> Vec<NodeRef> {
        let Some(re) = &self.versioned else {
            return Vec::new();
        };
        document
            .scripts()
            .into_iter()
            .filter(|script| dom::attr(script, "src").is_some_and(|src| re.is_match(&src)))
            .collect()
    }

    pub fn ensure_present(&self, window: &Window) -> ScriptPresence {
        let document = window.document();
        if document.get_element_by_id(&self.script_id).is_some()
            || document
                .scripts()
                .iter()
                .any(|script| self.is_bootstrap_src(script))
        {
            debug!(script_id = %self.script_id, "bootstrap script already present");
            return ScriptPresence::AlreadyPresent;
        }

        let script = match document.create_element("script") {
            Ok(script) => script,
            Err(err) => {
                warn!(?err, "failed to create bootstrap script element");
                return ScriptPresence::AlreadyPresent;
            }
        };
        dom::set_detached_attr(&script, "id", &self.script_id);
        dom::set_detached_attr(&script, "src", &self.script_url);
        dom::set_detached_attr(&script, "async", "");
        dom::set_detached_attr(&script, "defer", "");
        document.append_child(document.body(), &script);
        info!(script_id = %self.script_id, src = %self.script_url, "inserted bootstrap script");
        ScriptPresence::Inserted
    }

    /// Unconditional cleanup: the bootstrap script if it can still be found
    /// and every versioned-release script. Missing scripts are not an error.
    pub fn remove_on_teardown(&self, window: &Window) -> RemovalReport {
        let document = window.document();
        let mut report = RemovalReport::default();
        if let Some(script) = self.find_bootstrap(document) {
            report.bootstrap_removed = document.remove(&script);
        } else {
            debug!(script_id = %self.script_id, "bootstrap script already gone");
        }
        for script in self.versioned_scripts(document) {
            if document.remove(&script) {
                report.versioned_removed += 1;
            }
        }
        info!(
            bootstrap_removed = report.bootstrap_removed,
            versioned_removed = report.versioned_removed,
            "removed captcha scripts"
        );
        report
    }

    pub fn acquire(&self, window: &Window, instance_id: &str) -> ScriptPresence {
        window.bootstrap().enter(instance_id);
        self.ensure_present(window)
    }

    /// Drops `instance_id`'s claim. Scripts are removed only once no
    /// instance is registered; presence is looked up again at that moment.
    pub fn release(&self, window: &Window, instance_id: &str) -> Option<RemovalReport> {
        if !window.bootstrap().leave(instance_id) {
            debug!(%instance_id, "instance held no bootstrap claim");
            return None;
        }
        if !window.bootstrap().is_idle() {
            debug!(
                %instance_id,
                remaining = window.bootstrap().active(),
                "bootstrap script still in use"
            );
            return None;
        }
        Some(self.remove_on_teardown(window))
    }

    fn is_bootstrap_src(&self, script: &NodeRef) -> bool {
        dom::attr(script, "src").is_some_and(|src| src.trim() == self.script_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> ScriptLoader {
        ScriptLoader::new(&WidgetSettings::default())
    }

    fn append_script(window: &Window, src: &str) -> NodeRef {
        let document = window.document();
        let script = document.create_element("script").unwrap();
        dom::set_detached_attr(&script, "src", src);
        document.append_child(document.body(), &script);
        script
    }

    #[test]
    fn inserts_once() {
        let window = Window::blank();
        let loader = loader();
        assert_eq!(loader.ensure_present(&window), ScriptPresence::Inserted);
        assert_eq!(loader.ensure_present(&window), ScriptPresence::AlreadyPresent);
        assert_eq!(window.document().scripts().len(), 1);

        let script = loader.find_bootstrap(window.document()).unwrap();
        assert_eq!(dom::attr(&script, "src").as_deref(), Some(loader.script_url()));
        assert!(dom::has_attr(&script, "async"));
        assert!(dom::has_attr(&script, "defer"));
    }

    #[test]
    fn respects_foreign_bootstrap() {
        let window = Window::blank();
        let loader = loader();
        let foreign = append_script(&window, loader.script_url());
        assert_eq!(loader.ensure_present(&window), ScriptPresence::AlreadyPresent);
        assert_eq!(window.document().scripts().len(), 1);

        let report = loader.remove_on_teardown(&window);
        assert!(report.bootstrap_removed);
        assert!(foreign.parent().is_none());
    }

    #[test]
    fn removes_every_versioned_script() {
        let window = Window::blank();
        let loader = loader();
        loader.ensure_present(&window);
        append_script(&window, "https://www.gstatic.com/recaptcha/releases/aaa/recaptcha__en.js");
        append_script(&window, "https://www.gstatic.com/recaptcha/releases/bbb/recaptcha__en.js");
        append_script(&window, "https://cdn.example.test/app.js");

        let report = loader.remove_on_teardown(&window);
        assert_eq!(
            report,
            RemovalReport {
                bootstrap_removed: true,
                versioned_removed: 2
            }
        );
        let remaining = window.document().scripts();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            dom::attr(&remaining[0], "src").as_deref(),
            Some("https://cdn.example.test/app.js")
        );
    }

    #[test]
    fn removal_without_script_is_noop() {
        let window = Window::blank();
        let report = loader().remove_on_teardown(&window);
        assert_eq!(report, RemovalReport::default());
    }

    #[test]
    fn release_waits_for_last_user() {
        let window = Window::blank();
        let loader = loader();
        assert_eq!(loader.acquire(&window, "a"), ScriptPresence::Inserted);
        assert_eq!(loader.acquire(&window, "b"), ScriptPresence::AlreadyPresent);

        assert_eq!(loader.release(&window, "a"), None);
        assert!(loader.find_bootstrap(window.document()).is_some());
        assert_eq!(loader.release(&window, "a"), None);
        assert!(loader.find_bootstrap(window.document()).is_some());

        let report = loader.release(&window, "b").unwrap();
        assert!(report.bootstrap_removed);
        assert!(window.document().scripts().is_empty());
    }

    #[test]
    fn reacquire_after_external_removal() {
        let window = Window::blank();
        let loader = loader();
        loader.acquire(&window, "a");
        let script = loader.find_bootstrap(window.document()).unwrap();
        window.document().remove(&script);

        assert_eq!(loader.acquire(&window, "b"), ScriptPresence::Inserted);
        loader.release(&window, "a");
        loader.release(&window, "b");
        assert!(window.document().scripts().is_empty());
    }
}
