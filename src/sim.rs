use crate::config::WidgetSettings;
use crate::dom::{self, DomError};
use crate::globals::GlobalError;
use crate::script::ScriptLoader;
use crate::watcher::HiddenChallengeSignature;
use crate::window::Window;
use kuchiki::NodeRef;
use std::cell::Cell;
use thiserror::Error;
use tracing::{debug, info};

pub const WIDGET_ID_ATTR: &str = "data-recaptcha-widget-id";
pub const DEFAULT_RELEASE: &str = "Xh5Zjh8Od1_Uh5wmsAKbcU1d";

#[derive(Debug, Error)]
pub enum SimError {
    #[error("no widget element with id {0}")]
    UnknownWidget(String),
    #[error("widget {0} has no {1} attribute")]
    MissingCallback(String, &'static str),
    #[error(transparent)]
    Global(#[from] GlobalError),
    #[error(transparent)]
    Dom(#[from] DomError),
}

pub struct SimulatedCaptcha {
    loader: ScriptLoader,
    marker_class: String,
    release: String,
    next_widget: Cell<u64>,
}

impl SimulatedCaptcha {
    pub fn new(settings: &WidgetSettings) -> Self {
        Self {
            loader: ScriptLoader::new(settings),
            marker_class: settings.marker_class.clone(),
            release: DEFAULT_RELEASE.to_string(),
            next_widget: Cell::new(0),
        }
    }

    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = release.into();
        self
    }

    pub fn versioned_script_url(&self) -> String {
        format!(
            "https://www.gstatic.com/recaptcha/releases/{}/recaptcha__en.js",
            self.release
        )
    }

    /// One scan of the document. Returns how many widgets were rendered.
    pub fn run(&self, window: &Window) -> Result<usize, SimError> {
        let document = window.document();
        if self.loader.find_bootstrap(document).is_none() {
            debug!("bootstrap script not in document; nothing to do");
            return Ok(0);
        }

        let pending: Vec<NodeRef> = document
            .query_selector_all(&format!(".{}", self.marker_class))?
            .into_iter()
            .filter(|node| !dom::has_attr(node, WIDGET_ID_ATTR))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        self.ensure_versioned_script(window)?;
        for element in &pending {
            let widget_id = self.next_widget.get();
            self.next_widget.set(widget_id + 1);
            document.set_attribute(element, WIDGET_ID_ATTR, &widget_id.to_string());
            document.replace_children_html(
                element,
                &format!(
                    "<iframe src=\"about:blank\" title=\"reCAPTCHA\" data-recaptcha-widget-id=\"{widget_id}\"></iframe>"
                ),
            )?;

            let container = document.create_element("div")?;
            dom::set_detached_attr(
                &container,
                "style",
                &dom::style_text(&HiddenChallengeSignature::DECLARATIONS),
            );
            document.append_child(document.body(), &container);
            debug!(widget_id, "rendered widget and challenge container");
        }
        info!(rendered = pending.len(), "recaptcha widgets rendered");
        Ok(pending.len())
    }

    pub fn verify(&self, window: &Window, element_id: &str, token: &str) -> Result<(), SimError> {
        let name = self.callback_name(window, element_id, "data-callback")?;
        window.globals().call(&name, &[token.to_string()])?;
        Ok(())
    }

    pub fn fail(&self, window: &Window, element_id: &str) -> Result<(), SimError> {
        let name = self.callback_name(window, element_id, "data-error-callback")?;
        window.globals().call(&name, &[])?;
        Ok(())
    }

    pub fn expire(&self, window: &Window, element_id: &str) -> Result<(), SimError> {
        let name = self.callback_name(window, element_id, "data-expired-callback")?;
        window.globals().call(&name, &[])?;
        Ok(())
    }

    fn ensure_versioned_script(&self, window: &Window) -> Result<(), SimError> {
        let document = window.document();
        if !self.loader.versioned_scripts(document).is_empty() {
            return Ok(());
        }
        let script = document.create_element("script")?;
        dom::set_detached_attr(&script, "src", &self.versioned_script_url());
        document.append_child(document.body(), &script);
        Ok(())
    }

    fn callback_name(
        &self,
        window: &Window,
        element_id: &str,
        attribute: &'static str,
    ) -> Result<String, SimError> {
        let element = window
            .document()
            .get_element_by_id(element_id)
            .ok_or_else(|| SimError::UnknownWidget(element_id.to_string()))?;
        dom::attr(&element, attribute)
            .ok_or_else(|| SimError::MissingCallback(element_id.to_string(), attribute))
    }
}
