use crate::binder::{CallbackBinder, CallbackNames, Callbacks};
use crate::config::WidgetSettings;
use crate::dom;
use crate::script::ScriptLoader;
use crate::watcher::{
    ArtifactSignature, HiddenChallengeSignature, MutationWatcher, WatcherState,
};
use crate::window::Window;
use kuchiki::NodeRef;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TEST_SITE_KEY_SENTINEL: &str = "test";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} {value:?}")]
pub struct ParseOptionError {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Theme {
    type Err = ParseOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            _ => Err(ParseOptionError {
                kind: "theme",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Size {
    Normal,
    Compact,
}

impl Size {
    pub fn as_str(&self) -> &'static str {
        match self {
            Size::Normal => "normal",
            Size::Compact => "compact",
        }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Size {
    type Err = ParseOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Size::Normal),
            "compact" => Ok(Size::Compact),
            _ => Err(ParseOptionError {
                kind: "size",
                value: s.to_string(),
            }),
        }
    }
}

/// Per-instance widget options. Read by the third party once, when it first
/// renders the mount point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetConfig {
    pub site_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default)]
    pub tab_index: i32,
}

impl WidgetConfig {
    pub fn new(site_key: impl Into<String>) -> Self {
        Self {
            site_key: site_key.into(),
            theme: None,
            size: None,
            tab_index: 0,
        }
    }

    pub fn with_theme(mut self, theme: Theme) -> Self {
        self.theme = Some(theme);
        self
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_tab_index(mut self, tab_index: i32) -> Self {
        self.tab_index = tab_index;
        self
    }

    pub fn resolved_site_key<'a>(&'a self, settings: &'a WidgetSettings) -> &'a str {
        if self.site_key == TEST_SITE_KEY_SENTINEL {
            &settings.test_site_key
        } else {
            &self.site_key
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WidgetIdentity {
    pub element_id: String,
    pub callbacks: CallbackNames,
}

impl WidgetIdentity {
    pub fn generate() -> Self {
        Self {
            element_id: format!("recaptcha-{}", Uuid::new_v4().simple()),
            callbacks: CallbackNames {
                verify: format!("recaptchaOnVerify_{}", Uuid::new_v4().simple()),
                error: format!("recaptchaOnError_{}", Uuid::new_v4().simple()),
                expire: format!("recaptchaOnExpire_{}", Uuid::new_v4().simple()),
            },
        }
    }
}

pub trait Lifecycle {
    type Props;

    fn mounted(&mut self, parent: &NodeRef);
    fn updated(&mut self, props: Self::Props);
    fn unmounted(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct WidgetProps {
    pub config: Option<WidgetConfig>,
    pub callbacks: Callbacks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountPhase {
    Created,
    Mounted,
    Unmounted,
}

/// The mount point component. Renders the placeholder the bootstrap script
/// scans for and scopes that script's side effects to this instance.
pub struct ReCaptcha {
    window: Window,
    settings: Rc<WidgetSettings>,
    loader: ScriptLoader,
    signature: Rc<dyn ArtifactSignature>,
    config: WidgetConfig,
    identity: WidgetIdentity,
    binder: CallbackBinder,
    pending: Callbacks,
    element: Option<NodeRef>,
    watcher: Option<MutationWatcher>,
    phase: MountPhase,
}

impl std::fmt::Debug for ReCaptcha {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReCaptcha")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("watcher", &self.watcher_state())
            .finish()
    }
}

impl ReCaptcha {
    pub fn new(window: &Window, config: WidgetConfig, callbacks: Callbacks) -> Self {
        Self::with_settings(window, Rc::new(WidgetSettings::default()), config, callbacks)
    }

    pub fn with_settings(
        window: &Window,
        settings: Rc<WidgetSettings>,
        config: WidgetConfig,
        callbacks: Callbacks,
    ) -> Self {
        let identity = WidgetIdentity::generate();
        let binder = CallbackBinder::new(window.globals().clone(), identity.callbacks.clone());
        Self {
            window: window.clone(),
            loader: ScriptLoader::new(&settings),
            settings,
            signature: Rc::new(HiddenChallengeSignature),
            config,
            identity,
            binder,
            pending: callbacks,
            element: None,
            watcher: None,
            phase: MountPhase::Created,
        }
    }

    /// Replaces the hidden-node test. Only affects the next mount.
    pub fn with_signature(mut self, signature: Rc<dyn ArtifactSignature>) -> Self {
        self.signature = signature;
        self
    }

    pub fn identity(&self) -> &WidgetIdentity {
        &self.identity
    }

    pub fn config(&self) -> &WidgetConfig {
        &self.config
    }

    pub fn phase(&self) -> MountPhase {
        self.phase
    }

    pub fn element(&self) -> Option<&NodeRef> {
        self.element.as_ref()
    }

    pub fn watcher_state(&self) -> Option<WatcherState> {
        self.watcher.as_ref().map(MutationWatcher::state)
    }

    /// Builds the placeholder element with every attribute the bootstrap
    /// script reads. The element is detached.
    pub fn render(&self) -> Result<NodeRef, dom::DomError> {
        let element = dom::create_element("div")?;
        for (name, value) in self.attributes() {
            dom::set_detached_attr(&element, name, &value);
        }
        Ok(element)
    }

    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        let mut attrs = vec![
            ("id", self.identity.element_id.clone()),
            ("class", self.settings.marker_class.clone()),
            (
                "data-sitekey",
                self.config.resolved_site_key(&self.settings).to_string(),
            ),
        ];
        if let Some(theme) = self.config.theme {
            attrs.push(("data-theme", theme.to_string()));
        }
        if let Some(size) = self.config.size {
            attrs.push(("data-size", size.to_string()));
        }
        attrs.push(("data-tabindex", self.config.tab_index.to_string()));
        attrs.push(("data-callback", self.identity.callbacks.verify.clone()));
        attrs.push(("data-error-callback", self.identity.callbacks.error.clone()));
        attrs.push((
            "data-expired-callback",
            self.identity.callbacks.expire.clone(),
        ));
        attrs
    }

    fn mount_into(&mut self, parent: &NodeRef) {
        let document = self.window.document().clone();
        match self.render() {
            Ok(element) => {
                document.append_child(parent, &element);
                self.element = Some(element);
            }
            Err(err) => warn!(?err, "failed to render recaptcha mount point"),
        }

        let presence = self
            .loader
            .acquire(&self.window, &self.identity.element_id);
        self.watcher = Some(MutationWatcher::attach(
            &document,
            self.signature.clone(),
            self.window.artifact_claims().clone(),
        ));
        self.binder.bind(self.pending.clone());
        self.phase = MountPhase::Mounted;
        info!(
            element_id = %self.identity.element_id,
            ?presence,
            "recaptcha mounted"
        );
    }

    fn rerender(&self) {
        let Some(element) = &self.element else {
            return;
        };
        let document = self.window.document();
        let attrs = self.attributes();
        for optional in ["data-theme", "data-size"] {
            if !attrs.iter().any(|(name, _)| *name == optional) {
                document.remove_attribute(element, optional);
            }
        }
        for (name, value) in attrs {
            document.set_attribute(element, name, &value);
        }
    }

    fn teardown(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.teardown();
        }
        if let Some(report) = self
            .loader
            .release(&self.window, &self.identity.element_id)
        {
            debug!(?report, "last recaptcha instance removed scripts");
        }
        self.binder.unbind();
        if let Some(element) = self.element.take() {
            self.window.document().remove(&element);
        }
    }
}

impl Lifecycle for ReCaptcha {
    type Props = WidgetProps;

    fn mounted(&mut self, parent: &NodeRef) {
        match self.phase {
            MountPhase::Created => self.mount_into(parent),
            MountPhase::Mounted => {
                debug!(element_id = %self.identity.element_id, "already mounted")
            }
            MountPhase::Unmounted => warn!(
                element_id = %self.identity.element_id,
                "cannot remount an unmounted recaptcha instance"
            ),
        }
    }

    fn updated(&mut self, props: WidgetProps) {
        if let Some(config) = props.config
            && config != self.config
        {
            if self.phase == MountPhase::Mounted {
                debug!(
                    element_id = %self.identity.element_id,
                    "config changed after mount; rendered widget may not reflect it"
                );
            }
            self.config = config;
            self.rerender();
        }
        self.pending = props.callbacks.clone();
        if self.phase == MountPhase::Mounted {
            self.binder.bind(props.callbacks);
        }
    }

    fn unmounted(&mut self) {
        match self.phase {
            MountPhase::Created => {
                debug!(element_id = %self.identity.element_id, "unmounted before mount");
            }
            MountPhase::Mounted => {
                self.teardown();
                info!(element_id = %self.identity.element_id, "recaptcha unmounted");
            }
            MountPhase::Unmounted => {
                debug!(element_id = %self.identity.element_id, "already unmounted");
            }
        }
        self.phase = MountPhase::Unmounted;
    }
}

impl Drop for ReCaptcha {
    fn drop(&mut self) {
        if self.phase == MountPhase::Mounted {
            warn!(element_id = %self.identity.element_id, "dropped while mounted; tearing down");
            self.unmounted();
        }
    }
}
