pub mod binder;
pub mod config;
pub mod dom;
pub mod globals;
pub mod script;
pub mod sim;
pub mod watcher;
pub mod widget;
pub mod window;

pub use binder::{CallbackBinder, CallbackNames, Callbacks};
pub use config::WidgetSettings;
pub use dom::Document;
pub use script::{RemovalReport, ScriptLoader, ScriptPresence};
pub use watcher::{
    ArtifactClaims, ArtifactSignature, HiddenChallengeSignature, MutationWatcher, WatcherState,
};
pub use widget::{
    Lifecycle, MountPhase, ReCaptcha, Size, Theme, WidgetConfig, WidgetIdentity, WidgetProps,
};
pub use window::Window;
