use anyhow::Context;
use clap::{Parser, Subcommand};
use recaptcha_widget::sim::SimulatedCaptcha;
use recaptcha_widget::{
    ArtifactSignature, Callbacks, Document, HiddenChallengeSignature, Lifecycle, ReCaptcha,
    ScriptLoader, Size, Theme, WatcherState, WidgetConfig, WidgetSettings, Window,
};
use serde::Serialize;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

const SAMPLE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Sign up</title></head>
<body>
<main><form id="signup"></form></main>
</body>
</html>"#;

#[derive(Debug, Parser)]
#[command(
    name = "recaptcha-widget",
    about = "Mount, exercise and tear down reCAPTCHA widgets in an in-process document"
)]
struct Cli {
    /// TOML file overriding the bootstrap script contract.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the mount point markup for one widget.
    Render {
        #[arg(long)]
        site_key: String,
        #[arg(long)]
        theme: Option<Theme>,
        #[arg(long)]
        size: Option<Size>,
        #[arg(long, default_value_t = 0)]
        tab_index: i32,
    },
    /// Mount widgets into a sample page, drive them, unmount, and report the
    /// document after every phase.
    Demo {
        #[arg(long, default_value_t = 2)]
        instances: usize,
        #[arg(long, default_value = "test")]
        site_key: String,
        /// Also print the final document HTML.
        #[arg(long)]
        html: bool,
    },
}

#[derive(Debug, Serialize)]
struct Snapshot {
    phase: &'static str,
    bootstrap_scripts: usize,
    versioned_scripts: usize,
    hidden_containers: usize,
    globals: Vec<String>,
    watchers: Vec<Option<WatcherState>>,
    verified: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => WidgetSettings::from_path(path)?,
        None => WidgetSettings::default(),
    };

    match cli.command {
        Command::Render {
            site_key,
            theme,
            size,
            tab_index,
        } => {
            let window = Window::blank();
            let mut config = WidgetConfig::new(site_key).with_tab_index(tab_index);
            config.theme = theme;
            config.size = size;
            let widget =
                ReCaptcha::with_settings(&window, Rc::new(settings), config, Callbacks::new());
            let element = widget.render().context("rendering mount point")?;
            println!("{}", element.to_string());
        }
        Command::Demo {
            instances,
            site_key,
            html,
        } => run_demo(settings, instances, &site_key, html)?,
    }
    Ok(())
}

fn run_demo(
    settings: WidgetSettings,
    instances: usize,
    site_key: &str,
    print_html: bool,
) -> anyhow::Result<()> {
    let window = Window::new(Document::parse(SAMPLE_PAGE).context("parsing sample page")?);
    let form = window
        .document()
        .get_element_by_id("signup")
        .context("sample page has no form")?;
    let settings = Rc::new(settings);
    let loader = ScriptLoader::new(&settings);
    let sim = SimulatedCaptcha::new(&settings);
    let verified: Rc<RefCell<Vec<String>>> = Rc::default();

    let mut widgets: Vec<ReCaptcha> = (0..instances)
        .map(|index| {
            let sink = verified.clone();
            let callbacks = Callbacks::new()
                .on_verify(move |token| sink.borrow_mut().push(format!("{index}:{token}")))
                .on_expire(move || tracing::info!(index, "challenge expired"))
                .on_error(move || tracing::warn!(index, "challenge errored"));
            ReCaptcha::with_settings(
                &window,
                settings.clone(),
                WidgetConfig::new(site_key),
                callbacks,
            )
        })
        .collect();

    for widget in &mut widgets {
        widget.mounted(&form);
    }
    report(&window, &loader, &widgets, &verified, "mounted")?;

    sim.run(&window)?;
    window.document().deliver_mutations();
    report(&window, &loader, &widgets, &verified, "rendered")?;

    if let Some(first) = widgets.first() {
        sim.verify(&window, &first.identity().element_id, "demo-token")?;
    }
    report(&window, &loader, &widgets, &verified, "verified")?;

    for widget in &mut widgets {
        widget.unmounted();
    }
    window.document().deliver_mutations();
    report(&window, &loader, &widgets, &verified, "unmounted")?;

    if print_html {
        println!("{}", window.document().to_html());
    }
    Ok(())
}

fn report(
    window: &Window,
    loader: &ScriptLoader,
    widgets: &[ReCaptcha],
    verified: &RefCell<Vec<String>>,
    phase: &'static str,
) -> anyhow::Result<()> {
    let document = window.document();
    let hidden_containers = document
        .body()
        .children()
        .filter(|node| HiddenChallengeSignature.matches(node))
        .count();
    let snapshot = Snapshot {
        phase,
        bootstrap_scripts: usize::from(loader.find_bootstrap(document).is_some()),
        versioned_scripts: loader.versioned_scripts(document).len(),
        hidden_containers,
        globals: window.globals().names(),
        watchers: widgets.iter().map(ReCaptcha::watcher_state).collect(),
        verified: verified.borrow().clone(),
    };
    println!("{}", serde_json::to_string(&snapshot)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
