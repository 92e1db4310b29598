use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Args, Parser, Subcommand};
use mwpanel::config::PanelConfig;
use mwpanel::model::{CheckState, DocPath, EventSelection};
use mwpanel::monitor::{RawSelection, SelectionSurface, SurfaceMonitor};
use mwpanel::panel::{Panel, ToggleOutcome};
use mwpanel::storage::{DocumentStore, FsDocumentStore};
use mwpanel::{Locator, duration};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mwpanel",
    about = "Inspect and edit Markwhen timeline events embedded in notes",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON panel configuration; defaults apply to missing fields.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the body of one event.
    Locate(LocateArgs),

    /// Print the detail view of one event.
    Show(ShowArgs),

    /// Set one checkbox of an event and save the document.
    Toggle(ToggleArgs),

    /// Print the duration of a date expression such as `2024-01-01 / now`.
    Duration(DurationArgs),

    /// Drive a panel session from commands on stdin.
    Session(SessionArgs),
}

#[derive(Debug, Args)]
struct LocateArgs {
    file: PathBuf,
    /// Event title as the timeline shows it.
    #[arg(long)]
    title: String,
    /// Emit JSON with the byte offset of the body.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("format").args(["json", "html"])))]
struct ShowArgs {
    file: PathBuf,
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    date: String,
    #[arg(long)]
    json: bool,
    #[arg(long)]
    html: bool,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("state").required(true).args(["check", "uncheck"])))]
struct ToggleArgs {
    file: PathBuf,
    #[arg(long)]
    title: String,
    /// Zero-based line within the event body.
    #[arg(long)]
    line: usize,
    /// Zero-based checkbox on that line.
    #[arg(long)]
    index: usize,
    #[arg(long)]
    check: bool,
    #[arg(long)]
    uncheck: bool,
}

#[derive(Debug, Args)]
struct DurationArgs {
    #[arg(required = true)]
    expr: Vec<String>,
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Directory that link targets and `open` paths are relative to.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Document that is active when the session starts.
    #[arg(long)]
    open: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = match &cli.config {
        Some(path) => PanelConfig::load(path)?,
        None => PanelConfig::default(),
    };
    match cli.command {
        Commands::Locate(args) => handle_locate(args, &config),
        Commands::Show(args) => handle_show(args, &config),
        Commands::Toggle(args) => handle_toggle(args, &config),
        Commands::Duration(args) => handle_duration(args),
        Commands::Session(args) => handle_session(args, &config),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn handle_locate(args: LocateArgs, config: &PanelConfig) -> Result<()> {
    let LocateArgs { file, title, json } = args;
    let text = fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
    let locator = Locator::from_config(config).context("building locator")?;
    let Some(block) = locator.locate_block(&text, &title) else {
        bail!("event {:?} not found in {:?}", title, file);
    };

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            title: &'a str,
            offset: usize,
            body: &'a str,
        }

        let payload = JsonOutput {
            title: &title,
            offset: block.offset,
            body: &block.body,
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", block.body);
    }
    Ok(())
}

fn handle_show(args: ShowArgs, config: &PanelConfig) -> Result<()> {
    let ShowArgs {
        file,
        title,
        date,
        json,
        html,
    } = args;
    let (store, path) = open_store(&file)?;
    let mut panel = Panel::new(config)?;
    panel.select_event(&store, &path, &EventSelection::new(title, date))?;

    let view = panel.view();
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else if html {
        println!("{}", view.to_html());
    } else {
        println!("{}", view.to_text());
    }
    Ok(())
}

fn handle_toggle(args: ToggleArgs, config: &PanelConfig) -> Result<()> {
    let ToggleArgs {
        file,
        title,
        line,
        index,
        check,
        uncheck: _,
    } = args;
    let (mut store, path) = open_store(&file)?;
    let mut panel = Panel::new(config)?;
    let record = panel.select_event(&store, &path, &EventSelection::new(title.as_str(), ""))?;
    if record.raw_content.is_empty() {
        bail!("event {:?} not found in {:?}", title, file);
    }

    match panel.toggle_checkbox(&mut store, line, index, CheckState::from_checked(check))? {
        ToggleOutcome::Applied { line } => {
            println!("{line}");
            Ok(())
        }
        ToggleOutcome::Skipped(err) => Err(err).with_context(|| format!("updating {:?}", file)),
    }
}

fn handle_duration(args: DurationArgs) -> Result<()> {
    println!("{}", duration(&args.expr.join(" ")));
    Ok(())
}

fn handle_session(args: SessionArgs, config: &PanelConfig) -> Result<()> {
    let SessionArgs { root, open } = args;
    if !root.is_dir() {
        bail!("session root {:?} is not a directory", root);
    }
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut session = Session::new(FsDocumentStore::new(root), DocPath::new(open), config)?;
    session.run(stdin.lock(), &mut stdout.lock())
}

/// Split `file` into a store rooted at its directory and its name in that store.
fn open_store(file: &Path) -> Result<(FsDocumentStore, DocPath)> {
    let name = file
        .file_name()
        .with_context(|| format!("{:?} does not name a file", file))?;
    let root = match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((FsDocumentStore::new(root), DocPath::new(name.to_string_lossy())))
}

/* ------------------------------ Session ------------------------------ */

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionCommand {
    Select { title: String, date: String },
    Toggle { line: usize, index: usize, state: CheckState },
    Modified,
    Open(String),
    Link(String),
    Show,
    Quit,
}

/// `None` for blank lines and `#` comments.
fn parse_session_command(line: &str) -> Result<Option<SessionCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match verb.to_ascii_lowercase().as_str() {
        "select" => {
            let (title, date) = rest.split_once('|').unwrap_or((rest, ""));
            SessionCommand::Select {
                title: title.trim().to_string(),
                date: date.trim().to_string(),
            }
        }
        "toggle" => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let [line, index, state] = parts.as_slice() else {
                bail!("usage: toggle LINE INDEX on|off");
            };
            let state = match *state {
                "on" | "x" => CheckState::Checked,
                "off" => CheckState::Unchecked,
                other => bail!("expected on or off, got {:?}", other),
            };
            SessionCommand::Toggle {
                line: line.parse().with_context(|| format!("line {:?}", line))?,
                index: index.parse().with_context(|| format!("index {:?}", index))?,
                state,
            }
        }
        "modified" => SessionCommand::Modified,
        "open" if !rest.is_empty() => SessionCommand::Open(rest.to_string()),
        "link" if !rest.is_empty() => SessionCommand::Link(rest.to_string()),
        "show" => SessionCommand::Show,
        "quit" | "exit" => SessionCommand::Quit,
        _ => bail!("unknown command {:?}", line),
    };
    Ok(Some(command))
}

/// Selections typed into the session, handed over like timeline clicks.
#[derive(Debug, Default)]
struct ScriptSurface {
    pending: Vec<RawSelection>,
}

impl SelectionSurface for ScriptSurface {
    fn is_live(&self) -> bool {
        true
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn subscribe(&mut self) -> Result<()> {
        Ok(())
    }

    fn drain(&mut self) -> Vec<RawSelection> {
        std::mem::take(&mut self.pending)
    }
}

struct Session {
    store: FsDocumentStore,
    active: DocPath,
    panel: Panel,
    monitor: SurfaceMonitor<ScriptSurface>,
}

impl Session {
    fn new(store: FsDocumentStore, active: DocPath, config: &PanelConfig) -> Result<Self> {
        let mut monitor = SurfaceMonitor::new(ScriptSurface::default(), config);
        monitor.on_event_selected(|selection| debug!(id = %selection.id(), "event selected"));
        Ok(Self {
            store,
            active,
            panel: Panel::new(config)?,
            monitor,
        })
    }

    fn run(&mut self, input: impl BufRead, out: &mut impl Write) -> Result<()> {
        for line in input.lines() {
            let line = line.context("reading session input")?;
            let command = match parse_session_command(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(err) => {
                    writeln!(out, "error: {err:#}")?;
                    continue;
                }
            };
            if command == SessionCommand::Quit {
                break;
            }
            if let Err(err) = self.apply(command, out) {
                writeln!(out, "error: {err:#}")?;
            }
        }
        Ok(())
    }

    /// A timeline document renders a fresh surface, so subscribe to it again.
    fn resubscribe_if_timeline(&mut self) -> Result<()> {
        if !self.store.exists(&self.active) {
            return Ok(());
        }
        let text = self.store.read(&self.active)?;
        if self.panel.is_timeline_document(&self.active, &text) {
            self.monitor.reattach();
            for selection in self.monitor.tick(Instant::now()) {
                self.panel.select_event(&self.store, &self.active, &selection)?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, command: SessionCommand, out: &mut impl Write) -> Result<()> {
        match command {
            SessionCommand::Select { title, date } => {
                let now = Instant::now();
                self.monitor.surface_mut().pending.push(RawSelection { title, date, at: now });
                for selection in self.monitor.tick(now) {
                    self.panel.select_event(&self.store, &self.active, &selection)?;
                }
                writeln!(out, "{}", self.panel.view().to_text())?;
            }
            SessionCommand::Toggle { line, index, state } => {
                match self.panel.toggle_checkbox(&mut self.store, line, index, state)? {
                    ToggleOutcome::Applied { line } => writeln!(out, "saved: {line}")?,
                    ToggleOutcome::Skipped(err) => writeln!(out, "skipped: {err}")?,
                }
            }
            SessionCommand::Modified => {
                self.panel.on_document_modified(&self.store, &self.active)?;
                self.resubscribe_if_timeline()?;
                writeln!(out, "{}", self.panel.view().to_text())?;
            }
            SessionCommand::Open(path) => {
                self.active = DocPath::new(path);
                self.panel.on_document_opened(&self.active);
                self.monitor.hub_mut().forget_last();
                info!(path = %self.active, "document opened");
                self.resubscribe_if_timeline()?;
            }
            SessionCommand::Link(name) => match self.panel.follow_link(&self.store, &name) {
                Some(path) => writeln!(out, "{}", self.store.abs_path(&path).display())?,
                None => writeln!(out, "no document for [[{name}]]")?,
            },
            SessionCommand::Show => writeln!(out, "{}", self.panel.view().to_text())?,
            SessionCommand::Quit => {}
        }
        Ok(())
    }
}
