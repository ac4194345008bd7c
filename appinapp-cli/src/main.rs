// appinapp-cli/src/main.rs
mod app;
mod ui;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::{
    io,
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use appinapp_core::{
    BundleWatcher, FileStore, FsReader, LoadMode, MemoryWindows, ProcessRole, Runtime,
    RuntimeConfig, ShellExecutor, config::APP_DIR_NAME,
};

use crate::app::App;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Live,
    Packaged,
}

impl From<Mode> for LoadMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Live => LoadMode::Live,
            Mode::Packaged => LoadMode::Packaged,
        }
    }
}

/// Desktop widgets in the terminal.
#[derive(Debug, Parser)]
#[command(name = "appinapp", version, about)]
struct Args {
    /// Widget folder holding `<Type>.widget` bundles
    #[arg(long, env = "APPINAPP_FOLDER")]
    folder: Option<PathBuf>,

    /// How widget source is loaded
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Config file instead of the standard lookup
    #[arg(long)]
    config: Option<PathBuf>,

    /// State file holding the instance list
    #[arg(long)]
    state: Option<PathBuf>,

    /// Window label to run as: `control` or `widget-<id>`
    #[arg(long, default_value = "control")]
    role: String,
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let dir = dirs::data_dir()
        .ok_or("Data directory not found")?
        .join(APP_DIR_NAME);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("appinapp.log"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("APPINAPP_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn load_config(args: &Args) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load_from(path)?,
        None => RuntimeConfig::load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config: {}. Using default.", e);
            RuntimeConfig::default()
        }),
    };
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if let Some(state) = &args.state {
        config.state_file = Some(state.clone());
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Err(e) = init_logging() {
        eprintln!("Warning: Failed to open log file: {}. Logging disabled.", e);
    }

    let role: ProcessRole = args.role.parse()?;
    let config = load_config(&args)?;

    let windows = Arc::new(MemoryWindows::default());
    let store = Arc::new(FileStore::new(config.state_file_path()?));
    let runtime = Runtime::new(
        &config,
        store,
        windows.clone(),
        Arc::new(ShellExecutor),
        Arc::new(FsReader),
    );
    // the flag beats both the file and the persisted setting, without persisting
    if let Some(folder) = &args.folder {
        runtime.loader.set_root(folder.clone());
    }

    if let Err(e) = runtime.registry.restore() {
        warn!(error = %e, "could not restore widget instances");
    }

    // Start watching for bundle changes (hot-reload)
    let watcher = if config.mode == LoadMode::Live {
        BundleWatcher::new(runtime.widget_folder())
            .inspect_err(|e| warn!(error = %e, "hot reload disabled"))
            .ok()
    } else {
        None
    };

    info!(role = %role, "appinapp starting");
    let mut app = App::new(runtime, windows, role, watcher);

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Main loop
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| ui::draw(f, &mut app))?;

        // Handle input with timeout
        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));

        if event::poll(timeout)?
            && let CEvent::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
            && app.handle_key(key)
        {
            break;
        }

        // Advance every widget by the real time elapsed
        let elapsed = last_tick.elapsed();
        if elapsed >= tick_rate {
            app.tick(elapsed);
            last_tick = Instant::now();
        }
    }

    app.shutdown();

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    info!("appinapp stopped");
    Ok(())
}
