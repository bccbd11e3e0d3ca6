//! warden -- supervisory bridge between a strategy-level controller and an
//! autonomous operator agent (shell, X11 GUI, or browser backends), with a
//! guaranteed structured evidence report per run.

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use warden_types::WardenError;

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Operator-agent bridge CLI")]
struct Cli {
    /// Increase logging verbosity (same as RUST_LOG=debug)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Visual-mode tuning shared by `run` and `web-run`.
#[derive(Args, Debug, Clone)]
struct VisualFlags {
    /// Visual mode cursor overlay toggle
    #[arg(long, value_parser = ["on", "off"], default_value = "on")]
    visual_cursor: String,

    /// Visual mode click pulse overlay toggle
    #[arg(long, value_parser = ["on", "off"], default_value = "on")]
    visual_click_pulse: String,

    /// Visual overlay scale factor
    #[arg(long, default_value_t = 1.0)]
    visual_scale: f64,

    /// Visual overlay color hex
    #[arg(long, default_value = "#3BA7FF")]
    visual_color: String,

    /// Use human-like mouse movement/click in visual mode
    #[arg(long, value_parser = ["on", "off"], default_value = "on")]
    visual_human_mouse: String,

    /// Human mouse speed factor in visual mode
    #[arg(long, default_value_t = 1.0)]
    visual_mouse_speed: f64,

    /// Mouse hold duration before mouseup in visual mode (ms)
    #[arg(long, default_value_t = 180)]
    visual_click_hold_ms: u64,
}

#[derive(Args, Debug, Clone)]
struct RunFlags {
    /// Approve sensitive observation actions without interactive prompt
    #[arg(long)]
    confirm_sensitive: bool,

    /// Enable strict verified-mode checks before accepting run output
    #[arg(long)]
    verified: bool,

    /// Run the browser headed with the visual overlay (web mode)
    #[arg(long)]
    visual: bool,

    /// Enable teaching mode: retries, handoff, and the learning window
    #[arg(long)]
    teaching: bool,

    /// Attach to a persistent web session id (web mode)
    #[arg(long)]
    attach: Option<String>,

    /// Keep the web browser open after the run (web mode)
    #[arg(long)]
    keep_open: bool,

    #[command(flatten)]
    visual_flags: VisualFlags,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a task: warden run "<task>"
    Run {
        task: String,

        /// Execution mode
        #[arg(long, value_parser = ["shell", "gui", "web"], default_value = "shell")]
        mode: String,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// Run a GUI task (alias for run --mode gui)
    GuiRun {
        task: String,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// Run a deterministic web task (alias for run --mode web)
    WebRun {
        task: String,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// Open or reuse a persistent web session
    WebOpen {
        /// Initial URL for a freshly created session
        #[arg(long)]
        url: Option<String>,
    },

    /// Release assistant control from a session
    WebRelease {
        #[arg(long)]
        attach: String,
    },

    /// Close a persistent web session
    WebClose {
        #[arg(long)]
        attach: String,
    },

    /// Show the latest run status
    Status,

    /// Tail logs for the latest run
    Logs {
        #[arg(long, default_value_t = 200)]
        tail: usize,
    },

    /// Validate runtime prerequisites
    Doctor {
        #[arg(long, value_parser = ["shell", "gui", "web"], default_value = "shell")]
        mode: String,
    },

    /// Live-stream observer events from a session
    Live {
        /// Session id, or `last`
        #[arg(long, default_value = "last")]
        attach: String,
    },

    /// Watch a session for warn/error events
    Watch {
        /// Session id, or `last`
        #[arg(long, default_value = "last")]
        attach: String,

        /// Only show events at this severity
        #[arg(long, value_parser = ["warn", "error"])]
        only: Option<String>,

        /// Skip events already seen by a previous watch
        #[arg(long)]
        since_last: bool,

        /// Ring the terminal bell on matching events
        #[arg(long)]
        notify: bool,
    },

    /// Internal: per-session control agent (spawned, not for direct use)
    #[command(hide = true)]
    ControlAgent {
        #[arg(long)]
        session_id: String,

        #[arg(long)]
        port: u16,

        #[arg(long)]
        sessions_dir: PathBuf,
    },
}

fn flag_on(value: &str) -> bool {
    value == "on"
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let outcome = dispatch(cli.command).await;
    if let Err(err) = outcome {
        eprintln!("error: {err}");
        let code = err
            .downcast_ref::<WardenError>()
            .map(WardenError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn dispatch(command: Option<Commands>) -> anyhow::Result<()> {
    let Some(command) = command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Commands::Run { task, mode, flags } => {
            commands::run::run_command(&task, &mode, build_options(flags)).await
        }
        Commands::GuiRun { task, flags } => {
            commands::run::run_command(&task, "gui", build_options(flags)).await
        }
        Commands::WebRun { task, flags } => {
            commands::run::run_command(&task, "web", build_options(flags)).await
        }
        Commands::WebOpen { url } => commands::web::web_open(url.as_deref()).await,
        Commands::WebRelease { attach } => commands::web::web_release(&attach).await,
        Commands::WebClose { attach } => commands::web::web_close(&attach).await,
        Commands::Status => commands::status::status_command().await,
        Commands::Logs { tail } => commands::status::logs_command(tail),
        Commands::Doctor { mode } => commands::doctor::doctor_command(&mode).await,
        Commands::Live { attach } => commands::live::live_command(&attach).await,
        Commands::Watch {
            attach,
            only,
            since_last,
            notify,
        } => commands::live::watch_command(&attach, only.as_deref(), since_last, notify).await,
        Commands::ControlAgent {
            session_id,
            port,
            sessions_dir,
        } => warden_session::run_control_agent(sessions_dir, session_id, port)
            .await
            .map_err(Into::into),
    }
}

fn build_options(flags: RunFlags) -> commands::run::RunOptions {
    commands::run::RunOptions {
        confirm_sensitive: flags.confirm_sensitive,
        verified: flags.verified,
        visual: flags.visual,
        teaching: flags.teaching,
        attach: flags.attach,
        keep_open: flags.keep_open,
        visual_cursor: flag_on(&flags.visual_flags.visual_cursor),
        visual_click_pulse: flag_on(&flags.visual_flags.visual_click_pulse),
        visual_scale: flags.visual_flags.visual_scale,
        visual_color: flags.visual_flags.visual_color,
        visual_human_mouse: flag_on(&flags.visual_flags.visual_human_mouse),
        visual_mouse_speed: flags.visual_flags.visual_mouse_speed,
        visual_click_hold: Duration::from_millis(flags.visual_flags.visual_click_hold_ms),
    }
}
