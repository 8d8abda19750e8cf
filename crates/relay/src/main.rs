//! Command-line entry point for relay.

use std::path::PathBuf;

use eyre::WrapErr as _;

#[derive(clap::Parser)]
#[command(name = "relay", about = "Multiplexed terminal sessions and agent runs over one connection")]
struct Args {
    /// Enable debug logging to a timestamped file under the data directory
    #[arg(long, global = true)]
    debug: bool,

    /// Config file (defaults to ~/.config/relay/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the server (default when no command given).
    Serve {
        /// Address to listen on, overriding the config.
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Render a session recording as the final screen it would show.
    Render {
        /// Path to a `<session>.log` recording.
        log: PathBuf,
        #[arg(long, default_value_t = 80)]
        cols: u16,
        #[arg(long, default_value_t = 24)]
        rows: u16,
    },
    /// Print the effective configuration.
    Config,
}

fn load_config(path: Option<&std::path::Path>) -> eyre::Result<relay_config::Config> {
    match path {
        Some(path) => relay_config::load_from(path)
            .wrap_err_with(|| format!("failed to load config from {}", path.display())),
        None => relay_config::load().wrap_err("failed to load relay configuration"),
    }
}

fn init_logging(debug: bool) -> eyre::Result<()> {
    if debug {
        let log_dir = relay_protocol::data_dir().join("logs");
        std::fs::create_dir_all(&log_dir)
            .wrap_err_with(|| format!("failed to create {}", log_dir.display()))?;

        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let log_path = log_dir.join(format!("{timestamp}.log"));
        let log_file = std::fs::File::create(&log_path)?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .init();

        eprintln!("debug log: {}", log_path.display());
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }
    Ok(())
}

fn render(log: &std::path::Path, cols: u16, rows: u16) -> eyre::Result<()> {
    let data =
        std::fs::read(log).wrap_err_with(|| format!("failed to read {}", log.display()))?;
    let mut screen = relay_server::screen::Screen::new(rows, cols);
    screen.push(&data);

    println!("{}", screen.render());
    let (rows, cols) = screen.size();
    let (row, col) = screen.cursor_position();
    eprintln!("\x1b[2m[{cols}x{rows}, cursor at row {row}, col {col}]\x1b[0m");
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = <Args as clap::Parser>::parse();
    init_logging(args.debug)?;

    let command = args.command.unwrap_or(Command::Serve { bind: None });

    match command {
        Command::Serve { bind } => {
            let mut config = load_config(args.config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            relay_server::serve(config).await?;
        }
        Command::Render { log, cols, rows } => {
            render(&log, cols, rows)?;
        }
        Command::Config => {
            let config = load_config(args.config.as_deref())?;
            let text = toml::to_string_pretty(&config).wrap_err("failed to encode config")?;
            println!("# {}", relay_config::config_path().display());
            print!("{text}");
        }
    }

    Ok(())
}
