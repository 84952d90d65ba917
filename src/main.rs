//! Binary entrypoint for the advBBS CLI.
//!
//! Commands:
//! - `start` - run the BBS station
//! - `init` - write a default config.toml for the operator to edit
//! - `status` - print station, peer, and route state
//! - `hash-password` - argon2-hash a password read from stdin

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use advbbs::bbs::BbsServer;
use advbbs::config::Config;

#[derive(Parser)]
#[command(name = "advbbs")]
#[command(about = "Federated BBS for Meshtastic mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the BBS station
    Start,
    /// Write a default configuration file
    Init,
    /// Show station status and federation state
    Status,
    /// Hash a password read from stdin (for scripts and provisioning)
    HashPassword,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            // No logging yet; this runs before a config exists.
            Config::create_default(&cli.config).await?;
            println!("Wrote {}. Edit it, then run: advbbs start", cli.config);
            return Ok(());
        }
        Commands::HashPassword => {
            return hash_password_from_stdin();
        }
        _ => {}
    }

    let mut config = Config::load(&cli.config).await?;
    init_logging(&config, cli.verbose);

    // The passphrase may be kept out of the config file; prompt for it.
    if config.bbs.passphrase.is_empty() {
        config.bbs.passphrase = rpassword::prompt_password("Operator passphrase: ")?;
    }

    match cli.command {
        Commands::Start => {
            info!("starting advBBS v{}", env!("CARGO_PKG_VERSION"));
            let mut server = BbsServer::new(config).await?;
            server.connect();
            server.run().await?;
        }
        Commands::Status => {
            let server = BbsServer::new(config).await?;
            server.show_status().await?;
        }
        Commands::Init | Commands::HashPassword => unreachable!(),
    }
    Ok(())
}

fn hash_password_from_stdin() -> Result<()> {
    use argon2::Argon2;
    use password_hash::{PasswordHasher, SaltString};
    use std::io::BufRead;

    let mut password = String::new();
    std::io::stdin().lock().read_line(&mut password)?;
    let password = password.trim_end();
    if password.len() < 8 {
        eprintln!("Error: password too short (min 8 characters)");
        std::process::exit(1);
    }
    let salt = SaltString::generate(&mut rand::thread_rng());
    match Argon2::default().hash_password(password.as_bytes(), &salt) {
        Ok(hash) => {
            println!("{}", hash);
            Ok(())
        }
        Err(e) => {
            eprintln!("Hash error: {e}");
            std::process::exit(1);
        }
    }
}

/// Timestamped single-line logging to console and optional files. Records
/// with `target: "security"` are mirrored into the security log.
fn init_logging(config: &Config, verbosity: u8) {
    use std::io::Write;

    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => config
            .logging
            .level
            .parse()
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.logging.file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    let security_path = config.logging.security_file.clone();
    let is_tty = atty::is(atty::Stream::Stdout);

    match log_file {
        Some(file) => {
            let file = std::sync::Arc::new(std::sync::Mutex::new(file));
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if record.target() == "security" {
                    if let Some(path) = &security_path {
                        if let Ok(mut sec) = std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(path)
                        {
                            let _ = writeln!(sec, "{}", line);
                        }
                    }
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    }
    let _ = builder.try_init();
}
