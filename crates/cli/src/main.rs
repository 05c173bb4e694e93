use clap::{Args, Parser, Subcommand};
use lib::providers::create_provider;
use lib::relay::{self, unescape, RelayOptions, ReplyTarget};
use lib::split::TrailingFragment;

#[derive(Parser)]
#[command(name = "chatreply")]
#[command(about = "Relay input lines to a chat and print the replies they get", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    relay: RelayArgs,

    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a template configuration file (active provider and empty credentials).
    Init {
        /// Config file path (default: CHATREPLY_CONFIG_PATH or <config dir>/chatreply/config.json)
        #[arg(long, short = 'f', value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

/// Relay flags, used when no subcommand is given. Lines are read from stdin; matched
/// `<line><separator><reply>` pairs are written to stdout.
#[derive(Args)]
struct RelayArgs {
    /// Config file path (default: CHATREPLY_CONFIG_PATH or <config dir>/chatreply/config.json)
    #[arg(long, short = 'f', value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Printed between a line and its reply
    #[arg(long, short = 's', default_value = relay::options::DEFAULT_FIELD_SEPARATOR)]
    separator: String,

    /// Splits stdin into messages (backslash escapes allowed)
    #[arg(long = "msg-sep", value_name = "STR", default_value = "\\n")]
    msg_sep: String,

    /// Terminates every printed pair (backslash escapes allowed)
    #[arg(long = "out-sep", value_name = "STR", default_value = "\\n")]
    out_sep: String,

    /// Reaction attached to sent messages while waiting for replies
    #[arg(long, value_name = "EMOJI", default_value = relay::options::DEFAULT_WATCH_MARKER)]
    watch_emoji: String,

    /// Send the messages and exit without waiting for replies
    #[arg(long)]
    skip_replies: bool,

    /// Replies to collect per message before it is resolved (-1: keep collecting until Ctrl+C)
    #[arg(long, short = 'n', value_name = "N", default_value_t = 1, allow_negative_numbers = true)]
    replies: i64,

    /// Drop trailing input that is not closed by a separator
    #[arg(long)]
    drop_unterminated: bool,

    /// Send every chunk as text, even when it names an existing file
    #[arg(long)]
    as_text: bool,
}

impl RelayArgs {
    /// Flag values only; `relay::run` validates the result before touching the provider.
    fn options(&self) -> anyhow::Result<RelayOptions> {
        Ok(RelayOptions {
            field_separator: unescape(&self.separator),
            message_separator: unescape(&self.msg_sep),
            output_separator: unescape(&self.out_sep),
            watch_marker: self.watch_emoji.clone(),
            reply_target: ReplyTarget::from_flag(self.replies)?,
            skip_replies: self.skip_replies,
            trailing: if self.drop_unterminated {
                TrailingFragment::Drop
            } else {
                TrailingFragment::Emit
            },
            as_text: self.as_text,
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.command {
        Some(Commands::Version) => {
            println!("chatreply {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            if let Err(e) = run_relay(cli.relay).await {
                log::error!("relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let _dir = lib::init::init_config_dir(&path)?;
    println!("configuration at {}", path.display());
    Ok(())
}

async fn run_relay(args: RelayArgs) -> anyhow::Result<()> {
    let options = args.options()?;

    // Listen before the send phase; a Ctrl+C while stdin is still open ends it between sends.
    let signal = tokio::spawn(relay::shutdown_signal());

    let (config, path) = lib::config::load_config(args.config)?;
    log::debug!("loaded configuration from {}", path.display());
    let provider = create_provider(&config)?;

    let stdout = std::io::stdout();
    let summary = relay::run(
        provider.as_ref(),
        std::io::stdin(),
        stdout.lock(),
        &options,
        async {
            let _ = signal.await;
        },
    )
    .await?;

    log::info!(
        "sent {} message(s), printed {} repl(ies), exit: {:?}",
        summary.sent,
        summary.emitted,
        summary.exit
    );
    if !summary.cleanup.failed.is_empty() {
        log::warn!(
            "{} watch marker(s) could not be removed",
            summary.cleanup.failed.len()
        );
    }
    Ok(())
}
