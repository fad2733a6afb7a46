use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use talkative::config::{self, Config};
use talkative::conversation::ConversationState;
use talkative::llm::OpenAiClient;
use talkative::query::StreamingQueryHandler;

#[derive(Parser)]
#[command(name = "talkative")]
#[command(about = "Context-aware streaming chat with a local browser UI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default configuration file (the API key is read from OPENAI_API_KEY or .env).
    Init {
        /// Config file path (default: TALKATIVE_CONFIG_PATH or ~/.talkative/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Serve the browser chat UI (default when no subcommand is given).
    Serve {
        /// Config file path (default: TALKATIVE_CONFIG_PATH or ~/.talkative/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config or 7860)
        #[arg(long, short)]
        port: Option<u16>,

        /// Do not open the UI in the default browser.
        #[arg(long)]
        no_browser: bool,
    },

    /// Chat from the terminal; answers stream in as they are generated.
    Chat {
        /// Config file path (default: TALKATIVE_CONFIG_PATH or ~/.talkative/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// List the models offered by the completion endpoint.
    Models {
        /// Config file path (default: TALKATIVE_CONFIG_PATH or ~/.talkative/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match dotenvy::dotenv() {
        Ok(path) => log::debug!("loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => log::warn!("ignoring .env: {}", e),
    }

    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Serve {
        config: None,
        port: None,
        no_browser: false,
    });

    match command {
        Commands::Version => {
            println!("talkative {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Init { config } => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Serve {
            config,
            port,
            no_browser,
        } => {
            if let Err(e) = run_serve(config, port, no_browser).await {
                log::error!("serve failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Commands::Chat { config } => {
            if let Err(e) = run_chat(config).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Commands::Models { config } => {
            if let Err(e) = run_models(config).await {
                log::error!("listing models failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    if talkative::init::init_config_file(&path)? {
        println!("wrote default configuration to {}", path.display());
    } else {
        println!("configuration already exists at {}", path.display());
    }
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    no_browser: bool,
) -> anyhow::Result<()> {
    let (mut config, _) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    if no_browser {
        config.gateway.open_browser = false;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    talkative::gateway::run_gateway(config).await
}

fn openai_client(config: &Config) -> OpenAiClient {
    let api_key = config::resolve_api_key(config);
    if api_key.is_none() {
        log::warn!("{} is not set; requests will likely be rejected", config::API_KEY_ENV);
    }
    OpenAiClient::new(config.completion.base_url.clone(), api_key)
}

async fn run_chat(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let (config, _) = config::load_config(config_path)?;
    let handler = StreamingQueryHandler::new(
        openai_client(&config),
        ConversationState::shared(),
        config.query_settings(),
    );
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }

        let mut answer = match handler.query(input).await {
            Ok(answer) => answer,
            Err(e) => {
                eprintln!("chat error: {}", e);
                continue;
            }
        };
        // Each value is the whole answer so far; print only what grew since the last one.
        let mut printed = 0;
        write!(stdout, "< ")?;
        while let Some(value) = answer.next().await {
            match value {
                Ok(text) => {
                    if let Some(grown) = text.get(printed..) {
                        write!(stdout, "{}", grown)?;
                        stdout.flush()?;
                    }
                    printed = text.len();
                }
                Err(e) => {
                    writeln!(stdout)?;
                    eprintln!("chat error: {}", e);
                    break;
                }
            }
        }
        writeln!(stdout)?;
    }

    Ok(())
}

async fn run_models(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let models = openai_client(&config).list_models().await?;
    for model in models {
        println!("{}", model);
    }
    Ok(())
}
