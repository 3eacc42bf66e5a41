use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Chat relay gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration file with a generated secret and a sample user.
    Init {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (HTTP health + WebSocket relay).
    Gateway {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 8321)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Mint a local development token signed with the configured secret.
    Token {
        /// User id to embed in the token (must be in auth.users to connect)
        #[arg(long, value_name = "ID")]
        user: String,

        /// Token scheme: "jwt" (session) or "oauth2" (delegated)
        #[arg(long, default_value = "jwt")]
        scheme: String,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: i64,

        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Chat through a running gateway (interactive).
    Chat {
        /// Bearer token for the connection
        #[arg(long)]
        token: String,

        /// Token scheme: "jwt" or "oauth2"
        #[arg(long, default_value = "jwt")]
        auth_type: String,

        /// Gateway WebSocket URL (default built from config bind/port)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("relay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Token {
            user,
            scheme,
            ttl,
            config,
        }) => {
            if let Err(e) = run_token(user, scheme, ttl, config) {
                log::error!("token failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            token,
            auth_type,
            url,
            config,
        }) => {
            if let Err(e) = run_chat(token, auth_type, url, config).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    lib::config::init_config(&path)?;
    println!("initialized configuration at {}", path.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, _path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{}",
        config.gateway.bind,
        config.gateway.port
    );
    lib::gateway::run_gateway(config).await
}

fn run_token(
    user: String,
    scheme: String,
    ttl: i64,
    config_path: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let (config, _path) = lib::config::load_config(config_path)?;
    let secret = lib::config::resolve_jwt_secret(&config)
        .ok_or_else(|| anyhow::anyhow!("auth secret not configured (run `relay init`)"))?;
    let scheme = lib::auth::AuthScheme::parse(&scheme).map_err(|e| anyhow::anyhow!("{}", e))?;
    let token = match scheme {
        lib::auth::AuthScheme::Session => lib::auth::issue_session_token(&secret, &user, ttl)?,
        lib::auth::AuthScheme::Delegated => lib::auth::issue_delegated_token(&secret, &user, ttl)?,
    };
    println!("{}", token);
    Ok(())
}

async fn run_chat(
    token: String,
    auth_type: String,
    url: Option<String>,
    config_path: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    use std::io::{self, BufRead, Write};

    let base = match url {
        Some(u) => u,
        None => {
            let (config, _path) = lib::config::load_config(config_path)?;
            format!("ws://{}:{}/ws", config.gateway.bind, config.gateway.port)
        }
    };
    let url = format!("{}?token={}&auth_type={}", base, token, auth_type);

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await?;

    // First frame after a successful bind is user_info.
    match ws.next().await {
        Some(Ok(Message::Text(text))) => {
            let v: serde_json::Value = serde_json::from_str(&text)?;
            match v.get("type").and_then(|t| t.as_str()) {
                Some("user_info") => {
                    let name = v.get("username").and_then(|u| u.as_str()).unwrap_or("?");
                    println!("connected as {}", name);
                }
                Some("error") => {
                    anyhow::bail!(
                        "gateway rejected connection: {}",
                        v.get("message").and_then(|m| m.as_str()).unwrap_or("unknown")
                    );
                }
                _ => println!("{}", text),
            }
        }
        Some(Ok(Message::Close(frame))) => {
            anyhow::bail!("connection closed: {:?}", frame);
        }
        other => anyhow::bail!("unexpected first frame: {:?}", other),
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }

        let frame = serde_json::json!({ "type": "message", "content": input });
        ws.send(Message::Text(frame.to_string())).await?;

        // Print advisories until the reply (or a terminal frame) arrives.
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let v: serde_json::Value = serde_json::from_str(&text)?;
                    match v.get("type").and_then(|t| t.as_str()) {
                        Some("message") => {
                            let content =
                                v.get("content").and_then(|c| c.as_str()).unwrap_or("");
                            println!("< {}", content);
                            break;
                        }
                        Some("token_refresh_required") => {
                            eprintln!("(token refresh required)");
                        }
                        Some("error") => {
                            let msg =
                                v.get("message").and_then(|m| m.as_str()).unwrap_or("unknown");
                            eprintln!("gateway error: {}", msg);
                        }
                        _ => println!("{}", text),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(f) = frame {
                        eprintln!("connection closed ({}): {}", u16::from(f.code), f.reason);
                    } else {
                        eprintln!("connection closed");
                    }
                    return Ok(());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}
