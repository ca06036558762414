//! MADS agent - command line entry point
//!
//! Runs one agent in one of three roles: a bridge publishing JSON lines read
//! from stdin, a feedback monitor printing every received message, or a
//! one-shot settings dump.

use clap::{Parser, Subcommand};
use mads_agent::config::SettingsSource;
use mads_agent::observability::init_default_logging;
use mads_agent::protocol::CONTROL_TOPIC;
use mads_agent::{
    version, Agent, AgentResult, ErrorKind, EventType, LoopControl, MessageType, MqttClient,
    MqttTransportFactory,
};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

/// Client-side MADS messaging agent
#[derive(Parser)]
#[command(name = "mads-agent")]
#[command(about = "MADS messaging agent: lifecycle events, pub/sub and broker settings")]
#[command(version)]
struct Cli {
    /// Settings URI: broker URL or local TOML settings file
    #[arg(short, long, global = true, env = "MADS_SETTINGS", value_name = "URI")]
    settings: Option<String>,

    /// Agent name (defaults to the command name)
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// Connect with TLS client authentication
    #[arg(long, global = true)]
    crypto: bool,

    /// Directory holding certificates and keys
    #[arg(long, global = true, value_name = "DIR")]
    keys_dir: Option<PathBuf>,

    /// Client certificate/key base name
    #[arg(long, global = true, value_name = "NAME")]
    key_client: Option<String>,

    /// Broker certificate base name
    #[arg(long, global = true, value_name = "NAME")]
    key_broker: Option<String>,

    /// Log TLS configuration details
    #[arg(long, global = true)]
    auth_verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish JSON lines from stdin until `exit`, EOF or Ctrl-C
    Bridge {
        /// Topic to publish on
        #[arg(long, default_value = "bridge")]
        topic: String,

        /// Publish this JSON document once instead of reading stdin
        #[arg(long)]
        message: Option<String>,

        /// Pause before connecting, in milliseconds
        #[arg(long, default_value_t = 250)]
        delay: u64,
    },
    /// Print every received message until Ctrl-C or a remote shutdown
    Feedback {
        /// Maximum printed body width
        #[arg(long, default_value_t = 65)]
        width: usize,

        /// Extra topics to listen on
        #[arg(long = "topic", value_name = "TOPIC")]
        topics: Vec<String>,
    },
    /// Fetch and print the agent's settings
    Settings {
        /// JSON indentation (0 for a single line)
        #[arg(long, default_value_t = 2)]
        indent: usize,

        /// Settings request timeout, in milliseconds
        #[arg(long, default_value_t = 2000)]
        timeout: u64,
    },
}

impl Commands {
    fn default_name(&self) -> &'static str {
        match self {
            Commands::Bridge { .. } => "bridge",
            Commands::Feedback { .. } => "feedback",
            Commands::Settings { .. } => "settings",
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();
    info!("Starting mads-agent v{}", version());

    if let Err(e) = run(cli).await {
        error!(code = e.code(), "Command failed: {}", e.description());
        process::exit(e.code());
    }

    info!("Agent shutdown complete");
}

async fn run(cli: Cli) -> AgentResult<()> {
    let name = cli
        .name
        .clone()
        .unwrap_or_else(|| cli.command.default_name().to_string());
    let mut agent = Agent::create(&name, cli.settings.as_deref(), &MqttTransportFactory)?;

    if let Some(dir) = &cli.keys_dir {
        agent.set_key_dir(dir)?;
    }
    if let Some(client) = &cli.key_client {
        agent.set_client_key_name(client)?;
    }
    if let Some(broker) = &cli.key_broker {
        agent.set_server_key_name(broker)?;
    }
    agent.set_auth_verbose(cli.auth_verbose)?;
    agent.init(cli.crypto)?;

    let shutdown = agent.shutdown_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down gracefully...");
            shutdown.trigger();
        }
    });

    let result = match cli.command {
        Commands::Bridge {
            topic,
            message,
            delay,
        } => run_bridge(&mut agent, &topic, message.as_deref(), Duration::from_millis(delay)).await,
        Commands::Feedback { width, topics } => run_feedback(&mut agent, width, &topics).await,
        Commands::Settings { indent, timeout } => {
            run_settings(&mut agent, indent, Duration::from_millis(timeout)).await
        }
    };

    agent.disconnect().await?;
    agent.destroy().await;
    result
}

async fn run_bridge(
    agent: &mut Agent<MqttClient>,
    topic: &str,
    message: Option<&str>,
    delay: Duration,
) -> AgentResult<()> {
    agent.connect(delay).await?;
    agent.register_event(EventType::Startup, None).await?;

    match message {
        Some(message) => agent.publish_json(topic, message).await?,
        None => publish_stdin_lines(agent, topic).await?,
    }

    agent.register_event(EventType::Shutdown, None).await
}

async fn publish_stdin_lines(agent: &mut Agent<MqttClient>, topic: &str) -> AgentResult<()> {
    let shutdown = agent.shutdown_handle();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0usize;

    loop {
        let line = tokio::select! {
            _ = shutdown.triggered() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" {
            break;
        }

        match agent.publish_json(topic, line).await {
            Ok(()) => published += 1,
            Err(e) if e.kind() == ErrorKind::Encoding => {
                warn!(error = %e.description(), "Skipping line that is not JSON");
            }
            Err(e) => return Err(e),
        }
    }

    info!(topic, published, "Bridge input closed");
    Ok(())
}

async fn run_feedback(
    agent: &mut Agent<MqttClient>,
    width: usize,
    topics: &[String],
) -> AgentResult<()> {
    for topic in topics {
        agent.subscribe(topic).await?;
    }
    agent.enable_remote_control()?;
    agent.connect(Duration::ZERO).await?;

    if !SettingsSource::resolve(agent.settings_uri()).is_local() {
        let timeout = agent.settings_timeout();
        if let Err(e) = agent.fetch_settings(timeout).await {
            warn!(error = %e.description(), "Continuing without broker settings");
        }
    }
    // Nothing configured: listen to everything
    if agent.subscriptions().iter().all(|topic| topic == CONTROL_TOPIC) {
        agent.subscribe("#").await?;
    }

    println!("{}", agent.info());
    agent.register_event(EventType::Startup, None).await?;

    agent
        .run_loop(|agent| Box::pin(feedback_step(agent, width)))
        .await?;

    agent.register_event(EventType::Shutdown, None).await
}

async fn feedback_step(agent: &mut Agent<MqttClient>, width: usize) -> AgentResult<LoopControl> {
    let message_type = match agent.receive(false).await {
        Ok(MessageType::None) => return Ok(LoopControl::Continue),
        Ok(message_type) => message_type,
        Err(e) if e.kind() == ErrorKind::Connection => return Err(e),
        Err(e) => {
            warn!(error = %e.description(), "Receive failed");
            return Ok(LoopControl::Continue);
        }
    };

    if let Some(command) = agent.remote_control() {
        info!(?command, "Stopping on remote command");
        return Ok(LoopControl::Break);
    }
    match agent.last_message() {
        Ok(Some((topic, body))) => print_message(&topic, message_type, &body.to_string(), width),
        Ok(None) => {}
        Err(e) => warn!(error = %e.description(), "Undecodable message"),
    }
    Ok(LoopControl::Continue)
}

fn print_message(topic: &str, message_type: MessageType, body: &str, width: usize) {
    let mut shown: String = body.chars().take(width).collect();
    if body.chars().count() > width {
        shown.push_str("...");
    }
    println!("{topic:>16} [{message_type}] {shown}");
}

async fn run_settings(
    agent: &mut Agent<MqttClient>,
    indent: usize,
    timeout: Duration,
) -> AgentResult<()> {
    agent.connect(Duration::ZERO).await?;
    agent.fetch_settings(timeout).await?;
    agent.print_settings(indent);
    Ok(())
}
