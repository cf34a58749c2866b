//! Relay Daemon - Command-Line Driver for Session Turns
//!
//! Wires the producer and consumer sides together in one process around an
//! in-process broker. A subscriber is attached to the session before the turn
//! starts, so everything the turn publishes is rendered as it arrives.
//!
//! # Usage
//!
//! ```bash
//! # Ask a question through the OpenAI-compatible backend
//! OPENAI_API_KEY=sk-... relay-daemon ask --session abc "What is Rust?"
//!
//! # Same flow without credentials
//! relay-daemon ask --session abc --scripted "Anything"
//!
//! # Fixed demo sequence
//! relay-daemon demo
//!
//! # Mint a subscription token for a requester granted in [access.grants]
//! relay-daemon token --session abc --requester alice
//!
//! # Verbose logging
//! RUST_LOG=relay_core=debug relay-daemon demo
//! ```

mod render;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use relay_core::{
    default_config_path, load_config_from_path, AllowListAuthorizer, AnimationState,
    ChannelAddress, ConfigOverrides, ConnectionState, DemoConfig, DemoRunner, InProcessBroker,
    IssuerRefresher, OpenAiGenerator, Publisher, RelayConfig, Requester, ScriptedGenerator,
    SessionSubscriber, SessionView, StepStatus, TextGenerator, TokenIssuer, TopicSet, TurnError,
    TurnRequest, TurnRunner,
};

use render::Renderer;

/// Requester identity the daemon subscribes as
const LOCAL_REQUESTER: &str = "relay-daemon";

/// Relay Daemon - run session turns and watch them stream
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Model override
    #[arg(long, global = true)]
    model: Option<String>,

    /// Generation endpoint override
    #[arg(long, value_name = "URL", global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one turn and render it from an attached subscriber
    Ask {
        /// Session id (random when omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Use the scripted generator instead of the HTTP backend
        #[arg(long)]
        scripted: bool,

        /// Question for the turn
        question: String,
    },

    /// Publish the fixed demo sequence and render it
    Demo {
        /// Session id (random when omitted)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Mint and print a subscription token (local debugging aid)
    ///
    /// The requester must be granted the session in `[access.grants]`. The
    /// signing key lives only in this process, so the printed token shows
    /// scope and expiry but is not accepted by any other broker.
    Token {
        /// Session id
        #[arg(short, long)]
        session: String,

        /// Requester identity to authorize
        #[arg(short, long)]
        requester: String,

        /// Comma-separated topics (all when omitted)
        #[arg(short, long, value_delimiter = ',')]
        topics: Vec<String>,
    },
}

/// Initialize logging; `RUST_LOG` overrides the defaults
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("relay_daemon=info,relay_core=info")
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<RelayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref model) = args.model {
        overrides = overrides.with_model(model.clone());
    }
    if let Some(ref base_url) = args.base_url {
        overrides = overrides.with_base_url(base_url.clone());
    }
    overrides
        .apply(&mut config)
        .context("Invalid command-line overrides")?;

    info!(source = %config.source(), "Configuration loaded");
    Ok(config)
}

/// One broker plus the issuer that guards it, with grants from the config
struct Relay {
    broker: Arc<InProcessBroker>,
    authorizer: Arc<AllowListAuthorizer>,
    issuer: Arc<TokenIssuer>,
}

impl Relay {
    fn new(config: &RelayConfig) -> Self {
        let broker = Arc::new(InProcessBroker::new());
        let authorizer = Arc::new(AllowListAuthorizer::new());
        for (requester, sessions) in &config.grants {
            for session in sessions {
                authorizer.grant(requester.as_str(), session.as_str());
            }
        }
        let issuer = Arc::new(
            TokenIssuer::new(broker.clone(), config.tokens.clone())
                .with_authorizer(authorizer.clone()),
        );
        Self {
            broker,
            authorizer,
            issuer,
        }
    }
}

fn session_or_random(session: Option<String>) -> String {
    session.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

fn turn_settled(view: &SessionView) -> bool {
    view.has_failed()
        || view
            .progress("complete")
            .is_some_and(|p| p.status == StepStatus::Completed)
}

/// What publishes on the session while the subscriber watches
enum Producer {
    /// One generated turn
    Turn {
        question: String,
        generator: Arc<dyn TextGenerator>,
    },
    /// The fixed demo sequence
    Demo,
}

async fn run_session(config: RelayConfig, session: String, producer: Producer) -> Result<()> {
    let relay = Relay::new(&config);
    // The daemon's own subscriber always reads the session it produces
    relay.authorizer.grant(LOCAL_REQUESTER, session.as_str());

    let channel = ChannelAddress::for_session(&session);
    let requester = Requester::new(LOCAL_REQUESTER);
    let token = relay
        .issuer
        .issue(&channel, &TopicSet::all(), &requester)
        .await
        .context("Failed to mint subscription token")?;
    let refresher = Arc::new(IssuerRefresher::new(
        relay.issuer.clone(),
        channel.clone(),
        TopicSet::all(),
        requester,
    ));

    let subscriber =
        SessionSubscriber::attach(relay.broker.clone(), token, refresher, config.session.clone());
    subscriber
        .connection_watch()
        .wait_for(|s| !matches!(s, ConnectionState::Connecting))
        .await
        .context("Subscription ended before connecting")?;
    info!(channel = %channel, "Subscriber attached");

    let render = tokio::spawn(follow(subscriber.view_watch(), subscriber.animation_watch()));

    let publisher = Publisher::spawn(relay.broker.clone());
    let outcome = match producer {
        Producer::Turn {
            question,
            generator,
        } => TurnRunner::new(publisher, generator, config.turn.clone())
            .run(&TurnRequest::new(session.as_str(), question))
            .await
            .map(|outcome| info!(channel = %channel, chunks = outcome.chunks, "Turn finished")),
        Producer::Demo => DemoRunner::new(publisher, DemoConfig::default())
            .run(&session)
            .await
            .map(|outcome| {
                info!(
                    channel = %channel,
                    duration_ms = outcome.duration.as_millis(),
                    "Demo finished"
                );
            }),
    };

    let published = match outcome {
        Ok(()) => true,
        Err(TurnError::InvalidSession | TurnError::EmptyQuestion) => false,
        Err(ref e) => {
            error!(channel = %channel, error = %e, "Session producer failed");
            true
        }
    };

    if published {
        let settle = config.session.animation.quiescence + Duration::from_secs(5);
        tokio::select! {
            settled = wait_until_idle(&subscriber, settle) => {
                if !settled {
                    warn!(channel = %channel, "Animation did not return to idle in time");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
            }
        }
    }

    subscriber.detach().await;
    render.abort();
    println!();

    outcome.map_err(Into::into)
}

/// Wait for the turn to land in the view, then for the animation to settle
async fn wait_until_idle(subscriber: &SessionSubscriber, within: Duration) -> bool {
    let mut view = subscriber.view_watch();
    let mut animation = subscriber.animation_watch();
    tokio::time::timeout(within, async move {
        if view.wait_for(turn_settled).await.is_err() {
            return false;
        }
        animation
            .wait_for(|s| *s == AnimationState::Idle)
            .await
            .is_ok()
    })
    .await
    .unwrap_or(false)
}

async fn follow(
    mut view: watch::Receiver<SessionView>,
    mut animation: watch::Receiver<AnimationState>,
) {
    let mut renderer = Renderer::default();
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                renderer.view(&view.borrow_and_update());
            }
            changed = animation.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *animation.borrow_and_update();
                renderer.animation(state);
            }
        }
    }
}

async fn mint_token(
    config: RelayConfig,
    session: String,
    requester: String,
    topics: Vec<String>,
) -> Result<()> {
    let relay = Relay::new(&config);

    let topics = if topics.is_empty() {
        TopicSet::all()
    } else {
        TopicSet::parse(topics.iter().map(String::as_str)).context("Invalid topic list")?
    };
    let token = relay
        .issuer
        .issue(
            &ChannelAddress::for_session(&session),
            &topics,
            &Requester::new(requester),
        )
        .await
        .context("Token request refused; grant the requester in [access.grants]")?;

    println!("{}", serde_json::to_string_pretty(&token)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let config = load_config(&args)?;

    match args.command {
        Command::Ask {
            session,
            scripted,
            question,
        } => {
            let generator: Arc<dyn TextGenerator> = if scripted {
                Arc::new(ScriptedGenerator::demo())
            } else {
                Arc::new(OpenAiGenerator::from_env(config.base_url.clone()))
            };
            run_session(
                config,
                session_or_random(session),
                Producer::Turn {
                    question,
                    generator,
                },
            )
            .await
        }
        Command::Demo { session } => {
            run_session(config, session_or_random(session), Producer::Demo).await
        }
        Command::Token {
            session,
            requester,
            topics,
        } => mint_token(config, session, requester, topics).await,
    }
}
