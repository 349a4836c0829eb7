use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agentsessiond::agent::EchoAgentProvider;
use agentsessiond::api::{router, AppState};
use agentsessiond::auth::AuthState;
use agentsessiond::config::AppConfig;
use agentsessiond::db::Database;
use agentsessiond::event::{EventBus, EventLog};
use agentsessiond::git::GitRuntime;
use agentsessiond::message::MessageRepository;
use agentsessiond::notify::{LogChannel, NotificationDispatcher};
use agentsessiond::runner::SessionRunner;
use agentsessiond::session::SessionRepository;
use agentsessiond::user::{IdentityRepository, RepoRepository, UserRepository};

#[derive(Debug, Parser)]
#[command(author, version, about = "Coding agent session orchestration daemon", propagate_version = true)]
struct Cli {
    /// Override the config file path
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run database migrations and start the HTTP/WebSocket server
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config.log_level);

    match cli.command {
        Command::Serve => serve(config),
    }
}

fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("agentsessiond={log_level},tower_http={log_level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}

#[tokio::main]
async fn serve(config: AppConfig) -> Result<()> {
    let db_path = config.resolved_database_path();
    tracing::info!(path = %db_path.display(), "opening database");
    let database = Database::new(&db_path).await?;
    database.run_migrations().await?;

    let pool = database.pool().clone();
    let users = UserRepository::new(pool.clone());
    let identities = IdentityRepository::new(pool.clone());
    let repos = RepoRepository::new(pool.clone());
    let sessions = SessionRepository::new(pool.clone());
    let messages = MessageRepository::new(pool.clone());

    let log = EventLog::new(pool.clone());
    let dispatcher = Arc::new(NotificationDispatcher::new(
        users.clone(),
        sessions.clone(),
        vec![Arc::new(LogChannel)],
    ));
    let bus = EventBus::new(log, dispatcher);

    let git = GitRuntime::new(config.repos_root());
    let provider = Arc::new(EchoAgentProvider::new());
    let runner = SessionRunner::new(
        sessions.clone(),
        messages.clone(),
        identities.clone(),
        bus.clone(),
        git,
        provider,
        config.worktrees_root(),
    );

    let auth = AuthState::new(&config.jwt_secret);
    let state = AppState {
        sessions,
        messages,
        users,
        identities,
        repos,
        bus,
        runner,
        auth,
        config: Arc::new(config.clone()),
    };

    let app = router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .await
        .context("serving http")?;

    Ok(())
}
