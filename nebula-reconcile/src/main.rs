//! nebula-reconcile: converges OpenNebula templates, images and virtual
//! networks to a declared manifest.
//!
//! - `apply` creates, updates and prunes objects, recording what it did in a
//!   state file
//! - `destroy` deletes everything recorded in the state file
//! - `show` prints the remote record of one object

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nebula_reconcile::agent::{Agent, Manifest, Report, State};
use nebula_reconcile::clients::SessionClient;
use nebula_reconcile::config::{Config, DEFAULT_HTTP_TIMEOUT};
use nebula_reconcile::document::{ObjectRef, ObservedObject};
use nebula_reconcile::poller::PollBudget;
use nebula_reconcile::reconciler::{ImageKind, ResourceKind};
use nebula_reconcile::resolver::MatchPolicy;

/// OpenNebula reconciler
#[derive(Parser, Debug)]
#[command(name = "nebula-reconcile", version, about)]
struct Args {
    /// XML-RPC endpoint (e.g., http://frontend:2633/RPC2)
    #[arg(long, env = "OPENNEBULA_ENDPOINT")]
    endpoint: String,

    /// User name for the session credential
    #[arg(long, env = "OPENNEBULA_USERNAME")]
    username: String,

    /// Password for the session credential
    #[arg(long, env = "OPENNEBULA_PASSWORD", hide_env_values = true)]
    password: String,

    /// HTTP timeout per remote call in seconds
    #[arg(long, default_value_t = DEFAULT_HTTP_TIMEOUT.as_secs())]
    http_timeout: u64,

    /// Take the first object when several share a name instead of failing
    #[arg(long)]
    first_match: bool,

    /// Maximum time to wait for an object to become ready, in seconds
    #[arg(long, default_value_t = PollBudget::default().timeout.as_secs())]
    ready_timeout: u64,

    /// Interval between readiness polls in seconds
    #[arg(long, default_value_t = PollBudget::default().poll_interval.as_secs())]
    poll_interval: u64,

    /// Minimum spacing between readiness polls in seconds
    #[arg(long, default_value_t = PollBudget::default().min_interval.as_secs())]
    min_interval: u64,

    /// Readiness timeout for images in seconds, overriding --ready-timeout
    #[arg(long)]
    image_ready_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Converge the remote objects to a manifest
    Apply {
        /// JSON manifest of desired objects
        #[arg(long)]
        manifest: PathBuf,

        /// State file written after the run
        #[arg(long, default_value = "nebula-state.json")]
        state: PathBuf,
    },
    /// Delete every object recorded in the state file
    Destroy {
        #[arg(long, default_value = "nebula-state.json")]
        state: PathBuf,
    },
    /// Print the remote record of one object as JSON
    Show {
        #[arg(value_enum)]
        kind: Kind,

        name: String,

        /// Known numeric id, tried before the name lookup
        #[arg(long)]
        id: Option<i64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Template,
    Image,
    Network,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config::new(&self.endpoint, &self.username, &self.password);
        config.http_timeout = Duration::from_secs(self.http_timeout);
        if self.first_match {
            config.match_policy = MatchPolicy::FirstMatch;
        }
        config.budget.timeout = Duration::from_secs(self.ready_timeout);
        config.budget.poll_interval = Duration::from_secs(self.poll_interval);
        config.budget.min_interval = Duration::from_secs(self.min_interval);
        if let Some(secs) = self.image_ready_timeout {
            let image = PollBudget {
                timeout: Duration::from_secs(secs),
                ..config.budget
            };
            config.kind_budgets.insert(ImageKind::KIND.to_string(), image);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nebula_reconcile=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.config();
    info!(endpoint = %config.endpoint, user = %config.username, "Connecting");

    let client = Arc::new(SessionClient::connect(&config).context("Invalid configuration")?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received SIGINT, abandoning readiness waits");
            on_signal.cancel();
        }
    });

    let agent = Agent::new(client, &config).with_cancellation(cancel);

    match args.command {
        Command::Apply { manifest, state } => {
            let manifest = Manifest::load(&manifest).await?;
            let mut current = State::load(&state).await?;
            let report = agent.apply(&manifest, &mut current).await;
            current.save(&state).await?;
            finish(report)
        }
        Command::Destroy { state } => {
            let mut current = State::load(&state).await?;
            let report = agent.destroy(&mut current).await;
            current.save(&state).await?;
            finish(report)
        }
        Command::Show { kind, name, id } => {
            let object = ObjectRef::new(id, name);
            let found: Option<ObservedObject> = match kind {
                Kind::Template => agent.templates().read(&object).await?,
                Kind::Image => agent.images().read(&object).await?,
                Kind::Network => agent.networks().read(&object).await?,
            };
            let Some(found) = found else {
                bail!("{kind:?} {:?} not found", object.name);
            };
            println!("{}", serde_json::to_string_pretty(&found)?);
            Ok(())
        }
    }
}

fn finish(report: Report) -> Result<()> {
    info!(
        created = report.created.len(),
        updated = report.updated.len(),
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Run complete"
    );
    if report.is_success() {
        return Ok(());
    }
    for (object, reason) in &report.failed {
        eprintln!("{object}: {reason}");
    }
    bail!("{} object(s) failed to reconcile", report.failed.len())
}
