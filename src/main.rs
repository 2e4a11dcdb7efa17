use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use promptline::agent::{HttpWorkerAgent, WorkerAgent};
use promptline::anthropic::AnthropicClient;
use promptline::censorship::{
    CensorshipClassifier, CensorshipRecoveryPolicy, FallbackRewriter, LlmRewriter,
    PhraseClassifier, RewriteService,
};
use promptline::cli::{Cli, Command, MediaArg};
use promptline::config::PromptlineConfig;
use promptline::delivery::NoopBackend;
use promptline::orchestrator::Orchestrator;
use promptline::state_machine::{LifecycleState, RunState};
use promptline::{queue, ui};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = PromptlineConfig::load_from(&cli.config)?;

    match cli.command {
        Command::Run {
            queue,
            concurrency,
            retry_rounds,
            platform,
            media,
        } => {
            let overrides = Overrides {
                concurrency,
                platform,
                media,
            };
            run(overrides.apply(config), &queue, retry_rounds).await
        }
        Command::Check => check(&config).await,
        Command::Classify { message, code } => {
            classify(&config, &message, code.as_deref());
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "promptline=debug"
    } else {
        "promptline=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

struct Overrides {
    concurrency: Option<usize>,
    platform: Option<String>,
    media: Option<MediaArg>,
}

impl Overrides {
    fn apply(self, mut config: PromptlineConfig) -> PromptlineConfig {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(platform) = self.platform {
            config.platform = platform;
        }
        if let Some(media) = self.media {
            config.media = media.into();
        }
        config
    }
}

async fn run(config: PromptlineConfig, queue_path: &Path, retry_rounds: u32) -> Result<()> {
    let specs = queue::load_queue(queue_path)?;
    let agent: Arc<dyn WorkerAgent> = Arc::new(HttpWorkerAgent::new(&config.agent_url)?);

    let handle = Orchestrator::new(vec![agent], config.orchestrator_options())
        .with_policy(build_policy(&config))
        .with_backend(Arc::new(NoopBackend))
        .spawn()?;

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping run");
            let _ = stopper.stop().await;
        }
    });

    let count = handle.start(specs, config.run_settings()).await?;
    tracing::info!(count, queue = %queue_path.display(), "Queue loaded");
    let mut snapshot = ui::follow(&handle).await?;

    for round in 1..=retry_rounds {
        if snapshot.failed_count == 0 || snapshot.lifecycle_state == LifecycleState::Idle {
            break;
        }
        let count = handle.retry_failed().await?;
        if count == 0 {
            break;
        }
        ui::RunProgress::retry_round(round, retry_rounds, count);
        snapshot = ui::follow(&handle).await?;
    }

    Ok(())
}

fn build_policy(config: &PromptlineConfig) -> CensorshipRecoveryPolicy {
    let classifier = PhraseClassifier::with_extra_phrases(&config.censorship.phrases);

    let mut providers: Vec<Arc<dyn RewriteService>> = Vec::new();
    for provider in &config.censorship.providers {
        let client = match &provider.base_url {
            Some(url) => AnthropicClient::with_base_url(config.api_key.clone(), url.clone()),
            None => AnthropicClient::new(config.api_key.clone()),
        };
        match client {
            Ok(client) => providers.push(Arc::new(LlmRewriter::new(client, &provider.model))),
            Err(e) => {
                tracing::warn!(model = %provider.model, error = %e, "Rewrite provider disabled");
            }
        }
    }

    let rewriter: Option<Arc<dyn RewriteService>> = if providers.is_empty() {
        None
    } else {
        Some(Arc::new(FallbackRewriter::new(providers)))
    };
    CensorshipRecoveryPolicy::new(
        Box::new(classifier),
        rewriter,
        config.censorship.max_rewrites,
    )
}

async fn check(config: &PromptlineConfig) -> Result<()> {
    let mut probe = RunState::new();
    probe.init(Vec::new(), config.run_settings())?;
    println!("✓ config ok ({} slot(s), platform {})", config.concurrency, config.platform);

    let agent = HttpWorkerAgent::new(&config.agent_url)?;
    let agent_id = agent
        .ping()
        .await
        .with_context(|| format!("agent at {} did not answer PING", config.agent_url))?;
    println!("✓ agent {agent_id} ready at {}", agent.base_url());

    if config.api_key.is_empty() {
        println!("! no API key set, censored prompts will not be rewritten");
    }
    Ok(())
}

fn classify(config: &PromptlineConfig, message: &str, code: Option<&str>) {
    let classifier = PhraseClassifier::with_extra_phrases(&config.censorship.phrases);
    match classifier.classify(message, code) {
        Some(indicator) => println!("censorship (matched \"{indicator}\")"),
        None => println!("not censorship"),
    }
}
