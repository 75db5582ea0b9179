//! convflow - regex-gated conversation flows over a JSON-lines transport.

use convflow_core::{
    ConversationDefinition, ConversationRuntime, CoreError, FlowBuilder, FlowFile, PromptAction,
};
use convflow_server::{Config, Dispatcher, IdleEvictor, Server, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Flow used when no flow file is configured.
fn survey_flow() -> Result<ConversationDefinition, CoreError> {
    FlowBuilder::named("survey")
        .start(
            PromptAction::new("This is starting. Select your gender?")
                .with_options([["Boy", "Girl", "Other"]]),
        )
        .attach_reply("Tell me your Age.", r"^(Boy|Girl|Other)$")?
        .attach_reply(
            PromptAction::new("Your meal pref").with_options([["NonVeg", "Veg"]]),
            r"^\d+$",
        )?
        .attach_reply(
            PromptAction::new("Debit/credit").with_options([["Debit", "Credit"]]),
            r"^(NonVeg|Veg)$",
        )?
        .stop_with("Thanks for the replies.", r"^(Debit|Credit)$")?
        .chain_conversation("Sorry something wrong.")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if CONVFLOW_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("CONVFLOW_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("CONVFLOW_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            // Otherwise fall back to defaults
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    let definition = match &config.flow.path {
        Some(path) => {
            tracing::info!("Loading flow from {}", path.display());
            FlowFile::load(path)?.build()?
        }
        None => survey_flow()?,
    };

    tracing::info!("Starting convflow server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Flow: {} ({} states, checksum {})",
        definition.name,
        definition.state_count(),
        definition.checksum
    );
    tracing::info!(
        "  Commands: entry {}, cancel {}",
        definition.entry_command,
        definition.cancel_command
    );

    let runtime = Arc::new(ConversationRuntime::new(Arc::new(definition)));
    let dispatcher = Arc::new(Dispatcher::new(runtime.clone()));
    let server = Arc::new(Server::new(
        ServerConfig::from_network(&config.network),
        dispatcher,
    ));

    let evictor = Arc::new(IdleEvictor::new(runtime.clone(), config.eviction.clone()));
    let evictor_handle = {
        let evictor = evictor.clone();
        tokio::spawn(async move {
            evictor.run().await;
        })
    };

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_evictor = evictor.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        shutdown_evictor.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let _ = evictor_handle.await;

    tracing::info!(
        "Server stopped ({} live conversation(s) dropped)",
        runtime.instance_count()
    );
    Ok(())
}
