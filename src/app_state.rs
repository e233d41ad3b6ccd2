use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ConfigError};
use crate::services::completion::{
    CompletionStrategy, Finisher, PollingStrategy, WebhookReceiver, WebhookStrategy,
};
use crate::services::image_host::{build_image_host, ImageHost, TempImageRegistry};
use crate::services::ingress::ImageIngress;
use crate::services::job_store::{InMemoryJobStore, JobStore};
use crate::services::provider::{
    build_provider, CompletionMode, InputMode, ProviderKind, StagingProvider,
};
use crate::services::staging::StagingService;
use crate::services::sweeper::CleanupSweeper;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub staging: Arc<StagingService>,
    pub webhooks: Arc<WebhookReceiver>,
    pub store: Arc<dyn JobStore>,
    pub sweeper: Arc<CleanupSweeper>,
    pub provider: ProviderKind,
    pub completion_mode: CompletionMode,
}

impl AppState {
    /// Wire the services around an already-built provider and image host.
    pub fn new(
        provider: Arc<dyn StagingProvider>,
        image_host: Option<Arc<dyn ImageHost>>,
        store: Arc<dyn JobStore>,
        config: &AppConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let images = Arc::new(TempImageRegistry::new(image_host.clone()));
        let finisher = Finisher::new(store.clone(), images);
        let completion_mode = provider.completion_mode();

        let strategy: Arc<dyn CompletionStrategy> = match completion_mode {
            CompletionMode::Polling => Arc::new(PollingStrategy::new(
                provider.clone(),
                finisher.clone(),
                config.polling(),
            )),
            CompletionMode::Webhook => Arc::new(WebhookStrategy::new(
                finisher.clone(),
                config.polling().max_wait,
            )),
        };

        let staging = StagingService::new(
            provider.clone(),
            ImageIngress::new(config.ingress_limits(), image_host),
            strategy,
            finisher.clone(),
            config.submit_policy(),
            config.webhook_base(),
            shutdown,
        );

        Self {
            staging: Arc::new(staging),
            webhooks: Arc::new(WebhookReceiver::new(provider.clone(), finisher.clone())),
            store,
            sweeper: Arc::new(CleanupSweeper::new(finisher, config.sweeper())),
            provider: provider.kind(),
            completion_mode,
        }
    }

    /// Build the provider and image host from configuration, backed by the
    /// in-memory job store.
    pub fn from_config(config: &AppConfig, shutdown: CancellationToken) -> Result<Self, ConfigError> {
        let provider = build_provider(config)?;
        let image_host = match provider.input_mode() {
            InputMode::HostedUrl => Some(build_image_host(config)?),
            InputMode::InlineBytes => None,
        };

        Ok(Self::new(
            provider,
            image_host,
            Arc::new(InMemoryJobStore::new()),
            config,
            shutdown,
        ))
    }
}
