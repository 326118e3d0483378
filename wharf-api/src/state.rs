//! Application state
//!
//! Process-scoped services, initialized during startup and passed by
//! handle to the HTTP layer and background tasks.

use crate::config::Config;
use crate::connections::ConnectionManager;
use crate::events::defender::Defender;
use crate::events::EventManager;
use crate::kms::SecretBox;
use crate::mfa::MfaService;
use crate::provider::DataProvider;
use crate::status::QuotaScanTracker;
use crate::tokens::TokenService;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kms: Arc<SecretBox>,
    pub provider: Arc<DataProvider>,
    pub connections: Arc<ConnectionManager>,
    pub events: Arc<EventManager>,
    pub defender: Arc<Defender>,
    pub tokens: Arc<TokenService>,
    pub mfa: Arc<MfaService>,
    pub quota_scans: Arc<QuotaScanTracker>,
}

impl AppState {
    pub async fn build(config: Config) -> wharf_common::Result<Self> {
        let kms = Arc::new(SecretBox::new(&config.kms)?);
        let pool = crate::db::open(&config.data_provider.name, config.data_provider.pool_size)
            .await?;
        crate::db::migrate(&pool).await?;
        let provider = Arc::new(DataProvider::new(
            pool.clone(),
            kms.clone(),
            config.data_provider.clone(),
        ));
        provider.ensure_default_admin().await?;
        let connections = ConnectionManager::new(config.common.clone(), provider.clone());
        let events = EventManager::new(provider.clone(), config.smtp.clone());
        let defender = Arc::new(if config.defender.driver == "provider" {
            Defender::new_provider(config.defender.clone(), pool)
        } else {
            Defender::new_memory(config.defender.clone())
        });
        let tokens = Arc::new(TokenService::new(
            config.httpd.api_token_ttl_mins,
            config.httpd.web_token_ttl_mins,
        ));
        let mfa = Arc::new(MfaService::new(&config.mfa.totp_issuer));
        Ok(Self {
            config: Arc::new(config),
            kms,
            provider,
            connections,
            events,
            defender,
            tokens,
            mfa,
            quota_scans: Arc::new(QuotaScanTracker::default()),
        })
    }
}
