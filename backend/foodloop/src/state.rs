//! Shared application state handed to handlers and the matcher.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sqlx::SqlitePool;

use crate::auth::TokenAuthority;
use crate::cache::NgoCache;
use crate::classifier::{Classifier, MlClassifier};
use crate::config::Config;
use crate::notarizer::{DisabledNotarizer, EthRpcNotarizer, Notarizer};
use crate::notify::{HttpNotifier, Notifier};

pub struct AppState {
    pub pool: SqlitePool,
    pub config: Config,
    pub tokens: TokenAuthority,
    pub ngo_cache: NgoCache,
    pub notifier: Arc<dyn Notifier>,
    pub notarizer: Arc<dyn Notarizer>,
    pub classifier: Arc<dyn Classifier>,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        config: Config,
        notifier: Arc<dyn Notifier>,
        notarizer: Arc<dyn Notarizer>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            tokens: TokenAuthority::new(&config.jwt_secret, config.token_ttl_hours),
            ngo_cache: NgoCache::new(Duration::from_secs(config.ngo_cache_ttl_secs)),
            pool,
            config,
            notifier,
            notarizer,
            classifier,
        }
    }

    /// Wire the HTTP-backed collaborators described by `config`.
    pub fn from_config(pool: SqlitePool, config: Config, client: Client) -> Self {
        let notifier = Arc::new(HttpNotifier::new(client.clone(), &config));
        let classifier = Arc::new(MlClassifier::new(
            client.clone(),
            config.ml_api_url.clone(),
            Duration::from_secs(config.ml_timeout_secs),
        ));
        let notarizer: Arc<dyn Notarizer> = match &config.chain {
            Some(chain) => Arc::new(EthRpcNotarizer::new(client, chain.clone())),
            None => {
                tracing::warn!("Chain settings missing; certificates will not be minted");
                Arc::new(DisabledNotarizer)
            }
        };
        Self::new(pool, config, notifier, notarizer, classifier)
    }
}
