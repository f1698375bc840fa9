//! Named authentication and scraping strategies
//!
//! A strategy is a swappable implementation of one device capability, selected
//! by its string key. Registries keep registration order, which the credential
//! prober relies on for its deterministic first-match search.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::device::Credential;

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Strategy '{0}' is not registered")]
    NotRegistered(String),
    #[error("Strategy returned an empty session token")]
    EmptyToken,
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Obtains a session token from a device
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        address: IpAddr,
        credential: &Credential,
    ) -> Result<String, StrategyError>;
}

/// Reads the ordered counter values of a device using a session token
#[async_trait]
pub trait ScrapeStrategy: Send + Sync {
    async fn scrape(&self, address: IpAddr, token: &str) -> Result<Vec<i64>, StrategyError>;
}

/// Insertion-ordered map of strategy name to implementation
pub struct StrategyRegistry<S: ?Sized> {
    entries: IndexMap<String, Arc<S>>,
}

pub type AuthRegistry = StrategyRegistry<dyn AuthStrategy>;
pub type ScrapeRegistry = StrategyRegistry<dyn ScrapeStrategy>;

impl<S: ?Sized> StrategyRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    /// Register a strategy under `name`. Re-registering keeps the original position.
    pub fn register(&mut self, name: impl Into<String>, strategy: Arc<S>) -> &mut Self {
        let name = name.into();
        if self.entries.insert(name.clone(), strategy).is_some() {
            warn!(strategy = %name, "Strategy registered twice, replacing implementation");
        }
        self
    }

    pub fn get(&self, name: &str) -> Result<&Arc<S>, StrategyError> {
        self.entries
            .get(name)
            .ok_or_else(|| StrategyError::NotRegistered(name.to_string()))
    }

    /// Strategies in registration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<S>)> {
        self.entries.iter().map(|(name, s)| (name.as_str(), s))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: ?Sized> Default for StrategyRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry<dyn AuthStrategy> {
    /// Run the named auth strategy; an empty token counts as a failure
    pub async fn authenticate(
        &self,
        name: &str,
        address: IpAddr,
        credential: &Credential,
    ) -> Result<String, StrategyError> {
        let token = self.get(name)?.authenticate(address, credential).await?;
        if token.is_empty() {
            return Err(StrategyError::EmptyToken);
        }
        Ok(token)
    }
}

impl StrategyRegistry<dyn ScrapeStrategy> {
    pub async fn scrape(
        &self,
        name: &str,
        address: IpAddr,
        token: &str,
    ) -> Result<Vec<i64>, StrategyError> {
        self.get(name)?.scrape(address, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct FixedToken(&'static str);

    #[async_trait]
    impl AuthStrategy for FixedToken {
        async fn authenticate(
            &self,
            _address: IpAddr,
            _credential: &Credential,
        ) -> Result<String, StrategyError> {
            Ok(self.0.to_string())
        }
    }

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
    }

    #[test]
    fn test_registration_order_is_kept() {
        let mut registry = AuthRegistry::new();
        registry
            .register("zeta", Arc::new(FixedToken("z")))
            .register("alpha", Arc::new(FixedToken("a")))
            .register("mid", Arc::new(FixedToken("m")));
        assert_eq!(registry.names(), vec!["zeta", "alpha", "mid"]);

        registry.register("zeta", Arc::new(FixedToken("z2")));
        assert_eq!(registry.names(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_an_error() {
        let registry = AuthRegistry::new();
        let result = registry
            .authenticate("missing", addr(), &Credential::new("u", "p"))
            .await;
        assert!(matches!(result, Err(StrategyError::NotRegistered(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected() {
        let mut registry = AuthRegistry::new();
        registry.register("blank", Arc::new(FixedToken("")));
        let result = registry
            .authenticate("blank", addr(), &Credential::new("u", "p"))
            .await;
        assert!(matches!(result, Err(StrategyError::EmptyToken)));
    }
}
