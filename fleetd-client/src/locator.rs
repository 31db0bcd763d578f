//! Find the daemon that owns a named agent.

use futures_util::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::client::{ClientOptions, DaemonClient};
use crate::error::ClientError;
use crate::registry::{DaemonConfig, DaemonRegistry};

pub const DEFAULT_LOCATE_CONCURRENCY: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("agent '{agent}' not found on any daemon")]
    NotFound { agent: String },
    #[error("agent '{agent}' exists on multiple daemons: {}; specify one explicitly", .daemons.join(", "))]
    Ambiguous { agent: String, daemons: Vec<String> },
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Queries every enabled daemon's process list.
///
/// Daemons that fail or time out are skipped. Probes run with bounded
/// concurrency but results are folded in registry order.
#[derive(Debug, Clone)]
pub struct Locator {
    registry: DaemonRegistry,
    options: ClientOptions,
    concurrency: usize,
}

impl Locator {
    pub fn new(registry: DaemonRegistry) -> Self {
        Self {
            registry,
            options: ClientOptions::default(),
            concurrency: DEFAULT_LOCATE_CONCURRENCY,
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// `1` gives a strictly sequential scan.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn registry(&self) -> &DaemonRegistry {
        &self.registry
    }

    pub async fn locate(&self, agent: &str) -> Result<String, LocateError> {
        let agent = agent.trim();
        let probes = stream::iter(self.registry.enabled().cloned())
            .map(|daemon| self.probe(daemon, agent))
            .buffered(self.concurrency);
        let matches: Vec<String> = probes
            .filter_map(|found| async move { found })
            .collect()
            .await;

        match matches.len() {
            0 => Err(LocateError::NotFound {
                agent: agent.to_string(),
            }),
            1 => {
                let daemon = matches.into_iter().next().unwrap_or_default();
                info!(agent, daemon = %daemon, "agent located");
                Ok(daemon)
            }
            _ => Err(LocateError::Ambiguous {
                agent: agent.to_string(),
                daemons: matches,
            }),
        }
    }

    async fn probe(&self, daemon: DaemonConfig, agent: &str) -> Option<String> {
        let client = match DaemonClient::new(&daemon) {
            Ok(client) => client.with_options(self.options),
            Err(err) => {
                debug!(daemon = %daemon.name, error = %err, "skipping daemon with bad address");
                return None;
            }
        };
        match client.list_processes().await {
            Ok(processes) => processes
                .iter()
                .any(|p| p.name == agent)
                .then(|| daemon.name.clone()),
            Err(err) => {
                debug!(daemon = %daemon.name, error = %err, "skipping unreachable daemon");
                None
            }
        }
    }

    /// Client for `agent`: the explicit daemon when given, else the located one.
    pub async fn client_for_agent(
        &self,
        agent: &str,
        explicit_daemon: Option<&str>,
    ) -> Result<DaemonClient, LocateError> {
        let name = match explicit_daemon.map(str::trim).filter(|d| !d.is_empty()) {
            Some(name) => name.to_string(),
            None => self.locate(agent).await?,
        };
        Ok(DaemonClient::from_registry(&self.registry, &name)?.with_options(self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_message_lists_daemons() {
        let err = LocateError::Ambiguous {
            agent: "worker".into(),
            daemons: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("worker"));
        assert!(msg.contains("a, b"));
    }

    #[tokio::test]
    async fn empty_registry_is_not_found() {
        let locator = Locator::new(DaemonRegistry::default());
        match locator.locate("worker").await {
            Err(LocateError::NotFound { agent }) => assert_eq!(agent, "worker"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_daemons_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nobody.sock");
        let registry = DaemonRegistry::new(vec![DaemonConfig::new(
            "ghost",
            format!("unix://{}", missing.display()),
        )]);
        let locator = Locator::new(registry);
        assert!(matches!(
            locator.locate("worker").await,
            Err(LocateError::NotFound { .. })
        ));
    }
}
