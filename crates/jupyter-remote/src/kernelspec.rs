//! Catalog of launchable kernel types, cached with a TTL.
//!
//! Subscribers hear about every fetch that changes the set of specs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::poll::{spawn_poll, PollPolicy};
use crate::server_connection::{expect_status, read_json, ServerConnection};

/// Default time a fetched catalog stays fresh.
pub const DEFAULT_SPEC_TTL: Duration = Duration::from_secs(600);

/// `kernel.json` of an installed kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecFile {
    #[serde(default)]
    pub argv: Vec<String>,
    pub display_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub interrupt_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    pub spec: KernelSpecFile,
    /// Resource name → URL path (logos, kernel.js).
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

/// Body of `GET /api/kernelspecs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecCatalog {
    #[serde(default)]
    pub default: String,
    pub kernelspecs: BTreeMap<String, KernelSpec>,
}

impl KernelSpecCatalog {
    /// The server default, or the first spec by name when the default is
    /// not installed.
    pub fn default_spec(&self) -> Option<&KernelSpec> {
        self.kernelspecs
            .get(&self.default)
            .or_else(|| self.kernelspecs.values().next())
    }
}

/// A catalog as returned to callers, with its freshness.
#[derive(Debug, Clone)]
pub struct SpecsSnapshot {
    pub catalog: KernelSpecCatalog,
    pub fetched_at: DateTime<Utc>,
    /// Set when a refresh failed and this is the last good catalog.
    pub stale: bool,
}

struct Cached {
    catalog: KernelSpecCatalog,
    fetched_at: DateTime<Utc>,
    fetched: Instant,
}

pub struct KernelSpecManager {
    server: Arc<ServerConnection>,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
    events: broadcast::Sender<KernelSpecCatalog>,
}

impl KernelSpecManager {
    pub fn new(server: Arc<ServerConnection>) -> Self {
        Self::with_ttl(server, DEFAULT_SPEC_TTL)
    }

    pub fn with_ttl(server: Arc<ServerConnection>, ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            server,
            ttl,
            cache: Mutex::new(None),
            events,
        }
    }

    /// The new catalog, each time a fetch returns a different one than the
    /// cache held (the first fetch included).
    pub fn subscribe(&self) -> broadcast::Receiver<KernelSpecCatalog> {
        self.events.subscribe()
    }

    /// The cached catalog, refreshed first if it is missing or expired.
    ///
    /// A network failure during refresh falls back to the previous catalog
    /// marked `stale`. Without a previous catalog the error is returned.
    pub async fn list_specs(&self) -> Result<SpecsSnapshot> {
        self.load(false).await
    }

    /// Fetch the catalog now, regardless of the TTL.
    pub async fn refresh(&self) -> Result<SpecsSnapshot> {
        self.load(true).await
    }

    /// Drop the cache so the next call fetches.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn load(&self, force: bool) -> Result<SpecsSnapshot> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if !force && cached.fetched.elapsed() < self.ttl {
                return Ok(snapshot(cached, false));
            }
        }

        match self.fetch().await {
            Ok(catalog) => Ok(self.store(&mut cache, catalog)),
            Err(Error::Network(reason)) => match cache.as_ref() {
                Some(cached) => {
                    warn!(
                        "[kernelspecs] Refresh failed, serving catalog from {}: {}",
                        cached.fetched_at, reason
                    );
                    Ok(snapshot(cached, true))
                }
                None => Err(Error::Network(reason)),
            },
            Err(e) => Err(e),
        }
    }

    fn store(&self, cache: &mut Option<Cached>, catalog: KernelSpecCatalog) -> SpecsSnapshot {
        let changed = cache
            .as_ref()
            .map_or(true, |previous| previous.catalog != catalog);
        let fresh = Cached {
            catalog,
            fetched_at: Utc::now(),
            fetched: Instant::now(),
        };
        let result = snapshot(&fresh, false);
        if changed {
            debug!("[kernelspecs] Spec set changed");
            let _ = self.events.send(fresh.catalog.clone());
        }
        *cache = Some(fresh);
        result
    }

    pub async fn get_default_spec(&self) -> Result<KernelSpec> {
        let snapshot = self.list_specs().await?;
        snapshot
            .catalog
            .default_spec()
            .cloned()
            .ok_or_else(|| Error::NotFound("no kernel specs installed".to_string()))
    }

    pub async fn get_spec(&self, name: &str) -> Result<KernelSpec> {
        let snapshot = self.list_specs().await?;
        snapshot
            .catalog
            .kernelspecs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("kernel spec {}", name)))
    }

    /// Refresh the catalog in the background on `policy`'s schedule.
    pub fn spawn_refresh(self: &Arc<Self>, policy: PollPolicy) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        spawn_poll("kernelspecs", policy, move || {
            let manager = Arc::clone(&manager);
            async move { manager.refresh().await.map(|_| ()) }
        })
    }

    async fn fetch(&self) -> Result<KernelSpecCatalog> {
        let url = self.server.build_url("api/kernelspecs")?;
        let response = self.server.fetch::<()>(Method::GET, url, None).await?;
        let response = expect_status(response, &[StatusCode::OK]).await?;
        let catalog: KernelSpecCatalog = read_json(response).await?;
        info!(
            "[kernelspecs] Fetched {} kernel specs (default: {})",
            catalog.kernelspecs.len(),
            catalog.default
        );
        debug!(
            "[kernelspecs] Available: {:?}",
            catalog.kernelspecs.keys().collect::<Vec<_>>()
        );
        Ok(catalog)
    }
}

fn snapshot(cached: &Cached, stale: bool) -> SpecsSnapshot {
    SpecsSnapshot {
        catalog: cached.catalog.clone(),
        fetched_at: cached.fetched_at,
        stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "default": "python3",
        "kernelspecs": {
            "python3": {
                "name": "python3",
                "spec": {
                    "argv": ["python", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
                    "env": {},
                    "display_name": "Python 3 (ipykernel)",
                    "language": "python",
                    "interrupt_mode": "signal",
                    "metadata": {"debugger": true}
                },
                "resources": {
                    "logo-64x64": "/kernelspecs/python3/logo-64x64.png"
                }
            },
            "ir": {
                "name": "ir",
                "spec": {
                    "argv": ["R", "--slave", "-e", "IRkernel::main()", "--args", "{connection_file}"],
                    "display_name": "R",
                    "language": "R"
                },
                "resources": {}
            }
        }
    }"#;

    #[test]
    fn test_parse_server_catalog() {
        let catalog: KernelSpecCatalog = serde_json::from_str(CATALOG).unwrap();
        assert_eq!(catalog.kernelspecs.len(), 2);

        let python = &catalog.kernelspecs["python3"];
        assert_eq!(python.spec.language, "python");
        assert_eq!(python.spec.interrupt_mode.as_deref(), Some("signal"));
        assert!(python.resources.contains_key("logo-64x64"));

        let r = &catalog.kernelspecs["ir"];
        assert!(r.spec.env.is_empty());
        assert!(r.spec.interrupt_mode.is_none());
    }

    #[tokio::test]
    async fn test_changes_are_broadcast_once() {
        use crate::server_connection::ServerSettings;

        let settings =
            ServerSettings::new(url::Url::parse("http://127.0.0.1:9/").unwrap()).unwrap();
        let manager = KernelSpecManager::new(Arc::new(ServerConnection::new(settings).unwrap()));
        let mut changes = manager.subscribe();
        let catalog: KernelSpecCatalog = serde_json::from_str(CATALOG).unwrap();

        let mut cache = manager.cache.lock().await;
        manager.store(&mut cache, catalog.clone());
        assert_eq!(changes.try_recv().unwrap(), catalog);

        manager.store(&mut cache, catalog.clone());
        assert!(changes.try_recv().is_err());

        let mut fewer = catalog;
        fewer.kernelspecs.remove("ir");
        manager.store(&mut cache, fewer.clone());
        assert_eq!(changes.try_recv().unwrap(), fewer);
    }

    #[test]
    fn test_default_spec_falls_back_to_first() {
        let mut catalog: KernelSpecCatalog = serde_json::from_str(CATALOG).unwrap();
        assert_eq!(catalog.default_spec().unwrap().name, "python3");

        catalog.default = "julia-1.10".to_string();
        assert_eq!(catalog.default_spec().unwrap().name, "ir");

        catalog.kernelspecs.clear();
        assert!(catalog.default_spec().is_none());
    }
}
