//! Check bundle management
//!
//! Resolves the agent's check bundle from the control API, derives the
//! reverse tunnel's dial configuration (broker endpoint, TLS trust,
//! introduction credentials) from it, and keeps the broker-side metric
//! catalog in sync with the metrics seen locally.

pub mod api;
pub mod bundle;
pub mod state;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::sync::RwLock;

use pm_core::config::{CheckConfig, Config, TunnelConfig};
use pm_core::Metric;

use api::{ApiClient, ApiError};
use bundle::{parse_reverse_url, BundleMetric, CheckBundle};
use state::MetricStates;

/// Check manager errors
#[derive(Error, Debug)]
pub enum CheckError {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// No reverse configuration has been computed (reverse disabled or
    /// check management off)
    #[error("invalid reverse configuration")]
    NoReverseConfig,

    /// The manager was constructed as a NOP sentinel
    #[error("check management disabled")]
    ManagementDisabled,

    #[error("no check bundle found for target {0}")]
    BundleNotFound(String),

    #[error("{count} check bundles match target {target}, refusing to guess")]
    MultipleBundles { target: String, count: usize },

    #[error("no check bundle configured")]
    NoBundle,

    #[error("check bundle has no reverse connection URLs")]
    NoReverseUrls,

    #[error("check bundle lists no brokers")]
    NoBrokers,

    #[error("creating a check bundle requires a configured broker")]
    BrokerRequired,

    #[error("invalid reverse URL {url}: {reason}")]
    InvalidReverseUrl { url: String, reason: String },

    #[error("no active broker detail matches {0}")]
    BrokerDetailNotFound(String),

    #[error("broker CN {0} is not a valid server name")]
    InvalidBrokerCn(String),

    #[error("invalid broker CA certificate: {0}")]
    InvalidCa(String),

    #[error("reading broker CA file {path:?}: {source}")]
    CaFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything the reverse tunnel needs to dial its broker
///
/// Derived from the check bundle and broker records; immutable until the
/// next `refresh_check_config`.
#[derive(Clone)]
pub struct ReverseConfig {
    /// `host:port` to dial
    pub dial_addr: String,
    /// Name the broker's certificate is verified against (the broker CN,
    /// never the URL host)
    pub server_name: ServerName<'static>,
    /// Client TLS configuration with the broker CA pool
    pub tls: Arc<rustls::ClientConfig>,
    /// Introduction path (`/check/<name>`)
    pub intro_path: String,
    /// Introduction secret (the URL fragment)
    pub intro_secret: String,
}

impl ReverseConfig {
    /// The introduction command payload sent on channel 0 after TLS is up
    pub fn introduction(&self) -> String {
        format!("REVERSE {}#{}\r\n\r\n", self.intro_path, self.intro_secret)
    }
}

impl fmt::Debug for ReverseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseConfig")
            .field("dial_addr", &self.dial_addr)
            .field("server_name", &self.server_name)
            .field("intro_path", &self.intro_path)
            .finish_non_exhaustive()
    }
}

#[derive(Default, Debug)]
struct Inner {
    bundle: Option<CheckBundle>,
    rev_config: Option<ReverseConfig>,
    metric_states: MetricStates,
    update_metric_states: bool,
    last_refresh: Option<Instant>,
}

/// Check bundle manager
///
/// When neither the reverse tunnel, managed metrics, nor create-mode need
/// a check, `new` returns a NOP sentinel that never touches the API.
#[derive(Debug)]
pub struct Check {
    client: Option<ApiClient>,
    manage: bool,
    refresh_ttl: Duration,
    state_file: PathBuf,
    tunnel: TunnelConfig,
    check_cfg: CheckConfig,
    inner: RwLock<Inner>,
}

impl Check {
    /// Create a check manager from configuration
    ///
    /// Resolves (or creates) the check bundle and computes the reverse
    /// configuration when the tunnel is enabled. A supplied `client`
    /// overrides the one built from `cfg.api`.
    pub async fn new(cfg: &Config, client: Option<ApiClient>) -> Result<Self, CheckError> {
        let need_check = cfg.reverse.enabled
            || cfg.check.enable_new_metrics
            || (cfg.check.create && cfg.reverse.check_bundle_cid.is_empty());

        if !need_check {
            tracing::info!("check management disabled");
            return Ok(Self::noop(cfg));
        }

        let client = match client {
            Some(c) => c,
            None => ApiClient::new(&cfg.api)?,
        };

        let mut manage = cfg.check.enable_new_metrics;
        if manage {
            if let Err(e) = fs::create_dir_all(&cfg.check.state_path) {
                tracing::warn!(
                    "state path {} unusable ({}), disabling enable-new-metrics",
                    cfg.check.state_path.display(),
                    e
                );
                manage = false;
            }
        }

        let check = Self {
            client: Some(client),
            manage,
            refresh_ttl: cfg.check.metric_refresh_ttl,
            state_file: cfg.check.state_path.join(state::STATE_FILE),
            tunnel: cfg.reverse.clone(),
            check_cfg: cfg.check.clone(),
            inner: RwLock::new(Inner::default()),
        };

        {
            let mut inner = check.inner.write().await;
            check.set_check(&mut inner).await?;

            if check.manage {
                match state::load_state(&check.state_file) {
                    Ok(states) => inner.metric_states = states,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::debug!("no existing metric state file");
                    }
                    Err(e) => tracing::warn!(
                        "unable to load metric states ({}), all local metrics will appear new",
                        e
                    ),
                }
            }
        }

        Ok(check)
    }

    fn noop(cfg: &Config) -> Self {
        Self {
            client: None,
            manage: false,
            refresh_ttl: cfg.check.metric_refresh_ttl,
            state_file: cfg.check.state_path.join(state::STATE_FILE),
            tunnel: cfg.reverse.clone(),
            check_cfg: cfg.check.clone(),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// The cached reverse configuration
    pub async fn reverse_config(&self) -> Result<ReverseConfig, CheckError> {
        let inner = self.inner.read().await;
        inner.rev_config.clone().ok_or(CheckError::NoReverseConfig)
    }

    /// Re-resolve the check bundle and reverse configuration
    ///
    /// The tunnel calls this after repeated connection failures so a
    /// broker-side failover shows up in the next dial.
    pub async fn refresh_check_config(&self) -> Result<(), CheckError> {
        if self.client.is_none() {
            return Err(CheckError::ManagementDisabled);
        }
        let mut inner = self.inner.write().await;
        self.set_check(&mut inner).await
    }

    /// Enable any locally seen metrics the broker does not know yet
    ///
    /// TTL-gated: broker-side metric states are re-fetched when stale,
    /// then the local snapshot is diffed against them and unknown metrics
    /// are submitted as `active`. State-file trouble is logged, never
    /// propagated.
    pub async fn enable_new_metrics(
        &self,
        local: &BTreeMap<String, Metric>,
    ) -> Result<(), CheckError> {
        if !self.manage {
            return Ok(());
        }
        let client = match &self.client {
            Some(c) => c,
            None => return Ok(()),
        };

        let mut inner = self.inner.write().await;

        // let the first submission pass when there is no prior state
        if !inner.update_metric_states && inner.metric_states.is_empty() {
            tracing::debug!("no existing metric states, triggering load");
            inner.update_metric_states = true;
            return Ok(());
        }

        let stale = inner
            .last_refresh
            .map_or(true, |t| t.elapsed() > self.refresh_ttl);
        if stale {
            inner.update_metric_states = true;
        }

        if inner.update_metric_states {
            tracing::debug!("updating metric states");
            let cid = inner
                .bundle
                .as_ref()
                .map(|b| b.cid.clone())
                .ok_or(CheckError::NoBundle)?;
            let full = client.fetch_check_bundle(&cid).await?;
            for metric in &full.metrics {
                inner
                    .metric_states
                    .insert(metric.name.clone(), metric.status.clone());
            }
            inner.bundle = Some(full);
            inner.last_refresh = Some(Instant::now());
            inner.update_metric_states = false;

            if let Err(e) = state::save_state(&self.state_file, &inner.metric_states) {
                tracing::warn!("unable to persist metric states: {}", e);
            }
        }

        let new_metrics: Vec<BundleMetric> = local
            .iter()
            .filter(|(name, _)| !inner.metric_states.contains_key(*name))
            .map(|(name, metric)| BundleMetric {
                name: name.clone(),
                metric_type: broker_metric_type(&metric.kind).to_string(),
                status: "active".to_string(),
            })
            .collect();

        if !new_metrics.is_empty() {
            tracing::debug!("enabling {} new metrics", new_metrics.len());
            let mut updated = inner.bundle.clone().ok_or(CheckError::NoBundle)?;
            updated.metrics.extend(new_metrics);
            match client.update_check_bundle(&updated).await {
                Ok(saved) => {
                    inner.bundle = Some(saved);
                    // pick up the broker's view of the new metrics next pass
                    inner.update_metric_states = true;
                }
                Err(e) => tracing::error!("adding new metrics to check bundle: {}", e),
            }
        }

        Ok(())
    }

    async fn set_check(&self, inner: &mut Inner) -> Result<(), CheckError> {
        let client = self.client.as_ref().ok_or(CheckError::ManagementDisabled)?;

        // configured CID wins; a previously resolved bundle keeps its CID
        // across refreshes even when it was found by search or created
        let cid = if !self.tunnel.check_bundle_cid.is_empty() {
            Some(self.tunnel.check_bundle_cid.clone())
        } else {
            inner
                .bundle
                .as_ref()
                .map(|b| b.cid.clone())
                .filter(|c| !c.is_empty())
        };

        let bundle = match cid {
            Some(cid) => client.fetch_check_bundle(&cid).await?,
            None => {
                let target = self.check_cfg.target_host();
                let criteria = format!(r#"(active:1)(type:"json")(target:"{}")"#, target);
                let mut found = client.search_check_bundles(&criteria).await?;
                match found.len() {
                    0 if self.check_cfg.create => self.create_check(client, &target).await?,
                    0 => return Err(CheckError::BundleNotFound(target)),
                    1 => found.remove(0),
                    count => return Err(CheckError::MultipleBundles { target, count }),
                }
            }
        };

        if self.tunnel.enabled {
            inner.rev_config = Some(self.build_reverse_config(client, &bundle).await?);
        }
        inner.bundle = Some(bundle);

        Ok(())
    }

    async fn create_check(
        &self,
        client: &ApiClient,
        target: &str,
    ) -> Result<CheckBundle, CheckError> {
        if self.check_cfg.broker.is_empty() {
            return Err(CheckError::BrokerRequired);
        }

        let broker = &self.check_cfg.broker;
        let broker_cid = if broker.starts_with('/') {
            broker.clone()
        } else {
            format!("/broker/{}", broker)
        };

        tracing::info!("creating check bundle for target {}", target);
        let bundle = CheckBundle {
            cid: String::new(),
            reverse_urls: Vec::new(),
            brokers: vec![broker_cid],
            metrics: Vec::new(),
            target: target.to_string(),
            check_type: "json".to_string(),
            display_name: format!("{} pulsemon", target),
            status: "active".to_string(),
        };

        Ok(client.create_check_bundle(&bundle).await?)
    }

    async fn build_reverse_config(
        &self,
        client: &ApiClient,
        bundle: &CheckBundle,
    ) -> Result<ReverseConfig, CheckError> {
        let raw = bundle.reverse_urls.first().ok_or(CheckError::NoReverseUrls)?;
        let rurl = parse_reverse_url(raw)?;

        let broker_cid = bundle.brokers.first().ok_or(CheckError::NoBrokers)?;
        let broker = client.fetch_broker(broker_cid).await?;
        let cn = broker.cn_for(&rurl.host, rurl.port)?;

        let ca_pem = match &self.tunnel.broker_ca_file {
            Some(path) => fs::read_to_string(path).map_err(|e| CheckError::CaFile {
                path: path.clone(),
                source: e,
            })?,
            None => client.fetch_ca().await?,
        };

        let mut roots = rustls::RootCertStore::empty();
        let certs: Vec<_> = rustls_pemfile::certs(&mut ca_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| CheckError::InvalidCa(e.to_string()))?;
        if certs.is_empty() {
            return Err(CheckError::InvalidCa("no certificates in PEM".to_string()));
        }
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| CheckError::InvalidCa(e.to_string()))?;
        }

        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name =
            ServerName::try_from(cn.clone()).map_err(|_| CheckError::InvalidBrokerCn(cn))?;

        Ok(ReverseConfig {
            dial_addr: rurl.dial_addr(),
            server_name,
            tls: Arc::new(tls),
            intro_path: rurl.path,
            intro_secret: rurl.secret,
        })
    }
}

/// Map a local metric type tag to the broker-side metric type
fn broker_metric_type(tag: &str) -> &'static str {
    match tag {
        "n" => "histogram",
        "s" => "text",
        _ => "numeric",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_metric_type() {
        assert_eq!(broker_metric_type("n"), "histogram");
        assert_eq!(broker_metric_type("s"), "text");
        assert_eq!(broker_metric_type("L"), "numeric");
        assert_eq!(broker_metric_type("i"), "numeric");
        assert_eq!(broker_metric_type(""), "numeric");
    }

    #[tokio::test]
    async fn test_noop_when_nothing_needs_a_check() {
        let check = Check::new(&Config::default(), None).await.unwrap();

        let err = check.reverse_config().await.unwrap_err();
        assert_eq!(err.to_string(), "invalid reverse configuration");

        let err = check.refresh_check_config().await.unwrap_err();
        assert!(matches!(err, CheckError::ManagementDisabled));

        // NOP manager never objects to metric submissions
        check.enable_new_metrics(&BTreeMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reverse_enabled_requires_token() {
        let mut cfg = Config::default();
        cfg.reverse.enabled = true;

        let err = Check::new(&cfg, None).await.unwrap_err();
        assert!(err.to_string().contains("API Token is required"));
    }
}
