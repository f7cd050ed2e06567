//! Control API object models and reverse URL handling

use serde::{Deserialize, Serialize};
use url::Url;

use super::CheckError;

/// Default broker reverse port when the URL carries none
const DEFAULT_REVERSE_PORT: u16 = 43191;

/// A check bundle as returned by the control API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckBundle {
    /// Stable identifier (`/check_bundle/<id>`)
    #[serde(rename = "_cid", default)]
    pub cid: String,

    /// Reverse-connect URLs; the first is the primary, the rest failover
    #[serde(rename = "_reverse_connection_urls", default)]
    pub reverse_urls: Vec<String>,

    #[serde(default)]
    pub brokers: Vec<String>,

    #[serde(default)]
    pub metrics: Vec<BundleMetric>,

    #[serde(default)]
    pub target: String,

    #[serde(rename = "type", default)]
    pub check_type: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub status: String,
}

/// A declared metric on a check bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMetric {
    pub name: String,

    #[serde(rename = "type")]
    pub metric_type: String,

    /// `active`, `available`, or `disabled`
    pub status: String,
}

/// A broker as returned by the control API
#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    #[serde(rename = "_cid", default)]
    pub cid: String,

    #[serde(rename = "_name", default)]
    pub name: String,

    #[serde(rename = "_details", default)]
    pub details: Vec<BrokerDetail>,
}

/// One connection record of a broker
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerDetail {
    /// Certificate CN the broker presents
    pub cn: String,

    #[serde(default)]
    pub ipaddress: Option<String>,

    #[serde(default)]
    pub external_host: Option<String>,

    #[serde(default)]
    pub external_port: Option<u16>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub status: String,
}

impl Broker {
    /// Find the CN to verify the TLS peer against, from the detail record
    /// matching the reverse URL's host and port.
    ///
    /// The dial address is commonly an IP literal, so the CN must come
    /// from the broker record rather than the URL host.
    pub fn cn_for(&self, host: &str, port: u16) -> Result<String, CheckError> {
        self.details
            .iter()
            .filter(|d| d.status == "active")
            .find(|d| {
                let host_match = d.ipaddress.as_deref() == Some(host)
                    || d.external_host.as_deref() == Some(host)
                    || d.cn == host;
                let port_match = match (d.external_port, d.port) {
                    (Some(p), _) => p == port,
                    (None, Some(p)) => p == port,
                    (None, None) => true,
                };
                host_match && port_match
            })
            .map(|d| d.cn.clone())
            .ok_or_else(|| CheckError::BrokerDetailNotFound(format!("{}:{}", host, port)))
    }
}

/// A parsed reverse-connect URL
///
/// `mtev_reverse://host:port/check/<name>#<secret>`: the scheme dials as
/// TLS, the path introduces the check, the fragment is the shared secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secret: String,
}

impl ReverseUrl {
    /// Dial address in `host:port` form
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a reverse-connect URL from a check bundle
pub fn parse_reverse_url(raw: &str) -> Result<ReverseUrl, CheckError> {
    let invalid = |reason: &str| CheckError::InvalidReverseUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;

    let port = match url.scheme() {
        "mtev_reverse" => url.port().unwrap_or(DEFAULT_REVERSE_PORT),
        "https" | "http" => url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?,
        other => return Err(invalid(&format!("unsupported scheme '{}'", other))),
    };

    let host = url
        .host_str()
        .ok_or_else(|| invalid("missing host"))?
        .to_string();

    let secret = url
        .fragment()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| invalid("missing secret fragment"))?
        .to_string();

    Ok(ReverseUrl {
        host,
        port,
        path: url.path().to_string(),
        secret,
    })
}

/// Normalize a possibly-bare CID into its API path form
pub fn cid_path(kind: &str, cid: &str) -> String {
    let cid = cid.trim();
    if cid.starts_with('/') {
        cid.trim_start_matches('/').to_string()
    } else {
        format!("{}/{}", kind, cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reverse_url() {
        let r = parse_reverse_url("mtev_reverse://10.1.2.3:43191/check/foo-bar-baz#abc123").unwrap();
        assert_eq!(r.host, "10.1.2.3");
        assert_eq!(r.port, 43191);
        assert_eq!(r.path, "/check/foo-bar-baz");
        assert_eq!(r.secret, "abc123");
        assert_eq!(r.dial_addr(), "10.1.2.3:43191");
    }

    #[test]
    fn test_parse_reverse_url_default_port() {
        let r = parse_reverse_url("mtev_reverse://broker.example.net/check/x#s").unwrap();
        assert_eq!(r.port, 43191);
    }

    #[test]
    fn test_parse_reverse_url_rejects_bad_input() {
        assert!(parse_reverse_url("not a url").is_err());
        assert!(parse_reverse_url("ftp://h:1/check/x#s").is_err());
        assert!(parse_reverse_url("mtev_reverse://h:1/check/x").is_err()); // no secret
    }

    #[test]
    fn test_cid_path() {
        assert_eq!(cid_path("check_bundle", "1234"), "check_bundle/1234");
        assert_eq!(cid_path("check_bundle", "/check_bundle/1234"), "check_bundle/1234");
        assert_eq!(cid_path("broker", "/broker/35"), "broker/35");
    }

    #[test]
    fn test_broker_cn_matching() {
        let broker: Broker = serde_json::from_str(
            r#"{
                "_cid": "/broker/1234",
                "_name": "test",
                "_details": [
                    {"cn": "down-broker", "ipaddress": "10.0.0.1", "external_port": 43191, "status": "unprovisioned"},
                    {"cn": "test-broker", "ipaddress": "10.0.0.2", "external_port": 43191, "status": "active"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(broker.cn_for("10.0.0.2", 43191).unwrap(), "test-broker");
        // inactive details never match
        assert!(broker.cn_for("10.0.0.1", 43191).is_err());
        // wrong port never matches
        assert!(broker.cn_for("10.0.0.2", 43192).is_err());
    }

    #[test]
    fn test_bundle_parse_defaults() {
        let bundle: CheckBundle = serde_json::from_str(
            r#"{
                "_cid": "/check_bundle/1234",
                "_reverse_connection_urls": ["mtev_reverse://10.0.0.2:43191/check/foo#s3cr3t"],
                "brokers": ["/broker/1234"],
                "target": "web01",
                "type": "json",
                "metrics": [{"name": "requests", "type": "numeric", "status": "active"}]
            }"#,
        )
        .unwrap();

        assert_eq!(bundle.cid, "/check_bundle/1234");
        assert_eq!(bundle.reverse_urls.len(), 1);
        assert_eq!(bundle.metrics[0].status, "active");
        assert!(bundle.display_name.is_empty());
    }
}
