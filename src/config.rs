use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::Rng;
use serde::Deserialize;
use url::Url;

/// Proxy-side settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address serving scraper HTTP traffic and the admin endpoints.
    pub proxy_address: String,
    /// Address accepting client tunnel connections.
    pub server_address: String,
    /// Scrapes asking for more than this are clamped to it.
    pub max_scrape_timeout: Duration,
    /// Timeout stamped on scrapes that do not carry one.
    pub default_scrape_timeout: Duration,
    /// Accepted shared tokens, in order of preference.
    pub tokens: Vec<String>,
}

/// Resolves the accepted token list; a token file overrides the flag.
/// Tokens are comma-separated in both.
pub fn resolve_tokens(tokens: &str, token_file: Option<&Path>) -> Result<Vec<String>> {
    let raw = match token_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?,
        None => tokens.to_string(),
    };
    Ok(raw.trim().split(',').map(|t| t.trim().to_string()).collect())
}

/// One local scrape endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub name: Option<String>,
    pub url: Url,
}

/// Client-side settings, merged from flags and an optional TOML file
/// (file values take priority).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default, rename = "proxy-addr")]
    pub proxy_addr: String,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default, rename = "metrics")]
    pub endpoints: Vec<Endpoint>,
    #[serde(default, rename = "label-pairs")]
    pub label_pairs: BTreeMap<String, String>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Overlays file values on top of flag values; fields present in the
    /// file win.
    pub fn merge_file(mut self, file: ClientConfig) -> ClientConfig {
        if !file.token.is_empty() {
            self.token = file.token;
        }
        if !file.proxy_addr.is_empty() {
            self.proxy_addr = file.proxy_addr;
        }
        if !file.fqdn.is_empty() {
            self.fqdn = file.fqdn;
        }
        if !file.endpoints.is_empty() {
            self.endpoints = file.endpoints;
        }
        if !file.label_pairs.is_empty() {
            self.label_pairs = file.label_pairs;
        }
        self
    }

    /// Fills derived fields: unnamed endpoints get a name derived from
    /// their URL, and a missing FQDN falls back to a random one.
    pub fn complete(&mut self) {
        if self.fqdn.is_empty() {
            self.fqdn = format!("rand-fqdn-{}", random_suffix(5));
        }
        for endpoint in &mut self.endpoints {
            if endpoint.name.as_deref().map_or(true, str::is_empty) {
                let host = endpoint.url.host_str().unwrap_or_default();
                let port = endpoint
                    .url
                    .port()
                    .map(|p| format!(":{p}"))
                    .unwrap_or_default();
                endpoint.name = Some(URL_SAFE.encode(format!("{host}{port}{}", endpoint.url.path())));
            }
        }
    }
}

/// Builds the process-name to URL map, rejecting duplicates.
pub fn endpoint_urls(endpoints: &[Endpoint]) -> Result<HashMap<String, Url>> {
    let mut processes = HashMap::new();
    for (i, endpoint) in endpoints.iter().enumerate() {
        let name = endpoint
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .with_context(|| format!("endpoint[{i}] has no name"))?;
        if processes.insert(name.clone(), endpoint.url.clone()).is_some() {
            bail!("duplicate endpoint, name: {name}");
        }
    }
    Ok(processes)
}

/// Parses comma-separated endpoint URLs from the `--metrics` flag.
pub fn parse_metric_endpoints(list: &str) -> Result<Vec<Endpoint>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let url = Url::parse(s).with_context(|| format!("invalid metric endpoint {s:?}"))?;
            Ok(Endpoint { name: None, url })
        })
        .collect()
}

/// Parses `key=value,key2=value2` label pairs.
pub fn parse_label_pairs(list: &str) -> Result<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    for pair in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("expected LABEL=VALUE, got {pair:?}");
        };
        pairs.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(pairs)
}

/// Parses durations like `500ms`, `15s`, `5m`, `1h`; a bare number means
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = value
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    ensure!(value.is_finite() && value >= 0.0, "invalid duration {s:?}");
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => bail!("invalid duration unit in {s:?}"),
    };
    Ok(Duration::from_secs_f64(seconds))
}

// vowel-less so random names cannot spell anything unfortunate
const ALPHANUMS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

fn random_suffix(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ALPHANUMS[rng.gen_range(0..ALPHANUMS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn label_pair_parsing() {
        let pairs = parse_label_pairs("node=my-node, region=shanghai").unwrap();
        assert_eq!(pairs.get("node").map(String::as_str), Some("my-node"));
        assert_eq!(pairs.get("region").map(String::as_str), Some("shanghai"));
        assert!(parse_label_pairs("oops").is_err());
    }

    #[test]
    fn endpoint_names_default_from_the_url() {
        let mut cfg = ClientConfig {
            fqdn: "node-a".into(),
            endpoints: parse_metric_endpoints("http://127.0.0.1:9100/metrics").unwrap(),
            ..ClientConfig::default()
        };
        cfg.complete();
        let name = cfg.endpoints[0].name.clone().unwrap();
        assert_eq!(name, URL_SAFE.encode("127.0.0.1:9100/metrics"));
    }

    #[test]
    fn missing_fqdn_gets_a_random_fallback() {
        let mut cfg = ClientConfig::default();
        cfg.complete();
        assert!(cfg.fqdn.starts_with("rand-fqdn-"));
        assert_eq!(cfg.fqdn.len(), "rand-fqdn-".len() + 5);
    }

    #[test]
    fn duplicate_endpoint_names_are_rejected() {
        let endpoints = vec![
            Endpoint {
                name: Some("cpu".into()),
                url: Url::parse("http://127.0.0.1:9100/metrics").unwrap(),
            },
            Endpoint {
                name: Some("cpu".into()),
                url: Url::parse("http://127.0.0.1:9200/metrics").unwrap(),
            },
        ];
        let err = endpoint_urls(&endpoints).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn file_values_take_priority() {
        let flags = ClientConfig {
            token: "flag-token".into(),
            proxy_addr: "127.0.0.1:7080".into(),
            ..ClientConfig::default()
        };
        let file: ClientConfig = toml::from_str(
            r#"
            token = "file-token"

            [[metrics]]
            name = "cpu"
            url = "http://127.0.0.1:9100/metrics"
            "#,
        )
        .unwrap();
        let merged = flags.merge_file(file);
        assert_eq!(merged.token, "file-token");
        assert_eq!(merged.proxy_addr, "127.0.0.1:7080");
        assert_eq!(merged.endpoints.len(), 1);
    }

    #[test]
    fn token_lists_split_on_commas() {
        let tokens = resolve_tokens("pwd-a, token-x", None).unwrap();
        assert_eq!(tokens, vec!["pwd-a", "token-x"]);
        // an empty flag still yields one (empty) token, like the reference
        assert_eq!(resolve_tokens("", None).unwrap(), vec![""]);
    }
}
