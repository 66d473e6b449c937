// Proxy failover
// Ordered proxy slots read from PROXY_HOST[_n] variables and probed in order.
// Reddit throttles shared CI address ranges, so listings go through the first
// proxy that answers.

use reqwest::header::USER_AGENT;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Slot 1 uses unsuffixed names, slots 2.. use `_2`, `_3`, ...
pub const MAX_PROXY_SLOTS: usize = 5;
pub const DEFAULT_PROXY_PORT: &str = "8080";
pub const DEFAULT_TEST_URL: &str = "https://www.reddit.com/";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(8);
const PROBE_USER_AGENT: &str = "Mozilla/5.0";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid proxy {label}: {source}")]
    Invalid {
        label: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ProxyConfig {
    pub label: String,
    /// Ready-to-use `http://[user:pass@]host:port`
    #[serde(serialize_with = "serialize_redacted")]
    pub url: String,
}

impl ProxyConfig {
    pub fn to_reqwest(&self) -> Result<reqwest::Proxy, ProxyError> {
        reqwest::Proxy::all(&self.url).map_err(|source| ProxyError::Invalid {
            label: self.label.clone(),
            source,
        })
    }

    /// Proxy URL with the password masked, for logs
    pub fn redacted_url(&self) -> String {
        redact_url(&self.url)
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("label", &self.label)
            .field("url", &self.redacted_url())
            .finish()
    }
}

fn redact_url(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

fn serialize_redacted<S: serde::Serializer>(url: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&redact_url(url))
}

fn slot_suffix(slot: usize) -> String {
    if slot == 1 {
        String::new()
    } else {
        format!("_{}", slot)
    }
}

/// Build the ordered proxy list. Slots without a host are skipped.
pub fn proxies_from_lookup<F>(lookup: &F) -> Vec<ProxyConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut proxies = Vec::new();

    for slot in 1..=MAX_PROXY_SLOTS {
        let suffix = slot_suffix(slot);
        let Some(host) = lookup(&format!("PROXY_HOST{}", suffix)) else {
            continue;
        };
        let port = lookup(&format!("PROXY_PORT{}", suffix))
            .unwrap_or_else(|| DEFAULT_PROXY_PORT.to_string());
        let user = lookup(&format!("PROXY_USER{}", suffix));
        let pass = lookup(&format!("PROXY_PASS{}", suffix));

        let url = match (user, pass) {
            (Some(user), Some(pass)) => format!(
                "http://{}:{}@{}:{}",
                urlencoding::encode(&user),
                urlencoding::encode(&pass),
                host,
                port
            ),
            _ => format!("http://{}:{}", host, port),
        };

        proxies.push(ProxyConfig {
            label: format!("Proxy {}", slot),
            url,
        });
    }

    proxies
}

/// True when `proxy` can fetch `test_url` with HTTP 200
pub async fn test_proxy(proxy: &ProxyConfig, test_url: &str, timeout: Duration) -> bool {
    let client = match proxy
        .to_reqwest()
        .and_then(|p| {
            reqwest::Client::builder()
                .proxy(p)
                .timeout(timeout)
                .build()
                .map_err(|source| ProxyError::Invalid {
                    label: proxy.label.clone(),
                    source,
                })
        }) {
        Ok(client) => client,
        Err(e) => {
            log::debug!("  {} unusable: {}", proxy.label, e);
            return false;
        }
    };

    match client
        .get(test_url)
        .header(USER_AGENT, PROBE_USER_AGENT)
        .send()
        .await
    {
        Ok(resp) => resp.status() == reqwest::StatusCode::OK,
        Err(e) => {
            log::debug!("  {} test failed: {}", proxy.label, e);
            false
        }
    }
}

/// First reachable proxy in list order, or `None` (caller connects directly)
pub async fn get_available_proxy(proxies: &[ProxyConfig], test_url: &str) -> Option<ProxyConfig> {
    if proxies.is_empty() {
        log::warn!("No proxies configured (PROXY_HOST not set).");
        return None;
    }

    for proxy in proxies {
        log::info!("Testing {} ...", proxy.label);
        if test_proxy(proxy, test_url, PROBE_TIMEOUT).await {
            log::info!("{} is ONLINE.", proxy.label);
            return Some(proxy.clone());
        }
        log::warn!("{} is OFFLINE, trying next...", proxy.label);
    }

    log::error!("All proxies are OFFLINE.");
    None
}
