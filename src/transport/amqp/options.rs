//! Broker connection options and failover selection
//!
//! A transport is configured with one or more candidate option sets (one per
//! broker in the fleet). Each connect attempt consumes one set from a shuffled
//! eligibility queue; the queue is refilled from the full pool once drained.

use crate::error::TransportError;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use tracing::debug;
use url::Url;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USER: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";
pub const DEFAULT_VHOST: &str = "/";

/// One broker's connection parameters; absent fields fall back to AMQP defaults
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub vhost: Option<String>,
    /// Unacknowledged deliveries allowed in flight per channel
    pub prefetch: Option<i64>,
    /// Heartbeat interval in seconds
    pub heartbeat: Option<u16>,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("vhost", &self.vhost)
            .field("prefetch", &self.prefetch)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl ConnectionOptions {
    /// Options pointing at `host` with every other field defaulted
    pub fn for_host<S: Into<String>>(host: S) -> Self {
        Self {
            host: Some(host.into()),
            ..Default::default()
        }
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(DEFAULT_USER)
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or(DEFAULT_PASSWORD)
    }

    pub fn vhost(&self) -> &str {
        self.vhost.as_deref().unwrap_or(DEFAULT_VHOST)
    }

    /// True when `host` is set and is a name rather than an IP literal
    pub fn needs_resolution(&self) -> bool {
        self.host
            .as_deref()
            .is_some_and(|host| host.parse::<IpAddr>().is_err())
    }

    /// `host:port` for log lines
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// URI form for log lines, password masked
    pub fn redacted(&self) -> String {
        format!(
            "amqp://{}:***@{}/{}",
            self.user(),
            self.endpoint(),
            encode_vhost(self.vhost())
        )
    }

    /// Render as an `amqp://` URI understood by the broker client
    pub fn to_amqp_uri(&self) -> Result<String, TransportError> {
        let invalid = |message: String| TransportError::InvalidOptions { message };

        let mut url = Url::parse("amqp://localhost")
            .map_err(|e| invalid(format!("base URI: {e}")))?;

        let host = match self.host().parse::<Ipv6Addr>() {
            Ok(v6) => format!("[{v6}]"),
            Err(_) => self.host().to_string(),
        };
        url.set_host(Some(&host))
            .map_err(|e| invalid(format!("host {}: {e}", self.host())))?;
        url.set_port(Some(self.port()))
            .map_err(|_| invalid(format!("port {}", self.port())))?;
        url.set_username(self.user())
            .map_err(|_| invalid(format!("user {}", self.user())))?;
        url.set_password(Some(self.password()))
            .map_err(|_| invalid("password".to_string()))?;
        url.set_path(&format!("/{}", encode_vhost(self.vhost())));

        if let Some(heartbeat) = self.heartbeat {
            url.query_pairs_mut()
                .append_pair("heartbeat", &heartbeat.to_string());
        }

        Ok(url.to_string())
    }
}

/// The vhost is a single path segment, so `/` must be escaped
fn encode_vhost(vhost: &str) -> String {
    vhost.replace('%', "%25").replace('/', "%2F")
}

/// Randomized eligibility queue over the candidate pool
#[derive(Debug, Default)]
pub struct BrokerOptionSelector {
    pool: Vec<ConnectionOptions>,
    eligible: VecDeque<ConnectionOptions>,
}

impl BrokerOptionSelector {
    pub fn new(pool: Vec<ConnectionOptions>) -> Self {
        Self {
            pool,
            eligible: VecDeque::new(),
        }
    }

    /// Replace the candidate pool; the eligibility queue is rebuilt lazily
    pub fn replace_pool(&mut self, pool: Vec<ConnectionOptions>) {
        self.pool = pool;
        self.eligible.clear();
    }

    pub fn pool(&self) -> &[ConnectionOptions] {
        &self.pool
    }

    /// Option sets left before the next reshuffle
    pub fn remaining(&self) -> usize {
        self.eligible.len()
    }

    /// Draw the next option set, reshuffling the pool when drained
    pub fn next(&mut self) -> ConnectionOptions {
        self.next_with(&mut rand::thread_rng())
    }

    pub fn next_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> ConnectionOptions {
        if self.eligible.is_empty() {
            let mut shuffled = self.pool.clone();
            shuffled.shuffle(rng);
            self.eligible = shuffled.into();
            debug!(candidates = self.eligible.len(), "Reshuffled broker candidates");
        }

        self.eligible.pop_front().unwrap_or_default()
    }
}

/// Resolves a broker hostname to one address
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<IpAddr, TransportError>;
}

/// System resolver backed by `tokio::net::lookup_host`
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, TransportError> {
        let mut addresses = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| TransportError::Resolution {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        addresses
            .next()
            .map(|address| address.ip())
            .ok_or_else(|| TransportError::Resolution {
                host: host.to_string(),
                reason: "no addresses returned".to_string(),
            })
    }
}

/// Replace a hostname with its resolved address; IP literals pass through
pub async fn resolve_options(
    options: ConnectionOptions,
    resolver: &dyn HostResolver,
) -> Result<ConnectionOptions, TransportError> {
    if !options.needs_resolution() {
        return Ok(options);
    }

    let host = options.host().to_string();
    let address = resolver.resolve(&host).await?;
    debug!(host = %host, address = %address, "Resolved broker host");

    Ok(ConnectionOptions {
        host: Some(address.to_string()),
        ..options
    })
}
