use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence, SurgeError};

use crate::error::TransportError;

/// Opens echo links to monitored addresses.
pub trait Transport: Send + Sync + 'static {
    type Link: EchoLink;

    fn open(&self, address: &str) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// A link that sends echo requests to one resolved address.
pub trait EchoLink: Send + Sync + 'static {
    /// Sends one echo request with sequence number `seq` and waits for its
    /// reply. `Ok(None)` means no reply arrived before the link gave up; an
    /// `Err` means the link is unusable.
    fn echo(
        &self,
        seq: u16,
    ) -> impl Future<Output = Result<Option<Duration>, TransportError>> + Send + 'static;
}

/// Sanitize hostname by keeping only valid characters (alphanumeric, dots, hyphens)
/// Returns None if the result is empty
fn sanitize_hostname(hostname: &str) -> Option<String> {
    // Also handle case where user included port like "example.com:8080"
    let hostname = hostname.split(':').next().unwrap_or(hostname);

    let sanitized: String = hostname
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '.' || *c == '-')
        .collect();

    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

/// Resolve hostname to IP address
async fn resolve_target(target: &str) -> Option<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some(ip);
    }

    let sanitized = sanitize_hostname(target)?;

    match tokio::net::lookup_host(&format!("{sanitized}:80")).await {
        Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
        Err(_) => None,
    }
}

/// ICMP echo transport backed by surge-ping.
#[derive(Debug, Clone)]
pub struct IcmpTransport {
    /// How long a single echo waits before the link reports "no reply".
    /// The correlator's reaper decides the actual timeout, so this only
    /// needs to outlast it.
    reply_deadline: Duration,
}

impl IcmpTransport {
    pub fn new(reply_deadline: Duration) -> Self {
        Self { reply_deadline }
    }
}

impl Transport for IcmpTransport {
    type Link = IcmpLink;

    async fn open(&self, address: &str) -> Result<IcmpLink, TransportError> {
        let ip = resolve_target(address)
            .await
            .ok_or_else(|| TransportError::Unresolved(address.to_string()))?;
        let config = match ip {
            IpAddr::V4(_) => Config::default(),
            IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
        };
        let client = Client::new(&config)?;
        let identifier = PingIdentifier(rand::random());
        log::debug!("opened icmp link to {address} ({ip}) with identifier {}", identifier.0);
        Ok(IcmpLink {
            client,
            ip,
            identifier,
            reply_deadline: self.reply_deadline,
        })
    }
}

pub struct IcmpLink {
    client: Client,
    ip: IpAddr,
    identifier: PingIdentifier,
    reply_deadline: Duration,
}

impl EchoLink for IcmpLink {
    fn echo(
        &self,
        seq: u16,
    ) -> impl Future<Output = Result<Option<Duration>, TransportError>> + Send + 'static {
        let client = self.client.clone();
        let ip = self.ip;
        let identifier = self.identifier;
        let reply_deadline = self.reply_deadline;
        async move {
            let mut pinger = client.pinger(ip, identifier).await;
            pinger.timeout(reply_deadline);
            match pinger.ping(PingSequence(seq), &[]).await {
                Ok((_, rtt)) => Ok(Some(rtt)),
                Err(SurgeError::Timeout { .. }) => Ok(None),
                Err(SurgeError::IOError(e)) if e.kind() == io::ErrorKind::PermissionDenied => {
                    Err(TransportError::Socket(e))
                }
                Err(e) => {
                    log::debug!("echo {seq} to {ip} failed: {e}");
                    Ok(None)
                }
            }
        }
    }
}
