//! SOA/DLV reachability probe built on the `domain` wire format.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::base::iana::{Rcode, Rtype};
use domain::base::{Message, MessageBuilder, Name};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use dnsprobe_config::EngineConfig;
use dnsprobe_core::orchestration::network::detect_client_addresses;
use dnsprobe_core::orchestration::{AnalysisEngine, ClientAddresses, EngineFactory, JobDescriptor};
use dnsprobe_core::{ProbeError, Result};

const MAX_DGRAM: usize = 4_096;

/// One answered query.
#[derive(Clone, Copy, Debug)]
pub struct Answer {
    pub resolver: SocketAddr,
    pub rcode: Rcode,
    pub answers: u16,
}

/// Sends SOA queries for a name (and its ancestors on request) plus a DLV
/// lookup when the job names a DLV domain.
#[derive(Clone, Debug)]
pub struct DnsProbeEngine {
    resolvers: Vec<SocketAddr>,
    timeout: Duration,
}

impl DnsProbeEngine {
    pub fn new(resolvers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { resolvers, timeout }
    }

    /// Asks each usable resolver in turn until one answers.
    pub async fn query(&self, job: &JobDescriptor, qname: &str, qtype: Rtype) -> Result<Answer> {
        let name = Name::<Vec<u8>>::from_str(qname)
            .map_err(|err| ProbeError::analysis(qname, format!("invalid name: {err}")))?;
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_rd(true);
        builder.header_mut().set_random_id();
        let mut question = builder.question();
        question
            .push((name, qtype))
            .map_err(|err| ProbeError::analysis(qname, format!("cannot build query: {err}")))?;
        let request = question.into_message();

        let mut last_error = None;
        for resolver in &self.resolvers {
            let Some(source) = source_for(job, resolver) else {
                continue;
            };
            match self.exchange(&request, source, *resolver).await {
                Ok(reply) => {
                    return Ok(Answer {
                        resolver: *resolver,
                        rcode: reply.header().rcode(),
                        answers: reply.header_counts().ancount(),
                    });
                }
                Err(err) => {
                    debug!(domain = %qname, %resolver, error = %err, "resolver did not answer");
                    last_error = Some(err);
                }
            }
        }

        Err(ProbeError::analysis(
            qname,
            match last_error {
                Some(err) => format!("no resolver answered {qtype} query: {err}"),
                None => "no resolver reachable from the job's client addresses".to_string(),
            },
        ))
    }

    async fn exchange(
        &self,
        request: &Message<Vec<u8>>,
        source: IpAddr,
        resolver: SocketAddr,
    ) -> std::io::Result<Message<Vec<u8>>> {
        let socket = UdpSocket::bind(SocketAddr::new(source, 0)).await?;
        socket.connect(resolver).await?;
        socket.send(request.as_slice()).await?;

        tokio::time::timeout(self.timeout, async {
            loop {
                let mut buf = vec![0u8; MAX_DGRAM];
                let len = socket.recv(&mut buf).await?;
                buf.truncate(len);
                // Stray or spoofed datagrams are skipped.
                if let Ok(reply) = Message::from_octets(buf)
                    && reply.is_answer(request)
                {
                    return Ok::<_, std::io::Error>(reply);
                }
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "query timed out"))?
    }
}

fn source_for(job: &JobDescriptor, resolver: &SocketAddr) -> Option<IpAddr> {
    match resolver {
        SocketAddr::V4(_) => job.client_ipv4.map(IpAddr::V4),
        SocketAddr::V6(_) => job.client_ipv6.map(IpAddr::V6),
    }
}

/// `www.example.com.` → `www.example.com.`, `example.com.`, `com.`.
pub fn ancestry(name: &str) -> Vec<String> {
    let trimmed = name.trim().trim_end_matches('.');
    let labels: Vec<&str> = trimmed.split('.').filter(|l| !l.is_empty()).collect();
    (0..labels.len())
        .map(|i| format!("{}.", labels[i..].join(".")))
        .collect()
}

/// Name under which a DLV registry publishes `name`'s trust anchor.
pub fn dlv_name(name: &str, dlv_domain: &str) -> String {
    format!(
        "{}.{}.",
        name.trim().trim_end_matches('.'),
        dlv_domain.trim().trim_matches('.')
    )
}

#[async_trait]
impl AnalysisEngine for DnsProbeEngine {
    async fn analyze(&self, job: &JobDescriptor) -> Result<()> {
        let target = job.canonical_name();
        let zones = if job.force_ancestry {
            ancestry(&target)
        } else {
            vec![target.clone()]
        };

        for zone in &zones {
            let answer = self.query(job, zone, Rtype::SOA).await?;
            debug!(domain = %zone, resolver = %answer.resolver, rcode = %answer.rcode, answers = answer.answers, "SOA answered");
            if answer.rcode != Rcode::NOERROR {
                return Err(ProbeError::analysis(
                    zone,
                    format!("SOA query returned {}", answer.rcode),
                ));
            }
        }

        if let Some(dlv) = job.dlv_domain.as_deref() {
            let lookaside = dlv_name(&target, dlv);
            let answer = self.query(job, &lookaside, Rtype::DLV).await?;
            if answer.rcode == Rcode::SERVFAIL {
                return Err(ProbeError::analysis(
                    &lookaside,
                    format!("DLV query returned {}", answer.rcode),
                ));
            }
            debug!(domain = %lookaside, rcode = %answer.rcode, answers = answer.answers, "DLV answered");
        }

        info!(domain = %target, zones = zones.len(), "probe succeeded");
        Ok(())
    }
}

/// Builds [`DnsProbeEngine`]s from [`EngineConfig`], refusing when the host
/// has no usable source address.
#[derive(Clone, Debug)]
pub struct DnsEngineFactory {
    config: EngineConfig,
}

impl DnsEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for DnsEngineFactory {
    fn client_addresses(&self) -> Result<ClientAddresses> {
        detect_client_addresses(
            self.config.connectivity_probe_v4,
            self.config.connectivity_probe_v6,
        )
    }

    fn build(&self) -> Result<Arc<dyn AnalysisEngine>> {
        self.client_addresses()?;
        Ok(Arc::new(DnsProbeEngine::new(
            self.config.resolvers.clone(),
            self.config.query_timeout(),
        )))
    }
}
