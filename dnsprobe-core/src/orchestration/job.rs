use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Local source addresses a probe may use, one per address family.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientAddresses {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl ClientAddresses {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

impl fmt::Display for ClientAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ipv4, self.ipv6) {
            (Some(v4), Some(v6)) => write!(f, "{v4}, {v6}"),
            (Some(v4), None) => write!(f, "{v4}"),
            (None, Some(v6)) => write!(f, "{v6}"),
            (None, None) => write!(f, "none"),
        }
    }
}

/// One probe request. Built by a driver right before dispatch and handed to
/// the engine by value; every job of one batch shares `start_time`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub dlv_domain: Option<String>,
    pub client_ipv4: Option<Ipv4Addr>,
    pub client_ipv6: Option<Ipv6Addr>,
    pub force_ancestry: bool,
    pub start_time: DateTime<Utc>,
}

impl JobDescriptor {
    /// Lowercased, dot-terminated form used in logs.
    pub fn canonical_name(&self) -> String {
        let mut name = self.name.trim().to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        name
    }

    pub fn client_addresses(&self) -> ClientAddresses {
        ClientAddresses {
            ipv4: self.client_ipv4,
            ipv6: self.client_ipv6,
        }
    }
}

/// Run-wide fields shared by every job a driver produces.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobTemplate {
    pub dlv_domain: Option<String>,
    pub clients: ClientAddresses,
    pub force_ancestry: bool,
}

impl JobTemplate {
    pub fn job_for(&self, name: impl Into<String>, start_time: DateTime<Utc>) -> JobDescriptor {
        JobDescriptor {
            name: name.into(),
            dlv_domain: self.dlv_domain.clone(),
            client_ipv4: self.clients.ipv4,
            client_ipv6: self.clients.ipv6,
            force_ancestry: self.force_ancestry,
            start_time,
        }
    }
}
