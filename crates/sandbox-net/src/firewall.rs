//! Host-side redirection of guest web traffic to the intercepting proxy.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::command::{self, Privilege};
use crate::error::Result;

/// Default port the intercepting proxy listens on.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Guest destination ports redirected to the proxy.
pub const REDIRECTED_PORTS: [u16; 2] = [80, 443];

/// Per-VM redirection rules on the host.
#[async_trait]
pub trait FirewallRules: Send + Sync {
    /// Redirect the guest's outbound web traffic to the proxy.
    async fn install(&self, guest_ip: Ipv4Addr) -> Result<()>;

    /// Remove what [`FirewallRules::install`] added.
    async fn remove(&self, guest_ip: Ipv4Addr) -> Result<()>;
}

/// `iptables -t nat PREROUTING ... REDIRECT` rules.
#[derive(Debug, Clone)]
pub struct IptablesRedirect {
    proxy_port: u16,
}

impl IptablesRedirect {
    pub fn new(proxy_port: u16) -> Self {
        Self { proxy_port }
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    async fn apply(&self, op: Op, guest_ip: Ipv4Addr, port: u16) -> Result<()> {
        let args = rule_args(op, guest_ip, port, self.proxy_port);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        command::run("iptables", &args, Privilege::Sudo).await?;
        Ok(())
    }
}

impl Default for IptablesRedirect {
    fn default() -> Self {
        Self::new(DEFAULT_PROXY_PORT)
    }
}

#[async_trait]
impl FirewallRules for IptablesRedirect {
    async fn install(&self, guest_ip: Ipv4Addr) -> Result<()> {
        for (i, port) in REDIRECTED_PORTS.iter().enumerate() {
            if let Err(e) = self.apply(Op::Append, guest_ip, *port).await {
                for added in &REDIRECTED_PORTS[..i] {
                    if let Err(undo) = self.apply(Op::Delete, guest_ip, *added).await {
                        warn!(
                            %guest_ip,
                            port = added,
                            error = %undo,
                            "failed to undo partial redirect"
                        );
                    }
                }
                return Err(e);
            }
        }
        debug!(%guest_ip, proxy_port = self.proxy_port, "installed proxy redirect");
        Ok(())
    }

    async fn remove(&self, guest_ip: Ipv4Addr) -> Result<()> {
        let mut first_err = None;
        for port in REDIRECTED_PORTS {
            if let Err(e) = self.apply(Op::Delete, guest_ip, port).await {
                warn!(%guest_ip, port, error = %e, "failed to remove proxy redirect");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                debug!(%guest_ip, "removed proxy redirect");
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Append,
    Delete,
}

fn rule_args(op: Op, guest_ip: Ipv4Addr, port: u16, proxy_port: u16) -> Vec<String> {
    let flag = match op {
        Op::Append => "-A",
        Op::Delete => "-D",
    };
    let guest_ip = guest_ip.to_string();
    let port = port.to_string();
    let proxy_port = proxy_port.to_string();
    [
        "-t",
        "nat",
        flag,
        "PREROUTING",
        "-s",
        guest_ip.as_str(),
        "-p",
        "tcp",
        "--dport",
        port.as_str(),
        "-j",
        "REDIRECT",
        "--to-ports",
        proxy_port.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
