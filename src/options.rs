use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use crate::error::{Error, Result};

/// Creates Azure DNS record sets for LoadBalancer Services.
#[derive(Debug, Clone, Parser)]
#[command(name = "aks-dns-ingress", version, about)]
pub struct Options {
    /// Azure service principal configuration file. The AZURE_CLIENT_* and
    /// AZURE_TENANT_ID/AZURE_SUBSCRIPTION_ID variables are used when absent.
    #[arg(long = "azureconfig", env = "AZURE_AUTH_LOCATION")]
    pub azure_config: Option<PathBuf>,

    /// Path to a kubeconfig file. Falls back to in-cluster configuration
    /// when the file does not exist.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Only watch objects in this namespace.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Root of the DNS domain records are created under.
    #[arg(long = "domain", env = "DOMAIN_NAME_ROOT", default_value = "")]
    pub domain_name_root: String,

    #[arg(long = "resource-group", env = "AZURE_RESOURCE_GROUP", default_value = "")]
    pub resource_group: String,

    /// Name of the cluster resource.
    #[arg(long = "resource", env = "AZURE_RESOURCE_NAME", default_value = "")]
    pub resource_name: String,

    #[arg(long, env = "AZURE_REGION", default_value = "")]
    pub region: String,

    /// How often every watched object is queued again, e.g. "30s" or "5m".
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub interval: Duration,

    /// Number of reconcile workers.
    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    /// Enable debug logging.
    #[arg(short, long)]
    pub debug: bool,
}

impl Options {
    /// Rejects options the controller cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.domain_name_root.is_empty() {
            return Err(Error::Options("domain name root cannot be empty"));
        }
        if self.resource_group.is_empty() {
            return Err(Error::Options("resource group name cannot be empty"));
        }
        if self.resource_name.is_empty() {
            return Err(Error::Options("resource name cannot be empty"));
        }
        if self.region.is_empty() {
            return Err(Error::Options("region cannot be empty"));
        }
        if self.workers == 0 {
            return Err(Error::Options("at least one worker is required"));
        }
        Ok(())
    }

    /// The DNS zone this cluster's records live in:
    /// `hex(subscription + resource group + resource name).region.root`.
    pub fn domain_suffix(&self, subscription_id: &str) -> String {
        let zone: String = [subscription_id, &self.resource_group, &self.resource_name]
            .concat()
            .bytes()
            .map(|byte| format!("{byte:02x}"))
            .collect();

        format!("{zone}.{}.{}", self.region, self.domain_name_root)
    }
}

/// Parses a Go-style duration such as `"30s"`, `"1m30s"` or `"250ms"`.
///
/// Units are `ms`, `s`, `m` and `h`; a bare `"0"` is zero.
pub fn parse_duration(input: &str) -> anyhow::Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        bail!("duration cannot be empty");
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .with_context(|| format!("duration {input:?} is missing a unit"))?;
        if digits == 0 {
            bail!("duration {input:?} has a unit without a value");
        }

        let value: u64 = rest[..digits]
            .parse()
            .with_context(|| format!("duration {input:?} has an invalid value"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            unit => bail!("duration {input:?} has unknown unit {unit:?}"),
        };
        rest = &rest[unit_len..];

        total = total
            .checked_add(part)
            .with_context(|| format!("duration {input:?} overflows"))?;
    }

    Ok(total)
}
