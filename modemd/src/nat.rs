use crate::utils::run_cmd;
use async_trait::async_trait;
use color_eyre::Result;
use tracing::info;

/// Masquerading for a connected data interface.
#[async_trait]
pub trait NatControl: 'static + Send + Sync {
    async fn enable(&self, interface: &str) -> Result<()>;

    async fn disable(&self, interface: &str) -> Result<()>;
}

/// For hosts where NAT is configured outside of this daemon. Only records the requests.
pub struct ExternalNat;

#[async_trait]
impl NatControl for ExternalNat {
    async fn enable(&self, interface: &str) -> Result<()> {
        info!("NAT requested on {interface}, managed externally");

        Ok(())
    }

    async fn disable(&self, interface: &str) -> Result<()> {
        info!("NAT released on {interface}, managed externally");

        Ok(())
    }
}

/// Masquerades traffic leaving the interface with iptables.
pub struct IptablesNat;

#[async_trait]
impl NatControl for IptablesNat {
    async fn enable(&self, interface: &str) -> Result<()> {
        run_cmd("iptables", &masquerade_args("-A", interface)).await?;
        info!("NAT enabled on {interface}");

        Ok(())
    }

    async fn disable(&self, interface: &str) -> Result<()> {
        run_cmd("iptables", &masquerade_args("-D", interface)).await?;
        info!("NAT disabled on {interface}");

        Ok(())
    }
}

fn masquerade_args<'a>(action: &'a str, interface: &'a str) -> [&'a str; 8] {
    ["-t", "nat", action, "POSTROUTING", "-o", interface, "-j", "MASQUERADE"]
}
