use crate::utils::run_cmd;
use async_trait::async_trait;
use color_eyre::{
    eyre::{ContextCompat, WrapErr},
    Result,
};
use serde::Deserialize;
use tracing::info;

/// Brings network interfaces up and down by index.
#[async_trait]
pub trait LinkControl: 'static + Send + Sync {
    async fn ifup(&self, ifindex: u32) -> Result<()>;

    async fn ifdown(&self, ifindex: u32) -> Result<()>;
}

/// [`LinkControl`] through iproute2.
pub struct IpLink;

#[async_trait]
impl LinkControl for IpLink {
    async fn ifup(&self, ifindex: u32) -> Result<()> {
        set_link(ifindex, "up").await
    }

    async fn ifdown(&self, ifindex: u32) -> Result<()> {
        set_link(ifindex, "down").await
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct IpLinkEntry {
    ifindex: u32,
    ifname: String,
}

async fn set_link(ifindex: u32, state: &str) -> Result<()> {
    let name = name_of(ifindex).await?;
    run_cmd("ip", &["link", "set", "dev", &name, state])
        .await
        .wrap_err_with(|| format!("failed to set {name} {state}"))?;

    info!("interface {name} ({ifindex}) is {state}");

    Ok(())
}

async fn name_of(ifindex: u32) -> Result<String> {
    let output = run_cmd("ip", &["-j", "link", "show"]).await?;

    parse_links(&output)?
        .into_iter()
        .find(|l| l.ifindex == ifindex)
        .map(|l| l.ifname)
        .wrap_err_with(|| format!("no interface with index {ifindex}"))
}

pub(crate) async fn index_of(name: &str) -> Result<u32> {
    let output = run_cmd("ip", &["-j", "link", "show"]).await?;

    find_index(&parse_links(&output)?, name)
}

fn find_index(links: &[IpLinkEntry], name: &str) -> Result<u32> {
    links
        .iter()
        .find(|l| l.ifname == name)
        .map(|l| l.ifindex)
        .wrap_err_with(|| format!("no interface named {name}"))
}

fn parse_links(output: &str) -> Result<Vec<IpLinkEntry>> {
    let links = serde_json::from_str(output)?;

    Ok(links)
}
