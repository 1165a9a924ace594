//! natpmpc - NAT-PMP command line client
//!
//! ```text
//! natpmpc external-ip
//! natpmpc map <tcp|udp> <private-port> [public-port] [lifetime-secs]
//! natpmpc unmap <tcp|udp> <private-port>
//! ```
//!
//! The gateway and retry settings are read from the JSON file named by
//! `NATPMP_CONFIG` (default `natpmp.json`); `NATPMP_GATEWAY` overrides the
//! gateway address.

use anyhow::{Context, bail};
use natpmp::{Client, ClientConfig, Protocol};
use std::env;

const DEFAULT_LIFETIME_SECS: u32 = 3600;

fn usage() -> &'static str {
    concat!(
        "usage: natpmpc external-ip",
        " | map <tcp|udp> <private> [public] [lifetime]",
        " | unmap <tcp|udp> <private>"
    )
}

fn parse_protocol(arg: Option<&String>) -> anyhow::Result<Protocol> {
    match arg.map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("tcp") => Ok(Protocol::Tcp),
        Some("udp") => Ok(Protocol::Udp),
        other => bail!("expected tcp or udp, got {:?}\n{}", other, usage()),
    }
}

fn parse_number<N: std::str::FromStr>(
    arg: Option<&String>,
    name: &str,
) -> anyhow::Result<Option<N>> {
    arg.map(|s| s.parse::<N>())
        .transpose()
        .map_err(|_| anyhow::anyhow!("invalid {}\n{}", name, usage()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    natpmp::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config_path = env::var("NATPMP_CONFIG").unwrap_or_else(|_| "natpmp.json".to_string());
    let mut config = ClientConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path))?;
    if let Ok(gateway) = env::var("NATPMP_GATEWAY") {
        config.gateway = Some(gateway.parse().context("parsing NATPMP_GATEWAY")?);
    }

    let client = Client::bind(config).await.context("starting NAT-PMP client")?;

    let outcome = match args.first().map(String::as_str) {
        Some("external-ip") => client
            .get_external_ip()
            .await
            .map(|ip| println!("External IP Address: {}", ip)),
        Some("map") => {
            let protocol = parse_protocol(args.get(1))?;
            let private_port =
                parse_number::<u16>(args.get(2), "private port")?.context(usage())?;
            let public_port =
                parse_number::<u16>(args.get(3), "public port")?.unwrap_or(private_port);
            let lifetime =
                parse_number::<u32>(args.get(4), "lifetime")?.unwrap_or(DEFAULT_LIFETIME_SECS);
            client
                .map_port(protocol, private_port, public_port, lifetime)
                .await
                .map(|mapping| {
                    println!(
                        "Port Mapping: {} {} -> {} for {}s (expires {})",
                        mapping.protocol,
                        mapping.private_port,
                        mapping.public_port,
                        mapping.lifetime_secs,
                        mapping.expires_at()
                    )
                })
        }
        Some("unmap") => {
            let protocol = parse_protocol(args.get(1))?;
            let private_port = parse_number::<u16>(args.get(2), "private port")?
                .context(usage())?;
            client
                .unmap_port(protocol, private_port)
                .await
                .map(|()| println!("Removed {} mapping for port {}", protocol, private_port))
        }
        _ => {
            client.close().await;
            bail!(usage());
        }
    };

    client.close().await;
    outcome.context("NAT-PMP request failed")
}
