use anyhow::Result;
use client::monitor::{up_interfaces, LocalNetworks};
use client::{Service, Settings};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = shared::init(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
    print_header_info()?;

    let config_path = std::env::args().nth(1).unwrap_or_else(|| {
        String::from("bandwatch-client.yml")
    });

    if config_path == "list-interfaces" {
        return list_interfaces();
    }

    let settings = Settings::load(&config_path)?;
    if let Some(description) = &settings.client.description {
        info!("{}", description);
    }
    let settings = settings.client.validate()?;

    let service = Service::new(settings);
    service.run().await?;
    Ok(())
}

fn print_header_info() -> Result<()> {
    let bandwatch_official_build = option_env!("BANDWATCH_OFFICIAL_BUILD").unwrap_or("false").parse::<bool>()?;
    shared::print_header(
        bandwatch_official_build,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_GIT_DESCRIBE"),
        env!("VERGEN_GIT_DIRTY"),
        env!("VERGEN_BUILD_TIMESTAMP"),
        env!("VERGEN_CARGO_TARGET_TRIPLE"),
    );
    Ok(())
}

fn list_interfaces() -> Result<()> {
    let interfaces = NetworkInterface::show()?;
    let up = up_interfaces();
    let local = LocalNetworks::from_interfaces(&interfaces, |iface| up.contains(&iface.name));
    for iface in interfaces {
        println!();
        let state = if up.contains(&iface.name) { "up" } else { "down or loopback" };
        println!("{} ({})", iface.name, state);
        for addr in &iface.addr {
            let ip = addr.ip();
            let role = if local.contains(ip) { "local" } else { "ignored" };
            println!("  Address: {} ({})", ip, role);
        }
    }
    Ok(())
}
