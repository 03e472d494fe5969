use super::Cli;
use anyhow::Result;
use fabricator_api::{models, Config, EmulatorRegistry, FleetPorts, Ports};

pub async fn main(cli: &Cli, cfg: &Config) -> Result<()> {
    let ports = FleetPorts::new(EmulatorRegistry::default()).available_ports().await?;
    let profiles = models::known_profiles();

    tracing::debug!(ports = ports.len(), "enumerated serial ports");
    for port in ports {
        let name = cfg.name_for(&port.hardware_id);
        let descriptor = models::profile_for(&profiles, &port).map(|profile| *profile.descriptor());

        if cli.json {
            println!(
                "{}",
                serde_json::json!({
                    "port": port,
                    "name": name,
                    "model": descriptor,
                })
            );
            continue;
        }

        let model = match descriptor {
            Some(descriptor) => format!("{} {}", descriptor.manufacturer, descriptor.model),
            None => format!("(unsupported: {})", port.description),
        };
        println!("{}\t{}\t{}\t{}", port.device_path, model, name.unwrap_or("-"), port.hardware_id);
    }
    Ok(())
}
