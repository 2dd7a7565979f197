use anyhow::Context;
use pcap::Device;
use tracing::info;

use crate::error::Error;

/// Interfaces to monitor when none are given: every device with an address
/// except loopback, or only the bonding device if there is one.
pub fn monitored_devices() -> anyhow::Result<Vec<String>> {
    let devices = Device::list().context("Failed to list network devices")?;
    for device in &devices {
        info!(
            "Found device: {} ({})",
            device.name,
            device.desc.as_deref().unwrap_or("no description")
        );
    }

    let selected = select_devices(
        devices
            .iter()
            .filter(|device| !device.addresses.is_empty())
            .map(|device| device.name.as_str()),
    );
    if selected.is_empty() {
        return Err(Error::NoDeviceFound.into());
    }
    Ok(selected)
}

fn select_devices<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut selected = Vec::new();
    for name in names {
        if name.starts_with("lo") {
            continue;
        }
        if name.starts_with("bond") {
            return vec![name.to_owned()];
        }
        selected.push(name.to_owned());
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["eth0", "lo", "wlan0"], &["eth0", "wlan0"])]
    #[case(&["lo", "eth0", "bond0", "eth1"], &["bond0"])]
    #[case(&["lo"], &[])]
    #[case(&["loopback0", "docker0"], &["docker0"])]
    fn test_select_devices(#[case] names: &[&str], #[case] expected: &[&str]) {
        assert_eq!(select_devices(names.iter().copied()), expected);
    }
}
