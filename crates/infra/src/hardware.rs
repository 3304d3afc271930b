//! Hardware identity of the host

use std::io;
use std::path::Path;
use tracing::debug;

use house_audio_core::domain::bluetooth::MacAddress;

const SYS_CLASS_NET: &str = "/sys/class/net";

/// MAC address of the first non-loopback interface, by interface name
pub async fn primary_mac() -> io::Result<Option<MacAddress>> {
    primary_mac_in(Path::new(SYS_CLASS_NET)).await
}

/// Same as [`primary_mac`] over an arbitrary `sys/class/net` style tree
pub async fn primary_mac_in(dir: &Path) -> io::Result<Option<MacAddress>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != "lo" {
            names.push(name);
        }
    }
    names.sort();

    for name in names {
        let Ok(raw) = tokio::fs::read_to_string(dir.join(&name).join("address")).await else {
            continue;
        };
        match raw.trim().parse::<MacAddress>() {
            Ok(mac) if !mac.is_zero() => {
                debug!(interface = %name, mac = %mac, "Primary hardware address");
                return Ok(Some(mac));
            }
            _ => continue,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn interface(root: &Path, name: &str, address: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("address"), format!("{address}\n")).unwrap();
    }

    #[tokio::test]
    async fn test_skips_loopback_and_zero_addresses() {
        let root = tempfile::tempdir().unwrap();
        interface(root.path(), "lo", "00:00:00:00:00:00");
        interface(root.path(), "dummy0", "00:00:00:00:00:00");
        interface(root.path(), "wlan0", "b8:27:eb:12:34:56");
        interface(root.path(), "eth0", "dc:a6:32:01:02:03");

        let mac = primary_mac_in(root.path()).await.unwrap().unwrap();
        assert_eq!(mac.as_str(), "DC:A6:32:01:02:03");
    }

    #[tokio::test]
    async fn test_no_usable_interface() {
        let root = tempfile::tempdir().unwrap();
        interface(root.path(), "lo", "00:00:00:00:00:00");
        fs::create_dir_all(root.path().join("can0")).unwrap();

        assert!(primary_mac_in(root.path()).await.unwrap().is_none());
    }
}
