//! Host power status reported in heartbeats.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

/// Battery and power-save status of the collecting host.
#[async_trait]
pub trait PowerStatus: Send + Sync {
    /// Battery charge in percent, `None` without a battery.
    async fn battery_percentage(&self) -> Option<u8>;

    /// Whether the host is saving power, `None` when unknown.
    async fn power_save(&self) -> Option<bool>;
}

/// Reads `/sys/class/power_supply` and the ACPI platform profile.
#[derive(Debug, Clone)]
pub struct SysfsPowerStatus {
    power_supply: PathBuf,
    platform_profile: PathBuf,
}

impl SysfsPowerStatus {
    /// Use the standard sysfs locations.
    pub fn new() -> Self {
        Self::with_root("/sys")
    }

    /// Use a different sysfs root.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            power_supply: root.join("class").join("power_supply"),
            platform_profile: root.join("firmware").join("acpi").join("platform_profile"),
        }
    }

    async fn batteries(&self) -> Vec<PathBuf> {
        let mut batteries = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.power_supply).await else {
            return batteries;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if read_trimmed(&path.join("type")).await.as_deref() == Some("Battery") {
                batteries.push(path);
            }
        }
        batteries.sort();
        batteries
    }
}

impl Default for SysfsPowerStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PowerStatus for SysfsPowerStatus {
    async fn battery_percentage(&self) -> Option<u8> {
        for battery in self.batteries().await {
            if let Some(capacity) = read_trimmed(&battery.join("capacity")).await {
                match capacity.parse::<u8>() {
                    Ok(value) => return Some(value.min(100)),
                    Err(e) => debug!("Unreadable capacity in {}: {}", battery.display(), e),
                }
            }
        }
        None
    }

    async fn power_save(&self) -> Option<bool> {
        read_trimmed(&self.platform_profile)
            .await
            .map(|profile| matches!(profile.as_str(), "low-power" | "quiet"))
    }
}

async fn read_trimmed(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

/// Fixed power status, for hosts without sysfs and for tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticPowerStatus {
    /// Reported battery charge.
    pub battery_percentage: Option<u8>,
    /// Reported power-save flag.
    pub power_save: Option<bool>,
}

#[async_trait]
impl PowerStatus for StaticPowerStatus {
    async fn battery_percentage(&self) -> Option<u8> {
        self.battery_percentage
    }

    async fn power_save(&self) -> Option<bool> {
        self.power_save
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_sysfs_battery() {
        let root = tempfile::tempdir().unwrap();
        let supply = root.path().join("class/power_supply");
        write(&supply.join("AC/type"), "Mains\n");
        write(&supply.join("AC/online"), "1\n");
        write(&supply.join("BAT0/type"), "Battery\n");
        write(&supply.join("BAT0/capacity"), "87\n");
        write(&root.path().join("firmware/acpi/platform_profile"), "low-power\n");

        let status = SysfsPowerStatus::with_root(root.path());
        assert_eq!(status.battery_percentage().await, Some(87));
        assert_eq!(status.power_save().await, Some(true));
    }

    #[tokio::test]
    async fn test_sysfs_without_battery() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("class/power_supply/AC/type"), "Mains\n");
        write(&root.path().join("firmware/acpi/platform_profile"), "balanced\n");

        let status = SysfsPowerStatus::with_root(root.path());
        assert_eq!(status.battery_percentage().await, None);
        assert_eq!(status.power_save().await, Some(false));
    }

    #[tokio::test]
    async fn test_sysfs_missing_root() {
        let status = SysfsPowerStatus::with_root("/nonexistent/sysfs");
        assert_eq!(status.battery_percentage().await, None);
        assert_eq!(status.power_save().await, None);
    }
}
