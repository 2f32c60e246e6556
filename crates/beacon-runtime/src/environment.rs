use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use beacon_protocol::{DeviceSnapshot, EnvironmentProvider, NetworkSnapshot, PipelineConfig};
use chrono::Local;

/// Shared online flag. The host flips it; the scheduler and the network
/// snapshot read it.
#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Store the new state and return the previous one.
    pub fn set(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }
}

/// Environment provider backed by the running process.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    app_name: String,
    app_version: String,
    environment: String,
    connectivity: Connectivity,
}

impl HostEnvironment {
    pub fn new(config: &PipelineConfig, connectivity: Connectivity) -> Self {
        Self {
            app_name: config.app_name.clone(),
            app_version: config.app_version.clone(),
            environment: config.environment.clone(),
            connectivity,
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }
}

impl EnvironmentProvider for HostEnvironment {
    fn device(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            platform: Some(std::env::consts::OS.to_owned()),
            arch: Some(std::env::consts::ARCH.to_owned()),
            language: host_language(),
            timezone_offset_minutes: Some(Local::now().offset().local_minus_utc() / 60),
            user_agent: Some(format!(
                "{}/{} ({})",
                self.app_name,
                self.app_version,
                std::env::consts::OS
            )),
            app_name: Some(self.app_name.clone()),
            app_version: Some(self.app_version.clone()),
            environment: Some(self.environment.clone()),
            ..DeviceSnapshot::default()
        }
    }

    fn network(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            online: Some(self.connectivity.is_online()),
            ..NetworkSnapshot::default()
        }
    }
}

// "en_US.UTF-8" -> "en-US"
fn host_language() -> Option<String> {
    ["LC_ALL", "LANG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty() && value != "C" && value != "POSIX")
        .map(|value| {
            let tag = value.split(['.', '@']).next().unwrap_or_default();
            tag.replace('_', "-")
        })
        .filter(|tag| !tag.is_empty())
}
