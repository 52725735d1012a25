//! Identity service: plugin name, version, capabilities and readiness.

use super::types::{PluginCapability, PluginInfo};

/// Name the plugin registers under.
pub const PLUGIN_NAME: &str = "stowage.csi.local";

/// Answers identity calls.
#[derive(Clone, Copy, Debug)]
pub struct IdentityService {
    controller: bool,
}

impl IdentityService {
    /// Creates the service; `controller` reports whether this process also
    /// serves controller calls.
    #[must_use]
    pub const fn new(controller: bool) -> Self {
        Self { controller }
    }

    /// Plugin name and crate version.
    #[must_use]
    pub fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Capabilities advertised to the orchestrator.
    #[must_use]
    pub fn capabilities(&self) -> Vec<PluginCapability> {
        let mut capabilities = vec![PluginCapability::OnlineVolumeExpansion];
        if self.controller {
            capabilities.insert(0, PluginCapability::ControllerService);
        }
        capabilities
    }

    /// Readiness probe. The process is ready once it is serving requests.
    #[must_use]
    pub const fn probe(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_info_reports_name_and_version() {
        let info = IdentityService::new(true).plugin_info();
        assert_eq!(info.name, PLUGIN_NAME);
        assert_eq!(info.vendor_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn node_only_process_omits_controller_capability() {
        let capabilities = IdentityService::new(false).capabilities();
        assert_eq!(capabilities, vec![PluginCapability::OnlineVolumeExpansion]);
    }
}
