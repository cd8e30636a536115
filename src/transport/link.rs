use super::{NetworkLink, TransportError};
use tracing::{debug, warn};

const SYSFS_NET: &str = "/sys/class/net";

/// Link check backed by the kernel's view of a network interface.
///
/// Without an interface name the host's networking is trusted as-is and the
/// link is always reported up; the broker session check then carries the
/// whole liveness decision.
#[derive(Debug, Clone)]
pub struct HostLink {
    interface: Option<String>,
    last_state: Option<String>,
}

impl HostLink {
    pub fn new(interface: Option<String>) -> Self {
        Self {
            interface,
            last_state: None,
        }
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    async fn operstate(interface: &str) -> Option<String> {
        let path = format!("{}/{}/operstate", SYSFS_NET, interface);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) => {
                debug!("Unable to read {}: {}", path, e);
                None
            }
        }
    }
}

impl NetworkLink for HostLink {
    async fn check(&mut self) -> bool {
        let Some(interface) = self.interface.clone() else {
            return true;
        };

        let state = Self::operstate(&interface).await;
        if state != self.last_state {
            debug!("Interface {} operstate: {:?}", interface, state);
            self.last_state = state.clone();
        }
        // Virtual interfaces without carrier detection report "unknown"
        matches!(state.as_deref(), Some("up") | Some("unknown"))
    }

    async fn establish(&mut self) -> Result<(), TransportError> {
        if self.check().await {
            return Ok(());
        }
        let interface = self.interface.clone().unwrap_or_default();
        warn!("Waiting for interface {} to come up", interface);
        Err(TransportError::LinkDown(interface))
    }
}
