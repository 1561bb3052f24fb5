use nb_common::{BootConfig, EventBus};
use nb_dhcp::{Lease, SharedLeases};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Render the lease table, one `ip client` line per lease, sorted by address.
pub fn format_leases(leases: &[Lease]) -> String {
    if leases.is_empty() {
        return "no leases".to_string();
    }
    let mut out = String::new();
    for lease in leases {
        out.push_str(&format!("{:<15} {}\n", lease.ip, lease.client));
    }
    out.pop();
    out
}

/// SIGUSR1
pub async fn dump_leases(leases: Option<&SharedLeases>) {
    let Some(leases) = leases else {
        info!("DHCP disabled, no lease table");
        return;
    };
    let table = leases.read().await.leases();
    info!("{} DHCP leases:\n{}", table.len(), format_leases(&table));
}

/// SIGHUP
pub fn save_config(config: &BootConfig, path: &Path) {
    match config.save(path) {
        Ok(()) => info!("Configuration saved to {}", path.display()),
        Err(e) => error!("Failed to save configuration: {}", e),
    }
}

/// Mirror bus events into the log as JSON.
pub fn spawn_event_log(events: &Arc<EventBus>) {
    let dhcp = events.dhcp.subscribe();
    let tftp = events.tftp.subscribe();
    let service = events.service.subscribe();
    tokio::spawn(forward("dhcp", dhcp));
    tokio::spawn(forward("tftp", tftp));
    tokio::spawn(forward("service", service));
}

async fn forward<T>(topic: &'static str, mut rx: broadcast::Receiver<T>)
where
    T: serde::Serialize + Clone + Send + 'static,
{
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => debug!(topic, "{}", json),
                Err(e) => warn!("Failed to serialize {} event: {}", topic, e),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event log lagged, {} {} events skipped", n, topic);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// First CLI argument, else `NETBOOT_CONFIG`, else `netboot.conf`.
pub fn config_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("netboot.conf"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_config_path_precedence() {
        assert_eq!(
            config_path(Some("a.conf".into()), Some("b.conf".into())),
            PathBuf::from("a.conf")
        );
        assert_eq!(config_path(None, Some("b.conf".into())), PathBuf::from("b.conf"));
        assert_eq!(config_path(None, None), PathBuf::from("netboot.conf"));
    }

    #[test]
    fn test_format_leases() {
        assert_eq!(format_leases(&[]), "no leases");
        let leases = vec![
            Lease {
                client: "02:00:00:00:00:01".to_string(),
                ip: Ipv4Addr::new(10, 0, 0, 20),
            },
            Lease {
                client: "02:00:00:00:00:02".to_string(),
                ip: Ipv4Addr::new(10, 0, 0, 21),
            },
        ];
        assert_eq!(
            format_leases(&leases),
            "10.0.0.20       02:00:00:00:00:01\n10.0.0.21       02:00:00:00:00:02"
        );
    }

    #[test]
    fn test_save_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netboot.conf");
        let mut config = BootConfig::default();
        config.boot_file = "undionly.kpxe".to_string();

        save_config(&config, &path);
        let loaded = BootConfig::load(&path).unwrap();
        assert_eq!(loaded.boot_file, "undionly.kpxe");
    }
}
