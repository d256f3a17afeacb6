//! Ephemeral port allocation for the sandbox RPC server.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use tokio::net::TcpListener;

const MAX_ATTEMPTS: usize = 16;

fn leased_ports() -> &'static Mutex<HashSet<u16>> {
    static LEASED: OnceLock<Mutex<HashSet<u16>>> = OnceLock::new();
    LEASED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// A port handed to one execution. Released when dropped.
///
/// The OS listener is already closed so the sandboxed server can bind the
/// port; the lease only keeps concurrent executions in this process from
/// being handed the same number.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Ok(mut leased) = leased_ports().lock() {
            leased.remove(&self.port);
        }
    }
}

/// Ask the OS for a free TCP port.
///
/// Call this once per execution and keep the lease until the subprocess has
/// exited.
pub async fn allocate_port() -> std::io::Result<PortLease> {
    for _ in 0..MAX_ATTEMPTS {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let mut leased = leased_ports()
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "port lease table poisoned"))?;
        if leased.insert(port) {
            tracing::debug!(port, "Allocated ephemeral port");
            return Ok(PortLease { port });
        }
        tracing::debug!(port, "OS returned a port already leased, retrying");
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no free port after {} attempts", MAX_ATTEMPTS),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_nonzero_port() {
        let lease = allocate_port().await.unwrap();
        assert_ne!(lease.port(), 0);
    }

    #[tokio::test]
    async fn allocated_port_is_bindable() {
        let lease = allocate_port().await.unwrap();
        let listener = TcpListener::bind(("127.0.0.1", lease.port())).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn concurrent_allocations_are_distinct() {
        let leases = futures::future::join_all((0..8).map(|_| allocate_port())).await;
        let unique: HashSet<u16> = leases.iter().map(|l| l.as_ref().unwrap().port()).collect();
        assert_eq!(unique.len(), 8);
    }

    #[tokio::test]
    async fn dropping_a_lease_releases_it() {
        let lease = allocate_port().await.unwrap();
        let port = lease.port();
        assert!(leased_ports().lock().unwrap().contains(&port));
        drop(lease);
        assert!(!leased_ports().lock().unwrap().contains(&port));
    }
}
