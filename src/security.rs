//! Security helpers: discovery shared secret, registration host policy,
//! and the per-IP WebSocket connection limiter.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Discovery shared secret
// ---------------------------------------------------------------------------

/// When a key is configured, peers must present it in `X-Discovery-Key`.
pub fn discovery_key_ok(configured: Option<&str>, provided: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) => provided == Some(expected),
    }
}

// ---------------------------------------------------------------------------
// Registration host policy
// ---------------------------------------------------------------------------

/// Reject registrations whose host resolves to a private / loopback /
/// link-local address, unless the deployment explicitly allows them.
pub fn validate_server_host(host: &str, allow_private: bool) -> Result<(), String> {
    if allow_private {
        return Ok(());
    }
    let host = host.trim().to_ascii_lowercase();

    if host == "localhost" || host == "localhost.localdomain" {
        return Err("Localhost registrations are not allowed".to_string());
    }

    let Ok(ip) = host.parse::<IpAddr>() else {
        // Hostnames we cannot classify are allowed through.
        return Ok(());
    };

    let special = match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // Unique-local fc00::/7 and link-local fe80::/10.
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    };
    if special {
        return Err("Private or special IP registrations are not allowed".to_string());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WebSocket limiter
// ---------------------------------------------------------------------------

/// Caps concurrent WebSocket subscriptions per client identity.
pub struct WebSocketLimiter {
    max_connections: usize,
    connections: Mutex<HashMap<String, usize>>,
}

impl WebSocketLimiter {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn can_connect(&self, client_ip: &str) -> bool {
        self.connections
            .lock()
            .get(client_ip)
            .map(|&n| n < self.max_connections)
            .unwrap_or(true)
    }

    /// Register a connection. Returns false when the cap is hit.
    pub fn connect(&self, client_ip: &str) -> bool {
        let mut connections = self.connections.lock();
        let count = connections.entry(client_ip.to_string()).or_insert(0);
        if *count >= self.max_connections {
            return false;
        }
        *count += 1;
        true
    }

    pub fn disconnect(&self, client_ip: &str) {
        let mut connections = self.connections.lock();
        if let Some(count) = connections.get_mut(client_ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(client_ip);
            }
        }
    }
}

impl Default for WebSocketLimiter {
    fn default() -> Self {
        Self::new(5)
    }
}
