use std::fmt;

/// Backend health as tracked by the forwarding engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    /// Requests are forwarded to the backend
    Up,
    /// Backend unreachable; requests are answered from the proxy cache
    Down,
    /// A reconnect attempt is in progress
    Probing,
}

impl BackendHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendHealth::Up => "UP",
            BackendHealth::Down => "DOWN",
            BackendHealth::Probing => "PROBING",
        }
    }
}

impl fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
