//! Local port allocation for forwarding sessions.

pub mod allocator;
pub mod probe;

pub use allocator::PortAllocator;

/// Source of operator port preferences.
pub trait Preferences: Send + Sync {
    /// Inclusive range probed for ephemeral ports.
    fn port_range(&self) -> (u16, u16);

    /// Sticky local port for a target name and remote endpoint, if any.
    fn sticky_port(
        &self,
        target_name: &str,
        remote_port: u16,
        remote_host: Option<&str>,
    ) -> Option<u16>;
}
