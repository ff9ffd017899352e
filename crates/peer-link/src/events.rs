use relay_bus::Envelope;

/// Why a record left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The primitive reported `failed`.
    Failed,
    /// The primitive reported `closed`.
    Closed,
    /// The channel never opened within the grace period.
    Zombie,
    /// The peer announced it is leaving.
    Left,
    /// Removed through the public API or on shutdown.
    Local,
    /// Torn down to be recreated.
    Reset,
}

/// Observable side effects of the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected { peer_id: String },
    ChannelOpen { peer_id: String },
    Removed { peer_id: String, reason: RemovalReason },
    /// A non-reserved notification addressed to us.
    Notification(Envelope),
}
