/// Lifecycle of the inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// No traffic within the heartbeat timeout; a reconnect follows
    Degraded,
    Reconnecting,
}

/// Observations fed into [`ConnectionState::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Dial,
    HandshakeAcknowledged,
    Traffic,
    SilenceTimeout,
    Closed,
    Shutdown,
}

impl ConnectionState {
    /// The single transition function for the connection lifecycle.
    /// Events that make no sense in the current state leave it unchanged.
    pub fn on(self, event: TransportEvent) -> ConnectionState {
        use ConnectionState::*;
        use TransportEvent::*;

        match (self, event) {
            (_, Shutdown) => Disconnected,
            (Disconnected | Reconnecting, Dial) => Connecting,
            (Connecting, HandshakeAcknowledged) => Connected,
            (Connected | Degraded, Traffic) => Connected,
            (Connected, SilenceTimeout) => Degraded,
            (Connecting | Connected | Degraded, Closed | SilenceTimeout) => Reconnecting,
            (state, _) => state,
        }
    }
}
