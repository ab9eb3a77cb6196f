//! Connection state machine for the push channel.

use std::fmt;

/// Lifecycle of the push channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Initial state, and terminal after `disconnect` or giving up
    #[default]
    Disconnected,
    /// Handshake outstanding; outbound frames are buffered
    Connecting,
    /// Transport open; inbound frames are dispatched
    Connected,
    /// Transport lost; a backoff timer will trigger the next attempt
    Reconnecting,
}

impl ChannelState {
    /// Whether handlers may be registered.
    pub fn accepts_subscriptions(&self) -> bool {
        *self != ChannelState::Disconnected
    }

    /// Apply `input`, or `None` when the transition is illegal.
    pub fn next(self, input: ChannelInput) -> Option<ChannelState> {
        use ChannelInput::*;
        use ChannelState::*;

        match (self, input) {
            (_, Disconnect) => Some(Disconnected),

            (Disconnected, Connect) => Some(Connecting),
            // connect() while already live is a no-op
            (Connecting | Connected | Reconnecting, Connect) => Some(self),

            (Connecting, Opened) => Some(Connected),
            (Connecting | Connected, TransportLost) => Some(Reconnecting),
            (Reconnecting, RetryDue) => Some(Connecting),
            (Reconnecting, GiveUp) => Some(Disconnected),

            _ => None,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Reconnecting => "reconnecting",
        })
    }
}

/// Something that happened to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelInput {
    Connect,
    Opened,
    TransportLost,
    RetryDue,
    GiveUp,
    Disconnect,
}

impl fmt::Display for ChannelInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelInput::Connect => "connect",
            ChannelInput::Opened => "opened",
            ChannelInput::TransportLost => "transport lost",
            ChannelInput::RetryDue => "retry due",
            ChannelInput::GiveUp => "give up",
            ChannelInput::Disconnect => "disconnect",
        })
    }
}
