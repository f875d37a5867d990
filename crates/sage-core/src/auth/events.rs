/// Session lifecycle notifications.
///
/// Delivered over a `tokio::sync::broadcast` channel; `Expired` is the signal
/// that the user has to log in again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Login succeeded or a stored session was restored
    Established,
    /// The access token was renewed
    Refreshed,
    /// Refresh failed or the server kept rejecting a renewed token
    Expired,
    /// The user logged out or changed their password
    LoggedOut,
}

/// Capacity of the session event channel.
/// Slow subscribers only miss intermediate events, never block the session.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;
