/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use core::fmt;

type Boxed = Box<dyn std::error::Error + Send + Sync>;

/// All the ways operating a detector can fail.
///
/// Programmer errors (starting twice, stopping a stopped detector,
/// closing twice) are not represented here: those panic, since they
/// indicate API misuse rather than runtime conditions.
#[derive(Debug)]
pub enum Error {
    /// Wire bytes do not describe a valid [`crate::Addr`].
    ///
    /// Can happen during normal operation when receiving junk data.
    InvalidAddress,

    /// Wraps [`crate::Codec`] encoding failures.
    ///
    /// Shouldn't happen under normal circumstances unless using a
    /// broken codec.
    Encode(Boxed),

    /// Wraps [`crate::Codec`] decoding failures.
    ///
    /// Can happen during normal operation when receiving junk data.
    /// The offending message is dropped and the receive loop
    /// continues.
    Decode(Boxed),

    /// The transport has been closed.
    ///
    /// Terminates the receive task; the detector stays in a zombie
    /// state until closed.
    TransportClosed,

    /// Wraps transport delivery failures (unreachable address,
    /// congestion on a transport that doesn't drop silently).
    ///
    /// Dissemination tolerates per-message loss; these are logged and
    /// the message is dropped.
    Transport(Boxed),
}

impl Error {
    pub(crate) fn encode(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Encode(Box::new(err))
    }

    pub(crate) fn decode(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Decode(Box::new(err))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Wrapped errors have to allocate to compare, but
            // PartialEq on an error type is mostly useful for tests
            (Self::Encode(a), Self::Encode(b)) => a.to_string().eq(&b.to_string()),
            (Self::Decode(a), Self::Decode(b)) => a.to_string().eq(&b.to_string()),
            (Self::Transport(a), Self::Transport(b)) => a.to_string().eq(&b.to_string()),

            (Self::InvalidAddress, Self::InvalidAddress) => true,
            (Self::TransportClosed, Self::TransportClosed) => true,

            // Explicitly enumerated so that adding a variant without
            // updating this impl fails to compile
            (Self::Encode(_), _) => false,
            (Self::Decode(_), _) => false,
            (Self::Transport(_), _) => false,
            (Self::InvalidAddress, _) => false,
            (Self::TransportClosed, _) => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress => formatter.write_str("Invalid binary address"),
            Self::Encode(err) => write!(formatter, "Encode error: {err}"),
            Self::Decode(err) => write!(formatter, "Decode error: {err}"),
            Self::TransportClosed => formatter.write_str("Transport is closed"),
            Self::Transport(err) => write!(formatter, "Transport error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    fn ensure_send_sync<T: Send + Sync>(_val: T) {}

    #[test]
    fn errors_are_sync() {
        ensure_send_sync(super::Error::TransportClosed);
    }
}
