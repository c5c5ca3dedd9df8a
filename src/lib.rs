macro_rules! diag {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

pub mod config;
pub mod errors;
pub mod media;
pub mod peer;
mod rtc;
pub mod signal;

pub use errors::{Error, FailureKind, Result};
pub use media::{
    MediaDevices, MediaStream, RemoteStream, SampleDevices, StreamOptions, get_local_stream,
};
pub use peer::{Peer, PeerInit};
pub use signal::Signal;
