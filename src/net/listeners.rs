//! Client admission loop.
//!
//! Accepts TCP connections until the broker's shutdown token fires, handing each one to
//! [`Broker::admit`]. Resource exhaustion while accepting is retried with exponential backoff.

use crate::broker::{Broker, ConnectionKind};
use std::io;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const ACCEPT_MIN_SLEEP: Duration = Duration::from_millis(10);
pub const ACCEPT_MAX_SLEEP: Duration = Duration::from_secs(1);

/// Delay between accept retries: starts at [`ACCEPT_MIN_SLEEP`], doubles up to
/// [`ACCEPT_MAX_SLEEP`], and starts over after a successful accept.
#[derive(Debug, Clone, Default)]
pub struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => ACCEPT_MIN_SLEEP,
            Some(delay) => (delay * 2).min(ACCEPT_MAX_SLEEP),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

pub(crate) async fn run_admission_loop(
    listener: TcpListener,
    broker: Broker,
    shutdown: CancellationToken,
) {
    let mut backoff = AcceptBackoff::default();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    broker.admit(stream, peer, ConnectionKind::Client);
                }
                Err(err) if is_transient(&err) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(?delay, "temporary accept error: {err}");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
                Err(err) => tracing::error!("tcp accept error: {err:?}"),
            },
        }
    }
    tracing::info!("stopped accepting client connections");
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) || is_descriptor_exhaustion(err)
}

#[cfg(target_os = "linux")]
fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    // ENFILE, EMFILE
    matches!(err.raw_os_error(), Some(23 | 24))
}

#[cfg(not(target_os = "linux"))]
fn is_descriptor_exhaustion(_err: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap_and_resets() {
        let mut backoff = AcceptBackoff::default();
        let delays: Vec<u64> = (0..9)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), ACCEPT_MIN_SLEEP);
    }

    #[test]
    fn resource_errors_are_transient() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        #[cfg(target_os = "linux")]
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
    }
}
