use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::board_protocol::{BoardCommand, BoardResponse};
use crate::device_session::SessionError;
use crate::transport::{Transport, TransportError};

/// Transport shared between the session and its watchdog thread. The mutex
/// guarantees a single command in flight on the link.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub(crate) fn lock(transport: &SharedTransport) -> MutexGuard<'_, Box<dyn Transport>> {
    transport.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn exchange(
    transport: &SharedTransport,
    command: &BoardCommand,
) -> Result<BoardResponse, SessionError> {
    let frame = lock(transport).send(&command.to_frame())?;
    Ok(BoardResponse::from_frame(command, &frame)?)
}

/// Permission to keep the board powered, renewed on a fixed cadence by a
/// background thread. If renewals stop, the board firmware disables the
/// power supply on its own.
pub struct WatchdogLease {
    transport: SharedTransport,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    refreshes: Arc<AtomicU64>,
    interval: Duration,
}

impl WatchdogLease {
    pub fn acquire(
        transport: SharedTransport,
        interval: Duration,
        board_timeout: Duration,
    ) -> Result<Self, SessionError> {
        if interval.is_zero() || interval >= board_timeout {
            return Err(SessionError::InvalidWatchdogInterval {
                interval,
                board_timeout,
            });
        }
        let timeout_ms = u16::try_from(board_timeout.as_millis()).unwrap_or(u16::MAX);
        exchange(
            &transport,
            &BoardCommand::SetWatchdog {
                enabled: true,
                timeout_ms,
            },
        )?;
        exchange(&transport, &BoardCommand::RefreshWatchdog)?;
        log::debug!(
            "Watchdog lease acquired: refresh every {:?}, board timeout {:?}",
            interval,
            board_timeout
        );

        let refreshes = Arc::new(AtomicU64::new(1));
        let (stop, stopped) = mpsc::channel::<()>();
        let worker = {
            let transport = Arc::clone(&transport);
            let refreshes = Arc::clone(&refreshes);
            thread::Builder::new()
                .name("dmf-watchdog".to_string())
                .spawn(move || loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            match exchange(&transport, &BoardCommand::RefreshWatchdog) {
                                Ok(_) => {
                                    refreshes.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(SessionError::Transport(TransportError::Disconnected)) => {
                                    log::warn!("Watchdog refresh stopped: link closed");
                                    break;
                                }
                                Err(e) => log::warn!("Watchdog refresh failed: {}", e),
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .map_err(SessionError::WatchdogThread)?
        };

        Ok(Self {
            transport,
            stop: Some(stop),
            worker: Some(worker),
            refreshes,
            interval,
        })
    }

    /// Refresh right now, ahead of the background cadence.
    pub fn renew(&self) -> Result<(), SessionError> {
        exchange(&self.transport, &BoardCommand::RefreshWatchdog)?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn stop_worker(&mut self) {
        drop(self.stop.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Watchdog thread panicked");
            }
        }
    }

    /// Stop renewing and disable the board watchdog.
    pub fn release(mut self) -> Result<(), SessionError> {
        self.stop_worker();
        exchange(
            &self.transport,
            &BoardCommand::SetWatchdog {
                enabled: false,
                timeout_ms: 0,
            },
        )?;
        log::debug!("Watchdog lease released after {} refreshes", self.refresh_count());
        Ok(())
    }
}

impl fmt::Debug for WatchdogLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchdogLease")
            .field("interval", &self.interval)
            .field("refreshes", &self.refresh_count())
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for WatchdogLease {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_board::SimBoard;

    #[test]
    fn test_interval_must_be_shorter_than_board_timeout() {
        let board = SimBoard::new();
        let err = WatchdogLease::acquire(
            board.shared_transport(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::InvalidWatchdogInterval { .. }));
        assert!(!board.state().watchdog_enabled);
    }

    #[test]
    fn test_debug_shows_interval_and_refreshes() {
        let board = SimBoard::new();
        let lease = WatchdogLease::acquire(
            board.shared_transport(),
            Duration::from_secs(10),
            Duration::from_secs(20),
        )
        .unwrap();
        let text = format!("{lease:?}");
        assert!(text.contains("interval: 10s"), "{text}");
        assert!(text.contains("refreshes: 1"), "{text}");
    }

    #[test]
    fn test_background_refresh_runs_until_release() {
        let board = SimBoard::new();
        let lease = WatchdogLease::acquire(
            board.shared_transport(),
            Duration::from_millis(5),
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(board.state().watchdog_enabled);
        assert_eq!(board.state().watchdog_timeout_ms, 100);

        thread::sleep(Duration::from_millis(60));
        assert!(lease.refresh_count() > 2);
        assert!(board.state().watchdog_refreshes > 2);

        lease.release().unwrap();
        let after_release = board.state().watchdog_refreshes;
        thread::sleep(Duration::from_millis(30));
        assert_eq!(board.state().watchdog_refreshes, after_release);
        assert!(!board.state().watchdog_enabled);
    }

    #[test]
    fn test_renew_refreshes_immediately() {
        let board = SimBoard::new();
        let lease = WatchdogLease::acquire(
            board.shared_transport(),
            Duration::from_secs(10),
            Duration::from_secs(20),
        )
        .unwrap();
        let before = board.state().watchdog_refreshes;
        lease.renew().unwrap();
        assert_eq!(board.state().watchdog_refreshes, before + 1);
    }
}
