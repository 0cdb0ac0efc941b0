//! A single-line spinner for long-running git operations.
//!
//! Only shown when stdout is a terminal. The line is always cleared before
//! the spinner is dropped, so diagnostics never land mid-line.

use std::io::{self, IsTerminal, Write};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];
const TICK: Duration = Duration::from_millis(100);

pub struct Spinner {
    ticker: Option<(Sender<()>, JoinHandle<()>)>,
}

impl Spinner {
    /// Start spinning with the given label, or do nothing when stdout is not
    /// a TTY.
    pub fn start(label: &str) -> Self {
        if !io::stdout().is_terminal() {
            return Spinner { ticker: None };
        }

        let label = label.to_string();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::spawn(move || {
            let mut frame = 0usize;
            loop {
                print!("\r{} {}", label, FRAMES[frame % FRAMES.len()]);
                let _ = io::stdout().flush();
                frame += 1;
                match stop_rx.recv_timeout(TICK) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Clear the line before anything else is printed.
            print!("\r\x1b[K");
            let _ = io::stdout().flush();
        });
        Spinner {
            ticker: Some((stop_tx, handle)),
        }
    }

    /// Stop the spinner and clear its line.
    pub fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some((stop_tx, handle)) = self.ticker.take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop();
    }
}
