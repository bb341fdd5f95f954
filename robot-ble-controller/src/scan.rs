//! Scan controller: owns the running scan and its deferred auto-stop
//!
//! Every scan gets a new cycle number. The pump and timer tasks tag their
//! messages with it, so anything that arrives after the scan ended (or after a
//! newer scan started) is recognised as stale and dropped.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adapter::{BleAdapter, PeerEvent};
use crate::controller::Radio;

/// Why a scan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStopReason {
    Requested,
    Timeout,
    PeerSelected,
    Disconnected,
    /// The adapter stopped delivering results
    Failed,
}

struct ActiveScan {
    cycle: u64,
    pump: JoinHandle<()>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct ScanController {
    cycle: u64,
    active: Option<ActiveScan>,
}

impl ScanController {
    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    /// Whether `cycle` belongs to the scan that is running right now
    pub fn is_current(&self, cycle: u64) -> bool {
        self.active.as_ref().is_some_and(|scan| scan.cycle == cycle)
    }

    /// Start forwarding `results` to the mailbox and arm the auto-stop
    pub fn begin<A: BleAdapter>(
        &mut self,
        mut results: BoxStream<'static, PeerEvent>,
        timeout: Duration,
        mailbox: mpsc::Sender<Radio<A>>,
    ) -> u64 {
        self.end();
        self.cycle += 1;
        let cycle = self.cycle;

        let tx = mailbox.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = results.next().await {
                if tx.send(Radio::PeerFound { cycle, event }).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Radio::ScanEnded { cycle }).await;
        });

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = mailbox.send(Radio::ScanTimedOut { cycle }).await;
        });

        self.active = Some(ActiveScan { cycle, pump, timer });
        cycle
    }

    /// Cancel the pump and the pending auto-stop; returns whether a scan was running
    pub fn end(&mut self) -> bool {
        match self.active.take() {
            Some(scan) => {
                scan.pump.abort();
                scan.timer.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.end();
    }
}
