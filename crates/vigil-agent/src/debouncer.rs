//! Coalescing trigger for discovery and fact refreshes.
//!
//! Container events, netstat changes and SIGHUP can all fire within the
//! same second; the handler waits ten seconds after the first trigger and
//! serves every pending request in one pass.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use vigil_discovery::Discovery;
use vigil_facts::FactProvider;
use vigil_task::{Runner, Shutdown};

const COALESCE_DELAY: Duration = Duration::from_secs(10);

#[derive(Default, Clone, Copy)]
struct Pending {
    discovery: bool,
    facts: bool,
}

pub struct TriggerHandler {
    discovery: Arc<Discovery>,
    facts: Arc<FactProvider>,
    pending: Mutex<Pending>,
    tx: mpsc::Sender<()>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl TriggerHandler {
    pub fn new(discovery: Arc<Discovery>, facts: Arc<FactProvider>) -> TriggerHandler {
        let (tx, rx) = mpsc::channel(1);
        TriggerHandler {
            discovery,
            facts,
            pending: Mutex::new(Pending::default()),
            tx,
            rx: tokio::sync::Mutex::new(Some(rx)),
        }
    }

    /// Request a refresh; multiple calls within the coalescing window run
    /// once.
    pub fn fire(&self, discovery: bool, facts: bool) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.discovery |= discovery;
            pending.facts |= facts;
        }
        let _ = self.tx.try_send(());
    }

    fn take_pending(&self) -> Pending {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    async fn handle(&self) {
        let pending = self.take_pending();
        if pending.discovery {
            if let Err(err) = self.discovery.discovery(Duration::ZERO).await {
                tracing::warn!(error = %err, "triggered discovery failed");
            }
        }
        if pending.facts {
            let _ = self.facts.facts(Duration::ZERO);
        }
    }
}

#[async_trait]
impl Runner for TriggerHandler {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .expect("TriggerHandler::run started twice");
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                received = rx.recv() => {
                    if received.is_none() {
                        return Ok(());
                    }
                }
            }
            if shutdown.sleep(COALESCE_DELAY).await {
                return Ok(());
            }
            // Drain triggers accumulated during the wait.
            while rx.try_recv().is_ok() {}
            self.handle().await;
        }
    }
}
