use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use vigil_common::{Status, StatusDescription};
use vigil_store::accumulator::push_check_result;
use vigil_store::FieldsAccumulator;
use vigil_task::{Runner, Shutdown, ShutdownHandle};

const CHECK_INTERVAL: Duration = Duration::from_secs(60);
const FAST_RECHECK: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(1);

/// Protocol-specific part of a check.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> StatusDescription;
}

struct Sockets {
    handle: Option<ShutdownHandle>,
    tasks: Vec<JoinHandle<()>>,
}

/// The generic check state machine.
///
/// The probe runs first; on success every additional TCP address is dialed
/// once. With `persistent_connection`, successful checks keep a TCP
/// connection open to each address, reading with a rolling one-second
/// deadline; a broken connection that cannot be reopened triggers an
/// immediate re-check.
pub struct BaseCheck {
    metric_name: String,
    item: String,
    main_tcp_address: String,
    tcp_addresses: Vec<String>,
    persistent_connection: bool,
    probe: Option<Arc<dyn Probe>>,
    accumulator: FieldsAccumulator,

    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    sockets: Mutex<Sockets>,
}

impl BaseCheck {
    pub fn new(
        metric_name: impl Into<String>,
        item: impl Into<String>,
        main_tcp_address: impl Into<String>,
        tcp_addresses: Vec<String>,
        persistent_connection: bool,
        probe: Option<Arc<dyn Probe>>,
        accumulator: FieldsAccumulator,
    ) -> BaseCheck {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        BaseCheck {
            metric_name: metric_name.into(),
            item: item.into(),
            main_tcp_address: main_tcp_address.into(),
            tcp_addresses,
            persistent_connection,
            probe,
            accumulator,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            sockets: Mutex::new(Sockets {
                handle: None,
                tasks: Vec::new(),
            }),
        }
    }

    async fn check(&self, shutdown: &Shutdown, previous: StatusDescription) -> (StatusDescription, Duration) {
        let result = self.do_check().await;
        if shutdown.is_shutdown() {
            return (previous, CHECK_INTERVAL);
        }

        let mut next_delay = CHECK_INTERVAL;
        if result.current_status != Status::Ok {
            self.close_sockets().await;
            if previous.current_status == Status::Ok {
                next_delay = FAST_RECHECK;
            }
        } else if self.persistent_connection {
            self.open_sockets(shutdown).await;
        }

        tracing::debug!(
            metric = %self.metric_name,
            item = %self.item,
            status = %result.current_status,
            description = %result.description,
            "check completed"
        );
        push_check_result(&self.accumulator, &self.metric_name, &self.item, result.clone());
        (result, next_delay)
    }

    async fn do_check(&self) -> StatusDescription {
        let mut result = StatusDescription::default();
        if let Some(probe) = &self.probe {
            result = probe.check().await;
            if result.current_status != Status::Ok && result.current_status.is_set() {
                return result;
            }
        }
        for address in &self.tcp_addresses {
            if address == &self.main_tcp_address {
                continue;
            }
            let sub_result = crate::tcp::check_tcp(address, DIAL_TIMEOUT).await;
            if sub_result.current_status != Status::Ok {
                return sub_result;
            }
            if !result.current_status.is_set() {
                result = sub_result;
            }
        }
        if !result.current_status.is_set() {
            result = StatusDescription::new(Status::Ok, "");
        }
        result
    }

    async fn open_sockets(&self, shutdown: &Shutdown) {
        let mut sockets = self.sockets.lock().await;
        if sockets.handle.is_some() {
            return;
        }
        let (handle, child) = ShutdownHandle::new();
        for address in &self.tcp_addresses {
            let address = address.clone();
            let child = child.clone();
            let parent = shutdown.clone();
            let trigger = self.trigger_tx.clone();
            sockets.tasks.push(tokio::spawn(async move {
                socket_loop(child, parent, address, trigger).await;
            }));
        }
        sockets.handle = Some(handle);
    }

    async fn close_sockets(&self) {
        let mut sockets = self.sockets.lock().await;
        if let Some(handle) = sockets.handle.take() {
            handle.shutdown();
        }
        for task in sockets.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

async fn socket_loop(child: Shutdown, parent: Shutdown, address: String, trigger: mpsc::Sender<()>) {
    while !child.is_shutdown() && !parent.is_shutdown() {
        let long_sleep = open_socket_once(&child, &address, &trigger).await;
        let delay = if long_sleep {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(1)
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = child.wait() => {}
            _ = parent.wait() => {}
        }
    }
}

/// Keep one connection open until it breaks. Returns whether the caller
/// should back off before retrying (dial failed).
async fn open_socket_once(shutdown: &Shutdown, address: &str, trigger: &mpsc::Sender<()>) -> bool {
    let mut stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        _ => {
            tracing::debug!(address, "unable to open persistent TCP connection");
            let _ = trigger.try_send(());
            return true;
        }
    };
    let mut buffer = [0u8; 4096];
    while !shutdown.is_shutdown() {
        match timeout(READ_DEADLINE, stream.read(&mut buffer)).await {
            // Deadline passed with the connection still up.
            Err(_) => continue,
            Ok(Ok(0)) => {
                tracing::debug!(address, "persistent TCP connection closed by peer");
                return false;
            }
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => {
                tracing::debug!(address, error = %err, "persistent TCP connection lost");
                return false;
            }
        }
    }
    false
}

#[async_trait]
impl Runner for BaseCheck {
    async fn run(&self, shutdown: Shutdown) -> Result<()> {
        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .await
            .take()
            .expect("BaseCheck::run started twice");

        let mut previous = StatusDescription::new(Status::Ok, "initial status");
        let mut next_delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    self.close_sockets().await;
                    return Ok(());
                }
                _ = tokio::time::sleep(next_delay) => {}
                _ = trigger_rx.recv() => {}
            }
            let (result, delay) = self.check(&shutdown, previous).await;
            previous = result;
            next_delay = delay;
        }
    }

    async fn close(&self) -> Result<()> {
        self.close_sockets().await;
        Ok(())
    }
}
