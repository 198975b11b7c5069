//! Control channel
//!
//! The control task owns the CUPS transport, the subprocess table and
//! the only writer handle to the registry: every structural change to
//! the entity graph originates here. The loop multiplexes transport
//! I/O, child-exit events and the shutdown signal.

pub mod handlers;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use uecups_common::logging::{log_cups_pdu, Direction};
use uecups_proto::CupsResponse;

use crate::registry::Registry;
use crate::supervisor::{ChildExit, Supervisor};
use server::{ControlEvent, CupsServer};

/// Transport poll granularity; association timers keep firing while
/// the channel is idle.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// The control task state.
pub struct ControlTask {
    server: CupsServer,
    registry: Arc<Registry>,
    supervisor: Supervisor,
    exit_rx: mpsc::Receiver<ChildExit>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlTask {
    /// Assemble the control task around a bound server.
    pub fn new(
        server: CupsServer,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (supervisor, exit_rx) = Supervisor::new();
        Self {
            server,
            registry,
            supervisor,
            exit_rx,
            shutdown_rx,
        }
    }

    /// Run until shutdown. Consumes the task.
    pub async fn run(mut self) {
        info!("control task started");

        loop {
            tokio::select! {
                polled = self.server.poll(POLL_TIMEOUT) => {
                    match polled {
                        Ok(events) => {
                            for event in events {
                                self.handle_event(event).await;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "fatal control transport error");
                            break;
                        }
                    }
                }
                Some(exit) = self.exit_rx.recv() => {
                    self.handle_child_exit(exit).await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.server.stop();
        info!("control task stopped");
    }

    async fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::ClientConnected {
                client_id,
                remote_addr,
            } => {
                debug!(client_id, remote = %remote_addr, "control client connected");
            }
            ControlEvent::ClientClosed { client_id, .. } => {
                // Kill and forget every subprocess this client started.
                let killed = self.supervisor.kill_for_client(client_id);
                if killed > 0 {
                    info!(client_id, killed, "killed subprocesses of closed client");
                }
            }
            ControlEvent::Pdu { client_id, data } => {
                log_cups_pdu(Direction::Rx, &data);
                let response = handlers::handle_pdu(
                    &self.registry,
                    &mut self.supervisor,
                    client_id,
                    &data,
                );
                if let Some(response) = response {
                    self.send_to_client(client_id, &response).await;
                }
            }
        }
    }

    async fn handle_child_exit(&mut self, exit: ChildExit) {
        match self.supervisor.handle_exit(&exit) {
            Some(client_id) => {
                debug!(pid = exit.pid, exit_code = exit.exit_code, "subprocess terminated");
                let ind = CupsResponse::ProgramTermInd {
                    pid: exit.pid as i32,
                    exit_code: exit.exit_code,
                };
                self.send_to_client(client_id, &ind.encode()).await;
            }
            None => {
                info!(
                    pid = exit.pid,
                    exit_code = exit.exit_code,
                    "unknown subprocess terminated, discarding"
                );
            }
        }
    }

    /// Best-effort PDU delivery; the client may already be gone.
    async fn send_to_client(&mut self, client_id: u64, data: &[u8]) {
        log_cups_pdu(Direction::Tx, data);
        if let Err(e) = self.server.send(client_id, data).await {
            warn!(client_id, error = %e, "failed to send PDU");
        }
    }
}
