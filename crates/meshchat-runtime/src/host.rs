//! Dedicated network thread
//!
//! Runs a [`ChatService`] on its own thread with a single-threaded runtime,
//! so a synchronous consumer (a terminal UI, a test harness) never needs an
//! async context. The consumer talks to the service only through the
//! returned [`ConsumerBridge`].

use std::thread;
use tokio::sync::oneshot;

use meshchat_core::{ConsumerBridge, MeshchatError, MeshchatResult};

use crate::service::ChatService;

const THREAD_NAME: &str = "meshchat-network";

/// Handle to a service running on its own thread
#[derive(Debug)]
pub struct ServiceHost {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<MeshchatResult<()>>>,
}

impl ServiceHost {
    /// Start `service` on a new thread, blocking until it is ready
    ///
    /// Start failures are returned here after the thread has exited.
    pub fn spawn(mut service: ChatService) -> MeshchatResult<(ServiceHost, ConsumerBridge)> {
        let consumer = service
            .take_consumer_bridge()
            .ok_or_else(|| MeshchatError::startup_error("consumer bridge already taken"))?;

        let (ready_tx, ready_rx) = oneshot::channel::<MeshchatResult<()>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || -> MeshchatResult<()> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|err| MeshchatError::startup_error(format!("runtime: {}", err)))?;

                runtime.block_on(async move {
                    if let Err(err) = service.start().await {
                        let _ = ready_tx.send(Err(err));
                        return Ok(());
                    }
                    let _ = ready_tx.send(Ok(()));

                    // resolves on `stop` or when the host is dropped
                    let _ = stop_rx.await;
                    service.stop().await
                })
            })
            .map_err(|err| MeshchatError::startup_error(format!("network thread: {}", err)))?;

        match ready_rx.blocking_recv() {
            Ok(Ok(())) => Ok((
                ServiceHost {
                    stop: Some(stop_tx),
                    thread: Some(thread),
                },
                consumer,
            )),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(match thread.join() {
                Ok(Err(err)) => err,
                _ => MeshchatError::startup_error("network thread exited before becoming ready"),
            }),
        }
    }

    /// Stop the service and join its thread
    pub fn stop(mut self) -> MeshchatResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> MeshchatResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| MeshchatError::channel_error("network thread panicked"))?,
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!("network thread did not shut down cleanly: {}", err);
        }
    }
}
