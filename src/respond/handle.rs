use super::Command;
use crate::{
    conn::InboundRequest,
    errors::{ProbeError, RespondError, ShutdownError},
    service::Service,
};
use std::{
    collections::BTreeMap,
    sync::{atomic::AtomicU64, Arc, RwLock},
};
use tokio::sync::{mpsc, oneshot};

pub(super) struct ResponderHandleInner {
    thread: std::thread::JoinHandle<Result<(), RespondError>>,
    shutdown_tx: oneshot::Sender<()>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    ids: Arc<AtomicU64>,
}

pub(super) struct ResponderHandleDrop(Option<ResponderHandleInner>);
impl ResponderHandleDrop {
    fn shutdown(&mut self) -> Result<(), ShutdownError> {
        let ResponderHandleInner {
            thread,
            shutdown_tx,
            ..
        } = match self.0.take() {
            Some(inner) => inner,
            None => return Ok(()),
        };

        if !thread.is_finished() {
            shutdown_tx.send(()).ok();
        }

        match thread.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ShutdownError::Respond(err)),
            Err(err) => Err(ShutdownError::ThreadJoinError(err)),
        }
    }
}
impl Drop for ResponderHandleDrop {
    fn drop(&mut self) {
        if let Err(ShutdownError::ThreadJoinError(err)) = self.shutdown() {
            Err::<(), _>(err).unwrap();
        }
    }
}

/// Controls a responder running on a background thread. Dropping the
/// handle shuts the responder down, sending goodbyes for every managed
/// service.
pub struct ResponderHandle(pub(super) ResponderHandleDrop);

impl ResponderHandle {
    pub(super) fn new(
        thread: std::thread::JoinHandle<Result<(), RespondError>>,
        shutdown_tx: oneshot::Sender<()>,
        cmd_tx: mpsc::UnboundedSender<Command>,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self(ResponderHandleDrop(Some(ResponderHandleInner {
            thread,
            shutdown_tx,
            cmd_tx,
            ids,
        })))
    }

    /// Stops the responder after it said goodbye for its services.
    pub fn shutdown(mut self) -> Result<(), ShutdownError> {
        let res = self.0.shutdown();
        std::mem::forget(self.0);
        res
    }

    /// Probes for the service's names and announces it. Blocks until the
    /// names are claimed; a conflict that cannot be resolved within the
    /// probing deadline is returned as an error.
    pub fn add(&self, service: Service) -> Result<ServiceHandle, ProbeError> {
        let inner = match &self.0 .0 {
            Some(inner) => inner,
            None => return Err(ProbeError::Shutdown),
        };

        let id = inner.ids.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let shared = Arc::new(RwLock::new(service.clone()));
        let (reply_tx, reply_rx) = oneshot::channel();

        inner
            .cmd_tx
            .send(Command::Add {
                id,
                service,
                shared: shared.clone(),
                reply: reply_tx,
            })
            .map_err(|_| ProbeError::Shutdown)?;

        match reply_rx.blocking_recv() {
            Ok(Ok(())) => Ok(ServiceHandle::new(id, inner.cmd_tx.clone(), shared)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ProbeError::Shutdown),
        }
    }

    /// Retracts the service with a goodbye and stops managing it. Unknown
    /// or already-removed handles are a no-op.
    pub fn remove(&self, handle: &ServiceHandle) {
        if let Some(inner) = &self.0 .0 {
            inner.cmd_tx.send(Command::Remove(handle.id)).ok();
        }
    }

    /// Registers a function called with a copy of every inbound request.
    pub fn debug<F>(&self, f: F)
    where
        F: Fn(&InboundRequest) + Send + 'static,
    {
        if let Some(inner) = &self.0 .0 {
            inner.cmd_tx.send(Command::Tap(Box::new(f))).ok();
        }
    }
}

#[derive(Clone)]
/// Refers to one service managed by a responder. The handle submits
/// commands into the responder; it holds no reference back to it, so it
/// stays valid (as a no-op) after the responder is gone.
pub struct ServiceHandle {
    pub(super) id: u64,
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<RwLock<Service>>,
}

impl ServiceHandle {
    pub(super) fn new(
        id: u64,
        tx: mpsc::UnboundedSender<Command>,
        shared: Arc<RwLock<Service>>,
    ) -> Self {
        Self { id, tx, shared }
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    /// The service as currently advertised, including any renames probing
    /// had to apply.
    pub fn service(&self) -> Service {
        self.shared.read().unwrap().clone()
    }

    /// Replaces the TXT data and re-announces the TXT record.
    pub fn update_txt(&self, txt: BTreeMap<String, String>) {
        self.tx.send(Command::UpdateText(self.id, txt)).ok();
    }
}
