pub(super) struct BrowserHandleInner {
    pub(super) thread: std::thread::JoinHandle<Result<(), std::io::Error>>,
    pub(super) shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

pub(super) struct BrowserHandleDrop(pub(super) Option<BrowserHandleInner>);
impl BrowserHandleDrop {
    fn shutdown(&mut self) -> std::thread::Result<Result<(), std::io::Error>> {
        let BrowserHandleInner {
            thread,
            shutdown_tx,
        } = match self.0.take() {
            Some(inner) => inner,
            None => return Ok(Ok(())),
        };

        shutdown_tx.send(()).ok();
        thread.join()
    }
}
impl Drop for BrowserHandleDrop {
    fn drop(&mut self) {
        self.shutdown().ok();
    }
}

/// Keeps a background [`Browser`](super::Browser) alive; dropping the
/// handle stops it.
pub struct BrowserHandle(pub(super) BrowserHandleDrop);
impl BrowserHandle {
    pub fn shutdown(mut self) -> std::thread::Result<Result<(), std::io::Error>> {
        let res = self.0.shutdown();
        std::mem::forget(self.0);
        res
    }
}
