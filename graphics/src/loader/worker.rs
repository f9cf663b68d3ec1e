//! Background threads for the first load phase.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use toonskin_core::model::ModelAsset;

use super::{LoadError, LoadRequest, ModelLoader, PreparedModel};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a first-phase load running on a [`LoadWorker`].
///
/// The result is delivered exactly once. Dropping the ticket discards the
/// result when it arrives, releasing everything it owns.
///
/// # Example
///
/// ```ignore
/// let ticket = worker.submit(LoadRequest::new("models/hero.glb"))?;
///
/// // Each frame, on the render thread:
/// if let Some(result) = ticket.try_recv() {
///     let model = loader.finalize(result?)?;
///     cache.put("hero", Arc::new(model));
/// }
/// ```
pub struct LoadTicket {
    receiver: mpsc::Receiver<Result<PreparedModel, LoadError>>,
    finished: Arc<AtomicBool>,
}

impl LoadTicket {
    /// Take the result if the load has completed.
    ///
    /// This consumes the value; subsequent calls return `None`.
    pub fn try_recv(&self) -> Option<Result<PreparedModel, LoadError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                if self.finished.load(Ordering::Acquire) {
                    None
                } else {
                    Some(Err(LoadError::WorkerUnavailable))
                }
            }
        }
    }

    /// Block until the load completes.
    ///
    /// This blocks the calling thread; the render thread should poll with
    /// [`try_recv`](Self::try_recv).
    pub fn recv(self) -> Result<PreparedModel, LoadError> {
        self.receiver
            .recv()
            .unwrap_or(Err(LoadError::WorkerUnavailable))
    }

    /// Whether the worker has produced a result.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Fixed pool of threads running [`ModelLoader::prepare`].
pub struct LoadWorker {
    loader: Arc<ModelLoader>,
    sender: Option<mpsc::Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl LoadWorker {
    /// Start as many threads as the loader's configuration asks for.
    pub fn from_config(loader: Arc<ModelLoader>) -> Result<Self, LoadError> {
        let threads = loader.config().worker_threads;
        Self::new(loader, threads)
    }

    /// Start `threads` worker threads.
    pub fn new(loader: Arc<ModelLoader>, threads: usize) -> Result<Self, LoadError> {
        let (sender, handles) = start_threads(threads, |index, receiver| {
            std::thread::Builder::new()
                .name(format!("toonskin-load-{index}"))
                .spawn(move || worker_loop(&receiver))
        })?;
        log::debug!("LoadWorker: started {} threads", handles.len());

        Ok(Self {
            loader,
            sender: Some(sender),
            threads: handles,
        })
    }

    /// Number of running worker threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn loader(&self) -> &Arc<ModelLoader> {
        &self.loader
    }

    /// Run the first phase of `request` in the background.
    pub fn submit(&self, request: LoadRequest) -> Result<LoadTicket, LoadError> {
        let loader = self.loader.clone();
        self.spawn(move || loader.prepare(&request))
    }

    /// Run the first phase of an in-memory asset in the background.
    pub fn submit_asset(
        &self,
        asset: ModelAsset,
        layer_count: Option<u32>,
    ) -> Result<LoadTicket, LoadError> {
        let loader = self.loader.clone();
        self.spawn(move || loader.prepare_asset(asset, layer_count))
    }

    fn spawn<F>(&self, work: F) -> Result<LoadTicket, LoadError>
    where
        F: FnOnce() -> Result<PreparedModel, LoadError> + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(LoadError::WorkerUnavailable)?;
        let (result_tx, result_rx) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();

        let job: Job = Box::new(move || {
            let result = work();
            done.store(true, Ordering::Release);
            // A dropped ticket means the caller discarded the load.
            if let Err(mpsc::SendError(discarded)) = result_tx.send(result) {
                log::debug!(
                    "LoadWorker: discarding result of {}",
                    discarded
                        .as_ref()
                        .map_or("failed load", |prepared| prepared.name())
                );
            }
        });
        sender
            .send(job)
            .map_err(|_| LoadError::WorkerUnavailable)?;

        Ok(LoadTicket {
            receiver: result_rx,
            finished,
        })
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Spawn `threads` consumers of a fresh job channel.
///
/// If any spawn fails, the channel is closed and the threads already
/// started are joined before the error is returned.
fn start_threads<S>(
    threads: usize,
    mut spawn: S,
) -> Result<(mpsc::Sender<Job>, Vec<JoinHandle<()>>), LoadError>
where
    S: FnMut(usize, SharedReceiver) -> std::io::Result<JoinHandle<()>>,
{
    let (sender, receiver) = mpsc::channel::<Job>();
    let receiver = Arc::new(Mutex::new(receiver));

    let mut handles = Vec::with_capacity(threads.max(1));
    for index in 0..threads.max(1) {
        match spawn(index, receiver.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                log::error!("LoadWorker: failed to spawn thread {}: {}", index, e);
                drop(sender);
                join_all(handles);
                return Err(LoadError::WorkerUnavailable);
            }
        }
    }
    Ok((sender, handles))
}

fn worker_loop(receiver: &Mutex<mpsc::Receiver<Job>>) {
    crate::profiling::set_thread_name!("toonskin-load");
    loop {
        let job = receiver.lock().recv();
        let Ok(job) = job else {
            break;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("LoadWorker: load job panicked");
        }
    }
}

impl Drop for LoadWorker {
    fn drop(&mut self) {
        // Closing the channel lets every thread finish its queue and exit.
        self.sender.take();
        join_all(self.threads.drain(..));
    }
}

fn join_all(handles: impl IntoIterator<Item = JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            log::warn!("LoadWorker: worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_spawn_failure_joins_started_threads() {
        let exited = Arc::new(AtomicUsize::new(0));
        let result = start_threads(4, |index, receiver| {
            if index == 2 {
                return Err(std::io::Error::other("no more threads"));
            }
            let exited = exited.clone();
            Ok(std::thread::spawn(move || {
                worker_loop(&receiver);
                exited.fetch_add(1, Ordering::SeqCst);
            }))
        });

        assert!(matches!(result, Err(LoadError::WorkerUnavailable)));
        // Both started threads saw the channel close and were joined.
        assert_eq!(exited.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_threads_starts_one() {
        let (sender, handles) =
            start_threads(0, |_, receiver| Ok(std::thread::spawn(move || worker_loop(&receiver))))
                .unwrap();
        assert_eq!(handles.len(), 1);
        drop(sender);
        join_all(handles);
    }
}
