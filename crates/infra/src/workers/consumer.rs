use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::debug;

use jobrelay_events::{Delivery, Subscription};

/// How long a consumer blocks on its subscription before re-checking for
/// shutdown.
pub const CONSUMER_TICK: Duration = Duration::from_millis(250);

/// Handle to control and join a background consumer thread.
#[derive(Debug)]
pub struct ConsumerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the consumer to stop after its current delivery.
    pub fn signal(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the consumer thread to exit.
    pub fn join(mut self) {
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                tracing::error!(consumer = %self.name, "consumer thread panicked");
            }
        }
    }

    /// Request graceful shutdown and wait for the consumer to stop.
    pub fn shutdown(self) {
        self.signal();
        self.join();
    }
}

/// Spawn a thread that feeds every delivery of `sub` to `handler`.
///
/// - `handler` owns the delivery and is responsible for settling it; an
///   unsettled delivery is nacked when dropped
/// - the loop exits on shutdown or when the subscription closes
pub fn spawn_consumer<M, H>(
    name: impl Into<String>,
    sub: Subscription<M>,
    mut handler: H,
) -> io::Result<ConsumerHandle>
where
    M: Send + 'static,
    H: FnMut(Delivery<M>) + Send + 'static,
{
    let name = name.into();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let thread_name = name.clone();
    let join = thread::Builder::new()
        .name(name.clone())
        .spawn(move || consumer_loop(&thread_name, sub, shutdown_rx, &mut handler))?;

    Ok(ConsumerHandle {
        name,
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

fn consumer_loop<M, H>(
    name: &str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    H: FnMut(Delivery<M>),
{
    loop {
        // Shutdown check (non-blocking); a dropped handle also stops the loop.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match sub.recv_timeout(CONSUMER_TICK) {
            Ok(delivery) => handler(delivery),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(consumer = name, "consumer stopped");
}
