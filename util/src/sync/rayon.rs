use crate::metrics::HistogramGuard;

/// Runs a CPU-bound closure on the rayon pool without blocking the async runtime.
pub async fn rayon_run<T: 'static + Send>(f: impl 'static + Send + FnOnce() -> T) -> T {
    let guard = Guard { finished: false };

    let (send, recv) = tokio::sync::oneshot::channel();
    let queue_wait_timer = HistogramGuard::begin("tondex_rayon_queue_time");

    rayon::spawn(move || {
        queue_wait_timer.finish();

        let _hist = HistogramGuard::begin("tondex_rayon_task_time");
        _ = send.send(f());
    });

    let res = recv.await.unwrap();
    guard.disarm();
    res
}

struct Guard {
    finished: bool,
}

impl Guard {
    fn disarm(mut self) {
        self.finished = true;
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("rayon_run has been aborted");
        }
    }
}
