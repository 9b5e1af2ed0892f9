//! Per-account serial processing queue.
//!
//! Webhook handlers must acknowledge inside the platform window, but
//! inbound messages of one conversation have to reach the host in
//! platform-receive order. Handlers therefore enqueue their processing
//! future here and return; one worker per account drains the queue in
//! order. Cancelling the token drops the worker and everything queued.

use {
    futures::future::BoxFuture,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

/// Ordered, single-consumer work queue for one account's inbound flow.
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl SerialQueue {
    /// Spawn the worker task; it runs until `cancel` fires or the queue
    /// handle is dropped.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("inbound queue cancelled");
                        return;
                    }
                    job = rx.recv() => {
                        let Some(job) = job else { return };
                        job.await;
                    }
                }
            }
        });
        Self { tx }
    }

    /// Enqueue one processing future. Returns false when the worker is
    /// gone (account stopped), in which case the message is dropped.
    pub fn push(&self, job: BoxFuture<'static, ()>) -> bool {
        self.tx.send(job).is_ok()
    }
}
