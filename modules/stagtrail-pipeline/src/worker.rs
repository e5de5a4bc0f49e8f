//! Queue-driven worker pools.
//!
//! Each pool runs N independent loops over one queue: reserve, run the
//! handler under its wall-clock deadline, then ack or nack per the error
//! taxonomy. Workers block only on the queue, the DB, image storage, the
//! inference engine, and profile row locks; backpressure lives entirely in
//! the queue.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stagtrail_common::{QueueAction, WorkError, DETECT_QUEUE, REID_QUEUE};

use crate::deps::WorkerDeps;
use crate::traits::{MetadataStore as _, ReservedItem, WorkQueue as _};
use crate::{detect, reid};

/// Slack added to the handler deadline so a slow-but-alive handler is not
/// double-delivered mid-flight.
const VISIBILITY_MARGIN: Duration = Duration::from_secs(30);

const IDLE_SLEEP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Detect,
    Reid,
}

impl QueueKind {
    fn queue_name(&self) -> &'static str {
        match self {
            QueueKind::Detect => DETECT_QUEUE,
            QueueKind::Reid => REID_QUEUE,
        }
    }
}

/// Spawn the pool and block until shutdown is signalled and every worker
/// loop has wound down.
pub async fn run_pool(kind: QueueKind, deps: Arc<WorkerDeps>, shutdown: watch::Receiver<bool>) {
    let concurrency = match kind {
        QueueKind::Detect => deps.settings.detect_concurrency,
        QueueKind::Reid => deps.settings.reid_concurrency,
    };

    info!(queue = kind.queue_name(), concurrency, "worker pool starting");

    let mut handles = Vec::with_capacity(concurrency);
    for index in 0..concurrency {
        handles.push(tokio::spawn(worker_loop(
            kind,
            index,
            deps.clone(),
            shutdown.clone(),
        )));
    }
    for handle in handles {
        let _ = handle.await;
    }

    info!(queue = kind.queue_name(), "worker pool stopped");
}

async fn worker_loop(
    kind: QueueKind,
    index: usize,
    deps: Arc<WorkerDeps>,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue_name = kind.queue_name();
    let deadline = match kind {
        QueueKind::Detect => deps.settings.detect_deadline,
        QueueKind::Reid => deps.settings.reid_deadline,
    };
    let visibility = deadline + VISIBILITY_MARGIN;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let item = match deps.queue.reserve(queue_name, visibility).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                idle_sleep(&mut shutdown).await;
                continue;
            }
            Err(e) => {
                warn!(queue_name, worker = index, error = %e, "queue reserve failed");
                idle_sleep(&mut shutdown).await;
                continue;
            }
        };

        let result = tokio::time::timeout(deadline, dispatch(kind, &item, &deps)).await;
        let work_error = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(WorkError::DeadlineExceeded(deadline)),
        };

        finish_item(kind, &item, work_error, &deps).await;
    }
}

async fn dispatch(kind: QueueKind, item: &ReservedItem, deps: &WorkerDeps) -> Result<(), WorkError> {
    match kind {
        QueueKind::Detect => detect::handle_image(item.item_id, deps).await,
        QueueKind::Reid => reid::handle_detection(item.item_id, deps).await,
    }
}

pub(crate) async fn finish_item(
    kind: QueueKind,
    item: &ReservedItem,
    work_error: Option<WorkError>,
    deps: &WorkerDeps,
) {
    let Some(work_error) = work_error else {
        if let Err(e) = deps.queue.ack(item).await {
            warn!(item_id = %item.item_id, error = %e, "ack failed; visibility timeout will redeliver");
        }
        return;
    };

    match work_error.queue_action() {
        QueueAction::Ack => {
            debug!(
                item_id = %item.item_id,
                error = %work_error,
                "terminal outcome, acking"
            );
            if let Err(e) = deps.queue.ack(item).await {
                warn!(item_id = %item.item_id, error = %e, "ack failed after terminal outcome");
            }
        }
        action @ (QueueAction::Nack | QueueAction::NackQuick) => {
            error!(
                item_id = %item.item_id,
                attempt = item.attempt,
                error = %work_error,
                "handler failed, releasing for retry"
            );
            // A detect claim must not strand the image in `processing`
            // while its queue item waits out the backoff.
            if kind == QueueKind::Detect {
                if let Err(e) = deps.store.release_image(item.item_id).await {
                    warn!(image_id = %item.item_id, error = %e, "release after failure did not apply");
                }
            }
            deps.stats.bump(&deps.stats.items_nacked);
            let quick = action == QueueAction::NackQuick;
            if let Err(e) = deps
                .queue
                .nack(item, quick, Some(work_error.classification()))
                .await
            {
                warn!(item_id = %item.item_id, error = %e, "nack failed; visibility timeout will redeliver");
            }
        }
    }
}

async fn idle_sleep(shutdown: &mut watch::Receiver<bool>) {
    let jitter = rand::rng().random_range(0..250u64);
    tokio::select! {
        _ = tokio::time::sleep(IDLE_SLEEP + Duration::from_millis(jitter)) => {}
        _ = shutdown.changed() => {}
    }
}
