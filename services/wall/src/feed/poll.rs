use super::ChangeFeed;
use crate::config::FeedConfig;
use crate::store::RecordStore;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Synthesize change events by diffing `list()` against the feed's known set
/// every poll interval. Runs until the task is aborted.
pub async fn run(feed: Arc<ChangeFeed>, records: Arc<dyn RecordStore>, config: &FeedConfig) {
    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match feed.sync_with(records.as_ref()).await {
            Ok(0) => {}
            Ok(published) => debug!(published, "Poll found changes"),
            Err(e) => {
                // Keep the last known state and try again next tick
                warn!(error = %e, "Poll failed");
                metrics::counter!("wall.feed.poll_errors").increment(1);
            }
        }
    }
}
