//! Fan-in of per-backend event channels into one merged stream.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Event;

/// Capacity of the merged channel.
pub const MERGED_CHANNEL_CAPACITY: usize = 64;

/// Merges a set of event receivers into a single channel.
///
/// `None` entries are skipped. One forwarder task per input reads and
/// forwards; sends block when the consumer is slow, so back-pressure
/// propagates to the producing watcher instead of dropping inside the
/// merge. Per-input ordering is preserved; ordering across inputs is
/// unspecified.
///
/// The merged channel closes once every forwarder has returned - when all
/// inputs have closed, or when `cancel` fires - because each forwarder owns
/// one clone of the sender.
pub fn merge_events(
    sources: Vec<Option<mpsc::Receiver<Event>>>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel(MERGED_CHANNEL_CAPACITY);

    for mut source in sources.into_iter().flatten() {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = source.recv() => {
                        match event {
                            Some(event) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    rx
}
