//! Background tasks turning change events into re-fetches.

use std::{collections::BTreeSet, sync::Weak};

use shared::domain::MessageId;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    realtime::ChangeStream,
    session::{ClientEvent, ViewInner},
};

/// Re-reads the whole view on every message change. Events queued while a
/// re-fetch runs collapse into the next one.
pub(crate) fn spawn_message_listener(view: Weak<ViewInner>, mut stream: ChangeStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            let mut coalesced = 0usize;
            while stream.try_recv().is_some() {
                coalesced += 1;
            }
            let Some(view) = view.upgrade() else { break };
            debug!(table = ?event.table, kind = ?event.kind, coalesced, "message change; refetching");
            if let Err(err) = view.refetch_messages().await {
                warn!(error = %err, "message refetch failed");
                view.emit(ClientEvent::Error(err.to_string()));
            }
        }
        debug!(subscription_id = stream.subscription_id(), "message listener stopped");
    })
}

/// Re-reads the reactions of each message an event names.
pub(crate) fn spawn_reaction_listener(view: Weak<ViewInner>, mut stream: ChangeStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            let mut affected: BTreeSet<MessageId> = event.message_id.into_iter().collect();
            while let Some(next) = stream.try_recv() {
                affected.extend(next.message_id);
            }
            let Some(view) = view.upgrade() else { break };
            for message_id in affected {
                if let Err(err) = view.refetch_reactions(message_id).await {
                    warn!(message_id = message_id.0, error = %err, "reaction refetch failed");
                }
            }
        }
    })
}
