use std::collections::HashSet;

use chatvault_core::{MessageRef, ObjectId};
use chatvault_pool::{ConnectionPool, DeleteReport};
use chatvault_state::MetadataStore;
use tracing::{info, warn};

/// Undo a failed or cancelled upload.
///
/// Deletes every message in `sent` plus any message referenced by a stored
/// chunk row, then the chunk rows and the object row. Cleanup is advisory:
/// failures are logged and reflected in the returned report, never raised.
pub async fn rollback(
    pool: &ConnectionPool,
    store: &dyn MetadataStore,
    object_id: &ObjectId,
    sent: Vec<MessageRef>,
) -> DeleteReport {
    let mut seen: HashSet<MessageRef> = HashSet::new();
    let mut refs: Vec<MessageRef> = Vec::new();
    for r in sent {
        if seen.insert(r.clone()) {
            refs.push(r);
        }
    }
    match store.get_chunks(object_id).await {
        Ok(chunks) => {
            for chunk in chunks {
                let r = chunk.message_ref();
                if seen.insert(r.clone()) {
                    refs.push(r);
                }
            }
        }
        Err(e) => warn!(object_id = %object_id, error = %e, "could not list chunks for rollback"),
    }

    let report = pool.bulk_delete(&refs).await;
    if let Err(e) = store.delete_chunks(object_id).await {
        warn!(object_id = %object_id, error = %e, "could not delete chunk rows");
    }
    if let Err(e) = store.delete_object(object_id).await {
        warn!(object_id = %object_id, error = %e, "could not delete object row");
    }
    info!(
        object_id = %object_id,
        messages = refs.len(),
        deleted = report.deleted,
        failed = report.failed.len(),
        "upload rolled back"
    );
    report
}
