use chatvault_core::{
    ChannelId, ChunkProbeResult, ChunkRecord, HealthScanRecord, MessageId, ObjectId, ObjectMeta,
    ObjectRecord, ObjectStatus, ProbeOutcome, ScanId, ScanScope, ScanStatus,
};
use chrono::Utc;

use crate::error::StateError;
use crate::store::{ChunkUrlUpdate, MetadataStore};

fn object(id: &str, folder: Option<&str>) -> ObjectRecord {
    let mut meta = ObjectMeta::new(format!("{id}.bin"), 30, "tester");
    if let Some(folder) = folder {
        meta = meta.with_folder(folder);
    }
    ObjectRecord::from_meta(ObjectId::new(id), &meta, 10)
}

fn chunk(object_id: &str, sequence: u32) -> ChunkRecord {
    ChunkRecord {
        object_id: ObjectId::new(object_id),
        sequence,
        message_id: MessageId::new(format!("m{sequence}")),
        channel_id: ChannelId::new("c"),
        attachment_index: sequence - 1,
        url: format!("https://cdn.test/{object_id}/{sequence}"),
        size: 10,
        plain_size: 10,
        iv: None,
        tag: None,
        url_refreshed_at: None,
    }
}

fn probe(object_id: &str, sequence: u32, outcome: ProbeOutcome) -> ChunkProbeResult {
    ChunkProbeResult {
        object_id: ObjectId::new(object_id),
        sequence,
        outcome,
        latency_ms: 3,
        status_code: Some(200),
        stale_url: false,
        error: None,
        checked_at: Utc::now(),
    }
}

/// Run the full metadata store conformance test suite.
///
/// Call this from your backend's test module with a fresh store instance.
///
/// # Errors
///
/// Returns an error if a store operation fails; assertion failures panic.
pub async fn run_store_conformance_tests(store: &dyn MetadataStore) -> Result<(), StateError> {
    test_object_lifecycle(store).await?;
    test_duplicate_insert(store).await?;
    test_update_missing(store).await?;
    test_list_by_folder(store).await?;
    test_chunks_sorted_and_idempotent(store).await?;
    test_chunk_url_updates(store).await?;
    test_delete_cascades(store).await?;
    test_scan_lifecycle(store).await?;
    Ok(())
}

async fn test_object_lifecycle(store: &dyn MetadataStore) -> Result<(), StateError> {
    let mut record = object("life", None);
    store.insert_object(&record).await?;
    let got = store.get_object(&record.id).await?;
    assert_eq!(got.as_ref(), Some(&record));

    record.status = ObjectStatus::Complete;
    record.chunk_count = 3;
    store.update_object(&record).await?;
    let got = store.get_object(&record.id).await?.map(|r| r.status);
    assert_eq!(got, Some(ObjectStatus::Complete));

    assert!(store.delete_object(&record.id).await?);
    assert!(store.get_object(&record.id).await?.is_none());
    assert!(!store.delete_object(&record.id).await?, "second delete reports absence");
    Ok(())
}

async fn test_duplicate_insert(store: &dyn MetadataStore) -> Result<(), StateError> {
    let record = object("dup", None);
    store.insert_object(&record).await?;
    let err = store.insert_object(&record).await;
    assert!(matches!(err, Err(StateError::AlreadyExists(_))));
    store.delete_object(&record.id).await?;
    Ok(())
}

async fn test_update_missing(store: &dyn MetadataStore) -> Result<(), StateError> {
    let err = store.update_object(&object("ghost", None)).await;
    assert!(matches!(err, Err(StateError::NotFound(_))));
    Ok(())
}

async fn test_list_by_folder(store: &dyn MetadataStore) -> Result<(), StateError> {
    store.insert_object(&object("la", Some("docs"))).await?;
    store.insert_object(&object("lb", Some("pics"))).await?;
    store.insert_object(&object("lc", Some("docs"))).await?;

    let docs: Vec<_> = store
        .list_objects(Some("docs"))
        .await?
        .into_iter()
        .map(|r| r.id.to_string())
        .collect();
    assert_eq!(docs.len(), 2);
    assert!(docs.contains(&"la".to_owned()) && docs.contains(&"lc".to_owned()));
    assert!(store.list_objects(None).await?.len() >= 3);

    for id in ["la", "lb", "lc"] {
        store.delete_object(&ObjectId::new(id)).await?;
    }
    Ok(())
}

async fn test_chunks_sorted_and_idempotent(store: &dyn MetadataStore) -> Result<(), StateError> {
    let id = ObjectId::new("sorted");
    store.insert_chunks(&[chunk("sorted", 3), chunk("sorted", 1)]).await?;
    store.insert_chunks(&[chunk("sorted", 2), chunk("sorted", 1)]).await?;

    let sequences: Vec<_> = store.get_chunks(&id).await?.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(store.delete_chunks(&id).await?, 3);
    assert!(store.get_chunks(&id).await?.is_empty());
    Ok(())
}

async fn test_chunk_url_updates(store: &dyn MetadataStore) -> Result<(), StateError> {
    let id = ObjectId::new("urls");
    store.insert_chunks(&[chunk("urls", 1), chunk("urls", 2)]).await?;
    let now = Utc::now();
    let updated = store
        .update_chunk_urls(&[
            ChunkUrlUpdate {
                object_id: id.clone(),
                sequence: 2,
                url: "https://cdn.test/fresh".into(),
                refreshed_at: now,
            },
            ChunkUrlUpdate {
                object_id: id.clone(),
                sequence: 9,
                url: "https://cdn.test/nowhere".into(),
                refreshed_at: now,
            },
        ])
        .await?;
    assert_eq!(updated, 1);

    let chunks = store.get_chunks(&id).await?;
    assert_eq!(chunks[1].url, "https://cdn.test/fresh");
    assert_eq!(chunks[1].url_refreshed_at, Some(now));
    assert_eq!(chunks[0].url, "https://cdn.test/urls/1");
    store.delete_chunks(&id).await?;
    Ok(())
}

async fn test_delete_cascades(store: &dyn MetadataStore) -> Result<(), StateError> {
    let record = object("cascade", None);
    store.insert_object(&record).await?;
    store.insert_chunks(&[chunk("cascade", 1), chunk("cascade", 2)]).await?;
    store.delete_object(&record.id).await?;
    assert!(store.get_chunks(&record.id).await?.is_empty());
    Ok(())
}

async fn test_scan_lifecycle(store: &dyn MetadataStore) -> Result<(), StateError> {
    let mut scan = HealthScanRecord::start(ScanId::new("scan-1"), ScanScope::All);
    store.insert_scan(&scan).await?;

    let first = vec![probe("o", 1, ProbeOutcome::Healthy)];
    let second = vec![
        probe("o", 2, ProbeOutcome::Unhealthy),
        probe("o", 3, ProbeOutcome::Error),
    ];
    store.append_scan_results(&scan.id, &first).await?;
    store.append_scan_results(&scan.id, &second).await?;
    for r in first.iter().chain(&second) {
        scan.record(r);
    }
    scan.finish(ScanStatus::Completed, None);
    store.update_scan(&scan).await?;

    let got = store.get_scan(&scan.id).await?;
    assert_eq!(got.as_ref().map(|s| s.status), Some(ScanStatus::Completed));
    assert_eq!(got.map(|s| s.checked), Some(3));
    let sequences: Vec<_> = store
        .get_scan_results(&scan.id)
        .await?
        .iter()
        .map(|r| r.sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(store.get_scan(&ScanId::new("missing")).await?.is_none());
    Ok(())
}
