//! Upload, download and delete across the pool, store and platform.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chatvault_core::{ChunkRecord, ObjectId, ObjectMeta, ObjectRecord, ObjectStatus, ProgressSender};
use chatvault_crypto::{ChunkCodec, CodecConfig, SecretString};
use chatvault_engine::{
    Downloader, EgressConfig, EngineError, IngestConfig, IngestService, MemorySink, PlainChunk,
    fetch_to_offset,
};
use chatvault_platform::{BotCredential, MockCall, MockPlatform, OutgoingFile};
use chatvault_pool::{ConnectionPool, PoolConfig};
use chatvault_state::MetadataStore;
use chatvault_state_memory::MemoryMetadataStore;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;

struct Harness {
    platform: MockPlatform,
    pool: ConnectionPool,
    store: Arc<MemoryMetadataStore>,
}

impl Harness {
    async fn new(bots: usize) -> Self {
        let platform = MockPlatform::new(["c1"]);
        let credentials = (1..=bots).map(|i| BotCredential::new(format!("t{i}"))).collect();
        let pool = ConnectionPool::init(
            Arc::new(platform.clone()),
            credentials,
            PoolConfig::new(["c1"]).with_login_delay(Duration::ZERO),
        )
        .await
        .unwrap();
        Self {
            platform,
            pool,
            store: Arc::new(MemoryMetadataStore::new()),
        }
    }

    fn ingest(&self, codec: Option<ChunkCodec>, config: IngestConfig) -> IngestService {
        IngestService::new(self.pool.clone(), self.store.clone(), codec, config)
    }

    fn downloader(&self, codec: Option<ChunkCodec>) -> Downloader {
        self.downloader_with(codec, EgressConfig::default())
    }

    fn downloader_with(&self, codec: Option<ChunkCodec>, config: EgressConfig) -> Downloader {
        Downloader::new(
            self.pool.clone(),
            self.store.clone(),
            Arc::new(self.platform.clone()),
            codec,
            config.with_retries(1, Duration::from_millis(10)),
        )
    }

    fn sends(&self) -> usize {
        self.platform
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Send { .. }))
            .count()
    }
}

fn codec() -> ChunkCodec {
    ChunkCodec::new(
        SecretString::new("correct horse".to_owned()),
        CodecConfig::default().with_pbkdf2_iterations(1_000),
    )
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn download_all(downloader: &Downloader, id: &ObjectId) -> Result<Vec<u8>, EngineError> {
    let mut out = Vec::new();
    downloader
        .download(id, &mut out, &CancellationToken::new(), &ProgressSender::disabled())
        .await?;
    Ok(out)
}

#[tokio::test]
async fn twenty_megabytes_split_into_three_chunks_in_one_message() {
    let harness = Harness::new(1).await;
    let ingest = harness.ingest(None, IngestConfig::default().with_encryption(false));
    let data = payload(20 * MIB);

    let record = ingest
        .put(ObjectMeta::new("big.bin", data.len() as u64, "me"), &data[..])
        .await
        .unwrap();

    assert_eq!(record.status, ObjectStatus::Complete);
    assert_eq!(record.chunk_count, 3);
    assert_eq!(harness.sends(), 1);
    let chunks = harness.store.get_chunks(&record.id).await.unwrap();
    let sequences: Vec<u32> = chunks.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(chunks[0].size, 8 * MIB as u64);
    assert_eq!(chunks[2].size, 4 * MIB as u64);
    assert!(chunks.iter().all(|c| c.message_id == chunks[0].message_id));

    let restored = download_all(&harness.downloader(None), &record.id).await.unwrap();
    assert_eq!(restored, data);
}

#[tokio::test]
async fn encrypted_objects_round_trip() {
    let harness = Harness::new(2).await;
    let ingest = harness.ingest(Some(codec()), IngestConfig::default().with_chunk_size(1000).with_batch_size(3));
    let data = payload(10_500);

    let record = ingest
        .put(ObjectMeta::new("secret.txt", data.len() as u64, "me"), &data[..])
        .await
        .unwrap();
    assert_eq!(record.chunk_count, 11);
    assert!(record.is_encrypted());

    let chunks = harness.store.get_chunks(&record.id).await.unwrap();
    assert!(chunks.iter().all(|c| c.iv.is_some() && c.size > c.plain_size));

    let report = {
        let mut out = Vec::new();
        let report = harness
            .downloader(Some(codec()))
            .download(&record.id, &mut out, &CancellationToken::new(), &ProgressSender::disabled())
            .await
            .unwrap();
        assert_eq!(out, data);
        report
    };
    assert_eq!(report.bytes, data.len() as u64);
    assert_eq!(report.chunks, 11);
    assert!(!report.degraded);
}

#[tokio::test]
async fn objects_above_the_memory_limit_are_spooled_to_disk() {
    let harness = Harness::new(2).await;
    let data = payload(9_000);
    for codec in [None, Some(codec())] {
        let ingest = harness.ingest(codec.clone(), IngestConfig::default().with_chunk_size(1024));
        let record = ingest
            .put(ObjectMeta::new("spooled", data.len() as u64, "me"), &data[..])
            .await
            .unwrap();

        let downloader = harness.downloader_with(codec, EgressConfig::default().with_memory_limit(2048));
        let restored = download_all(&downloader, &record.id).await.unwrap();
        assert_eq!(restored, data);
    }
}

#[tokio::test]
async fn encrypted_download_without_a_key_is_refused() {
    let harness = Harness::new(1).await;
    let ingest = harness.ingest(Some(codec()), IngestConfig::default());
    let record = ingest
        .put(ObjectMeta::new("secret.txt", 5, "me"), &b"hello"[..])
        .await
        .unwrap();

    let err = download_all(&harness.downloader(None), &record.id).await.unwrap_err();
    assert!(matches!(err, EngineError::KeyRequired(id) if id == record.id));
}

#[tokio::test]
async fn legacy_single_stream_objects_download() {
    let harness = Harness::new(1).await;
    let codec = codec();
    let data = payload(3_000);
    let (header, stream) = codec.encrypt_legacy(Bytes::from(data.clone())).await.unwrap();

    let id = ObjectId::new("legacy");
    let (head, tail) = stream.split_at(stream.len() / 2);
    let message = harness.platform.seed_message(
        "t1",
        "c1",
        vec![
            OutgoingFile::new("legacy.part1", head.to_vec()),
            OutgoingFile::new("legacy.part2", tail.to_vec()),
        ],
    );
    let mut record = ObjectRecord::from_meta(id.clone(), &ObjectMeta::new("legacy", data.len() as u64, "me"), 2048);
    record.encryption = Some(header.to_json());
    record.status = ObjectStatus::Complete;
    record.chunk_count = 2;
    harness.store.insert_object(&record).await.unwrap();
    let rows: Vec<ChunkRecord> = message
        .attachments
        .iter()
        .zip(1u32..)
        .map(|(a, sequence)| ChunkRecord {
            object_id: id.clone(),
            sequence,
            message_id: message.id.clone(),
            channel_id: message.channel_id.clone(),
            attachment_index: sequence - 1,
            url: a.url.clone(),
            size: a.size,
            plain_size: a.size,
            iv: None,
            tag: None,
            url_refreshed_at: None,
        })
        .collect();
    harness.store.insert_chunks(&rows).await.unwrap();

    let restored = download_all(&harness.downloader(Some(codec)), &id).await.unwrap();
    assert_eq!(restored, data);
}

#[tokio::test]
async fn cancelled_upload_leaves_no_messages_or_rows() {
    let harness = Harness::new(2).await;
    let ingest = harness.ingest(None, IngestConfig::default().with_encryption(false).with_chunk_size(4));
    let ticket = ingest.start(ObjectMeta::new("notes", 12, "me")).await.unwrap();

    let stored = ingest
        .submit(
            &ticket.object_id,
            vec![PlainChunk::new(1, &b"abcd"[..]), PlainChunk::new(3, &b"ijkl"[..])],
        )
        .await
        .unwrap();
    assert_eq!(stored, 2);
    assert!(harness.platform.message_count() > 0);

    ingest.cancel(&ticket.object_id).await.unwrap();

    assert_eq!(harness.platform.message_count(), 0);
    assert!(harness.store.get_object(&ticket.object_id).await.unwrap().is_none());
    assert!(harness.store.get_chunks(&ticket.object_id).await.unwrap().is_empty());
    assert_eq!(ingest.active_sessions(), 0);
    assert!(matches!(
        ingest.finish(&ticket.object_id).await,
        Err(EngineError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn finishing_with_missing_chunks_persists_nothing() {
    let harness = Harness::new(1).await;
    let ingest = harness.ingest(None, IngestConfig::default().with_encryption(false).with_chunk_size(4));
    let ticket = ingest.start(ObjectMeta::new("notes", 12, "me")).await.unwrap();
    ingest
        .submit(
            &ticket.object_id,
            vec![PlainChunk::new(1, &b"abcd"[..]), PlainChunk::new(2, &b"efgh"[..])],
        )
        .await
        .unwrap();

    let err = ingest.finish(&ticket.object_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Incomplete { expected: 3, found: 2, .. }));
    assert_eq!(harness.platform.message_count(), 0);
    assert!(harness.store.get_object(&ticket.object_id).await.unwrap().is_none());
    assert!(harness.store.get_chunks(&ticket.object_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn out_of_order_submissions_reassemble_in_sequence() {
    let harness = Harness::new(3).await;
    let ingest = harness.ingest(Some(codec()), IngestConfig::default().with_chunk_size(100).with_batch_size(2));
    let data = payload(950);
    let ticket = ingest
        .start(ObjectMeta::new("shuffled", data.len() as u64, "me"))
        .await
        .unwrap();

    let mut chunks = chatvault_engine::ingest::split_bytes(&Bytes::from(data.clone()), ticket.chunk_size);
    chunks.shuffle(&mut rand::thread_rng());
    let (first, second) = chunks.split_at(4);
    ingest.submit(&ticket.object_id, second.to_vec()).await.unwrap();
    ingest.submit(&ticket.object_id, first.to_vec()).await.unwrap();
    let record = ingest.finish(&ticket.object_id).await.unwrap();
    assert_eq!(record.chunk_count, 10);

    let restored = download_all(&harness.downloader(Some(codec())), &record.id).await.unwrap();
    assert_eq!(restored, data);
}

#[tokio::test(start_paused = true)]
async fn fetch_order_does_not_change_the_output() {
    let harness = Harness::new(1).await;
    let ingest = harness.ingest(None, IngestConfig::default().with_encryption(false).with_chunk_size(7));
    let data = payload(100);
    let record = ingest
        .put(ObjectMeta::new("perm", data.len() as u64, "me"), &data[..])
        .await
        .unwrap();
    let mut chunks = harness.store.get_chunks(&record.id).await.unwrap();
    chunks.sort_by_key(|c| c.sequence);

    let fetch = |concurrency: usize| {
        let chunks = chunks.clone();
        let platform = harness.platform.clone();
        async move {
            let sink = MemorySink::with_len(data_len(&chunks)).unwrap();
            fetch_to_offset(
                &platform,
                &chunks,
                &sink,
                &EgressConfig::default().with_concurrency(concurrency),
                &CancellationToken::new(),
                &ProgressSender::disabled(),
            )
            .await
            .unwrap();
            sink.into_inner()
        }
    };
    let sequential = fetch(1).await;
    assert_eq!(sequential, data);

    let mut rng = rand::thread_rng();
    for concurrency in [3, 16] {
        // Later sequences answer first, then a random completion order.
        for reversed in [true, false] {
            let mut delays: Vec<u64> = (1..=chunks.len() as u64).collect();
            if reversed {
                delays.reverse();
            } else {
                delays.shuffle(&mut rng);
            }
            for (chunk, delay) in chunks.iter().zip(delays) {
                harness.platform.set_download_delay(&chunk.url, Duration::from_millis(delay * 10));
            }
            let before = harness.platform.completed_downloads().len();
            assert_eq!(fetch(concurrency).await, sequential);
            if reversed && concurrency >= chunks.len() {
                let completed = harness.platform.completed_downloads().split_off(before);
                let expected: Vec<_> = chunks.iter().rev().map(|c| c.url.clone()).collect();
                assert_eq!(completed, expected);
            }
        }
    }
}

fn data_len(chunks: &[ChunkRecord]) -> u64 {
    chunks.iter().map(|c| c.size).sum()
}

#[tokio::test(start_paused = true)]
async fn unreachable_origin_messages_fall_back_to_cached_urls() {
    let harness = Harness::new(1).await;
    let ingest = harness.ingest(None, IngestConfig::default().with_encryption(false).with_chunk_size(10));
    let data = payload(35);
    let record = ingest
        .put(ObjectMeta::new("cached", data.len() as u64, "me"), &data[..])
        .await
        .unwrap();

    harness.platform.fail_all_fetches(true);
    let mut out = Vec::new();
    let report = harness
        .downloader(None)
        .download(&record.id, &mut out, &CancellationToken::new(), &ProgressSender::disabled())
        .await
        .unwrap();
    assert!(report.degraded);
    assert_eq!(out, data);
}

#[tokio::test]
async fn cancelled_download_writes_nothing() {
    let harness = Harness::new(1).await;
    let ingest = harness.ingest(None, IngestConfig::default().with_encryption(false).with_chunk_size(10));
    let record = ingest
        .put(ObjectMeta::new("stop", 30, "me"), &payload(30)[..])
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut out = Vec::new();
    let err = harness
        .downloader(None)
        .download(&record.id, &mut out, &cancel, &ProgressSender::disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DownloadCancelled));
    assert!(out.is_empty());
}

#[tokio::test]
async fn deleting_an_object_removes_messages_and_rows() {
    let harness = Harness::new(1).await;
    let ingest = harness.ingest(None, IngestConfig::default().with_encryption(false).with_chunk_size(10).with_batch_size(1));
    let record = ingest
        .put(ObjectMeta::new("gone", 45, "me"), &payload(45)[..])
        .await
        .unwrap();
    assert_eq!(harness.platform.message_count(), 5);

    let report = ingest.delete_object(&record.id).await.unwrap();
    assert_eq!(report.deleted, 5);
    assert_eq!(harness.platform.message_count(), 0);
    assert!(harness.store.get_object(&record.id).await.unwrap().is_none());
    assert!(matches!(
        download_all(&harness.downloader(None), &record.id).await,
        Err(EngineError::ObjectNotFound(_))
    ));
}
