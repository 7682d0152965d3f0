use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, RgbImage};
use nuptia_core::models::{
    BatchState, PlanLimit, PlanTier, Priority, ProcessUploadPayload, Task, TaskType,
};
use nuptia_db::{
    InMemoryBatchStore, InMemoryMediaStore, InMemoryPlanStore, InMemoryTaskStore, MediaStore,
};
use nuptia_services::{
    IncomingFile, MediaValidator, PipelineSettings, PipelineStores, Storage, UploadPipeline,
};
use nuptia_storage::LocalStorage;
use nuptia_worker::TaskQueueConfig;
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    _dir: TempDir,
    storage: Arc<dyn Storage>,
    plans: InMemoryPlanStore,
    media: InMemoryMediaStore,
    tasks: InMemoryTaskStore,
    pipeline: UploadPipeline,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(dir.path(), "http://localhost/media".to_string())
                .await
                .unwrap(),
        );
        let plans = InMemoryPlanStore::new();
        let media = InMemoryMediaStore::new();
        let tasks = InMemoryTaskStore::new();
        let stores = PipelineStores {
            batches: Arc::new(InMemoryBatchStore::new()),
            media: Arc::new(media.clone()),
            plans: Arc::new(plans.clone()),
            tasks: Arc::new(tasks.clone()),
        };
        let settings = PipelineSettings {
            validator: MediaValidator::new(
                5 * 1024 * 1024,
                50 * 1024 * 1024,
                vec![
                    "image/jpeg".to_string(),
                    "image/png".to_string(),
                    "video/mp4".to_string(),
                ],
            ),
            thumbnail_max_dimension: 64,
            quota_warning_threshold: 0.8,
        };
        let pipeline =
            UploadPipeline::new(stores, storage.clone(), settings, TaskQueueConfig::default());

        Self {
            _dir: dir,
            storage,
            plans,
            media,
            tasks,
            pipeline,
        }
    }

    async fn drain(&self) -> usize {
        self.pipeline
            .queue()
            .drain(self.pipeline.task_context())
            .await
            .unwrap()
    }

    fn limit_free_plan(&self, wedding_id: Uuid, max_files: i64) {
        self.plans.set_tier(wedding_id, PlanTier::Free);
        self.plans.set_limit(PlanLimit {
            tier: PlanTier::Free,
            max_files,
            max_storage_bytes: 1 << 30,
        });
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 90])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn photo(name: &str) -> IncomingFile {
    IncomingFile {
        original_name: name.to_string(),
        mime_type: "image/png".to_string(),
        data: png(32, 24),
    }
}

#[tokio::test]
async fn image_is_stored_with_dimensions_and_thumbnail() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    let batch = h.pipeline.batches.create_batch(wedding_id, 1, None).await.unwrap();
    let staged = h
        .pipeline
        .stage_file(
            &batch,
            IncomingFile {
                original_name: "first dance.png".to_string(),
                mime_type: "image/png".to_string(),
                data: png(320, 200),
            },
        )
        .await
        .unwrap();
    let staged_path = staged.staged_path.clone();
    let file_id = staged.file_id;
    h.pipeline.batches.enqueue_files(&batch, vec![staged]).await.unwrap();

    assert_eq!(h.drain().await, 1);

    let media = h.media.get_media(wedding_id, file_id).await.unwrap().unwrap();
    assert_eq!(media.original_name, "first_dance.png");
    assert_eq!(media.width, Some(320));
    assert_eq!(media.height, Some(200));
    assert_eq!(media.batch_id, Some(batch.id));
    assert_eq!(media.disk, "local");

    let thumb = media.thumbnail_path().unwrap();
    assert!(h.storage.exists(thumb).await.unwrap());
    assert!(h.storage.exists(&media.path).await.unwrap());
    assert!(!h.storage.exists(&staged_path).await.unwrap());

    let status = h
        .pipeline
        .status
        .get_batch_status(wedding_id, batch.id)
        .await
        .unwrap();
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!(status.completed, 1);
    assert!(status.errors.is_empty());
}

#[tokio::test]
async fn missing_staged_file_counts_as_failure() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    let batch = h.pipeline.batches.create_batch(wedding_id, 1, None).await.unwrap();
    let staged = h.pipeline.stage_file(&batch, photo("lost.png")).await.unwrap();
    h.storage.delete(&staged.staged_path).await.unwrap();
    h.pipeline.batches.enqueue_files(&batch, vec![staged]).await.unwrap();

    h.drain().await;

    assert!(h.media.is_empty());
    let status = h
        .pipeline
        .status
        .get_batch_status(wedding_id, batch.id)
        .await
        .unwrap();
    assert_eq!(status.failed, 1);
    assert_eq!(status.state, BatchState::Failed);
    assert_eq!(status.errors, vec!["lost.png: Temporary upload file is missing".to_string()]);
}

#[tokio::test]
async fn mixed_batch_completes_with_errors() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    let batch = h.pipeline.batches.create_batch(wedding_id, 3, None).await.unwrap();

    let good = h.pipeline.stage_file(&batch, photo("cake.png")).await.unwrap();
    let spoofed = h
        .pipeline
        .stage_file(
            &batch,
            IncomingFile {
                original_name: "flowers.png".to_string(),
                mime_type: "image/png".to_string(),
                data: b"MZ\x90\x00this is not a picture".to_vec(),
            },
        )
        .await
        .unwrap();
    let missing = h.pipeline.stage_file(&batch, photo("rings.png")).await.unwrap();
    h.storage.delete(&missing.staged_path).await.unwrap();

    h.pipeline
        .batches
        .enqueue_files(&batch, vec![good, spoofed, missing])
        .await
        .unwrap();
    h.drain().await;

    let status = h
        .pipeline
        .status
        .get_batch_status(wedding_id, batch.id)
        .await
        .unwrap();
    assert_eq!(status.state, BatchState::CompletedWithErrors);
    assert_eq!((status.completed, status.failed, status.pending), (1, 2, 0));
    assert!(status.is_complete());
    assert_eq!(status.errors.len(), 2);
    assert!(status.errors.iter().any(|e| e.starts_with("flowers.png: ")));
    assert!(status
        .errors
        .contains(&"rings.png: Temporary upload file is missing".to_string()));
    assert_eq!(h.media.len(), 1);
}

#[tokio::test]
async fn two_successes_and_one_rejection_finish_the_batch() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    let files = vec![
        photo("bouquet.png"),
        photo("venue.png"),
        IncomingFile {
            original_name: "speech.exe".to_string(),
            mime_type: "application/x-msdownload".to_string(),
            data: b"MZ\x90\x00".to_vec(),
        },
    ];
    let batch = h.pipeline.submit(wedding_id, None, files).await.unwrap();
    assert_eq!(h.drain().await, 3);

    let status = h
        .pipeline
        .status
        .get_batch_status(wedding_id, batch.id)
        .await
        .unwrap();
    assert_eq!((status.completed, status.failed, status.pending), (2, 1, 0));
    assert!(status.is_complete());
    assert_eq!(status.progress_percentage(), 100.0);
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].starts_with("speech.exe: "));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_count_every_file_once() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    let files: Vec<_> = (0..24).map(|i| photo(&format!("guest_{:02}.png", i))).collect();
    let batch = h.pipeline.submit(wedding_id, None, files).await.unwrap();

    let mut workers = Vec::new();
    for _ in 0..4 {
        let queue = h.pipeline.queue().clone();
        let context = h.pipeline.task_context();
        workers.push(tokio::spawn(async move { queue.drain(context).await.unwrap() }));
    }
    let mut processed = 0;
    for worker in workers {
        processed += worker.await.unwrap();
    }
    assert_eq!(processed, 24);

    let status = h
        .pipeline
        .status
        .get_batch_status(wedding_id, batch.id)
        .await
        .unwrap();
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!((status.completed, status.failed, status.pending), (24, 0, 0));
    assert_eq!(h.media.len(), 24);
}

#[tokio::test]
async fn redelivered_task_is_not_counted_twice() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    let batch = h.pipeline.batches.create_batch(wedding_id, 2, None).await.unwrap();
    let staged = h.pipeline.stage_file(&batch, photo("vows.png")).await.unwrap();
    let payload = ProcessUploadPayload {
        batch_id: batch.id,
        wedding_id,
        file_id: staged.file_id,
        staged_path: staged.staged_path.clone(),
        original_name: staged.original_name.clone(),
        mime_type: staged.mime_type.clone(),
    };
    h.pipeline.batches.enqueue_files(&batch, vec![staged]).await.unwrap();
    h.drain().await;

    h.pipeline
        .queue()
        .submit_task(
            wedding_id,
            TaskType::ProcessUpload,
            Task::payload_from(&payload).unwrap(),
            Priority::Normal,
            None,
        )
        .await
        .unwrap();
    h.drain().await;

    let status = h
        .pipeline
        .status
        .get_batch_status(wedding_id, batch.id)
        .await
        .unwrap();
    assert_eq!((status.completed, status.failed, status.pending), (1, 0, 1));
    assert_eq!(status.state, BatchState::Processing);
    assert_eq!(h.media.len(), 1);
    assert_eq!(h.tasks.tasks().len(), 2);
}

#[tokio::test]
async fn cancelled_batch_stops_counting() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    let batch = h.pipeline.batches.create_batch(wedding_id, 3, None).await.unwrap();
    let first = h.pipeline.stage_file(&batch, photo("toast.png")).await.unwrap();
    h.pipeline.batches.enqueue_files(&batch, vec![first]).await.unwrap();
    h.drain().await;

    let batch = h.pipeline.batches.get_batch(wedding_id, batch.id).await.unwrap();
    let rest = vec![
        h.pipeline.stage_file(&batch, photo("dance.png")).await.unwrap(),
        h.pipeline.stage_file(&batch, photo("exit.png")).await.unwrap(),
    ];
    let rest_paths: Vec<_> = rest.iter().map(|f| f.staged_path.clone()).collect();
    h.pipeline.batches.enqueue_files(&batch, rest).await.unwrap();

    assert!(h.pipeline.batches.cancel_batch(wedding_id, batch.id).await.unwrap());
    assert!(!h.pipeline.batches.cancel_batch(wedding_id, batch.id).await.unwrap());
    h.drain().await;

    let status = h
        .pipeline
        .status
        .get_batch_status(wedding_id, batch.id)
        .await
        .unwrap();
    assert_eq!(status.state, BatchState::Cancelled);
    assert_eq!((status.completed, status.failed), (1, 0));
    assert_eq!(h.media.len(), 1);
    for path in rest_paths {
        assert!(!h.storage.exists(&path).await.unwrap());
    }

    let cancelled = h.pipeline.batches.get_batch(wedding_id, batch.id).await.unwrap();
    assert!(h
        .pipeline
        .batches
        .enqueue_files(&cancelled, vec![])
        .await
        .is_err());
}

#[tokio::test]
async fn progress_reflects_files_still_pending() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    let batch = h.pipeline.batches.create_batch(wedding_id, 4, None).await.unwrap();
    let staged = vec![
        h.pipeline.stage_file(&batch, photo("a_photo.png")).await.unwrap(),
        h.pipeline.stage_file(&batch, photo("b_photo.png")).await.unwrap(),
    ];
    h.pipeline.batches.enqueue_files(&batch, staged).await.unwrap();
    h.drain().await;

    let status = h
        .pipeline
        .status
        .get_batch_status(wedding_id, batch.id)
        .await
        .unwrap();
    assert_eq!(status.state, BatchState::Processing);
    assert_eq!(status.pending, 2);
    assert!(!status.is_complete());
    assert!((status.progress_percentage() - 50.0).abs() < f64::EPSILON);

    let active = h.pipeline.batches.get_batches(wedding_id, false).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, batch.id);
}

#[tokio::test]
async fn uploads_may_reach_the_file_limit_but_not_pass_it() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    h.limit_free_plan(wedding_id, 2);

    let check = h.pipeline.quota.can_upload(wedding_id, 1024, 2).await.unwrap();
    assert!(check.can_upload);

    h.pipeline
        .submit(wedding_id, None, vec![photo("one.png"), photo("two.png")])
        .await
        .unwrap();
    h.drain().await;

    let usage = h.pipeline.quota.get_usage(wedding_id).await.unwrap();
    assert_eq!(usage.current_files, 2);
    assert!(h.pipeline.quota.is_near_limit(&usage, None));

    let check = h.pipeline.quota.can_upload(wedding_id, 1024, 1).await.unwrap();
    assert!(!check.can_upload);
    assert!(check.reason.unwrap().contains("File limit reached"));
}

#[tokio::test]
async fn full_free_plan_rejects_with_upgrade_message() {
    let h = Harness::new().await;
    let wedding_id = Uuid::new_v4();
    h.limit_free_plan(wedding_id, 10);

    let files: Vec<_> = (0..10).map(|i| photo(&format!("photo_{}.png", i))).collect();
    h.pipeline.submit(wedding_id, None, files).await.unwrap();
    h.drain().await;

    let check = h.pipeline.quota.can_upload(wedding_id, 10, 1).await.unwrap();
    assert!(!check.can_upload);
    assert!(check.upgrade_message.is_some());

    let batch = h
        .pipeline
        .submit(wedding_id, None, vec![photo("eleventh.png")])
        .await
        .unwrap();
    h.drain().await;

    let status = h
        .pipeline
        .status
        .get_batch_status(wedding_id, batch.id)
        .await
        .unwrap();
    assert_eq!(status.state, BatchState::Failed);
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].starts_with("eleventh.png: File limit reached"));
    assert!(status.errors[0].contains("Upgrade"));
    assert_eq!(h.media.len(), 10);
}
