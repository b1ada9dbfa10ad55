//! Test suite for ensuring a correct implementation of a backend.
use chrono::{TimeDelta, Utc};

use crate::job::{Job, JobId, JobStatus, Outcome};

use super::*;

/// Create test suite for cmdq backend.
///
/// For backend implementors, it is useful to include this are part of your test suites.
///
/// # Example
///
/// ```
/// # use cmdq::prelude::*;
/// use cmdq::test_suite;
/// use cmdq::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If the backend needs scratch state that has to outlive the test body, such as a temporary
/// directory, hand the suite a block that leaks or keeps that state alive:
///
/// ```ignore
/// use cmdq::test_suite;
/// test_suite!(
///     attr: tokio::test,
///     args: (),
///     backend: FileBackend::new(scratch_dir())
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        #[$attr]
        async fn enqueue $args {
          let backend = $backend;
          $crate::backend::testing::enqueue(backend).await;
        }
        #[$attr]
        async fn enqueue_duplicate $args {
          let backend = $backend;
          $crate::backend::testing::enqueue_duplicate(backend).await;
        }
        #[$attr]
        async fn enqueue_rejects_non_queued $args {
          let backend = $backend;
          $crate::backend::testing::enqueue_rejects_non_queued(backend).await;
        }
        #[$attr]
        async fn enqueue_rejects_unsafe_id $args {
          let backend = $backend;
          $crate::backend::testing::enqueue_rejects_unsafe_id(backend).await;
        }
        #[$attr]
        async fn load_not_found $args {
          let backend = $backend;
          $crate::backend::testing::load_not_found(backend).await;
        }
        #[$attr]
        async fn save_refreshes_updated_at $args {
          let backend = $backend;
          $crate::backend::testing::save_refreshes_updated_at(backend).await;
        }
        #[$attr]
        async fn save_rewrites_whole_record $args {
          let backend = $backend;
          $crate::backend::testing::save_rewrites_whole_record(backend).await;
        }
        #[$attr]
        async fn list_jobs_ordered_by_created_at $args {
          let backend = $backend;
          $crate::backend::testing::list_jobs_ordered_by_created_at(backend).await;
        }
        #[$attr]
        async fn list_pending_only_returns_queued $args {
          let backend = $backend;
          $crate::backend::testing::list_pending_only_returns_queued(backend).await;
        }
    };
}

fn job_created_at(offset: TimeDelta) -> Job {
    let mut job = Job::new("echo conformance");
    job.created_at = Utc::now() + offset;
    job
}

#[doc(hidden)]
pub async fn enqueue(backend: impl Backend) {
    let mut job = Job::new("echo hello");
    job.timeout_ms = Some(1234);
    job.channel = Some("channel".to_owned());
    job.user_id = Some("user".to_owned());
    let id = backend.enqueue(job.clone()).await.unwrap();
    assert_eq!(id, job.id);

    let loaded = backend.load(&id).await.unwrap().unwrap();
    assert_eq!(loaded.command, "echo hello");
    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.timeout_ms, Some(1234));
    assert_eq!(loaded.channel.as_deref(), Some("channel"));
    assert_eq!(loaded.user_id.as_deref(), Some("user"));
}

#[doc(hidden)]
pub async fn enqueue_duplicate(backend: impl Backend) {
    let job = Job::new("echo once");
    backend.enqueue(job.clone()).await.unwrap();
    let result = backend.enqueue(job).await;
    assert!(matches!(result, Err(BackendError::DuplicateJob(_))));
}

#[doc(hidden)]
pub async fn enqueue_rejects_non_queued(backend: impl Backend) {
    let mut job = Job::new("echo running");
    job.status = JobStatus::Running;
    let result = backend.enqueue(job).await;
    assert!(matches!(result, Err(BackendError::NotQueued(_))));

    let result = backend.enqueue(Job::new("")).await;
    assert!(matches!(result, Err(BackendError::NotQueued(_))));
}

#[doc(hidden)]
pub async fn enqueue_rejects_unsafe_id(backend: impl Backend) {
    let mut job = Job::new("echo escape");
    job.id = JobId::from("../escape");
    let result = backend.enqueue(job).await;
    assert!(matches!(result, Err(BackendError::InvalidJobId(_))));
}

#[doc(hidden)]
pub async fn load_not_found(backend: impl Backend) {
    let loaded = backend.load(&JobId::from("job-missing")).await.unwrap();
    assert!(loaded.is_none());
}

#[doc(hidden)]
pub async fn save_refreshes_updated_at(backend: impl Backend) {
    let mut job = Job::new("echo save");
    job.updated_at = Utc::now() - TimeDelta::hours(1);
    backend.enqueue(job.clone()).await.unwrap();
    let before = Utc::now();

    backend.save(&mut job).await.unwrap();

    assert!(job.updated_at >= before);
    let loaded = backend.load(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.updated_at, job.updated_at);
}

#[doc(hidden)]
pub async fn save_rewrites_whole_record(backend: impl Backend) {
    let mut job = Job::new("echo rewrite");
    backend.enqueue(job.clone()).await.unwrap();

    job.mark_running(Utc::now()).unwrap();
    job.progress.total_bytes = 42;
    job.progress.total_lines = 3;
    job.progress.reports_sent = 2;
    backend.save(&mut job).await.unwrap();
    job.finish(Outcome::Exited { code: Some(7) }, Utc::now())
        .unwrap();
    backend.save(&mut job).await.unwrap();

    let loaded = backend.load(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded, job);
    assert_eq!(loaded.status, JobStatus::Failed);
    assert_eq!(loaded.exit_code, Some(7));
    assert_eq!(loaded.progress.total_bytes, 42);
}

#[doc(hidden)]
pub async fn list_jobs_ordered_by_created_at(backend: impl Backend) {
    let newest = job_created_at(TimeDelta::seconds(10));
    let oldest = job_created_at(TimeDelta::seconds(-10));
    let middle = job_created_at(TimeDelta::zero());
    for job in [&newest, &oldest, &middle] {
        backend.enqueue(job.clone()).await.unwrap();
    }

    let ids: Vec<JobId> = backend
        .list_jobs()
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ids, vec![oldest.id, middle.id, newest.id]);
}

#[doc(hidden)]
pub async fn list_pending_only_returns_queued(backend: impl Backend) {
    let queued = job_created_at(TimeDelta::seconds(-1));
    let mut running = job_created_at(TimeDelta::seconds(-2));
    backend.enqueue(queued.clone()).await.unwrap();
    backend.enqueue(running.clone()).await.unwrap();
    running.mark_running(Utc::now()).unwrap();
    backend.save(&mut running).await.unwrap();

    let pending = backend.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, queued.id);
}
