//! Course persistence flow.
//!
//! Uploads module media, upserts module records and finalizes the course
//! through a [`PersistenceBackend`]. Without a backend (or when no course
//! document can be obtained) the result is built in memory from the local
//! artifacts instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::PersistError;
use crate::pipeline::{CourseSpec, ModuleArtifact};

use super::backend::PersistenceBackend;

/// Document sent to `courses:createDetailed`.
///
/// Optional fields mirror the matching build constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoursePayload {
    pub topic: String,
    pub level: String,
    pub module_count: usize,
    pub module_ids: Vec<String>,
    /// Seconds since the Unix epoch.
    pub created_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_weeks: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_range: Option<serde_json::Value>,
    pub language: String,
    pub status: String,
    pub progress: u8,
}

impl CoursePayload {
    /// Payload for `course` with the given modules, in the `uploading` state.
    pub fn new(course: &CourseSpec, modules: &[ModuleArtifact]) -> Self {
        let owned = |key: &str| course.constraint_str(key).map(str::to_string);
        let raw = |key: &str| {
            course
                .constraints
                .get(key)
                .filter(|v| !v.is_null())
                .cloned()
        };

        Self {
            topic: course.topic.clone(),
            level: course.level.clone(),
            module_count: modules.len(),
            module_ids: modules.iter().map(|m| m.module_id.clone()).collect(),
            created_at: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            title: owned("title"),
            description: owned("description"),
            instructor: owned("instructor"),
            audience: owned("audience"),
            level_label: owned("level_label"),
            duration_weeks: raw("duration_weeks"),
            category: owned("category"),
            age_range: raw("age_range"),
            language: course.language().to_string(),
            status: "uploading".to_string(),
            progress: 80,
        }
    }
}

/// Arguments of `modules:upsert`.
///
/// Absent fields are left untouched by the backend, which lets a recompile
/// update only the video reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub course_id: String,
    pub module_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outline: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manim_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_storage_id: Option<String>,
}

impl ModuleRecord {
    /// Full record for an artifact and its uploaded media.
    pub fn from_artifact(course_id: &str, artifact: &ModuleArtifact, storage: &StorageIds) -> Self {
        Self {
            course_id: course_id.to_string(),
            module_id: artifact.module_id.clone(),
            title: Some(artifact.title.clone()),
            outline: Some(artifact.outline.clone()),
            text: Some(artifact.text.clone().unwrap_or_default()),
            manim_code: Some(artifact.source_code.clone().unwrap_or_default()),
            video_storage_id: storage.video.clone(),
        }
    }

    /// Record that only replaces the video reference.
    pub fn video_only(course_id: &str, module_id: &str, video_storage_id: &str) -> Self {
        Self {
            course_id: course_id.to_string(),
            module_id: module_id.to_string(),
            video_storage_id: Some(video_storage_id.to_string()),
            ..Default::default()
        }
    }
}

/// Media references for one module.
///
/// The backend storage id when persisted remotely, the local video path in
/// memory mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageIds {
    pub video: Option<String>,
}

/// Outcome of [`persist_course_and_modules`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistResult {
    /// `None` in memory mode.
    pub course_id: Option<String>,
    pub module_ids: Vec<String>,
    #[serde(rename = "storage")]
    pub storage_ids: BTreeMap<String, StorageIds>,
}

impl PersistResult {
    /// Whether the course landed in the backend.
    pub fn is_remote(&self) -> bool {
        self.course_id.is_some()
    }
}

/// Persist a finished course.
///
/// With a backend, `existing_course_id` is reused or a course document is
/// created, then each module's video is uploaded and the module
/// is upserted; the course is finalized last. Individual failures are
/// logged and skipped. When there is no backend, or no course id can be
/// obtained, the result is built in memory.
pub async fn persist_course_and_modules(
    backend: Option<&dyn PersistenceBackend>,
    payload: &CoursePayload,
    modules: &[ModuleArtifact],
    existing_course_id: Option<&str>,
) -> PersistResult {
    let Some(backend) = backend else {
        debug!("No persistence backend configured, keeping course in memory");
        return in_memory(modules);
    };

    let course_id = match existing_course_id {
        Some(id) => Some(id.to_string()),
        None => match backend.create_course(payload).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Course creation failed");
                None
            }
        },
    };
    let Some(course_id) = course_id else {
        return in_memory(modules);
    };

    let mut result = PersistResult {
        course_id: Some(course_id.clone()),
        ..Default::default()
    };

    for artifact in modules {
        let module_id = artifact.module_id.clone();
        let mut storage = StorageIds::default();

        if let Some(path) = artifact.video_path.as_deref().filter(|p| p.exists()) {
            storage.video = match tokio::fs::read(path).await {
                Ok(bytes) => match upload(backend, bytes, "video/mp4").await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(module_id = %module_id, error = %e, "Video upload failed");
                        None
                    }
                },
                Err(e) => {
                    warn!(module_id = %module_id, path = %path.display(), error = %e, "Failed to read video");
                    None
                }
            };
        }

        let record = ModuleRecord::from_artifact(&course_id, artifact, &storage);
        if let Err(e) = backend.upsert_module(&record).await {
            warn!(module_id = %module_id, error = %e, "Module upsert failed");
        }

        result.module_ids.push(module_id.clone());
        result.storage_ids.insert(module_id, storage);
    }

    if let Err(e) = backend.finalize_course(&course_id, &result.module_ids).await {
        warn!(course_id = %course_id, error = %e, "Course finalize failed");
    }

    info!(
        course_id = %course_id,
        modules = result.module_ids.len(),
        "Course persisted"
    );
    result
}

/// Request an upload URL and send `bytes` to it.
pub async fn upload(
    backend: &dyn PersistenceBackend,
    bytes: Vec<u8>,
    content_type: &str,
) -> Result<String, PersistError> {
    let url = backend.generate_upload_url().await?;
    backend.put_bytes(&url, bytes, content_type).await
}

fn in_memory(modules: &[ModuleArtifact]) -> PersistResult {
    let mut result = PersistResult::default();
    for artifact in modules {
        result.module_ids.push(artifact.module_id.clone());
        result.storage_ids.insert(
            artifact.module_id.clone(),
            StorageIds {
                video: artifact
                    .video_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            },
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AuxiliaryAsset, Constraints, ModuleSpec};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        fail_create: bool,
        fail_uploads: bool,
        uploads: Mutex<Vec<(usize, String)>>,
        upserts: Mutex<Vec<ModuleRecord>>,
        finalized: Mutex<Option<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl PersistenceBackend for RecordingBackend {
        async fn create_course(&self, _payload: &CoursePayload) -> Result<String, PersistError> {
            if self.fail_create {
                return Err(PersistError::RequestFailed("down".to_string()));
            }
            Ok("course-1".to_string())
        }

        async fn upsert_module(&self, record: &ModuleRecord) -> Result<(), PersistError> {
            self.upserts.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn finalize_course(&self, course_id: &str, module_ids: &[String]) -> Result<(), PersistError> {
            *self.finalized.lock().unwrap() = Some((course_id.to_string(), module_ids.to_vec()));
            Ok(())
        }

        async fn generate_upload_url(&self) -> Result<String, PersistError> {
            if self.fail_uploads {
                return Err(PersistError::NotConfigured);
            }
            Ok("https://upload.test/slot".to_string())
        }

        async fn put_bytes(&self, _url: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, PersistError> {
            let mut uploads = self.uploads.lock().unwrap();
            uploads.push((bytes.len(), content_type.to_string()));
            Ok(format!("storage-{}", uploads.len()))
        }

        async fn get_url(&self, storage_id: &str) -> Result<Option<String>, PersistError> {
            Ok(Some(format!("https://files.test/{storage_id}")))
        }

        async fn update_progress(&self, _course_id: &str, _status: &str, _percent: u8) -> Result<(), PersistError> {
            Ok(())
        }
    }

    fn artifact(id: &str) -> ModuleArtifact {
        let mut artifact = ModuleArtifact::new(&ModuleSpec {
            id: id.to_string(),
            title: format!("Module {id}"),
            objectives: vec![],
            outline: vec!["Intro".to_string()],
        });
        artifact.text = Some("# Lesson".to_string());
        artifact.source_code = Some("from manim import *".to_string());
        artifact
    }

    fn payload(modules: &[ModuleArtifact]) -> CoursePayload {
        let constraints: Constraints = json!({"title": "Graphs 101", "duration_weeks": 4, "api_token": "x"})
            .as_object()
            .cloned()
            .unwrap();
        CoursePayload::new(&CourseSpec::new("Graphs", "beginner", constraints), modules)
    }

    #[test]
    fn test_course_payload_shape() {
        let modules = vec![artifact("m1"), artifact("m2")];
        let value = serde_json::to_value(payload(&modules)).unwrap();

        assert_eq!(value["moduleCount"], 2);
        assert_eq!(value["moduleIds"], json!(["m1", "m2"]));
        assert_eq!(value["title"], "Graphs 101");
        assert_eq!(value["durationWeeks"], 4);
        assert_eq!(value["language"], "en");
        assert_eq!(value["status"], "uploading");
        assert_eq!(value["progress"], 80);
        assert!(value.get("instructor").is_none());
        assert!(value["createdAt"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_video_only_record_omits_other_fields() {
        let value = serde_json::to_value(ModuleRecord::video_only("c1", "m3", "s9")).unwrap();
        assert_eq!(value, json!({"courseId": "c1", "moduleId": "m3", "videoStorageId": "s9"}));
    }

    #[tokio::test]
    async fn test_in_memory_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut m1 = artifact("m1");
        m1.video_path = Some(dir.path().join("m1.mp4"));
        m1.auxiliary = Some(AuxiliaryAsset::qa("Q&A"));
        let modules = vec![m1, artifact("m2")];

        let result = persist_course_and_modules(None, &payload(&modules), &modules, None).await;

        assert!(!result.is_remote());
        assert_eq!(result.module_ids, vec!["m1", "m2"]);
        let m1_ids = &result.storage_ids["m1"];
        assert!(m1_ids.video.as_deref().unwrap().ends_with("m1.mp4"));
        assert_eq!(result.storage_ids["m2"], StorageIds::default());
    }

    #[tokio::test]
    async fn test_backend_uploads_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("m1.mp4");
        std::fs::write(&video, b"mp4").unwrap();

        let mut m1 = artifact("m1");
        m1.video_path = Some(video);
        m1.auxiliary = Some(AuxiliaryAsset::qa("Q&A"));
        let mut m2 = artifact("m2");
        m2.video_path = Some(dir.path().join("missing.mp4"));
        let modules = vec![m1, m2];

        let backend = RecordingBackend::default();
        let result =
            persist_course_and_modules(Some(&backend), &payload(&modules), &modules, None).await;

        assert_eq!(result.course_id.as_deref(), Some("course-1"));
        assert_eq!(result.module_ids, vec!["m1", "m2"]);

        let uploads = backend.uploads.lock().unwrap().clone();
        assert_eq!(uploads, vec![(3, "video/mp4".to_string())]);
        assert_eq!(result.storage_ids["m1"].video.as_deref(), Some("storage-1"));
        assert_eq!(result.storage_ids["m2"], StorageIds::default());

        let upserts = backend.upserts.lock().unwrap().clone();
        assert_eq!(upserts.len(), 2);
        assert_eq!(upserts[0].video_storage_id.as_deref(), Some("storage-1"));
        assert!(upserts[1].video_storage_id.is_none());

        let wire = serde_json::to_value(&upserts[0]).unwrap();
        assert!(wire.get("imageStorageId").is_none());
        assert_eq!(wire["text"], "# Lesson");

        let finalized = backend.finalized.lock().unwrap().clone();
        assert_eq!(
            finalized,
            Some(("course-1".to_string(), vec!["m1".to_string(), "m2".to_string()]))
        );
    }

    #[tokio::test]
    async fn test_existing_course_id_skips_creation() {
        let backend = RecordingBackend {
            fail_create: true,
            ..Default::default()
        };
        let modules = vec![artifact("m1")];
        let result = persist_course_and_modules(
            Some(&backend),
            &payload(&modules),
            &modules,
            Some("existing"),
        )
        .await;

        assert_eq!(result.course_id.as_deref(), Some("existing"));
        assert_eq!(backend.upserts.lock().unwrap()[0].course_id, "existing");
    }

    #[tokio::test]
    async fn test_failed_creation_falls_back_to_memory() {
        let backend = RecordingBackend {
            fail_create: true,
            ..Default::default()
        };
        let modules = vec![artifact("m1")];
        let result =
            persist_course_and_modules(Some(&backend), &payload(&modules), &modules, None).await;

        assert!(result.course_id.is_none());
        assert_eq!(result.module_ids, vec!["m1"]);
        assert!(backend.upserts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failures_do_not_stop_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("m1.mp4");
        std::fs::write(&video, b"mp4").unwrap();
        let mut m1 = artifact("m1");
        m1.video_path = Some(video);
        let modules = vec![m1];

        let backend = RecordingBackend {
            fail_uploads: true,
            ..Default::default()
        };
        let result =
            persist_course_and_modules(Some(&backend), &payload(&modules), &modules, None).await;

        assert_eq!(result.storage_ids["m1"].video, None);
        assert_eq!(backend.upserts.lock().unwrap().len(), 1);
    }
}
