//! Fixtures shared by the pipeline tests

use crate::db::models::TrainingStatus;
use crate::store::{
    ImageRegistration, JobWithImages, MemoryStore, NewTrainingImage, NewTrainingJob,
    NotificationUpdate, ProvenanceStore,
};
use chrono::{DateTime, Duration, Utc};

/// A job seeded into a [`MemoryStore`]
pub struct SeededJob<'a> {
    pub external_id: &'a str,
    /// Stored parent collection (Flow B)
    pub collection: Vec<String>,
    /// One image per entry; `Some(ip)` marks it registered
    pub images: Vec<Option<String>>,
    pub completed_at: DateTime<Utc>,
}

impl<'a> SeededJob<'a> {
    pub fn new(external_id: &'a str) -> Self {
        Self {
            external_id,
            collection: Vec::new(),
            images: Vec::new(),
            completed_at: Utc::now() - Duration::hours(1),
        }
    }

    pub fn collection(mut self, ids: &[&str]) -> Self {
        self.collection = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn registered_images(mut self, ids: &[&str]) -> Self {
        self.images = ids.iter().map(|s| Some(s.to_string())).collect();
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = at;
        self
    }

    /// Insert as a succeeded, eligible job and read it back
    pub async fn insert(self, store: &MemoryStore) -> JobWithImages {
        let created = store
            .create_job(NewTrainingJob {
                replicate_job_id: Some(self.external_id.to_string()),
                model_name: Some(format!("model-{}", self.external_id)),
                trigger_word: Some("TOK".to_string()),
                steps: Some(1000),
                captioning: Some("automatic".to_string()),
                input_images_url: None,
                parent_ip_ids: self.collection,
                images: self
                    .images
                    .iter()
                    .map(|_| NewTrainingImage::default())
                    .collect(),
            })
            .await
            .unwrap();

        for (image, ip) in created.images.iter().zip(self.images) {
            if let Some(ip_id) = ip {
                store
                    .record_image_registration(image.id, ImageRegistration::Registered { ip_id })
                    .await
                    .unwrap();
            }
        }

        let mut update = NotificationUpdate::status_only(TrainingStatus::Succeeded);
        update.output_url = Some(format!("https://weights/{}.safetensors", self.external_id));
        update.completed_at = Some(self.completed_at);
        store
            .upsert_job_on_notification(self.external_id, &update)
            .await
            .unwrap();

        store
            .find_job_by_external_id(self.external_id)
            .await
            .unwrap()
            .unwrap()
    }
}
