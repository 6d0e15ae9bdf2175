//! Training image entity: one uploaded source image, registered as its own IP

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Registration state of a single source image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRegistrationStatus {
    Pending,
    Registered,
    Failed,
}

impl From<&str> for ImageRegistrationStatus {
    fn from(s: &str) -> Self {
        match s {
            "registered" => ImageRegistrationStatus::Registered,
            "failed" => ImageRegistrationStatus::Failed,
            _ => ImageRegistrationStatus::Pending,
        }
    }
}

impl From<ImageRegistrationStatus> for String {
    fn from(status: ImageRegistrationStatus) -> Self {
        match status {
            ImageRegistrationStatus::Pending => "pending".to_string(),
            ImageRegistrationStatus::Registered => "registered".to_string(),
            ImageRegistrationStatus::Failed => "failed".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "training_images")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub training_job_id: Uuid,

    pub display_order: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub image_url: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub story_ip_id: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub registration_status: String,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn registration_status(&self) -> ImageRegistrationStatus {
        ImageRegistrationStatus::from(self.registration_status.as_str())
    }

    /// The image's IP id, if its own registration completed
    pub fn registered_ip_id(&self) -> Option<&str> {
        match self.registration_status() {
            ImageRegistrationStatus::Registered => self.story_ip_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::training_job::Entity",
        from = "Column::TrainingJobId",
        to = "super::training_job::Column::Id",
        on_delete = "Cascade"
    )]
    TrainingJob,
}

impl Related<super::training_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TrainingJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
