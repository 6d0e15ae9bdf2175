//! Training job entity: one row per training run, carrying its provenance

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Training status as reported by the training provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Pending,
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl TrainingStatus {
    pub const TERMINAL: [TrainingStatus; 3] = [
        TrainingStatus::Succeeded,
        TrainingStatus::Failed,
        TrainingStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingStatus::Pending => "pending",
            TrainingStatus::Starting => "starting",
            TrainingStatus::Processing => "processing",
            TrainingStatus::Succeeded => "succeeded",
            TrainingStatus::Failed => "failed",
            TrainingStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Position in the lifecycle; all terminal states share the top rank
    pub fn rank(&self) -> u8 {
        match self {
            TrainingStatus::Pending => 0,
            TrainingStatus::Starting => 1,
            TrainingStatus::Processing => 2,
            TrainingStatus::Succeeded | TrainingStatus::Failed | TrainingStatus::Canceled => 3,
        }
    }

    /// Whether a notification carrying `incoming` may overwrite a row whose
    /// stored status is `self`. Terminal notifications always apply; anything
    /// else must strictly advance a non-terminal row.
    pub fn accepts(&self, incoming: TrainingStatus) -> bool {
        if incoming.is_terminal() {
            return true;
        }
        !self.is_terminal() && incoming.rank() > self.rank()
    }
}

impl fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TrainingStatus::Pending),
            "starting" => Ok(TrainingStatus::Starting),
            "processing" => Ok(TrainingStatus::Processing),
            "succeeded" => Ok(TrainingStatus::Succeeded),
            "failed" => Ok(TrainingStatus::Failed),
            "canceled" | "cancelled" => Ok(TrainingStatus::Canceled),
            other => Err(format!("unknown training status '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "training_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Id assigned by the training provider
    #[sea_orm(column_type = "Text", nullable, unique)]
    pub replicate_job_id: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub model_name: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub trigger_word: Option<String>,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub input_images_url: Option<String>,

    pub steps: Option<i32>,

    #[sea_orm(column_type = "Text", nullable)]
    pub captioning: Option<String>,

    /// Trained weights reference
    #[sea_orm(column_type = "Text", nullable)]
    pub output_url: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub logs: Option<String>,

    pub predict_time: Option<f64>,

    pub total_time: Option<f64>,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    /// Registered IP asset, set only by a confirmed registration
    #[sea_orm(column_type = "Text", nullable)]
    pub ip_id: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub registration_tx_hash: Option<String>,

    /// Ordered parent IP ids (JSON array of strings)
    #[sea_orm(column_type = "JsonBinary")]
    pub parent_ip_ids: Json,

    pub registration_failed: bool,

    #[sea_orm(column_type = "Text", nullable)]
    pub registration_failure_reason: Option<String>,

    pub registration_failed_at: Option<DateTimeWithTimeZone>,

    /// Set while a worker holds the registration claim for this job
    pub registration_claimed_at: Option<DateTimeWithTimeZone>,

    pub hidden: bool,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the job status as an enum. Unknown strings read as pending.
    pub fn training_status(&self) -> TrainingStatus {
        self.status.parse().unwrap_or(TrainingStatus::Pending)
    }

    /// Whether a notification carrying `incoming` may overwrite this row.
    /// Once a derivative IP is recorded only the stored status may repeat.
    pub fn accepts(&self, incoming: TrainingStatus) -> bool {
        let stored = self.training_status();
        if self.ip_id.is_some() && incoming != stored {
            return false;
        }
        stored.accepts(incoming)
    }

    /// Stored parent ids in their recorded order
    pub fn parent_ip_ids(&self) -> Vec<String> {
        parse_parent_ids(&self.parent_ip_ids)
    }
}

/// Read a JSON array of strings, skipping anything that is not a string
pub fn parse_parent_ids(value: &Json) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::training_image::Entity")]
    Images,
}

impl Related<super::training_image::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Images.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_rejects_processing() {
        for terminal in TrainingStatus::TERMINAL {
            assert!(!terminal.accepts(TrainingStatus::Processing));
            assert!(!terminal.accepts(TrainingStatus::Starting));
        }
    }

    #[test]
    fn test_processing_duplicate_not_accepted() {
        assert!(!TrainingStatus::Processing.accepts(TrainingStatus::Processing));
        assert!(TrainingStatus::Starting.accepts(TrainingStatus::Processing));
    }

    #[test]
    fn test_terminal_always_accepted() {
        assert!(TrainingStatus::Succeeded.accepts(TrainingStatus::Succeeded));
        assert!(TrainingStatus::Processing.accepts(TrainingStatus::Failed));
        assert!(TrainingStatus::Pending.accepts(TrainingStatus::Canceled));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("cancelled".parse::<TrainingStatus>(), Ok(TrainingStatus::Canceled));
        assert!("queued".parse::<TrainingStatus>().is_err());
    }

    #[test]
    fn test_parse_parent_ids_skips_non_strings() {
        let value = serde_json::json!(["0xaa", 7, "0xbb", null]);
        assert_eq!(parse_parent_ids(&value), vec!["0xaa", "0xbb"]);
        assert!(parse_parent_ids(&serde_json::json!({})).is_empty());
    }
}
