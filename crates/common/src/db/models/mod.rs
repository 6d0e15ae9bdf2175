//! SeaORM entity models
//!
//! Database entities for StoryForge

mod training_job;
mod training_image;

pub use training_job::{
    parse_parent_ids,
    Entity as TrainingJobEntity,
    Model as TrainingJob,
    ActiveModel as TrainingJobActiveModel,
    Column as TrainingJobColumn,
    TrainingStatus,
};

pub use training_image::{
    Entity as TrainingImageEntity,
    Model as TrainingImage,
    ActiveModel as TrainingImageActiveModel,
    Column as TrainingImageColumn,
    ImageRegistrationStatus,
};
