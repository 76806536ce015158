use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// `species` holds the ordered list of species requirements as a JSON array.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tally_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub created_at: DateTimeUtc,
    pub block_name: String,
    pub project_name: Option<String>,
    pub supervisor: Option<String>,
    pub target_density: Option<f64>,
    pub notes: Option<String>,
    pub species: Json,
    pub status: String,
    pub status_error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
