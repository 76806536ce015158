use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// `counts` is a JSON object mapping species code to a non-negative count.
///
/// The session link is advisory: the table carries no foreign key, callers
/// check the parent session before inserting.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "bagups")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub session_id: String,
    pub created_at: DateTimeUtc,
    pub counts: Json,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub status: String,
    pub status_error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
