use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema};
use url::Url;

use crate::entities::{bagup, project, supervisor, tally, tally_session};
use crate::error::AppError;

pub fn resolve_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("tallysync.db")
}

pub fn ensure_parent_dir(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Exclusive lock beside the database; every command holds it for its whole run,
/// which keeps sync runs from overlapping.
pub fn open_lock(path: &Path) -> Result<fd_lock::RwLock<File>, AppError> {
    let lock_path = path.with_extension("lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    Ok(fd_lock::RwLock::new(file))
}

pub async fn connect(path: &Path) -> Result<DatabaseConnection, AppError> {
    let mut url = Url::from_file_path(path)
        .map_err(|_| AppError::InvalidInput(format!("invalid sqlite path: {}", path.display())))?;
    url.set_query(Some("mode=rwc"));
    let sqlite_url = url.as_str().replacen("file://", "sqlite://", 1);
    Ok(Database::connect(&sqlite_url).await?)
}

pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), AppError> {
    create_table(db, tally::Entity).await?;
    create_table(db, tally_session::Entity).await?;
    create_table(db, bagup::Entity).await?;
    create_table(db, project::Entity).await?;
    create_table(db, supervisor::Entity).await?;

    create_index(
        db,
        Index::create()
            .name("idx_tallies_date")
            .table(tally::Entity)
            .col(tally::Column::Date)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_tallies_status")
            .table(tally::Entity)
            .col(tally::Column::Status)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_tallies_created")
            .table(tally::Entity)
            .col(tally::Column::CreatedAt)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_sessions_status")
            .table(tally_session::Entity)
            .col(tally_session::Column::Status)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_sessions_created")
            .table(tally_session::Entity)
            .col(tally_session::Column::CreatedAt)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_bagups_session_created")
            .table(bagup::Entity)
            .col(bagup::Column::SessionId)
            .col(bagup::Column::CreatedAt)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_bagups_status")
            .table(bagup::Entity)
            .col(bagup::Column::Status)
            .to_owned(),
    )
    .await?;

    Ok(())
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), AppError> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(builder.build(&stmt)).await?;
    Ok(())
}

async fn create_index(
    db: &DatabaseConnection,
    mut stmt: IndexCreateStatement,
) -> Result<(), AppError> {
    let builder = db.get_database_backend();
    stmt.if_not_exists();
    db.execute(builder.build(&stmt)).await?;
    Ok(())
}
