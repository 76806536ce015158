use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::sea_query::Query;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    Set, SqlErr, TransactionTrait,
};

use crate::capability::{Clock, IdGenerator};
use crate::entities::{bagup, project, supervisor, tally, tally_session};
use crate::error::AppError;
use crate::lifecycle::{BagupStatus, SessionStatus, TallyStatus};
use crate::model::{
    trim_optional, validate_species, BagupCounts, BagupInput, SessionFilter, SessionInput,
    SpeciesRequirement, SyncCounts, TallyInput,
};

/// Local-first persistence for tallies, sessions, bagups and the remote caches.
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

#[derive(Clone, Debug)]
pub struct FinalizedSession {
    pub session: tally_session::Model,
    pub bagups_finalized: usize,
}

/// Record ids of one sync batch, per kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchKeys {
    pub tallies: Vec<String>,
    pub sessions: Vec<String>,
    pub bagups: Vec<String>,
}

/// Keyset position in a sync queue. Queues run newest first, so the next page
/// holds records strictly older than `(created_at, id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueCursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl QueueCursor {
    pub fn new(created_at: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            created_at,
            id: id.into(),
        }
    }

    fn older<C: ColumnTrait>(&self, created_at: C, id: C) -> Condition {
        Condition::any().add(created_at.lt(self.created_at)).add(
            Condition::all()
                .add(created_at.eq(self.created_at))
                .add(id.lt(self.id.as_str())),
        )
    }
}

impl Store {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { db, clock, ids }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn create_tally(&self, input: TallyInput) -> Result<tally::Model, AppError> {
        let date = input.date.trim().to_string();
        NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| {
            AppError::InvalidInput(format!("tally date '{date}' must be YYYY-MM-DD"))
        })?;
        if input.trees <= 0 {
            return Err(AppError::InvalidInput(
                "tally trees must be greater than zero".to_string(),
            ));
        }

        let id = self.ids.next_id();
        let active = tally::ActiveModel {
            id: Set(id.clone()),
            date: Set(date),
            trees: Set(input.trees),
            notes: Set(trim_optional(input.notes)),
            block_name: Set(trim_optional(input.block_name)),
            created_at: Set(self.clock.now()),
            status: Set(TallyStatus::Pending.as_str().to_string()),
            status_error: Set(None),
        };
        tally::Entity::insert(active)
            .exec_without_returning(&self.db)
            .await
            .map_err(|err| insert_error(err, "tally", &id))?;
        self.get_tally(&id).await
    }

    pub async fn get_tally(&self, id: &str) -> Result<tally::Model, AppError> {
        tally::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("tally id {id}")))
    }

    pub async fn list_tallies_by_date(&self, date: &str) -> Result<Vec<tally::Model>, AppError> {
        Ok(tally::Entity::find()
            .filter(tally::Column::Date.eq(date))
            .order_by_desc(tally::Column::CreatedAt)
            .order_by_desc(tally::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn list_tallies_by_status(
        &self,
        statuses: &[TallyStatus],
    ) -> Result<Vec<tally::Model>, AppError> {
        Ok(tally::Entity::find()
            .filter(tally::Column::Status.is_in(statuses.iter().map(|s| s.as_str())))
            .order_by_desc(tally::Column::CreatedAt)
            .order_by_desc(tally::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn count_tallies_by_status(&self, status: TallyStatus) -> Result<u64, AppError> {
        Ok(tally::Entity::find()
            .filter(tally::Column::Status.eq(status.as_str()))
            .count(&self.db)
            .await?)
    }

    pub async fn create_session(
        &self,
        input: SessionInput,
    ) -> Result<tally_session::Model, AppError> {
        ensure_non_empty("block name", &input.block_name)?;
        validate_species(&input.species)?;
        if let Some(density) = input.target_density {
            if !density.is_finite() || density < 0.0 {
                return Err(AppError::InvalidInput(
                    "target density must be a non-negative number".to_string(),
                ));
            }
        }
        let species: Vec<SpeciesRequirement> = input
            .species
            .into_iter()
            .map(|item| SpeciesRequirement {
                species_code: item.species_code.trim().to_string(),
                display_name: item.display_name.trim().to_string(),
                required_ratio: item.required_ratio,
            })
            .collect();

        let id = self.ids.next_id();
        let active = tally_session::ActiveModel {
            id: Set(id.clone()),
            created_at: Set(self.clock.now()),
            block_name: Set(input.block_name.trim().to_string()),
            project_name: Set(trim_optional(input.project_name)),
            supervisor: Set(trim_optional(input.supervisor)),
            target_density: Set(input.target_density),
            notes: Set(trim_optional(input.notes)),
            species: Set(serde_json::to_value(&species)?),
            status: Set(SessionStatus::Draft.as_str().to_string()),
            status_error: Set(None),
        };
        tally_session::Entity::insert(active)
            .exec_without_returning(&self.db)
            .await
            .map_err(|err| insert_error(err, "session", &id))?;
        self.get_session(&id).await
    }

    pub async fn get_session(&self, id: &str) -> Result<tally_session::Model, AppError> {
        get_session_with_conn(&self.db, id).await
    }

    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<tally_session::Model>, AppError> {
        self.list_sessions_by_status(&filter.resolved_statuses())
            .await
    }

    pub async fn list_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<tally_session::Model>, AppError> {
        Ok(tally_session::Entity::find()
            .filter(tally_session::Column::Status.is_in(statuses.iter().map(|s| s.as_str())))
            .order_by_desc(tally_session::Column::CreatedAt)
            .order_by_desc(tally_session::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn count_sessions_by_status(&self, status: SessionStatus) -> Result<u64, AppError> {
        Ok(tally_session::Entity::find()
            .filter(tally_session::Column::Status.eq(status.as_str()))
            .count(&self.db)
            .await?)
    }

    /// Moves the session to `finalized` and, in the same transaction, every
    /// `pending`/`error` bagup under it.
    pub async fn finalize_session(&self, id: &str) -> Result<FinalizedSession, AppError> {
        let txn = self.db.begin().await?;
        let result: Result<FinalizedSession, AppError> = async {
            let session = get_session_with_conn(&txn, id).await?;
            let next = session.sync_status()?.finalize()?;
            let session = write_session_status(&txn, id, next, None).await?;

            let open = bagup::Entity::find()
                .filter(bagup::Column::SessionId.eq(id))
                .filter(bagup::Column::Status.is_in([
                    BagupStatus::Pending.as_str(),
                    BagupStatus::Error.as_str(),
                ]))
                .all(&txn)
                .await?;
            let mut bagups_finalized = 0usize;
            for item in open {
                let next = item.sync_status()?.finalize()?;
                write_bagup_status(&txn, &item.id, next, None).await?;
                bagups_finalized += 1;
            }

            Ok(FinalizedSession {
                session,
                bagups_finalized,
            })
        }
        .await;

        commit_or_rollback(txn, result).await
    }

    pub async fn archive_session(&self, id: &str) -> Result<tally_session::Model, AppError> {
        let txn = self.db.begin().await?;
        let result: Result<tally_session::Model, AppError> = async {
            let session = get_session_with_conn(&txn, id).await?;
            let next = session.sync_status()?.archive()?;
            write_session_status(&txn, id, next, None).await
        }
        .await;

        commit_or_rollback(txn, result).await
    }

    pub async fn create_bagup(
        &self,
        session_id: &str,
        input: BagupInput,
    ) -> Result<bagup::Model, AppError> {
        let session = self.get_session(session_id).await?;
        let species = session.species_list()?;
        ensure_known_codes(&species, &input.counts)?;
        if input.lat.is_some() != input.lng.is_some() {
            return Err(AppError::InvalidInput(
                "bagup location needs both lat and lng".to_string(),
            ));
        }

        let mut counts = BagupCounts::new();
        for item in &species {
            counts.insert(item.species_code.clone(), 0);
        }
        counts.extend(input.counts);

        let id = self.ids.next_id();
        let active = bagup::ActiveModel {
            id: Set(id.clone()),
            session_id: Set(session.id.clone()),
            created_at: Set(self.clock.now()),
            counts: Set(serde_json::to_value(&counts)?),
            lat: Set(input.lat),
            lng: Set(input.lng),
            status: Set(BagupStatus::Pending.as_str().to_string()),
            status_error: Set(None),
        };
        bagup::Entity::insert(active)
            .exec_without_returning(&self.db)
            .await
            .map_err(|err| insert_error(err, "bagup", &id))?;
        self.get_bagup(&id).await
    }

    pub async fn get_bagup(&self, id: &str) -> Result<bagup::Model, AppError> {
        bagup::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("bagup id {id}")))
    }

    /// Replaces the bagup's counts. Whether the session is still editable is
    /// for the caller to check.
    pub async fn save_bagup_counts(
        &self,
        id: &str,
        counts: BagupCounts,
    ) -> Result<bagup::Model, AppError> {
        let existing = self.get_bagup(id).await?;
        let session = self.get_session(&existing.session_id).await?;
        ensure_known_codes(&session.species_list()?, &counts)?;

        let active = bagup::ActiveModel {
            id: Set(id.to_string()),
            counts: Set(serde_json::to_value(&counts)?),
            ..Default::default()
        };
        match active.update(&self.db).await {
            Ok(model) => Ok(model),
            Err(DbErr::RecordNotFound(_)) | Err(DbErr::RecordNotUpdated) => {
                Err(AppError::NotFound(format!("bagup id {id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn remove_bagup(&self, id: &str) -> Result<(), AppError> {
        let existing = self.get_bagup(id).await?;
        let status = existing.sync_status()?;
        if !status.is_removable() {
            return Err(AppError::InvalidInput(format!(
                "bagup id {id} is {}; only pending bagups can be removed",
                status.as_str()
            )));
        }
        let result = bagup::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(AppError::NotFound(format!("bagup id {id}")));
        }
        Ok(())
    }

    pub async fn list_bagups_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<bagup::Model>, AppError> {
        Ok(bagup::Entity::find()
            .filter(bagup::Column::SessionId.eq(session_id))
            .order_by_desc(bagup::Column::CreatedAt)
            .order_by_desc(bagup::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn list_bagups_by_status(
        &self,
        statuses: &[BagupStatus],
    ) -> Result<Vec<bagup::Model>, AppError> {
        Ok(bagup::Entity::find()
            .filter(bagup::Column::Status.is_in(statuses.iter().map(|s| s.as_str())))
            .order_by_desc(bagup::Column::CreatedAt)
            .order_by_desc(bagup::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn count_bagups_by_status(&self, status: BagupStatus) -> Result<u64, AppError> {
        Ok(bagup::Entity::find()
            .filter(bagup::Column::Status.eq(status.as_str()))
            .count(&self.db)
            .await?)
    }

    pub async fn sync_counts(&self) -> Result<SyncCounts, AppError> {
        let mut counts = SyncCounts::default();
        for status in TallyStatus::ALL {
            counts
                .tallies
                .push((status, self.count_tallies_by_status(status).await?));
        }
        for status in SessionStatus::ALL {
            counts
                .sessions
                .push((status, self.count_sessions_by_status(status).await?));
        }
        for status in BagupStatus::ALL {
            counts
                .bagups
                .push((status, self.count_bagups_by_status(status).await?));
        }
        Ok(counts)
    }

    pub async fn tally_sync_queue(
        &self,
        limit: u64,
        after: Option<&QueueCursor>,
    ) -> Result<Vec<tally::Model>, AppError> {
        let mut select = tally::Entity::find().filter(
            tally::Column::Status.is_in(TallyStatus::SYNC_ELIGIBLE.iter().map(|s| s.as_str())),
        );
        if let Some(cursor) = after {
            select = select.filter(cursor.older(tally::Column::CreatedAt, tally::Column::Id));
        }
        Ok(select
            .order_by_desc(tally::Column::CreatedAt)
            .order_by_desc(tally::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn session_sync_queue(
        &self,
        limit: u64,
        after: Option<&QueueCursor>,
    ) -> Result<Vec<tally_session::Model>, AppError> {
        let mut select = tally_session::Entity::find().filter(
            tally_session::Column::Status
                .is_in(SessionStatus::SYNC_ELIGIBLE.iter().map(|s| s.as_str())),
        );
        if let Some(cursor) = after {
            select = select.filter(
                cursor.older(tally_session::Column::CreatedAt, tally_session::Column::Id),
            );
        }
        Ok(select
            .order_by_desc(tally_session::Column::CreatedAt)
            .order_by_desc(tally_session::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Bagups whose session has been archived are never queued.
    pub async fn bagup_sync_queue(
        &self,
        limit: u64,
        after: Option<&QueueCursor>,
    ) -> Result<Vec<bagup::Model>, AppError> {
        let archived_sessions = Query::select()
            .column(tally_session::Column::Id)
            .from(tally_session::Entity)
            .and_where(tally_session::Column::Status.eq(SessionStatus::Archived.as_str()))
            .to_owned();
        let mut select = bagup::Entity::find()
            .filter(
                bagup::Column::Status
                    .is_in(BagupStatus::SYNC_ELIGIBLE.iter().map(|s| s.as_str())),
            )
            .filter(bagup::Column::SessionId.not_in_subquery(archived_sessions));
        if let Some(cursor) = after {
            select = select.filter(cursor.older(bagup::Column::CreatedAt, bagup::Column::Id));
        }
        Ok(select
            .order_by_desc(bagup::Column::CreatedAt)
            .order_by_desc(bagup::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Marks every record of an accepted batch `synced`. Missing records are
    /// skipped; returns how many were written.
    pub async fn mark_batch_synced(&self, keys: &BatchKeys) -> Result<usize, AppError> {
        self.write_batch_status(keys, None).await
    }

    /// Marks every record of a rejected batch `error` with `message`.
    pub async fn mark_batch_error(
        &self,
        keys: &BatchKeys,
        message: &str,
    ) -> Result<usize, AppError> {
        self.write_batch_status(keys, Some(message)).await
    }

    async fn write_batch_status(
        &self,
        keys: &BatchKeys,
        error: Option<&str>,
    ) -> Result<usize, AppError> {
        let txn = self.db.begin().await?;
        let result: Result<usize, AppError> = async {
            let mut written = 0usize;
            for id in &keys.tallies {
                let Some(model) = tally::Entity::find_by_id(id.clone()).one(&txn).await? else {
                    continue;
                };
                let current = model.sync_status()?;
                let next = match error {
                    None => current.mark_synced(),
                    Some(_) => current.mark_error(),
                };
                match next {
                    Ok(next) => {
                        let active = tally::ActiveModel {
                            id: Set(id.clone()),
                            status: Set(next.as_str().to_string()),
                            status_error: Set(error.map(str::to_string)),
                            ..Default::default()
                        };
                        active.update(&txn).await?;
                        written += 1;
                    }
                    Err(err) => {
                        tracing::warn!(id = %id, error = %err, "skipping tally status write")
                    }
                }
            }
            for id in &keys.sessions {
                let Some(model) = tally_session::Entity::find_by_id(id.clone()).one(&txn).await?
                else {
                    continue;
                };
                let current = model.sync_status()?;
                let next = match error {
                    None => current.mark_synced(),
                    Some(_) => current.mark_error(),
                };
                match next {
                    Ok(next) => {
                        write_session_status(&txn, id, next, error).await?;
                        written += 1;
                    }
                    Err(err) => {
                        tracing::warn!(id = %id, error = %err, "skipping session status write")
                    }
                }
            }
            for id in &keys.bagups {
                let Some(model) = bagup::Entity::find_by_id(id.clone()).one(&txn).await? else {
                    continue;
                };
                let current = model.sync_status()?;
                let next = match error {
                    None => current.mark_synced(),
                    Some(_) => current.mark_error(),
                };
                match next {
                    Ok(next) => {
                        write_bagup_status(&txn, id, next, error).await?;
                        written += 1;
                    }
                    Err(err) => {
                        tracing::warn!(id = %id, error = %err, "skipping bagup status write")
                    }
                }
            }
            Ok(written)
        }
        .await;

        commit_or_rollback(txn, result).await
    }

    /// Swaps the project cache for `projects` in one transaction. Duplicate names
    /// keep their first entry.
    pub async fn replace_projects(&self, projects: Vec<project::Model>) -> Result<usize, AppError> {
        let mut seen = HashSet::new();
        let rows: Vec<project::ActiveModel> = projects
            .into_iter()
            .filter(|item| seen.insert(item.project_name.clone()))
            .map(|item| project::ActiveModel {
                project_name: Set(item.project_name),
                species_data: Set(item.species_data),
                blocks_data: Set(item.blocks_data),
            })
            .collect();
        let inserted = rows.len();

        let txn = self.db.begin().await?;
        let result: Result<usize, AppError> = async {
            project::Entity::delete_many().exec(&txn).await?;
            if !rows.is_empty() {
                project::Entity::insert_many(rows)
                    .exec_without_returning(&txn)
                    .await?;
            }
            Ok(inserted)
        }
        .await;

        commit_or_rollback(txn, result).await
    }

    pub async fn replace_supervisors(
        &self,
        supervisors: Vec<supervisor::Model>,
    ) -> Result<usize, AppError> {
        let mut seen = HashSet::new();
        let rows: Vec<supervisor::ActiveModel> = supervisors
            .into_iter()
            .filter(|item| seen.insert(item.name.clone()))
            .map(|item| supervisor::ActiveModel {
                name: Set(item.name),
                project_name: Set(item.project_name),
            })
            .collect();
        let inserted = rows.len();

        let txn = self.db.begin().await?;
        let result: Result<usize, AppError> = async {
            supervisor::Entity::delete_many().exec(&txn).await?;
            if !rows.is_empty() {
                supervisor::Entity::insert_many(rows)
                    .exec_without_returning(&txn)
                    .await?;
            }
            Ok(inserted)
        }
        .await;

        commit_or_rollback(txn, result).await
    }

    pub async fn list_projects(&self) -> Result<Vec<project::Model>, AppError> {
        Ok(project::Entity::find()
            .order_by_asc(project::Column::ProjectName)
            .all(&self.db)
            .await?)
    }

    pub async fn get_project(&self, name: &str) -> Result<project::Model, AppError> {
        project::Entity::find_by_id(name.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("project {name}")))
    }

    pub async fn list_supervisors(&self) -> Result<Vec<supervisor::Model>, AppError> {
        Ok(supervisor::Entity::find()
            .order_by_asc(supervisor::Column::Name)
            .all(&self.db)
            .await?)
    }

    /// Species requirements prefilled from a cached project, with no ratio target.
    pub async fn species_from_project(
        &self,
        name: &str,
    ) -> Result<Vec<SpeciesRequirement>, AppError> {
        let project = self.get_project(name).await?;
        Ok(project
            .species_catalog()
            .into_iter()
            .map(|(species_code, display_name)| SpeciesRequirement {
                species_code,
                display_name,
                required_ratio: 0.0,
            })
            .collect())
    }
}

async fn get_session_with_conn<C: ConnectionTrait>(
    db: &C,
    id: &str,
) -> Result<tally_session::Model, AppError> {
    tally_session::Entity::find_by_id(id.to_string())
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("session id {id}")))
}

async fn write_session_status<C: ConnectionTrait>(
    db: &C,
    id: &str,
    status: SessionStatus,
    error: Option<&str>,
) -> Result<tally_session::Model, AppError> {
    let active = tally_session::ActiveModel {
        id: Set(id.to_string()),
        status: Set(status.as_str().to_string()),
        status_error: Set(status_error_for(status == SessionStatus::Error, error)),
        ..Default::default()
    };
    match active.update(db).await {
        Ok(model) => Ok(model),
        Err(DbErr::RecordNotFound(_)) | Err(DbErr::RecordNotUpdated) => {
            Err(AppError::NotFound(format!("session id {id}")))
        }
        Err(err) => Err(err.into()),
    }
}

async fn write_bagup_status<C: ConnectionTrait>(
    db: &C,
    id: &str,
    status: BagupStatus,
    error: Option<&str>,
) -> Result<bagup::Model, AppError> {
    let active = bagup::ActiveModel {
        id: Set(id.to_string()),
        status: Set(status.as_str().to_string()),
        status_error: Set(status_error_for(status == BagupStatus::Error, error)),
        ..Default::default()
    };
    match active.update(db).await {
        Ok(model) => Ok(model),
        Err(DbErr::RecordNotFound(_)) | Err(DbErr::RecordNotUpdated) => {
            Err(AppError::NotFound(format!("bagup id {id}")))
        }
        Err(err) => Err(err.into()),
    }
}

/// `status_error` is only ever stored alongside the `error` status.
fn status_error_for(is_error: bool, message: Option<&str>) -> Option<String> {
    if is_error {
        Some(message.unwrap_or("Sync failed").to_string())
    } else {
        None
    }
}

fn ensure_known_codes(
    species: &[SpeciesRequirement],
    counts: &BagupCounts,
) -> Result<(), AppError> {
    let known: HashSet<&str> = species
        .iter()
        .map(|item| item.species_code.as_str())
        .collect();
    let unknown: Vec<&str> = counts
        .keys()
        .map(String::as_str)
        .filter(|code| !known.contains(code))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "unknown species code(s) for this session: {}",
            unknown.join(", ")
        )))
    }
}

fn insert_error(err: DbErr, label: &str, id: &str) -> AppError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            AppError::DuplicateKey(format!("{label} id {id}"))
        }
        _ => err.into(),
    }
}

async fn commit_or_rollback<T>(
    txn: DatabaseTransaction,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                return Err(rollback_err.into());
            }
            Err(err)
        }
    }
}

fn ensure_non_empty(label: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{label} cannot be empty")));
    }
    Ok(())
}
