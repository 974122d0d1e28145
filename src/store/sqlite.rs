use super::Store;
use crate::error::AppError;
use crate::jobs::{ChildStatus, GroupId, GroupResult, JobId, JobState, ResultArchive};
use crate::models::{
    Demand, Directory, NewDemand, NewDirectory, NewPhoto, Photo, ProcessingStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const MAX_CONNECTIONS: u32 = 5;

const DIRECTORY_COLUMNS: &str =
    "id, name, path, is_visible, indexing_task_id, total_photos, last_indexing_date, generation";
const PHOTO_COLUMNS: &str = "id, directory_id, path, face_encodings, generation";
const DEMAND_COLUMNS: &str = "id, directory_id, name, first_name, email, upload, date, \
     processing_status, face_encoding, search_task_id, request_token";

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS directories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        is_visible INTEGER NOT NULL DEFAULT 1,
        indexing_task_id TEXT,
        total_photos INTEGER NOT NULL DEFAULT 0,
        last_indexing_date INTEGER,
        generation INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS photos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        directory_id INTEGER NOT NULL REFERENCES directories(id),
        path TEXT NOT NULL,
        face_encodings TEXT NOT NULL,
        generation INTEGER NOT NULL,
        UNIQUE(directory_id, path, generation)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS demands (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        directory_id INTEGER NOT NULL REFERENCES directories(id),
        name TEXT NOT NULL,
        first_name TEXT NOT NULL,
        email TEXT NOT NULL,
        upload TEXT,
        date INTEGER NOT NULL,
        processing_status TEXT NOT NULL,
        face_encoding TEXT,
        search_task_id TEXT,
        request_token TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS demand_photos (
        demand_id INTEGER NOT NULL REFERENCES demands(id) ON DELETE CASCADE,
        photo_id INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
        PRIMARY KEY (demand_id, photo_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_groups (
        id TEXT PRIMARY KEY,
        expected_count INTEGER NOT NULL,
        expires_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_results (
        job_id TEXT PRIMARY KEY,
        group_id TEXT,
        position INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL,
        terminal INTEGER NOT NULL DEFAULT 0,
        expires_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_photos_directory ON photos(directory_id, generation)",
    "CREATE INDEX IF NOT EXISTS idx_demands_status ON demands(processing_status, directory_id)",
    "CREATE INDEX IF NOT EXISTS idx_job_results_group ON job_results(group_id, position)",
];

fn from_millis(ms: i64) -> Result<DateTime<Utc>, AppError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AppError::Generic(format!("Invalid timestamp {}", ms)))
}

fn parse_uuid(value: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(value).map_err(|e| AppError::Generic(format!("Invalid id {}: {}", value, e)))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn directory_from_row(row: &SqliteRow) -> Result<Directory, AppError> {
    let task: Option<String> = row.try_get("indexing_task_id")?;
    let last: Option<i64> = row.try_get("last_indexing_date")?;
    Ok(Directory {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        path: PathBuf::from(row.try_get::<String, _>("path")?),
        is_visible: row.try_get("is_visible")?,
        indexing_task_id: task.as_deref().map(parse_uuid).transpose()?,
        total_photos: row.try_get::<i64, _>("total_photos")? as usize,
        last_indexing_date: last.map(from_millis).transpose()?,
        generation: row.try_get::<i64, _>("generation")? as u64,
    })
}

fn photo_from_row(row: &SqliteRow) -> Result<Photo, AppError> {
    Ok(Photo {
        id: row.try_get("id")?,
        directory_id: row.try_get("directory_id")?,
        path: PathBuf::from(row.try_get::<String, _>("path")?),
        face_encodings: serde_json::from_str(&row.try_get::<String, _>("face_encodings")?)?,
        generation: row.try_get::<i64, _>("generation")? as u64,
    })
}

/// Builds a demand without its match set, see [`SqliteStore::with_photos`].
fn demand_from_row(row: &SqliteRow) -> Result<Demand, AppError> {
    let upload: Option<String> = row.try_get("upload")?;
    let encoding: Option<String> = row.try_get("face_encoding")?;
    let task: Option<String> = row.try_get("search_task_id")?;
    Ok(Demand {
        id: row.try_get("id")?,
        directory_id: row.try_get("directory_id")?,
        name: row.try_get("name")?,
        first_name: row.try_get("first_name")?,
        email: row.try_get("email")?,
        upload: upload.map(PathBuf::from),
        date: from_millis(row.try_get("date")?)?,
        processing_status: row
            .try_get::<String, _>("processing_status")?
            .parse::<ProcessingStatus>()
            .map_err(AppError::Generic)?,
        face_encoding: encoding.as_deref().map(serde_json::from_str).transpose()?,
        photos: BTreeSet::new(),
        search_task_id: task.as_deref().map(parse_uuid).transpose()?,
        request_token: parse_uuid(&row.try_get::<String, _>("request_token")?)?,
    })
}

fn state_from_text(text: &str) -> Result<JobState, AppError> {
    Ok(serde_json::from_str(text)?)
}

/// SQLite-backed store. Also keeps the job results of the queue.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens or creates the database at `path` and brings its schema up to date.
    pub async fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        log::info!("Opened database {:?} (WAL mode)", path);
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), AppError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn with_photos(&self, mut demand: Demand) -> Result<Demand, AppError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT photo_id FROM demand_photos WHERE demand_id = ? ORDER BY photo_id",
        )
        .bind(demand.id)
        .fetch_all(&self.pool)
        .await?;
        demand.photos = ids.into_iter().collect();
        Ok(demand)
    }

    async fn demands_from_rows(&self, rows: Vec<SqliteRow>) -> Result<Vec<Demand>, AppError> {
        let mut demands = Vec::with_capacity(rows.len());
        for row in &rows {
            demands.push(self.with_photos(demand_from_row(row)?).await?);
        }
        Ok(demands)
    }

    async fn directory_exists(&self, id: i64) -> Result<bool, AppError> {
        Ok(sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM directories WHERE id = ?)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_directory(&self, new: NewDirectory) -> Result<Directory, AppError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO directories (name, path, is_visible) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(&new.name)
        .bind(path_text(&new.path))
        .bind(new.is_visible)
        .fetch_one(&self.pool)
        .await?;
        log::debug!("Created directory {} ({:?})", id, new.path);
        Ok(Directory {
            id,
            name: new.name,
            path: new.path,
            is_visible: new.is_visible,
            indexing_task_id: None,
            total_photos: 0,
            last_indexing_date: None,
            generation: 0,
        })
    }

    async fn get_directory(&self, id: i64) -> Result<Option<Directory>, AppError> {
        let sql = format!("SELECT {} FROM directories WHERE id = ?", DIRECTORY_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(directory_from_row).transpose()
    }

    async fn find_directory_by_name(&self, name: &str) -> Result<Option<Directory>, AppError> {
        let sql = format!(
            "SELECT {} FROM directories WHERE name = ? ORDER BY id LIMIT 1",
            DIRECTORY_COLUMNS
        );
        let row = sqlx::query(&sql).bind(name).fetch_optional(&self.pool).await?;
        row.as_ref().map(directory_from_row).transpose()
    }

    async fn list_directories(&self) -> Result<Vec<Directory>, AppError> {
        let sql = format!("SELECT {} FROM directories ORDER BY id", DIRECTORY_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(directory_from_row).collect()
    }

    async fn update_directory(&self, directory: &Directory) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE directories SET name = ?, path = ?, is_visible = ?, indexing_task_id = ?, \
             total_photos = ?, last_indexing_date = ? WHERE id = ?",
        )
        .bind(&directory.name)
        .bind(path_text(&directory.path))
        .bind(directory.is_visible)
        .bind(directory.indexing_task_id.map(|id| id.to_string()))
        .bind(directory.total_photos as i64)
        .bind(directory.last_indexing_date.map(|at| at.timestamp_millis()))
        .bind(directory.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("directory {}", directory.id)));
        }
        Ok(())
    }

    async fn begin_generation(&self, directory_id: i64) -> Result<(Directory, usize), AppError> {
        let mut tx = self.pool.begin().await?;
        // the write comes first so the transaction holds the write lock throughout
        let sql = format!(
            "UPDATE directories SET generation = generation + 1 WHERE id = ? RETURNING {}",
            DIRECTORY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(directory_id)
            .fetch_optional(&mut *tx)
            .await?;
        let directory = match row {
            Some(row) => directory_from_row(&row)?,
            None => return Err(AppError::NotFound(format!("directory {}", directory_id))),
        };
        let removed = sqlx::query("DELETE FROM photos WHERE directory_id = ?")
            .bind(directory_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok((directory, removed as usize))
    }

    async fn record_index_run(
        &self,
        directory_id: i64,
        generation: u64,
        total_photos: usize,
        indexing_task_id: GroupId,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE directories SET total_photos = ?, indexing_task_id = ?, last_indexing_date = ? \
             WHERE id = ? AND generation = ?",
        )
        .bind(total_photos as i64)
        .bind(indexing_task_id.to_string())
        .bind(at.timestamp_millis())
        .bind(directory_id)
        .bind(generation as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.directory_exists(directory_id).await? {
            return Err(AppError::NotFound(format!("directory {}", directory_id)));
        }
        Ok(false)
    }

    async fn create_photo(&self, new: NewPhoto) -> Result<Option<Photo>, AppError> {
        let encodings = serde_json::to_string(&new.face_encodings)?;
        let id: Option<i64> = sqlx::query_scalar(
            "INSERT INTO photos (directory_id, path, face_encodings, generation) \
             SELECT ?1, ?2, ?3, ?4 \
             WHERE EXISTS (SELECT 1 FROM directories WHERE id = ?1 AND generation = ?4) \
             ON CONFLICT (directory_id, path, generation) \
             DO UPDATE SET face_encodings = excluded.face_encodings \
             RETURNING id",
        )
        .bind(new.directory_id)
        .bind(path_text(&new.path))
        .bind(&encodings)
        .bind(new.generation as i64)
        .fetch_optional(&self.pool)
        .await?;

        match id {
            Some(id) => Ok(Some(Photo {
                id,
                directory_id: new.directory_id,
                path: new.path,
                face_encodings: new.face_encodings,
                generation: new.generation,
            })),
            None if !self.directory_exists(new.directory_id).await? => {
                Err(AppError::NotFound(format!("directory {}", new.directory_id)))
            }
            None => {
                log::debug!(
                    "Dropping photo {:?}: generation {} superseded",
                    new.path, new.generation
                );
                Ok(None)
            }
        }
    }

    async fn get_photo(&self, id: i64) -> Result<Option<Photo>, AppError> {
        let sql = format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(photo_from_row).transpose()
    }

    async fn get_photos(&self, ids: &[i64]) -> Result<Vec<Photo>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM photos WHERE id IN (", PHOTO_COLUMNS));
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let rows = query.build().fetch_all(&self.pool).await?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let photo = photo_from_row(row)?;
            by_id.insert(photo.id, photo);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn photo_ids_for_directory(&self, directory_id: i64) -> Result<Vec<i64>, AppError> {
        Ok(sqlx::query_scalar(
            "SELECT p.id FROM photos p JOIN directories d ON d.id = p.directory_id \
             WHERE p.directory_id = ? AND p.generation = d.generation ORDER BY p.id",
        )
        .bind(directory_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn count_photos(&self, directory_id: i64) -> Result<usize, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM photos p JOIN directories d ON d.id = p.directory_id \
             WHERE p.directory_id = ? AND p.generation = d.generation",
        )
        .bind(directory_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn create_demand(&self, new: NewDemand) -> Result<Demand, AppError> {
        let date = Utc::now();
        let token = Uuid::new_v4();
        let status = ProcessingStatus::NotProcessed;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO demands (directory_id, name, first_name, email, upload, date, \
             processing_status, request_token) VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(new.directory_id)
        .bind(&new.name)
        .bind(&new.first_name)
        .bind(&new.email)
        .bind(new.upload.as_deref().map(path_text))
        .bind(date.timestamp_millis())
        .bind(status.to_string())
        .bind(token.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(Demand {
            id,
            directory_id: new.directory_id,
            name: new.name,
            first_name: new.first_name,
            email: new.email,
            upload: new.upload,
            date: from_millis(date.timestamp_millis())?,
            processing_status: status,
            face_encoding: None,
            photos: BTreeSet::new(),
            search_task_id: None,
            request_token: token,
        })
    }

    async fn get_demand(&self, id: i64) -> Result<Option<Demand>, AppError> {
        let sql = format!("SELECT {} FROM demands WHERE id = ?", DEMAND_COLUMNS);
        match sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(self.with_photos(demand_from_row(&row)?).await?)),
            None => Ok(None),
        }
    }

    async fn get_demand_by_token(&self, token: Uuid) -> Result<Option<Demand>, AppError> {
        let sql = format!("SELECT {} FROM demands WHERE request_token = ?", DEMAND_COLUMNS);
        match sqlx::query(&sql)
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?
        {
            Some(row) => Ok(Some(self.with_photos(demand_from_row(&row)?).await?)),
            None => Ok(None),
        }
    }

    async fn update_demand(&self, demand: &Demand) -> Result<(), AppError> {
        let encoding = demand
            .face_encoding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "UPDATE demands SET directory_id = ?, name = ?, first_name = ?, email = ?, upload = ?, \
             date = ?, processing_status = ?, face_encoding = ?, search_task_id = ?, \
             request_token = ? WHERE id = ?",
        )
        .bind(demand.directory_id)
        .bind(&demand.name)
        .bind(&demand.first_name)
        .bind(&demand.email)
        .bind(demand.upload.as_deref().map(path_text))
        .bind(demand.date.timestamp_millis())
        .bind(demand.processing_status.to_string())
        .bind(encoding)
        .bind(demand.search_task_id.map(|id| id.to_string()))
        .bind(demand.request_token.to_string())
        .bind(demand.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("demand {}", demand.id)));
        }
        Ok(())
    }

    async fn delete_demand(&self, id: i64) -> Result<Option<Demand>, AppError> {
        let sql = format!("DELETE FROM demands WHERE id = ? RETURNING {}", DEMAND_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        // links went with the row
        row.as_ref().map(demand_from_row).transpose()
    }

    async fn recent_demand_exists(
        &self,
        directory_id: i64,
        name: &str,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM demands WHERE directory_id = ? AND date >= ? \
             AND (name = ? OR email = ?))",
        )
        .bind(directory_id)
        .bind(since.timestamp_millis())
        .bind(name)
        .bind(email)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn waiting_demands(
        &self,
        directory_id: Option<i64>,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Demand>, AppError> {
        let sql = format!(
            "SELECT {} FROM demands WHERE processing_status = ?1 AND face_encoding IS NOT NULL \
             AND (?2 IS NULL OR directory_id = ?2) AND (?3 IS NULL OR date <= ?3) ORDER BY id",
            DEMAND_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(ProcessingStatus::WaitingForSearch.to_string())
            .bind(directory_id)
            .bind(older_than.map(|at| at.timestamp_millis()))
            .fetch_all(&self.pool)
            .await?;
        self.demands_from_rows(rows).await
    }

    async fn claim_waiting(
        &self,
        directory_id: i64,
        search_task_id: GroupId,
    ) -> Result<Vec<Demand>, AppError> {
        let sql = format!(
            "UPDATE demands SET processing_status = ?1, search_task_id = ?2 \
             WHERE directory_id = ?3 AND processing_status = ?4 AND face_encoding IS NOT NULL \
             RETURNING {}",
            DEMAND_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(ProcessingStatus::Processing.to_string())
            .bind(search_task_id.to_string())
            .bind(directory_id)
            .bind(ProcessingStatus::WaitingForSearch.to_string())
            .fetch_all(&self.pool)
            .await?;
        let mut demands = self.demands_from_rows(rows).await?;
        demands.sort_by_key(|d| d.id);
        Ok(demands)
    }

    async fn release_claims(&self) -> Result<usize, AppError> {
        let result = sqlx::query(
            "UPDATE demands SET processing_status = ?, search_task_id = NULL \
             WHERE processing_status = ?",
        )
        .bind(ProcessingStatus::WaitingForSearch.to_string())
        .bind(ProcessingStatus::Processing.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn add_match(&self, demand_id: i64, photo_id: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO demand_photos (demand_id, photo_id) SELECT ?1, ?2 \
             WHERE EXISTS (SELECT 1 FROM demands WHERE id = ?1) \
             AND EXISTS (SELECT 1 FROM photos WHERE id = ?2)",
        )
        .bind(demand_id)
        .bind(photo_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let photo_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM photos WHERE id = ?)")
            .bind(photo_id)
            .fetch_one(&self.pool)
            .await?;
        if !photo_exists {
            return Err(AppError::NotFound(format!("photo {}", photo_id)));
        }
        let demand_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM demands WHERE id = ?)")
            .bind(demand_id)
            .fetch_one(&self.pool)
            .await?;
        if !demand_exists {
            return Err(AppError::NotFound(format!("demand {}", demand_id)));
        }
        Ok(false)
    }
}

#[async_trait]
impl ResultArchive for SqliteStore {
    async fn create_group(&self, group_id: GroupId, children: &[JobId]) -> Result<(), AppError> {
        let pending = serde_json::to_string(&JobState::Pending)?;
        let group = group_id.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO job_groups (id, expected_count) VALUES (?, ?)")
            .bind(&group)
            .bind(children.len() as i64)
            .execute(&mut *tx)
            .await?;
        for (position, job_id) in children.iter().enumerate() {
            sqlx::query(
                "INSERT INTO job_results (job_id, group_id, position, state) VALUES (?, ?, ?, ?)",
            )
            .bind(job_id.to_string())
            .bind(&group)
            .bind(position as i64)
            .bind(&pending)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_state(
        &self,
        group_id: Option<GroupId>,
        job_id: JobId,
        state: &JobState,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO job_results (job_id, group_id, state, terminal, expires_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (job_id) DO UPDATE SET state = excluded.state, \
             terminal = excluded.terminal, expires_at = excluded.expires_at",
        )
        .bind(job_id.to_string())
        .bind(group_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(state)?)
        .bind(state.is_terminal())
        .bind(expires_at.map(|at| at.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_group(&self, group_id: GroupId, expires_at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE job_groups SET expires_at = ? WHERE id = ?")
            .bind(expires_at.timestamp_millis())
            .bind(group_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_group(
        &self,
        group_id: GroupId,
    ) -> Result<Option<(GroupResult, Option<DateTime<Utc>>)>, AppError> {
        let row = sqlx::query("SELECT expected_count, expires_at FROM job_groups WHERE id = ?")
            .bind(group_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let expected_count: i64 = row.try_get("expected_count")?;
        let expires_at: Option<i64> = row.try_get("expires_at")?;

        let rows = sqlx::query(
            "SELECT job_id, state FROM job_results WHERE group_id = ? ORDER BY position",
        )
        .bind(group_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut children = Vec::with_capacity(rows.len());
        for row in &rows {
            children.push(ChildStatus {
                job_id: parse_uuid(&row.try_get::<String, _>("job_id")?)?,
                state: state_from_text(&row.try_get::<String, _>("state")?)?,
            });
        }

        let group = GroupResult {
            id: group_id,
            expected_count: expected_count as usize,
            children,
        };
        Ok(Some((group, expires_at.map(from_millis).transpose()?)))
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<(JobState, Option<DateTime<Utc>>)>, AppError> {
        let row = sqlx::query(
            "SELECT state, expires_at FROM job_results WHERE job_id = ? AND group_id IS NULL",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let state = state_from_text(&row.try_get::<String, _>("state")?)?;
                let expires_at: Option<i64> = row.try_get("expires_at")?;
                Ok(Some((state, expires_at.map(from_millis).transpose()?)))
            }
            None => Ok(None),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let now = now.timestamp_millis();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM job_results WHERE group_id IN \
             (SELECT id FROM job_groups WHERE expires_at IS NOT NULL AND expires_at <= ?)",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let groups = sqlx::query("DELETE FROM job_groups WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let jobs = sqlx::query(
            "DELETE FROM job_results WHERE group_id IS NULL \
             AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok((groups + jobs) as usize)
    }

    async fn abandon_unfinished(&self, expires_at: DateTime<Utc>) -> Result<usize, AppError> {
        let failed = serde_json::to_string(&JobState::Failure("Interrupted by a restart".into()))?;
        let expires_at = expires_at.timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let abandoned = sqlx::query(
            "UPDATE job_results SET state = ?, terminal = 1, \
             expires_at = CASE WHEN group_id IS NULL THEN ? ELSE expires_at END \
             WHERE terminal = 0",
        )
        .bind(&failed)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("UPDATE job_groups SET expires_at = ? WHERE expires_at IS NULL")
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if abandoned > 0 {
            log::warn!("{} jobs were interrupted by a restart and marked failed", abandoned);
        }
        Ok(abandoned as usize)
    }
}
