use super::Store;
use crate::error::AppError;
use crate::jobs::GroupId;
use crate::models::{
    Demand, Directory, NewDemand, NewDirectory, NewPhoto, Photo, ProcessingStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    next_id: i64,
    directories: BTreeMap<i64, Directory>,
    photos: BTreeMap<i64, Photo>,
    demands: BTreeMap<i64, Demand>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_current(&self, photo: &Photo) -> bool {
        self.directories
            .get(&photo.directory_id)
            .map_or(false, |d| d.generation == photo.generation)
    }
}

/// In-process store used by the unit tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, AppError> {
        Ok(self.tables.read()?)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, AppError> {
        Ok(self.tables.write()?)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_directory(&self, new: NewDirectory) -> Result<Directory, AppError> {
        let mut tables = self.write()?;
        let directory = Directory {
            id: tables.allocate_id(),
            name: new.name,
            path: new.path,
            is_visible: new.is_visible,
            indexing_task_id: None,
            total_photos: 0,
            last_indexing_date: None,
            generation: 0,
        };
        tables.directories.insert(directory.id, directory.clone());
        log::debug!("Created directory {} ({:?})", directory.id, directory.path);
        Ok(directory)
    }

    async fn get_directory(&self, id: i64) -> Result<Option<Directory>, AppError> {
        Ok(self.read()?.directories.get(&id).cloned())
    }

    async fn find_directory_by_name(&self, name: &str) -> Result<Option<Directory>, AppError> {
        Ok(self
            .read()?
            .directories
            .values()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn list_directories(&self) -> Result<Vec<Directory>, AppError> {
        Ok(self.read()?.directories.values().cloned().collect())
    }

    async fn update_directory(&self, directory: &Directory) -> Result<(), AppError> {
        let mut tables = self.write()?;
        match tables.directories.get_mut(&directory.id) {
            Some(row) => {
                let generation = row.generation;
                *row = directory.clone();
                row.generation = generation;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("directory {}", directory.id))),
        }
    }

    async fn begin_generation(&self, directory_id: i64) -> Result<(Directory, usize), AppError> {
        let mut tables = self.write()?;
        let directory = match tables.directories.get_mut(&directory_id) {
            Some(directory) => {
                directory.generation += 1;
                directory.clone()
            }
            None => return Err(AppError::NotFound(format!("directory {}", directory_id))),
        };
        let removed: BTreeSet<i64> = tables
            .photos
            .values()
            .filter(|p| p.directory_id == directory_id)
            .map(|p| p.id)
            .collect();
        tables.photos.retain(|id, _| !removed.contains(id));
        for demand in tables.demands.values_mut() {
            demand.photos.retain(|id| !removed.contains(id));
        }
        Ok((directory, removed.len()))
    }

    async fn record_index_run(
        &self,
        directory_id: i64,
        generation: u64,
        total_photos: usize,
        indexing_task_id: GroupId,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut tables = self.write()?;
        match tables.directories.get_mut(&directory_id) {
            Some(directory) if directory.generation == generation => {
                directory.total_photos = total_photos;
                directory.indexing_task_id = Some(indexing_task_id);
                directory.last_indexing_date = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!("directory {}", directory_id))),
        }
    }

    async fn create_photo(&self, new: NewPhoto) -> Result<Option<Photo>, AppError> {
        let mut tables = self.write()?;
        let current = match tables.directories.get(&new.directory_id) {
            Some(directory) => directory.generation,
            None => return Err(AppError::NotFound(format!("directory {}", new.directory_id))),
        };
        if current != new.generation {
            log::debug!(
                "Dropping photo {:?}: generation {} superseded by {}",
                new.path, new.generation, current
            );
            return Ok(None);
        }

        let existing = tables
            .photos
            .values()
            .find(|p| {
                p.directory_id == new.directory_id
                    && p.generation == new.generation
                    && p.path == new.path
            })
            .map(|p| p.id);
        if let Some(id) = existing {
            if let Some(photo) = tables.photos.get_mut(&id) {
                photo.face_encodings = new.face_encodings;
                return Ok(Some(photo.clone()));
            }
        }

        let photo = Photo {
            id: tables.allocate_id(),
            directory_id: new.directory_id,
            path: new.path,
            face_encodings: new.face_encodings,
            generation: new.generation,
        };
        tables.photos.insert(photo.id, photo.clone());
        Ok(Some(photo))
    }

    async fn get_photo(&self, id: i64) -> Result<Option<Photo>, AppError> {
        Ok(self.read()?.photos.get(&id).cloned())
    }

    async fn get_photos(&self, ids: &[i64]) -> Result<Vec<Photo>, AppError> {
        let tables = self.read()?;
        Ok(ids.iter().filter_map(|id| tables.photos.get(id).cloned()).collect())
    }

    async fn photo_ids_for_directory(&self, directory_id: i64) -> Result<Vec<i64>, AppError> {
        let tables = self.read()?;
        Ok(tables
            .photos
            .values()
            .filter(|p| p.directory_id == directory_id && tables.is_current(p))
            .map(|p| p.id)
            .collect())
    }

    async fn count_photos(&self, directory_id: i64) -> Result<usize, AppError> {
        let tables = self.read()?;
        Ok(tables
            .photos
            .values()
            .filter(|p| p.directory_id == directory_id && tables.is_current(p))
            .count())
    }

    async fn create_demand(&self, new: NewDemand) -> Result<Demand, AppError> {
        let mut tables = self.write()?;
        let demand = Demand {
            id: tables.allocate_id(),
            directory_id: new.directory_id,
            name: new.name,
            first_name: new.first_name,
            email: new.email,
            upload: new.upload,
            date: Utc::now(),
            processing_status: ProcessingStatus::NotProcessed,
            face_encoding: None,
            photos: BTreeSet::new(),
            search_task_id: None,
            request_token: Uuid::new_v4(),
        };
        tables.demands.insert(demand.id, demand.clone());
        Ok(demand)
    }

    async fn get_demand(&self, id: i64) -> Result<Option<Demand>, AppError> {
        Ok(self.read()?.demands.get(&id).cloned())
    }

    async fn get_demand_by_token(&self, token: Uuid) -> Result<Option<Demand>, AppError> {
        Ok(self
            .read()?
            .demands
            .values()
            .find(|d| d.request_token == token)
            .cloned())
    }

    async fn update_demand(&self, demand: &Demand) -> Result<(), AppError> {
        let mut tables = self.write()?;
        match tables.demands.get_mut(&demand.id) {
            Some(row) => {
                let photos = std::mem::take(&mut row.photos);
                *row = demand.clone();
                row.photos = photos;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("demand {}", demand.id))),
        }
    }

    async fn delete_demand(&self, id: i64) -> Result<Option<Demand>, AppError> {
        Ok(self.write()?.demands.remove(&id))
    }

    async fn recent_demand_exists(
        &self,
        directory_id: i64,
        name: &str,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self.read()?.demands.values().any(|d| {
            d.directory_id == directory_id
                && d.date >= since
                && (d.name == name || d.email == email)
        }))
    }

    async fn waiting_demands(
        &self,
        directory_id: Option<i64>,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Demand>, AppError> {
        Ok(self
            .read()?
            .demands
            .values()
            .filter(|d| d.processing_status == ProcessingStatus::WaitingForSearch)
            .filter(|d| d.face_encoding.is_some())
            .filter(|d| directory_id.map_or(true, |id| d.directory_id == id))
            .filter(|d| older_than.map_or(true, |limit| d.date <= limit))
            .cloned()
            .collect())
    }

    async fn claim_waiting(
        &self,
        directory_id: i64,
        search_task_id: GroupId,
    ) -> Result<Vec<Demand>, AppError> {
        let mut tables = self.write()?;
        let mut claimed = Vec::new();
        for demand in tables.demands.values_mut() {
            if demand.directory_id == directory_id
                && demand.processing_status == ProcessingStatus::WaitingForSearch
                && demand.face_encoding.is_some()
            {
                demand.processing_status = ProcessingStatus::Processing;
                demand.search_task_id = Some(search_task_id);
                claimed.push(demand.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_claims(&self) -> Result<usize, AppError> {
        let mut tables = self.write()?;
        let mut released = 0;
        for demand in tables.demands.values_mut() {
            if demand.processing_status == ProcessingStatus::Processing {
                demand.processing_status = ProcessingStatus::WaitingForSearch;
                demand.search_task_id = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn add_match(&self, demand_id: i64, photo_id: i64) -> Result<bool, AppError> {
        let mut tables = self.write()?;
        if !tables.photos.contains_key(&photo_id) {
            return Err(AppError::NotFound(format!("photo {}", photo_id)));
        }
        match tables.demands.get_mut(&demand_id) {
            Some(demand) => Ok(demand.photos.insert(photo_id)),
            None => Err(AppError::NotFound(format!("demand {}", demand_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn directory(store: &MemoryStore) -> Directory {
        store
            .create_directory(NewDirectory {
                name: "gala".into(),
                path: PathBuf::from("/photos/gala"),
                is_visible: true,
            })
            .await
            .unwrap()
    }

    async fn waiting_demand(store: &MemoryStore, directory_id: i64, name: &str) -> Demand {
        let mut demand = store
            .create_demand(NewDemand {
                directory_id,
                name: name.into(),
                first_name: "Ana".into(),
                email: format!("{}@example.org", name),
                upload: None,
            })
            .await
            .unwrap();
        demand.processing_status = ProcessingStatus::WaitingForSearch;
        demand.face_encoding = Some(vec![0.1, 0.2]);
        store.update_demand(&demand).await.unwrap();
        demand
    }

    fn new_photo(directory: &Directory, path: &str) -> NewPhoto {
        NewPhoto {
            directory_id: directory.id,
            generation: directory.generation,
            path: PathBuf::from(path),
            face_encodings: vec![],
        }
    }

    #[tokio::test]
    async fn claim_takes_each_waiting_demand_once() {
        let store = MemoryStore::new();
        let dir = directory(&store).await;
        let a = waiting_demand(&store, dir.id, "a").await;
        let mut b = waiting_demand(&store, dir.id, "b").await;
        b.processing_status = ProcessingStatus::Processed;
        store.update_demand(&b).await.unwrap();

        let group = Uuid::new_v4();
        let claimed = store.claim_waiting(dir.id, group).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, a.id);
        assert_eq!(claimed[0].processing_status, ProcessingStatus::Processing);
        assert!(store.claim_waiting(dir.id, Uuid::new_v4()).await.unwrap().is_empty());

        let a = store.get_demand(a.id).await.unwrap().unwrap();
        assert_eq!(a.search_task_id, Some(group));
        let b = store.get_demand(b.id).await.unwrap().unwrap();
        assert_eq!(b.processing_status, ProcessingStatus::Processed);
    }

    #[tokio::test]
    async fn add_match_is_idempotent_and_survives_demand_updates() {
        let store = MemoryStore::new();
        let dir = directory(&store).await;
        let demand = waiting_demand(&store, dir.id, "a").await;
        let photo = store.create_photo(new_photo(&dir, "/photos/gala/1.jpg")).await.unwrap().unwrap();

        assert!(store.add_match(demand.id, photo.id).await.unwrap());
        assert!(!store.add_match(demand.id, photo.id).await.unwrap());

        // a stale copy written back must not wipe the link
        store.update_demand(&demand).await.unwrap();
        let reloaded = store.get_demand(demand.id).await.unwrap().unwrap();
        assert_eq!(reloaded.photos.len(), 1);

        let err = store.add_match(9999, photo.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_photo_drops_stale_generations_and_dedupes_paths() {
        let store = MemoryStore::new();
        let dir = directory(&store).await;
        let stale = new_photo(&dir, "/photos/gala/1.jpg");
        let (dir, _) = store.begin_generation(dir.id).await.unwrap();
        let mut renamed = dir.clone();
        renamed.generation = 0;
        renamed.name = "gala 2024".into();
        store.update_directory(&renamed).await.unwrap();
        let stored = store.get_directory(dir.id).await.unwrap().unwrap();
        assert_eq!(stored.generation, dir.generation);
        assert_eq!(stored.name, "gala 2024");

        assert!(store.create_photo(stale).await.unwrap().is_none());

        let first = store.create_photo(new_photo(&dir, "/photos/gala/1.jpg")).await.unwrap().unwrap();
        let again = store.create_photo(new_photo(&dir, "/photos/gala/1.jpg")).await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(store.count_photos(dir.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn new_generation_clears_photos_and_refuses_old_writes() {
        let store = MemoryStore::new();
        let dir = directory(&store).await;
        let demand = waiting_demand(&store, dir.id, "a").await;
        let photo = store.create_photo(new_photo(&dir, "/photos/gala/1.jpg")).await.unwrap().unwrap();
        store.add_match(demand.id, photo.id).await.unwrap();

        let (current, removed) = store.begin_generation(dir.id).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(current.generation, dir.generation + 1);
        let demand = store.get_demand(demand.id).await.unwrap().unwrap();
        assert!(demand.photos.is_empty());

        // an encode job of the previous run landing late
        assert!(store.create_photo(new_photo(&dir, "/photos/gala/1.jpg")).await.unwrap().is_none());
        assert_eq!(store.count_photos(dir.id).await.unwrap(), 0);
        assert!(store.photo_ids_for_directory(dir.id).await.unwrap().is_empty());

        let run = Uuid::new_v4();
        assert!(!store.record_index_run(dir.id, dir.generation, 5, run, Utc::now()).await.unwrap());
        assert!(store.record_index_run(dir.id, current.generation, 5, run, Utc::now()).await.unwrap());
        let stored = store.get_directory(dir.id).await.unwrap().unwrap();
        assert_eq!(stored.total_photos, 5);
        assert_eq!(stored.indexing_task_id, Some(run));
    }

    #[tokio::test]
    async fn waiting_demands_filters_by_directory_and_age() {
        let store = MemoryStore::new();
        let dir = directory(&store).await;
        let other = directory(&store).await;
        let mut old = waiting_demand(&store, dir.id, "old").await;
        old.date = Utc::now() - chrono::Duration::hours(2);
        store.update_demand(&old).await.unwrap();
        waiting_demand(&store, dir.id, "fresh").await;
        waiting_demand(&store, other.id, "elsewhere").await;

        assert_eq!(store.waiting_demands(Some(dir.id), None).await.unwrap().len(), 2);
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let aged = store.waiting_demands(None, Some(cutoff)).await.unwrap();
        assert_eq!(aged.len(), 1);
        assert_eq!(aged[0].id, old.id);
    }
}
