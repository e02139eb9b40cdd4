//! Metadata collaborator: repository and image records, and the contract
//! the transfer engine commits through. The hub owns blobs and sessions;
//! this collaborator owns the permanent rows.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::api::models::{ImageInfo, OsInfo, RepositoryInfo};
use crate::name::{is_default_tag, ImageRef};

#[derive(Debug, Clone)]
pub struct Repository {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub private: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Image {
    pub id: i64,
    pub repo_id: i64,
    pub tag: String,
    pub labels: HashMap<String, String>,
    pub size: u64,
    pub digest: String,
    pub format: String,
    pub os: OsInfo,
    pub snapshot: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn fullname(&self) -> String {
        format!("{}/{}", self.username, self.name)
    }
}

impl Image {
    pub fn reference(&self, repo: &Repository) -> ImageRef {
        ImageRef::new(&repo.username, &repo.name, &self.tag)
    }

    pub fn info(&self, repo: &Repository) -> ImageInfo {
        ImageInfo {
            id: self.id,
            repo_id: self.repo_id,
            username: repo.username.clone(),
            name: repo.name.clone(),
            tag: self.tag.clone(),
            format: self.format.clone(),
            os: self.os.clone(),
            private: repo.private,
            size: self.size,
            digest: self.digest.clone(),
            snapshot: self.snapshot.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub fn repository_info(repo: &Repository) -> RepositoryInfo {
    RepositoryInfo {
        id: repo.id,
        username: repo.username.clone(),
        name: repo.name.clone(),
        private: repo.private,
        created_at: repo.created_at,
        updated_at: repo.updated_at,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub username: String,
    pub keyword: String,
    pub page: usize,
    pub page_size: usize,
    /// Whether private repositories of `username` may be included.
    pub include_private: bool,
}

/// The upsert input: what the transfer engine knows at commit time.
#[derive(Debug, Clone)]
pub struct ImageUpsert {
    pub username: String,
    pub name: String,
    pub private: bool,
    pub tag: String,
    pub labels: HashMap<String, String>,
    pub size: u64,
    pub digest: String,
    pub format: String,
    pub os: OsInfo,
    pub description: String,
}

#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn get_repo(&self, username: &str, name: &str) -> Result<Option<Repository>>;

    /// An empty or `latest` tag resolves to the most recently created image
    /// of the repository.
    async fn get_image(&self, repo: &Repository, tag: &str) -> Result<Option<Image>>;

    async fn repo_images(&self, repo_id: i64) -> Result<Vec<Image>>;

    async fn list_images(&self, filter: &ImageFilter) -> Result<(Vec<(Repository, Image)>, usize)>;

    async fn list_repositories(
        &self,
        username: &str,
        include_private: bool,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<Repository>>;

    /// Upserts the repository row and the image row keyed by
    /// `(repo_id, tag)` in one transaction.
    async fn upsert(&self, record: &ImageUpsert) -> Result<(Repository, Image)>;

    async fn delete_image(&self, repo_id: i64, tag: &str) -> Result<()>;

    /// Deletes the repository and, by cascade, all of its images.
    async fn delete_repository(&self, repo_id: i64) -> Result<()>;
}

#[derive(Default)]
struct MemoryTables {
    repos: Vec<Repository>,
    images: Vec<Image>,
}

/// Reference collaborator used by tests and single-node deployments.
pub struct MemoryMetadataStore {
    tables: RwLock<MemoryTables>,
    next_repo_id: AtomicI64,
    next_image_id: AtomicI64,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(MemoryTables::default()),
            next_repo_id: AtomicI64::new(1),
            next_image_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn newest<'a>(images: impl Iterator<Item = &'a Image>) -> Option<&'a Image> {
    images.max_by_key(|img| (img.created_at, img.id))
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_repo(&self, username: &str, name: &str) -> Result<Option<Repository>> {
        let tables = self.tables.read().expect("metadata store poisoned");
        Ok(tables
            .repos
            .iter()
            .find(|repo| repo.username == username && repo.name == name)
            .cloned())
    }

    async fn get_image(&self, repo: &Repository, tag: &str) -> Result<Option<Image>> {
        let tables = self.tables.read().expect("metadata store poisoned");
        let of_repo = tables.images.iter().filter(|img| img.repo_id == repo.id);
        if is_default_tag(tag) {
            return Ok(newest(of_repo).cloned());
        }
        Ok(of_repo.filter(|img| img.tag == tag).next_back().cloned())
    }

    async fn repo_images(&self, repo_id: i64) -> Result<Vec<Image>> {
        let tables = self.tables.read().expect("metadata store poisoned");
        Ok(tables
            .images
            .iter()
            .filter(|img| img.repo_id == repo_id)
            .cloned()
            .collect())
    }

    async fn list_images(&self, filter: &ImageFilter) -> Result<(Vec<(Repository, Image)>, usize)> {
        let tables = self.tables.read().expect("metadata store poisoned");
        let mut matches: Vec<(Repository, Image)> = tables
            .images
            .iter()
            .filter_map(|img| {
                let repo = tables.repos.iter().find(|repo| repo.id == img.repo_id)?;
                if !filter.username.is_empty() && repo.username != filter.username {
                    return None;
                }
                if repo.private && !filter.include_private {
                    return None;
                }
                if !filter.keyword.is_empty()
                    && !repo.name.contains(&filter.keyword)
                    && !img.tag.contains(&filter.keyword)
                {
                    return None;
                }
                Some((repo.clone(), img.clone()))
            })
            .collect();
        matches.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));

        let total = matches.len();
        let page = filter.page.max(1);
        let page_size = if filter.page_size == 0 { 10 } else { filter.page_size };
        let start = (page - 1) * page_size;
        let page_items = matches.into_iter().skip(start).take(page_size).collect();
        Ok((page_items, total))
    }

    async fn list_repositories(
        &self,
        username: &str,
        include_private: bool,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<Repository>> {
        let tables = self.tables.read().expect("metadata store poisoned");
        let mut matches: Vec<Repository> = tables
            .repos
            .iter()
            .filter(|repo| {
                (username.is_empty() || repo.username == username)
                    && (!repo.private || include_private)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let page = page.max(1);
        let page_size = if page_size == 0 { 10 } else { page_size };
        Ok(matches
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect())
    }

    async fn upsert(&self, record: &ImageUpsert) -> Result<(Repository, Image)> {
        let mut tables = self.tables.write().expect("metadata store poisoned");
        let now = Utc::now();

        let repo = match tables
            .repos
            .iter_mut()
            .find(|repo| repo.username == record.username && repo.name == record.name)
        {
            Some(repo) => {
                repo.updated_at = now;
                repo.clone()
            }
            None => {
                let repo = Repository {
                    id: self.next_repo_id.fetch_add(1, Ordering::SeqCst),
                    username: record.username.clone(),
                    name: record.name.clone(),
                    private: record.private,
                    created_at: now,
                    updated_at: now,
                };
                tables.repos.push(repo.clone());
                repo
            }
        };

        let image = match tables
            .images
            .iter_mut()
            .find(|img| img.repo_id == repo.id && img.tag == record.tag)
        {
            Some(img) => {
                img.labels = record.labels.clone();
                img.size = record.size;
                img.digest = record.digest.clone();
                img.format = record.format.clone();
                img.os = record.os.clone();
                img.description = record.description.clone();
                img.updated_at = now;
                img.clone()
            }
            None => {
                let img = Image {
                    id: self.next_image_id.fetch_add(1, Ordering::SeqCst),
                    repo_id: repo.id,
                    tag: record.tag.clone(),
                    labels: record.labels.clone(),
                    size: record.size,
                    digest: record.digest.clone(),
                    format: record.format.clone(),
                    os: record.os.clone(),
                    snapshot: String::new(),
                    description: record.description.clone(),
                    created_at: now,
                    updated_at: now,
                };
                tables.images.push(img.clone());
                img
            }
        };

        Ok((repo, image))
    }

    async fn delete_image(&self, repo_id: i64, tag: &str) -> Result<()> {
        let mut tables = self.tables.write().expect("metadata store poisoned");
        tables
            .images
            .retain(|img| !(img.repo_id == repo_id && img.tag == tag));
        Ok(())
    }

    async fn delete_repository(&self, repo_id: i64) -> Result<()> {
        let mut tables = self.tables.write().expect("metadata store poisoned");
        tables.images.retain(|img| img.repo_id != repo_id);
        tables.repos.retain(|repo| repo.id != repo_id);
        Ok(())
    }
}

const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

/// Read-through cache in front of the collaborator: repo and image lookups
/// are the hot path of every download, so they are held for ten minutes and
/// dropped on any mutation of the repository.
pub struct CachedMetadataStore {
    inner: Arc<dyn MetadataStore>,
    repos: Mutex<HashMap<String, CacheEntry<Option<Repository>>>>,
    images: Mutex<HashMap<String, CacheEntry<Option<Image>>>>,
    ttl: Duration,
}

impl CachedMetadataStore {
    pub fn new(inner: Arc<dyn MetadataStore>) -> Self {
        Self::with_ttl(inner, CACHE_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn MetadataStore>, ttl: Duration) -> Self {
        Self {
            inner,
            repos: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn repo_key(username: &str, name: &str) -> String {
        format!("{username}/{name}")
    }

    fn image_key(repo_id: i64, tag: &str) -> String {
        format!("{repo_id}:{tag}")
    }

    fn invalidate_repo(&self, username: &str, name: &str, repo_id: Option<i64>) {
        self.repos
            .lock()
            .expect("cache poisoned")
            .remove(&Self::repo_key(username, name));
        let mut images = self.images.lock().expect("cache poisoned");
        match repo_id {
            Some(id) => {
                let prefix = format!("{id}:");
                images.retain(|key, _| !key.starts_with(&prefix));
            }
            None => images.clear(),
        }
    }
}

#[async_trait]
impl MetadataStore for CachedMetadataStore {
    async fn get_repo(&self, username: &str, name: &str) -> Result<Option<Repository>> {
        let key = Self::repo_key(username, name);
        {
            let repos = self.repos.lock().expect("cache poisoned");
            if let Some(entry) = repos.get(&key) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.value.clone());
                }
            }
        }
        let value = self.inner.get_repo(username, name).await?;
        self.repos.lock().expect("cache poisoned").insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(value)
    }

    async fn get_image(&self, repo: &Repository, tag: &str) -> Result<Option<Image>> {
        // "latest" floats to the newest row, so only exact tags are cached.
        if is_default_tag(tag) {
            return self.inner.get_image(repo, tag).await;
        }
        let key = Self::image_key(repo.id, tag);
        {
            let images = self.images.lock().expect("cache poisoned");
            if let Some(entry) = images.get(&key) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.value.clone());
                }
            }
        }
        let value = self.inner.get_image(repo, tag).await?;
        self.images.lock().expect("cache poisoned").insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(value)
    }

    async fn repo_images(&self, repo_id: i64) -> Result<Vec<Image>> {
        self.inner.repo_images(repo_id).await
    }

    async fn list_images(&self, filter: &ImageFilter) -> Result<(Vec<(Repository, Image)>, usize)> {
        self.inner.list_images(filter).await
    }

    async fn list_repositories(
        &self,
        username: &str,
        include_private: bool,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<Repository>> {
        self.inner
            .list_repositories(username, include_private, page, page_size)
            .await
    }

    async fn upsert(&self, record: &ImageUpsert) -> Result<(Repository, Image)> {
        let result = self.inner.upsert(record).await?;
        self.invalidate_repo(&record.username, &record.name, Some(result.0.id));
        Ok(result)
    }

    async fn delete_image(&self, repo_id: i64, tag: &str) -> Result<()> {
        self.inner.delete_image(repo_id, tag).await?;
        self.images
            .lock()
            .expect("cache poisoned")
            .remove(&Self::image_key(repo_id, tag));
        Ok(())
    }

    async fn delete_repository(&self, repo_id: i64) -> Result<()> {
        self.inner.delete_repository(repo_id).await?;
        // Repo rows are keyed by name here; without it, drop everything.
        self.repos.lock().expect("cache poisoned").clear();
        let prefix = format!("{repo_id}:");
        self.images
            .lock()
            .expect("cache poisoned")
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert_record(user: &str, name: &str, tag: &str, digest: &str) -> ImageUpsert {
        ImageUpsert {
            username: user.into(),
            name: name.into(),
            private: false,
            tag: tag.into(),
            labels: HashMap::new(),
            size: 100,
            digest: digest.into(),
            format: "qcow2".into(),
            os: OsInfo::default(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let store = MemoryMetadataStore::new();
        let (repo, img) = store.upsert(&upsert_record("alice", "x", "v1", "d1")).await.unwrap();
        assert_eq!(img.digest, "d1");

        let (repo2, img2) = store.upsert(&upsert_record("alice", "x", "v1", "d2")).await.unwrap();
        assert_eq!(repo2.id, repo.id);
        assert_eq!(img2.id, img.id);
        assert_eq!(img2.digest, "d2");

        let images = store.repo_images(repo.id).await.unwrap();
        assert_eq!(images.len(), 1);
    }

    #[tokio::test]
    async fn latest_resolves_to_most_recent() {
        let store = MemoryMetadataStore::new();
        store.upsert(&upsert_record("alice", "x", "aaaa", "d1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.upsert(&upsert_record("alice", "x", "bbbb", "d2")).await.unwrap();

        let repo = store.get_repo("alice", "x").await.unwrap().unwrap();
        let latest = store.get_image(&repo, "latest").await.unwrap().unwrap();
        assert_eq!(latest.tag, "bbbb");

        // empty tag behaves identically
        let empty = store.get_image(&repo, "").await.unwrap().unwrap();
        assert_eq!(empty.tag, "bbbb");

        let exact = store.get_image(&repo, "aaaa").await.unwrap().unwrap();
        assert_eq!(exact.digest, "d1");
    }

    #[tokio::test]
    async fn delete_repository_cascades() {
        let store = MemoryMetadataStore::new();
        let (repo, _) = store.upsert(&upsert_record("alice", "x", "v1", "d1")).await.unwrap();
        store.upsert(&upsert_record("alice", "x", "v2", "d2")).await.unwrap();

        store.delete_repository(repo.id).await.unwrap();
        assert!(store.get_repo("alice", "x").await.unwrap().is_none());
        assert!(store.repo_images(repo.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_images_filters_private_and_paginates() {
        let store = MemoryMetadataStore::new();
        let mut private = upsert_record("alice", "secret", "v1", "d1");
        private.private = true;
        store.upsert(&private).await.unwrap();
        store.upsert(&upsert_record("alice", "pub", "v1", "d2")).await.unwrap();

        let (visible, total) = store
            .list_images(&ImageFilter {
                username: "alice".into(),
                page: 1,
                page_size: 10,
                include_private: false,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(visible[0].0.name, "pub");

        let (all, total) = store
            .list_images(&ImageFilter {
                username: "alice".into(),
                page: 1,
                page_size: 10,
                include_private: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn cache_serves_hits_and_invalidates_on_upsert() {
        let inner = Arc::new(MemoryMetadataStore::new());
        let cached = CachedMetadataStore::new(inner.clone());

        cached.upsert(&upsert_record("alice", "x", "v1", "d1")).await.unwrap();
        let repo = cached.get_repo("alice", "x").await.unwrap().unwrap();
        let img = cached.get_image(&repo, "v1").await.unwrap().unwrap();
        assert_eq!(img.digest, "d1");

        // mutate through the cache; the stale row must not survive
        cached.upsert(&upsert_record("alice", "x", "v1", "d2")).await.unwrap();
        let img = cached.get_image(&repo, "v1").await.unwrap().unwrap();
        assert_eq!(img.digest, "d2");
    }
}
