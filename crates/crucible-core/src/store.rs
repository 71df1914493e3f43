use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::RwLock;

use crucible_types::{JobRecord, Role, Task};

/// A persisted record addressable by a string id.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn record_id(&self) -> &str;
}

impl Record for Task {
    const KIND: &'static str = "task";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Role {
    const KIND: &'static str = "role";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for JobRecord {
    const KIND: &'static str = "job";

    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Key-value persistence collaborator. Lookups and writes by id only.
#[async_trait]
pub trait Repository<T: Record>: Send + Sync {
    async fn find(&self, id: &str) -> anyhow::Result<Option<T>>;

    /// Fails if a record with the same id already exists.
    async fn create(&self, record: T) -> anyhow::Result<T>;

    /// Fails if no record with that id exists.
    async fn update(&self, record: T) -> anyhow::Result<T>;

    /// Create-or-update.
    async fn save(&self, record: T) -> anyhow::Result<T> {
        if self.find(record.record_id()).await?.is_some() {
            self.update(record).await
        } else {
            self.create(record).await
        }
    }
}

pub struct MemoryRepository<T: Record> {
    records: RwLock<HashMap<String, T>>,
}

impl<T: Record> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_records(records: impl IntoIterator<Item = T>) -> Self {
        Self {
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|r| (r.record_id().to_string(), r))
                    .collect(),
            ),
        }
    }

    pub async fn list(&self) -> Vec<T> {
        self.records.read().await.values().cloned().collect()
    }
}

impl<T: Record> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record> Repository<T> for MemoryRepository<T> {
    async fn find(&self, id: &str) -> anyhow::Result<Option<T>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn create(&self, record: T) -> anyhow::Result<T> {
        let mut records = self.records.write().await;
        insert_new(&mut records, record)
    }

    async fn update(&self, record: T) -> anyhow::Result<T> {
        let mut records = self.records.write().await;
        replace_existing(&mut records, record)
    }
}

/// All records of one kind kept in a single JSON object file
/// (`<dir>/<kind>s.json`), rewritten on every write.
pub struct JsonFileRepository<T: Record> {
    path: PathBuf,
    records: RwLock<HashMap<String, T>>,
}

impl<T: Record> JsonFileRepository<T> {
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}s.json", T::KIND));
        let records = if path.exists() {
            let raw = fs::read_to_string(&path).await?;
            serde_json::from_str::<HashMap<String, T>>(&raw).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "unreadable record file; starting empty");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, snapshot: &HashMap<String, T>) -> anyhow::Result<()> {
        let payload = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl<T: Record> Repository<T> for JsonFileRepository<T> {
    async fn find(&self, id: &str) -> anyhow::Result<Option<T>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn create(&self, record: T) -> anyhow::Result<T> {
        let mut records = self.records.write().await;
        let created = insert_new(&mut records, record)?;
        self.flush(&records).await?;
        Ok(created)
    }

    async fn update(&self, record: T) -> anyhow::Result<T> {
        let mut records = self.records.write().await;
        let updated = replace_existing(&mut records, record)?;
        self.flush(&records).await?;
        Ok(updated)
    }
}

fn insert_new<T: Record>(records: &mut HashMap<String, T>, record: T) -> anyhow::Result<T> {
    let id = record.record_id().to_string();
    if records.contains_key(&id) {
        anyhow::bail!("{} `{}` already exists", T::KIND, id);
    }
    records.insert(id, record.clone());
    Ok(record)
}

fn replace_existing<T: Record>(records: &mut HashMap<String, T>, record: T) -> anyhow::Result<T> {
    let id = record.record_id().to_string();
    let Some(slot) = records.get_mut(&id) else {
        anyhow::bail!("{} `{}` not found", T::KIND, id);
    };
    *slot = record.clone();
    Ok(record)
}
