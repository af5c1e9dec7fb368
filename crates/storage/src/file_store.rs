use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use shared::domain::CalculationState;
use tracing::debug;
use uuid::Uuid;

use crate::{codec, validate_name, CalculationStore, StoreError, StoreLocation};

const BLOB_EXTENSION: &str = "json";

/// One `<name>.json` file per calculation under a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            name: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{BLOB_EXTENSION}"))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{name}.{}.tmp", Uuid::new_v4()))
    }
}

/// Runs blocking filesystem work off the async executor. The closure runs to
/// completion even if the awaiting future is dropped.
async fn run_blocking<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| StoreError::Task(error.to_string()))?
}

fn write_temp(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}

fn map_missing(name: &str, source: io::Error) -> StoreError {
    if source.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(name.to_string())
    } else {
        StoreError::io(name, source)
    }
}

#[async_trait]
impl CalculationStore for FileStore {
    async fn create(&self, name: &str) -> Result<StoreLocation, StoreError> {
        validate_name(name)?;
        let bytes = codec::encode(&CalculationState::new(name))
            .map_err(|source| StoreError::codec(name, source))?;
        let target = self.blob_path(name);
        let temp = self.temp_path(name);
        let owned = name.to_string();

        run_blocking(move || {
            write_temp(&temp, &bytes).map_err(|source| StoreError::io(&owned, source))?;
            // hard_link refuses to replace an existing target, so racing creates
            // cannot both win and no reader ever sees a partial blob.
            let linked = fs::hard_link(&temp, &target);
            let _ = fs::remove_file(&temp);
            match linked {
                Ok(()) => Ok(StoreLocation::new(target.display().to_string())),
                Err(source) if source.kind() == io::ErrorKind::AlreadyExists => {
                    Err(StoreError::AlreadyExists(owned))
                }
                Err(source) => Err(StoreError::io(&owned, source)),
            }
        })
        .await
        .inspect(|location| debug!(name, %location, "calculation blob created"))
    }

    async fn load(&self, name: &str) -> Result<CalculationState, StoreError> {
        validate_name(name)?;
        let path = self.blob_path(name);
        let owned = name.to_string();
        run_blocking(move || {
            let bytes = fs::read(&path).map_err(|source| map_missing(&owned, source))?;
            codec::decode(&owned, &bytes).map_err(|source| StoreError::codec(&owned, source))
        })
        .await
    }

    async fn save(&self, name: &str, state: &CalculationState) -> Result<(), StoreError> {
        validate_name(name)?;
        let bytes = codec::encode(state).map_err(|source| StoreError::codec(name, source))?;
        let target = self.blob_path(name);
        let temp = self.temp_path(name);
        let owned = name.to_string();

        run_blocking(move || {
            let written = write_temp(&temp, &bytes).and_then(|()| fs::rename(&temp, &target));
            if let Err(source) = written {
                let _ = fs::remove_file(&temp);
                return Err(StoreError::io(&owned, source));
            }
            Ok(())
        })
        .await?;
        debug!(name, "calculation blob saved");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<StoreLocation, StoreError> {
        validate_name(name)?;
        let path = self.blob_path(name);
        let owned = name.to_string();
        run_blocking(move || {
            fs::remove_file(&path).map_err(|source| map_missing(&owned, source))?;
            Ok(StoreLocation::new(path.display().to_string()))
        })
        .await
        .inspect(|location| debug!(name, %location, "calculation blob deleted"))
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        let path = self.blob_path(name);
        let owned = name.to_string();
        run_blocking(move || path.try_exists().map_err(|source| StoreError::io(&owned, source)))
            .await
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        run_blocking(move || {
            let label = root.display().to_string();
            let mut names = Vec::new();
            for entry in fs::read_dir(&root).map_err(|source| StoreError::io(&label, source))? {
                let entry = entry.map_err(|source| StoreError::io(&label, source))?;
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                if validate_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
            names.sort();
            Ok(names)
        })
        .await
    }
}
