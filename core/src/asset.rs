// Asset model and store
// One row per indexed media file, keyed by a fingerprint of the original path

use crate::constants::defaults::MEDIA_EXTENSIONS;
use crate::constants::hashing::{CHUNK_SIZE, PARTIAL_HASH_THRESHOLD};
use crate::error::{CoreError, Result};
use crate::media::ffprobe::{probe, MediaInfo};
use crate::media::MediaRunner;
use crate::utils::short_hash;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Lifecycle status of an asset row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    /// Row exists but the file has not been probed yet
    Pending,
    /// Fully indexed; current_path names an existing file
    Indexed,
    /// Last operation on this asset failed
    Error,
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetStatus::Pending => write!(f, "pending"),
            AssetStatus::Indexed => write!(f, "indexed"),
            AssetStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for AssetStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(AssetStatus::Pending),
            "indexed" => Ok(AssetStatus::Indexed),
            "error" => Ok(AssetStatus::Error),
            other => Err(CoreError::Validation(format!("unknown asset status: {}", other))),
        }
    }
}

/// A single indexed media file
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Asset {
    /// Fingerprint of the original absolute path, 16 hex chars
    pub id: String,

    /// Path at first indexing; never changes
    pub abs_path: String,

    /// Where the file lives now; mutated by move/remux workers
    pub current_path: String,

    pub file_name: String,
    pub size: i64,
    pub mtime: Option<String>,
    pub ctime: Option<String>,
    pub file_hash: Option<String>,
    pub status: String,

    // Media metadata from ffprobe; absent until indexed
    pub duration_sec: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub bitrate: Option<i64>,
    pub container: Option<String>,

    pub tags_json: String,
    pub created_at: String,
    pub updated_at: String,
    pub indexed_at: Option<String>,
}

impl Asset {
    pub fn tags(&self) -> Vec<String> {
        serde_json::from_str(&self.tags_json).unwrap_or_default()
    }
}

/// What `index` did with the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexAction {
    Created,
    Updated,
    Skipped,
}

impl fmt::Display for IndexAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexAction::Created => write!(f, "created"),
            IndexAction::Updated => write!(f, "updated"),
            IndexAction::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of an index operation
#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub asset_id: String,
    pub action: IndexAction,
    pub media: Option<MediaInfo>,
}

/// Compute the deterministic asset id for a path
pub fn fingerprint(path: &Path) -> String {
    short_hash(&path.to_string_lossy())
}

/// Hash a file for dedup purposes
///
/// Files up to 100 MiB get a full SHA-256. Larger files hash the first,
/// middle and last 64 KiB chunks together with the file length, so two
/// large files sharing those chunks but differing in size do not collide.
/// Blocking; call from `spawn_blocking` on hot paths.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    let mut hasher = Sha256::new();

    if size > PARTIAL_HASH_THRESHOLD {
        let mut chunk = vec![0u8; CHUNK_SIZE as usize];

        file.read_exact(&mut chunk)?;
        hasher.update(&chunk);

        file.seek(SeekFrom::Start(size / 2))?;
        let read = file.read(&mut chunk)?;
        hasher.update(&chunk[..read]);

        file.seek(SeekFrom::End(-(CHUNK_SIZE as i64)))?;
        let read = file.read(&mut chunk)?;
        hasher.update(&chunk[..read]);

        hasher.update(size.to_le_bytes());
    } else {
        let mut buf = vec![0u8; CHUNK_SIZE as usize];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
    }

    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

fn mtime_of(path: &Path) -> Option<DateTime<Utc>> {
    let meta = std::fs::metadata(path).ok()?;
    meta.modified().ok().map(DateTime::<Utc>::from)
}

fn ctime_of(path: &Path) -> Option<DateTime<Utc>> {
    let meta = std::fs::metadata(path).ok()?;
    meta.created().ok().map(DateTime::<Utc>::from)
}

/// Store for asset rows and the text-search index
#[derive(Clone)]
pub struct AssetStore {
    pool: SqlitePool,
}

impl AssetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a freshly detected file as a pending asset
    ///
    /// Returns the existing row untouched when the path is already known.
    pub async fn create_pending(&self, path: &Path) -> Result<Asset> {
        if let Some(existing) = self.lookup_by_path(path).await? {
            return Ok(existing);
        }

        let id = fingerprint(path);
        let now = Utc::now().to_rfc3339();
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO so_assets
                (id, abs_path, current_path, file_name, size, mtime, ctime,
                 status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(path.to_string_lossy().as_ref())
        .bind(path.to_string_lossy().as_ref())
        .bind(&file_name)
        .bind(size as i64)
        .bind(mtime_of(path).map(|t| t.to_rfc3339()))
        .bind(ctime_of(path).map(|t| t.to_rfc3339()))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("asset {} vanished after insert", id)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Asset>> {
        let asset = sqlx::query_as::<_, Asset>("SELECT * FROM so_assets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(asset)
    }

    /// Find an asset by either its original or its current location
    pub async fn lookup_by_path(&self, path: &Path) -> Result<Option<Asset>> {
        let p = path.to_string_lossy();
        let asset = sqlx::query_as::<_, Asset>(
            "SELECT * FROM so_assets WHERE abs_path = ? OR current_path = ?",
        )
        .bind(p.as_ref())
        .bind(p.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        Ok(asset)
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Asset>> {
        let assets = sqlx::query_as::<_, Asset>(
            "SELECT * FROM so_assets ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(assets)
    }

    /// Point-update of the asset's present location. Emits no event; the
    /// workers that call this emit their own.
    pub async fn set_current_path(&self, id: &str, path: &Path) -> Result<()> {
        let result = sqlx::query(
            "UPDATE so_assets SET current_path = ?, file_name = ?, updated_at = ? WHERE id = ?",
        )
        .bind(path.to_string_lossy().as_ref())
        .bind(
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("asset {}", id)));
        }
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: AssetStatus) -> Result<()> {
        sqlx::query("UPDATE so_assets SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Union-merge tags into the asset's tag set; returns the merged set
    pub async fn add_tags(&self, id: &str, new_tags: &[String]) -> Result<Vec<String>> {
        let asset = self
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("asset {}", id)))?;

        let mut tags = asset.tags();
        for tag in new_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags.sort();

        sqlx::query("UPDATE so_assets SET tags_json = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&tags)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(tags)
    }

    /// Full-text search over file name, path and probe tags
    pub async fn search(&self, query: &str) -> Result<Vec<Asset>> {
        let assets = sqlx::query_as::<_, Asset>(
            r#"
            SELECT a.* FROM so_assets a
            JOIN so_assets_fts f ON f.asset_id = a.id
            WHERE so_assets_fts MATCH ?
            ORDER BY a.created_at DESC
            "#,
        )
        .bind(query)
        .fetch_all(&self.pool)
        .await?;
        Ok(assets)
    }

    /// Index a media file: fingerprint, hash, probe, upsert, rebuild FTS
    ///
    /// Skips the work when the stored row is at least as new as the file
    /// and `force` is off. FFprobe failures are tolerated; the asset is
    /// indexed with whatever metadata could be gathered.
    pub async fn index(&self, path: &Path, force: bool, runner: &MediaRunner) -> Result<IndexOutcome> {
        if !path.exists() {
            return Err(CoreError::NotFound(format!("file {}", path.display())));
        }

        let id = fingerprint(path);
        let file_mtime = mtime_of(path);

        let hash_path = path.to_path_buf();
        let file_hash = tokio::task::spawn_blocking(move || compute_file_hash(&hash_path))
            .await
            .map_err(|e| CoreError::Internal(format!("hash task panicked: {}", e)))??;

        let existing = sqlx::query_as::<_, Asset>(
            "SELECT * FROM so_assets WHERE id = ? OR file_hash = ?",
        )
        .bind(&id)
        .bind(&file_hash)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref asset) = existing {
            if !force && !is_newer(file_mtime, asset.mtime.as_deref()) && asset.indexed_at.is_some() {
                debug!("asset already indexed and up to date: {}", path.display());
                return Ok(IndexOutcome {
                    asset_id: asset.id.clone(),
                    action: IndexAction::Skipped,
                    media: None,
                });
            }
        }

        let media = match probe(runner, path).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("ffprobe failed for {}: {}", path.display(), e);
                None
            }
        };

        let size = std::fs::metadata(path)?.len() as i64;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let now = Utc::now().to_rfc3339();

        let asset_id = existing.as_ref().map(|a| a.id.clone()).unwrap_or(id);
        let action = if existing.is_some() {
            IndexAction::Updated
        } else {
            IndexAction::Created
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO so_assets
                (id, abs_path, current_path, file_name, size, mtime, ctime, file_hash,
                 status, duration_sec, width, height, fps, video_codec, audio_codec,
                 bitrate, container, created_at, updated_at, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'indexed', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                current_path = excluded.current_path,
                file_name    = excluded.file_name,
                size         = excluded.size,
                mtime        = excluded.mtime,
                ctime        = excluded.ctime,
                file_hash    = excluded.file_hash,
                status       = 'indexed',
                duration_sec = excluded.duration_sec,
                width        = excluded.width,
                height       = excluded.height,
                fps          = excluded.fps,
                video_codec  = excluded.video_codec,
                audio_codec  = excluded.audio_codec,
                bitrate      = excluded.bitrate,
                container    = excluded.container,
                updated_at   = excluded.updated_at,
                indexed_at   = excluded.indexed_at
            "#,
        )
        .bind(&asset_id)
        .bind(path.to_string_lossy().as_ref())
        .bind(path.to_string_lossy().as_ref())
        .bind(&file_name)
        .bind(size)
        .bind(file_mtime.map(|t| t.to_rfc3339()))
        .bind(ctime_of(path).map(|t| t.to_rfc3339()))
        .bind(&file_hash)
        .bind(media.as_ref().and_then(|m| m.duration_sec))
        .bind(media.as_ref().and_then(|m| m.width))
        .bind(media.as_ref().and_then(|m| m.height))
        .bind(media.as_ref().and_then(|m| m.fps))
        .bind(media.as_ref().and_then(|m| m.video_codec.clone()))
        .bind(media.as_ref().and_then(|m| m.audio_codec.clone()))
        .bind(media.as_ref().and_then(|m| m.bitrate))
        .bind(media.as_ref().and_then(|m| m.container.clone()))
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        // The searchable row is a function of the asset row; rebuild it in
        // the same transaction.
        let tag_text = media
            .as_ref()
            .map(|m| {
                ["title", "comment", "creation_time"]
                    .iter()
                    .filter_map(|k| m.tags.get(*k).cloned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        sqlx::query("DELETE FROM so_assets_fts WHERE asset_id = ?")
            .bind(&asset_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO so_assets_fts (asset_id, file_name, path, tag_text) VALUES (?, ?, ?, ?)")
            .bind(&asset_id)
            .bind(&file_name)
            .bind(path.to_string_lossy().as_ref())
            .bind(&tag_text)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!("indexed asset {} ({}): {}", asset_id, action, path.display());
        Ok(IndexOutcome {
            asset_id,
            action,
            media,
        })
    }

    /// Re-point `current_path` for any indexed asset found in a folder
    ///
    /// Used after move/copy so rows track files that changed location.
    /// Non-recursive, like the folder views it serves. Returns the number
    /// of corrected rows.
    pub async fn reconcile_folder(&self, folder: &Path) -> Result<u64> {
        let folder = if folder.is_file() {
            folder.parent().map(PathBuf::from).unwrap_or_default()
        } else {
            folder.to_path_buf()
        };

        if !folder.is_dir() {
            return Ok(0);
        }

        let mut corrected = 0u64;
        for entry in std::fs::read_dir(&folder)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || !has_media_extension(&path) {
                continue;
            }

            if let Some(asset) = self.lookup_by_path(&path).await? {
                if asset.current_path != path.to_string_lossy() {
                    self.set_current_path(&asset.id, &path).await?;
                    corrected += 1;
                }
            } else {
                debug!("found unindexed media file: {}", path.display());
            }
        }

        Ok(corrected)
    }

    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM so_assets")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

/// Compare the on-disk mtime against the stored RFC 3339 timestamp
fn is_newer(file_mtime: Option<DateTime<Utc>>, stored: Option<&str>) -> bool {
    match (file_mtime, stored.and_then(|s| DateTime::parse_from_rfc3339(s).ok())) {
        (Some(file), Some(stored)) => file > stored.with_timezone(&Utc),
        // Without both timestamps, assume changed
        _ => true,
    }
}

fn has_media_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MEDIA_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}
