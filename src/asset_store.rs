use crate::config::DatabaseConfig;
use crate::error::{DeliveryError, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Asset source type, stored as text in the `assets` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Image,
    Video,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Image => "image",
            SourceType::Video => "video",
        }
    }
}

/// Canonical record of an uploaded file plus derived metadata.
///
/// `content_type` and `source_type` are inferred once at creation from the
/// original filename and never recomputed. `view_count` and `download_count`
/// are mutated only by the visit ledger fold, never by request handlers.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Asset {
    /// Unique asset ID
    pub id: i64,
    /// Object storage key of the uploaded bytes (empty when absent)
    pub source: String,
    /// One of `file`, `image`, `video`
    pub source_type: String,
    /// Filename at upload time, captured once
    pub original_filename: String,
    /// Size of the uploaded source in bytes
    pub size_bytes: i64,
    /// MIME type guessed from the original filename
    pub content_type: String,
    /// Object storage key of the thumbnail (empty when absent)
    pub thumbnail: String,
    /// Aggregate view counter, folded in from the visit ledger
    pub view_count: i64,
    /// Aggregate download counter, folded in from the visit ledger
    pub download_count: i64,
    pub date_created: DateTime<Utc>,
    pub date_updated: DateTime<Utc>,
}

impl Asset {
    pub fn is_video(&self) -> bool {
        self.source_type == SourceType::Video.as_str()
    }
}

/// Video child row, 1:1 with an asset of source type `video`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Video {
    pub id: i64,
    pub asset_id: i64,
    /// Duration in seconds, zero until transcoding reports in
    pub duration_seconds: f64,
}

/// An alternate encoded rendition of a video asset.
///
/// Insertion order is the preferred ordering; the first variation is the
/// default rendition served for downloads.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VideoVariation {
    pub id: i64,
    pub video_id: i64,
    pub resolution_label: String,
    /// Object storage key of the encoded rendition
    pub source: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub date_created: DateTime<Utc>,
}

/// Input for asset registration on upload completion.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAsset {
    /// Object storage key the upload was written to
    pub source: String,
    /// Filename as provided by the uploader
    pub original_filename: String,
    pub size_bytes: i64,
    /// Optional thumbnail key; images default to their own source
    #[serde(default)]
    pub thumbnail: String,
}

/// Input for registering a transcoded rendition.
#[derive(Debug, Clone, Deserialize)]
pub struct NewVariation {
    #[serde(default)]
    pub resolution_label: String,
    pub source: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub content_type: String,
}

/// Asset metadata store backed by PostgreSQL
pub struct AssetStore {
    pool: PgPool,
}

impl AssetStore {
    /// Create a new asset store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Register an asset after its upload completed.
    ///
    /// Infers content type and source type from the original filename. Video
    /// assets get their video child row in the same transaction; image
    /// assets without a thumbnail use their own source as the thumbnail.
    #[instrument(skip(self, new), fields(original_filename = %new.original_filename))]
    pub async fn create_asset(&self, new: &NewAsset) -> Result<Asset> {
        let content_type = guess_content_type(&new.original_filename).unwrap_or("");
        let source_type = source_type_for(content_type);

        let thumbnail = if source_type == SourceType::Image && new.thumbnail.is_empty() {
            new.source.clone()
        } else {
            new.thumbnail.clone()
        };

        let mut tx = self.pool.begin().await?;

        let asset = sqlx::query_as::<_, Asset>(
            r#"
            INSERT INTO assets (
                source, source_type, original_filename, size_bytes,
                content_type, thumbnail
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, source, source_type, original_filename, size_bytes,
                      content_type, thumbnail, view_count, download_count,
                      date_created, date_updated
            "#,
        )
        .bind(&new.source)
        .bind(source_type.as_str())
        .bind(&new.original_filename)
        .bind(new.size_bytes)
        .bind(content_type)
        .bind(&thumbnail)
        .fetch_one(&mut *tx)
        .await?;

        if source_type == SourceType::Video {
            sqlx::query("INSERT INTO videos (asset_id, duration_seconds) VALUES ($1, 0)")
                .bind(asset.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        info!(asset_id = asset.id, source_type = %asset.source_type, "Asset registered");
        metrics::counter!("assets.registered").increment(1);

        Ok(asset)
    }

    /// Get asset metadata by ID
    pub async fn get_asset(&self, asset_id: i64) -> Result<Option<Asset>> {
        let asset = sqlx::query_as::<_, Asset>(
            r#"
            SELECT id, source, source_type, original_filename, size_bytes,
                   content_type, thumbnail, view_count, download_count,
                   date_created, date_updated
            FROM assets
            WHERE id = $1
            "#,
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(asset)
    }

    /// Find the asset that owns a stored source path.
    ///
    /// The path may belong to a video variation or to an asset directly;
    /// variations are checked first since download links for videos point at
    /// renditions.
    pub async fn find_asset_by_source(&self, source: &str) -> Result<Option<Asset>> {
        let asset = sqlx::query_as::<_, Asset>(
            r#"
            SELECT a.id, a.source, a.source_type, a.original_filename,
                   a.size_bytes, a.content_type, a.thumbnail, a.view_count,
                   a.download_count, a.date_created, a.date_updated
            FROM assets a
            JOIN videos v ON v.asset_id = a.id
            JOIN video_variations vv ON vv.video_id = v.id
            WHERE vv.source = $1
            "#,
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        if asset.is_some() {
            return Ok(asset);
        }

        let asset = sqlx::query_as::<_, Asset>(
            r#"
            SELECT id, source, source_type, original_filename, size_bytes,
                   content_type, thumbnail, view_count, download_count,
                   date_created, date_updated
            FROM assets
            WHERE source = $1 AND source <> ''
            "#,
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        Ok(asset)
    }

    /// Get the video child row for a video asset
    pub async fn get_video(&self, asset_id: i64) -> Result<Option<Video>> {
        let video = sqlx::query_as::<_, Video>(
            "SELECT id, asset_id, duration_seconds FROM videos WHERE asset_id = $1",
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(video)
    }

    /// List variations of a video in preferred (insertion) order
    pub async fn list_variations(&self, video_id: i64) -> Result<Vec<VideoVariation>> {
        let variations = sqlx::query_as::<_, VideoVariation>(
            r#"
            SELECT id, video_id, resolution_label, source, size_bytes,
                   content_type, date_created
            FROM video_variations
            WHERE video_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(video_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(variations)
    }

    /// Register a transcoded rendition for a video asset.
    #[instrument(skip(self, new), fields(asset_id = asset_id))]
    pub async fn add_variation(
        &self,
        asset_id: i64,
        new: &NewVariation,
    ) -> Result<VideoVariation> {
        let asset = self.get_asset(asset_id).await?.ok_or(DeliveryError::NotFound)?;
        require_video_type(&asset)?;

        let video = self.require_video(&asset).await?;

        let variation = sqlx::query_as::<_, VideoVariation>(
            r#"
            INSERT INTO video_variations (
                video_id, resolution_label, source, size_bytes, content_type
            ) VALUES ($1, $2, $3, $4, $5)
            RETURNING id, video_id, resolution_label, source, size_bytes,
                      content_type, date_created
            "#,
        )
        .bind(video.id)
        .bind(&new.resolution_label)
        .bind(&new.source)
        .bind(new.size_bytes)
        .bind(&new.content_type)
        .fetch_one(&self.pool)
        .await?;

        info!(
            asset_id = asset_id,
            variation_id = variation.id,
            resolution_label = %variation.resolution_label,
            "Video variation registered"
        );

        Ok(variation)
    }

    /// Resolve the single download source for an asset.
    ///
    /// Video assets serve the first variation with a non-empty source, and
    /// fall back to the original upload when no usable variation exists.
    /// Returns `None` when the asset has no downloadable source at all.
    #[instrument(skip(self, asset), fields(asset_id = asset.id))]
    pub async fn resolve_download_source(&self, asset: &Asset) -> Result<Option<String>> {
        if !asset.is_video() {
            return Ok(non_empty(&asset.source));
        }

        let video = self.require_video(asset).await?;
        let variations = self.list_variations(video.id).await?;

        Ok(resolve_video_source(&variations, &asset.source))
    }

    /// Fetch the video row for a video asset, failing loudly when the 1:1
    /// invariant is broken instead of silently falling back.
    async fn require_video(&self, asset: &Asset) -> Result<Video> {
        match self.get_video(asset.id).await? {
            Some(video) => Ok(video),
            None => {
                warn!(asset_id = asset.id, "Video asset is missing its video row");
                metrics::counter!("assets.integrity_faults").increment(1);
                Err(DeliveryError::DataIntegrity(format!(
                    "asset {} is marked as video but has no video row",
                    asset.id
                )))
            }
        }
    }

    /// Get the connection pool (shared with the visit ledger and health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Variation registration treats non-video assets the same as missing ones,
/// so the webhook surface does not disclose what an asset ID points at.
fn require_video_type(asset: &Asset) -> Result<()> {
    if asset.is_video() {
        Ok(())
    } else {
        warn!(
            asset_id = asset.id,
            source_type = %asset.source_type,
            "Variation posted for a non-video asset"
        );
        Err(DeliveryError::NotFound)
    }
}

/// Pick the download source among a video's variations, in preferred order,
/// falling back to the parent asset's own source.
fn resolve_video_source(variations: &[VideoVariation], asset_source: &str) -> Option<String> {
    variations
        .iter()
        .find(|v| !v.source.is_empty())
        .map(|v| v.source.clone())
        .or_else(|| non_empty(asset_source))
}

fn non_empty(source: &str) -> Option<String> {
    if source.is_empty() {
        None
    } else {
        Some(source.to_string())
    }
}

/// Guess a MIME type from the filename extension.
///
/// Covers the formats the platform actually serves; anything unknown is
/// treated as a generic file.
pub fn guess_content_type(filename: &str) -> Option<&'static str> {
    let ext = filename.rsplit_once('.').map(|(_, ext)| ext)?;
    let content_type = match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "wav" => "audio/x-wav",
        "flac" => "audio/flac",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "blend" => "application/x-blender",
        "exr" => "image/x-exr",
        _ => return None,
    };
    Some(content_type)
}

/// Derive the asset source type from a guessed MIME type.
pub fn source_type_for(content_type: &str) -> SourceType {
    if content_type.starts_with("image/") {
        SourceType::Image
    } else if content_type.starts_with("video/") {
        SourceType::Video
    } else {
        SourceType::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variation(id: i64, source: &str) -> VideoVariation {
        VideoVariation {
            id,
            video_id: 1,
            resolution_label: "1080p".to_string(),
            source: source.to_string(),
            size_bytes: 1000,
            content_type: "video/mp4".to_string(),
            date_created: Utc::now(),
        }
    }

    #[test]
    fn test_resolve_prefers_first_variation() {
        let variations = vec![variation(1, "renditions/a-1080p.mp4"), variation(2, "renditions/a-720p.mp4")];
        assert_eq!(
            resolve_video_source(&variations, "orig.mp4"),
            Some("renditions/a-1080p.mp4".to_string())
        );
    }

    #[test]
    fn test_resolve_skips_variations_without_source() {
        let variations = vec![variation(1, ""), variation(2, "renditions/a-720p.mp4")];
        assert_eq!(
            resolve_video_source(&variations, "orig.mp4"),
            Some("renditions/a-720p.mp4".to_string())
        );
    }

    #[test]
    fn test_resolve_falls_back_to_asset_source() {
        assert_eq!(
            resolve_video_source(&[], "orig.mp4"),
            Some("orig.mp4".to_string())
        );
        let variations = vec![variation(1, "")];
        assert_eq!(
            resolve_video_source(&variations, "orig.mp4"),
            Some("orig.mp4".to_string())
        );
    }

    #[test]
    fn test_resolve_no_source_anywhere() {
        assert_eq!(resolve_video_source(&[], ""), None);
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("scene.blend"), Some("application/x-blender"));
        assert_eq!(guess_content_type("clip.MP4"), Some("video/mp4"));
        assert_eq!(guess_content_type("poster.jpeg"), Some("image/jpeg"));
        assert_eq!(guess_content_type("noext"), None);
        assert_eq!(guess_content_type("archive.xyz"), None);
    }

    #[test]
    fn test_source_type_inference() {
        assert_eq!(source_type_for("image/png"), SourceType::Image);
        assert_eq!(source_type_for("video/webm"), SourceType::Video);
        assert_eq!(source_type_for("application/zip"), SourceType::File);
        assert_eq!(source_type_for(""), SourceType::File);
    }

    fn asset_of_type(source_type: &str) -> Asset {
        Asset {
            id: 1,
            source: "orig.mp4".to_string(),
            source_type: source_type.to_string(),
            original_filename: "orig.mp4".to_string(),
            size_bytes: 1,
            content_type: "video/mp4".to_string(),
            thumbnail: String::new(),
            view_count: 0,
            download_count: 0,
            date_created: Utc::now(),
            date_updated: Utc::now(),
        }
    }

    #[test]
    fn test_is_video() {
        assert!(asset_of_type("video").is_video());
        assert!(!asset_of_type("image").is_video());
    }

    #[test]
    fn test_variation_target_must_be_video() {
        assert!(require_video_type(&asset_of_type("video")).is_ok());

        // Rejections look exactly like a missing asset; the error carries no
        // hint of what the ID actually points at.
        for source_type in ["image", "file"] {
            let err = require_video_type(&asset_of_type(source_type)).unwrap_err();
            assert!(matches!(err, DeliveryError::NotFound));
        }
    }
}
