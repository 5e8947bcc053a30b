//! Database backups.
//!
//! Backups are consistent snapshots taken with `VACUUM INTO`, named
//! `newsdesk-YYYYMMDD-HHMMSS.sqlite`. Each one is verified right after it is
//! written: the integrity check must pass and its article count must equal
//! the live count read just before the snapshot. Any failure once the target
//! name is chosen deletes the partial file and raises a Telegram alert.
//!
//! Rotation gzips backups older than `backup.compress_after_hours` and
//! deletes those older than `backup.retain_days`.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::Config;
use crate::db;
use crate::health;
use crate::notify::Notifier;

const PREFIX: &str = "newsdesk-";
const SUFFIX: &str = ".sqlite";
const GZ_SUFFIX: &str = ".sqlite.gz";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub integrity: String,
    pub articles: i64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RotateReport {
    pub compressed: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

/// Snapshots the live database into `backup.dir` and verifies the copy.
pub async fn create_backup(config: &Config) -> Result<BackupInfo> {
    let notifier = Notifier::from_config(&config.notify);
    create_backup_with(config, notifier.as_ref()).await
}

/// Like [`create_backup`], alerting through `notifier` on failure.
pub async fn create_backup_with(config: &Config, notifier: Option<&Notifier>) -> Result<BackupInfo> {
    fs::create_dir_all(&config.backup.dir).with_context(|| {
        format!("Failed to create backup dir: {}", config.backup.dir.display())
    })?;

    let name = format!(
        "{}{}{}",
        PREFIX,
        chrono::Utc::now().format("%Y%m%d-%H%M%S"),
        SUFFIX
    );
    let target = config.backup.dir.join(name);
    if target.exists() {
        bail!("backup already exists: {}", target.display());
    }

    match snapshot(config, &target).await {
        Ok(info) => {
            tracing::info!(path = %target.display(), articles = info.articles, "backup created");
            Ok(info)
        }
        Err(e) => {
            if target.exists() {
                let _ = fs::remove_file(&target);
            }
            tracing::error!(path = %target.display(), error = %e, "backup failed");
            if let Some(notifier) = notifier {
                if let Err(send_err) = notifier
                    .send(&format!("Newsdesk backup failed: {:#}", e))
                    .await
                {
                    tracing::warn!(error = %send_err, "failed to send backup alert");
                }
            }
            Err(e.context("backup failed; no backup file was kept"))
        }
    }
}

async fn snapshot(config: &Config, target: &Path) -> Result<BackupInfo> {
    let pool = db::connect_existing(&config.db.path).await?;
    let copied = async {
        let live_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&pool)
            .await?;
        sqlx::query("VACUUM INTO ?")
            .bind(target.to_string_lossy().to_string())
            .execute(&pool)
            .await
            .context("VACUUM INTO failed")?;
        Ok::<_, anyhow::Error>(live_count)
    }
    .await;
    pool.close().await;
    let live_count = copied?;

    let info = inspect(target).await?;
    if info.integrity != "ok" {
        bail!("integrity check failed: {}", info.integrity);
    }
    if info.articles != live_count {
        bail!(
            "article count mismatch: backup has {}, live database had {}",
            info.articles,
            live_count
        );
    }
    Ok(info)
}

/// Verifies a backup file, decompressing `.gz` files to a scratch copy.
pub async fn verify_backup(path: &Path) -> Result<BackupInfo> {
    if !path.exists() {
        bail!("backup not found: {}", path.display());
    }
    if is_gz(path) {
        let scratch = scratch_path(path);
        let result = match decompress(path, &scratch) {
            Ok(()) => inspect(&scratch).await,
            Err(e) => Err(e),
        };
        let _ = fs::remove_file(&scratch);
        result.map(|mut info| {
            info.path = path.to_path_buf();
            info
        })
    } else {
        inspect(path).await
    }
}

async fn inspect(path: &Path) -> Result<BackupInfo> {
    let pool = db::open_read_only(path).await?;
    let integrity = health::integrity_check(&pool).await;
    let articles: Result<i64> = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
        .fetch_one(&pool)
        .await
        .map_err(Into::into);
    pool.close().await;

    Ok(BackupInfo {
        path: path.to_path_buf(),
        integrity: integrity?,
        articles: articles?,
    })
}

/// Compresses and prunes backups by age (file modification time).
pub fn rotate_backups(config: &Config, now: SystemTime) -> Result<RotateReport> {
    let dir = &config.backup.dir;
    let mut report = RotateReport::default();
    if !dir.exists() {
        return Ok(report);
    }

    let compress_after = Duration::from_secs(config.backup.compress_after_hours.max(0) as u64 * 3600);
    let retain = Duration::from_secs(config.backup.retain_days.max(1) as u64 * 86_400);

    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| is_backup_file(p))
        .collect();
    entries.sort();

    for path in entries {
        let modified = fs::metadata(&path)?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();

        if age > retain {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            tracing::info!(path = %path.display(), "expired backup deleted");
            report.deleted.push(path);
        } else if age > compress_after && !is_gz(&path) {
            let gz = gz_path(&path);
            compress(&path, &gz)?;
            // keep the original mtime so retention still counts from the snapshot
            File::options().write(true).open(&gz)?.set_modified(modified)?;
            fs::remove_file(&path)?;
            tracing::info!(path = %gz.display(), "backup compressed");
            report.compressed.push(gz);
        }
    }

    Ok(report)
}

/// Replaces the live database with a verified backup.
///
/// The current database is kept next to it as `<db>.pre-restore`. The server
/// must be stopped while this runs.
pub async fn restore_backup(config: &Config, backup: &Path) -> Result<BackupInfo> {
    let info = verify_backup(backup).await?;
    if info.integrity != "ok" {
        bail!("refusing to restore: integrity check failed: {}", info.integrity);
    }

    let db_path = &config.db.path;
    if db_path.exists() {
        // fold the WAL into the main file before copying it aside
        let pool = db::connect(config).await?;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&pool).await?;
        pool.close().await;

        let keep = sibling(db_path, ".pre-restore");
        fs::copy(db_path, &keep)
            .with_context(|| format!("Failed to keep current database as {}", keep.display()))?;
        println!("  previous database kept at {}", keep.display());
    }

    for suffix in ["-wal", "-shm"] {
        let _ = fs::remove_file(sibling(db_path, suffix));
    }

    if is_gz(backup) {
        let staged = sibling(db_path, ".restoring");
        if let Err(e) = decompress(backup, &staged) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }
        fs::rename(&staged, db_path)?;
    } else {
        fs::copy(backup, db_path)?;
    }

    tracing::info!(from = %backup.display(), articles = info.articles, "database restored");
    Ok(info)
}

pub async fn run_backup_create(config: &Config) -> Result<()> {
    let info = create_backup(config).await?;
    println!("backup create");
    println!("  path: {}", info.path.display());
    println!("  articles: {}", info.articles);
    println!("  integrity: {}", info.integrity);
    Ok(())
}

pub fn run_backup_rotate(config: &Config) -> Result<()> {
    let report = rotate_backups(config, SystemTime::now())?;
    println!("backup rotate");
    println!("  compressed: {}", report.compressed.len());
    println!("  deleted: {}", report.deleted.len());
    Ok(())
}

pub async fn run_backup_verify(path: &Path) -> Result<()> {
    let info = verify_backup(path).await?;
    println!("backup verify");
    println!("  path: {}", info.path.display());
    println!("  integrity: {}", info.integrity);
    println!("  articles: {}", info.articles);
    if info.integrity != "ok" {
        bail!("integrity check failed");
    }
    Ok(())
}

pub async fn run_backup_restore(config: &Config, path: &Path) -> Result<()> {
    println!("backup restore");
    let info = restore_backup(config, path).await?;
    println!("  restored: {}", info.path.display());
    println!("  articles: {}", info.articles);
    Ok(())
}

fn is_backup_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(PREFIX) && (name.ends_with(SUFFIX) || name.ends_with(GZ_SUFFIX))
}

fn is_gz(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

fn gz_path(path: &Path) -> PathBuf {
    sibling(path, ".gz")
}

fn scratch_path(gz: &Path) -> PathBuf {
    let mut name = gz.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".verify");
    gz.with_file_name(name)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn compress(src: &Path, dst: &Path) -> Result<()> {
    let mut input = BufReader::new(File::open(src)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dst)?), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()?;
    Ok(())
}

fn decompress(src: &Path, dst: &Path) -> Result<()> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut output = BufWriter::new(File::create(dst)?);
    io::copy(&mut decoder, &mut output)
        .with_context(|| format!("Failed to decompress {}", src.display()))?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::insert_articles;
    use crate::models::NewArticle;

    async fn seeded_config(dir: &tempfile::TempDir, n: usize) -> Config {
        let mut config = Config::minimal(dir.path().join("data/news.sqlite"));
        config.backup.dir = dir.path().join("backups");
        let pool = db::connect(&config).await.unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        let articles: Vec<NewArticle> = (0..n)
            .map(|i| NewArticle {
                title: format!("Story {}", i),
                description: None,
                url: format!("https://example.com/{}", i),
                source: "AP".to_string(),
                published_at: chrono::Utc::now(),
            })
            .collect();
        insert_articles(&pool, &articles).await.unwrap();
        pool.close().await;
        config
    }

    fn touch(path: &Path, age: Duration) {
        fs::write(path, b"x").unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
    }

    #[tokio::test]
    async fn test_backup_count_matches_live() {
        let dir = tempfile::tempdir().unwrap();
        let config = seeded_config(&dir, 4).await;

        let info = create_backup(&config).await.unwrap();
        assert_eq!(info.articles, 4);
        assert_eq!(info.integrity, "ok");
        assert!(info.path.exists());
    }

    #[tokio::test]
    async fn test_verify_compressed_backup() {
        let dir = tempfile::tempdir().unwrap();
        let config = seeded_config(&dir, 2).await;
        let info = create_backup(&config).await.unwrap();

        let gz = gz_path(&info.path);
        compress(&info.path, &gz).unwrap();
        let verified = verify_backup(&gz).await.unwrap();
        assert_eq!(verified.articles, 2);
        assert_eq!(verified.path, gz);
        assert!(!scratch_path(&gz).exists());
    }

    #[tokio::test]
    async fn test_missing_database_alerts_and_leaves_nothing() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let telegram = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&telegram)
            .await;
        let notifier = Notifier::new(&telegram.uri(), "T".into(), "1".into()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::minimal(dir.path().join("wrong/news.sqlite"));
        config.backup.dir = dir.path().join("backups");

        let err = create_backup_with(&config, Some(&notifier)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("database not found"));
        assert!(!config.db.path.exists());
        assert_eq!(fs::read_dir(&config.backup.dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_archive_cleans_up_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let gz = dir.path().join("newsdesk-20240101-000000.sqlite.gz");
        fs::write(&gz, b"definitely not gzip").unwrap();

        assert!(verify_backup(&gz).await.is_err());
        assert!(!scratch_path(&gz).exists());
    }

    #[test]
    fn test_rotate_compresses_then_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::minimal(dir.path().join("news.sqlite"));
        config.backup.dir = dir.path().to_path_buf();

        let fresh = dir.path().join("newsdesk-20240105-000000.sqlite");
        let day_old = dir.path().join("newsdesk-20240104-000000.sqlite");
        let expired = dir.path().join("newsdesk-20231201-000000.sqlite.gz");
        let unrelated = dir.path().join("notes.sqlite");
        touch(&fresh, Duration::from_secs(3600));
        touch(&day_old, Duration::from_secs(30 * 3600));
        touch(&expired, Duration::from_secs(8 * 86_400));
        touch(&unrelated, Duration::from_secs(30 * 86_400));

        let report = rotate_backups(&config, SystemTime::now()).unwrap();
        assert_eq!(report.compressed, vec![gz_path(&day_old)]);
        assert_eq!(report.deleted, vec![expired.clone()]);
        assert!(fresh.exists());
        assert!(!day_old.exists());
        assert!(gz_path(&day_old).exists());
        assert!(!expired.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_restore_keeps_previous_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = seeded_config(&dir, 3).await;
        let info = create_backup(&config).await.unwrap();

        // grow the live database after the backup
        let pool = db::connect(&config).await.unwrap();
        insert_articles(
            &pool,
            &[NewArticle {
                title: "Late story".to_string(),
                description: None,
                url: "https://example.com/late".to_string(),
                source: "AP".to_string(),
                published_at: chrono::Utc::now(),
            }],
        )
        .await
        .unwrap();
        pool.close().await;

        restore_backup(&config, &info.path).await.unwrap();
        assert!(sibling(&config.db.path, ".pre-restore").exists());

        let pool = db::connect(&config).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }
}
