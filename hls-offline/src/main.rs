use hls_offline::config::AppConfig;
use hls_offline::database::{self, repositories::{DownloadRepository, SqlxDownloadRepository}};
use hls_offline::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let _logging = logging::init_logging(config.log_filter.as_deref(), config.log_dir.as_deref())?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    let write_pool = database::init_write_pool(&config.database_url).await?;

    let repo = SqlxDownloadRepository::new(pool, write_pool);
    let records = repo.list_all().await?;
    tracing::info!(count = records.len(), "Loaded download records");

    for record in records {
        println!(
            "{:<24} {:<12} {:>3}%  {}",
            record.content_id,
            record.status.to_string(),
            record.progress,
            record
                .title
                .as_deref()
                .or(record.local_path.as_deref())
                .unwrap_or("-"),
        );
    }

    Ok(())
}
