//! The `mnemo status` command: task counts by status.

use anyhow::Result;

use mnemo_db::pool;
use mnemo_db::queries::tasks;

use crate::config::MnemoConfig;

pub async fn run(config: &MnemoConfig) -> Result<()> {
    let pg_pool = pool::create_pool(&config.db_config).await?;
    let counts = tasks::count_by_status(&pg_pool).await?;
    pg_pool.close().await;

    println!("{:<12} {:>8}", "status", "count");
    println!("{:<12} {:>8}", "pending", counts.pending);
    println!("{:<12} {:>8}", "assigned", counts.assigned);
    println!("{:<12} {:>8}", "processing", counts.processing);
    println!("{:<12} {:>8}", "completed", counts.completed);
    println!("{:<12} {:>8}", "failed", counts.failed);
    println!("{:<12} {:>8}", "timeout", counts.timeout);
    println!("{:<12} {:>8}", "total", counts.total);
    Ok(())
}
