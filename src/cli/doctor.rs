use anyhow::Result;

use crate::config::MnemoConfig;
use crate::db;

/// Open the database and print a full health report.
pub fn doctor(config: MnemoConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path, config.embedding.dimensions)?;
    let report = db::check_database_health(&conn)?;

    println!("database:         {}", db_path.display());
    println!("schema version:   {}", report.schema_version);
    println!(
        "embedding model:  {}",
        report.embedding_model.as_deref().unwrap_or("(unset)")
    );
    println!("sqlite-vec:       {}", report.sqlite_vec_version);
    println!("memories:         {}", report.memory_count);
    println!("clusters:         {}", report.cluster_count);
    println!(
        "integrity:        {}",
        if report.integrity_ok {
            "ok".to_string()
        } else {
            report.integrity_details.clone()
        }
    );

    if !report.integrity_ok {
        anyhow::bail!("database integrity check failed");
    }
    Ok(())
}
