use std::env;

use annsampark::db::{self, models::Role};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if it exists
    dotenvy::dotenv().ok();

    println!("Starting database migration...");

    let path = env::var("DATABASE_PATH").unwrap_or_else(|_| "annsampark.db".to_string());
    if path == db::MEMORY_PATH {
        anyhow::bail!("Refusing to migrate an in-memory database; set DATABASE_PATH to a file");
    }

    println!("Applying schema to {}...", path);
    let pool = db::init_pool(&path).await?;
    println!("Schema applied.");

    // Admins cannot self-register; this is how one gets promoted.
    if let Ok(email) = env::var("PROMOTE_ADMIN_EMAIL") {
        let email = email.trim();
        if !email.is_empty() {
            if db::set_user_role(&pool, email, Role::Admin, chrono::Utc::now()).await? {
                println!("Promoted {} to admin.", email);
            } else {
                return Err(anyhow::anyhow!("No user registered with email {}", email));
            }
        }
    }

    println!("Migration complete.");
    Ok(())
}
