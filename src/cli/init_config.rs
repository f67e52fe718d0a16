use super::config::RentguardConfig;
use std::path::PathBuf;

/// Write a commented default config with a fresh identifier secret and
/// installation id.
pub fn execute(path: PathBuf, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !force {
        return Err(format!(
            "Config file '{}' already exists (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    RentguardConfig::create_default(&path)?;

    println!("✅ Wrote default configuration to {}", path.display());
    println!("   Set authority.base_url and authority.anon_key before use.");
    Ok(())
}
