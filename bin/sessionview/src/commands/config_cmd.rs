use sessionview_core::{Config, Paths};

/// Show the current configuration as pretty-printed JSON.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;
    if config.control_plane.bearer_token.is_some() {
        config.control_plane.bearer_token = Some("********".to_string());
    }

    println!();
    println!("📋 Current Configuration");
    println!("  File: {}", paths.config_file().display());
    if !paths.config_file().exists() {
        println!("  (not found, showing defaults)");
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Write a default config file.
pub async fn init(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let path = paths.config_file();
    if path.exists() && !force {
        println!("Config already exists: {}", path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    paths.ensure_dirs()?;
    Config::default().save(&path)?;
    println!("✓ Created config: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit {} to point controlPlane.baseUrl at your backend", path.display());
    println!("  2. Run `sessionview watch --family screencast --token <token>`");
    Ok(())
}
