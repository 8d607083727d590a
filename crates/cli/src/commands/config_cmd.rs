//! `devassist config`: show the effective configuration.

use devassist_config::AppConfig;

pub fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    println!("{}", config.redacted_toml());
    if config.has_api_key() {
        println!("# api_key is set (hidden)");
    } else {
        println!("# api_key is not set (use DEVASSIST_API_KEY or OPENAI_API_KEY)");
    }
    Ok(())
}

pub fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}
