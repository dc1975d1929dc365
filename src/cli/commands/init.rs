use crate::config::{AgentConfig, Config};

pub fn cmd_init() -> anyhow::Result<()> {
    if Config::create_default_if_missing()? {
        println!("✓ Created config.toml");
    } else {
        println!("config.toml already exists, left untouched");
    }

    if AgentConfig::create_default_if_missing()? {
        println!("✓ Created {}", AgentConfig::FILE_NAME);
    } else {
        println!("{} already exists, left untouched", AgentConfig::FILE_NAME);
    }

    println!("Edit the files and run `birdactyl panel` or `birdactyl agent pair`.");
    Ok(())
}
