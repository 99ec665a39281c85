//! Configuration view and validation commands: `cadence config`.

use anyhow::{Context, Result};

use cadence::config::{CADENCE_DIR, CONFIG_FILE, CadenceToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let cadence_dir = project_dir.join(CADENCE_DIR);
    let config_path = cadence_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No {} found, showing defaults", CONFIG_FILE);
            }

            // Effective values, including environment overrides
            let mut toml = CadenceToml::load_or_default(&cadence_dir)?;
            toml.apply_env();
            println!();
            print!("{}", toml.to_toml_string()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = CadenceToml::load(&config_path)?;
            let problems = toml.validate();
            if !problems.is_empty() {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                println!();
                anyhow::bail!("{} configuration problem(s) found", problems.len());
            }
            println!("Configuration is valid.");
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                return Ok(());
            }

            std::fs::create_dir_all(&cadence_dir)
                .with_context(|| format!("Failed to create {}", cadence_dir.display()))?;
            std::fs::write(&config_path, CadenceToml::default().to_toml_string()?)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
