//! `init`: persist the effective configuration.

use crate::output::{self, OutputFormat};
use relay_config_and_utils::{Config, Paths};

pub fn init(config: &Config, paths: &Paths, force: bool, format: &OutputFormat) -> anyhow::Result<()> {
    let path = paths.config_file();
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }

    config.save(paths)?;
    output::print_success(&format!("Wrote {}", path.display()), format);
    Ok(())
}
