//! `modelrelay routes` — print the configured routing table.

use anyhow::Result;

use modelrelay_config::AppConfig;

pub fn run(config: &AppConfig) -> Result<()> {
    if config.routes.is_empty() {
        println!("No routes configured.");
        return Ok(());
    }

    let mut models: Vec<_> = config.routes.keys().collect();
    models.sort();

    for model in models {
        println!("{model}");
        let mut entries = config.routes[model].clone();
        entries.sort_by(|a, b| {
            b.weight
                .cmp(&a.weight)
                .then_with(|| a.provider.cmp(&b.provider))
        });
        for entry in entries {
            let upstream = entry.upstream_model.as_deref().unwrap_or(model);
            println!("  -> {} ({}), weight {}", entry.provider, upstream, entry.weight);
        }
    }
    Ok(())
}
