use std::sync::Arc;

use fc_hostd::config::Config;
use fc_hostd::http::{self, AllowAll};
use log::{error, info};

fn main() {
    env_logger::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_startup_reconciliation(&config) {
        error!("startup reconciliation failed, continuing: {e}");
    }

    info!("fc-hostd starting");
    if let Err(e) = http::serve(config, Arc::new(AllowAll)) {
        error!("http server exited: {e}");
        std::process::exit(1);
    }
}

fn run_startup_reconciliation(config: &Config) -> fc_hostd::Result<()> {
    let names = fc_hostd::lifecycle::list_vms(config)?;
    let mut specs = std::collections::HashMap::new();
    for name in names {
        match fc_hostd::lifecycle::load_spec(config, &name) {
            Ok(spec) => {
                specs.insert(name, spec);
            }
            Err(e) => error!("startup reconciliation: no usable spec for '{name}', skipping: {e}"),
        }
    }
    fc_hostd::lifecycle::startup_reconciliation(config, &specs)
}
