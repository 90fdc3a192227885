use anyhow::Context;
use clap::Parser;
use property_geocoder::commands::{dispatch, Cli};
use property_geocoder::{init_tracing, AppConfig, GeocoderApp};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(data_dir) = cli.data_dir.clone() {
        config.data_dir = data_dir;
    }

    let app = GeocoderApp::initialize(config).context("failed to initialize geocoder")?;
    let result = dispatch(cli.command, &app).await;
    app.flush_journal();
    result.context("command failed")
}
