use capp_crm::{config::CappConfig, controller, init_tracing};
use envconfig::Envconfig;
use kube::Client;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cfg = CappConfig::init_from_env()?.apply_profile_defaults();
    init_tracing("info", cfg.log_json);
    info!(?cfg, "Starting capp controller");

    let client = Client::try_default().await?;
    controller::run_controller(client, cfg).await
}
