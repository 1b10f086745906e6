use forge::prelude::*;

mod error;
mod functions;
mod schema;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ForgeConfig::from_file("forge.toml")?;
    let mut builder = Forge::builder();

    // Register your queries here:
    // builder.function_registry_mut().register_query::<functions::GetUsersQuery>();

    // Register your mutations here:
    // builder.function_registry_mut().register_mutation::<functions::CreateUserMutation>();

    // Register your jobs here:
    // builder.job_registry_mut().register::<functions::MyJob>();

    // Register your crons here:
    // builder.cron_registry_mut().register::<functions::MyCron>();

    // Register your workflows here:
    // builder.workflow_registry_mut().register::<functions::MyWorkflow>();

    builder.config(config).build()?.run().await
}
