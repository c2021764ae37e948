use anyhow::Result;
use credo::cli::{actions, actions::Action, start, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let (action, globals) = start()?;

    let result = match action {
        Action::Server(args) => actions::server::execute(args, &globals).await,
    };

    telemetry::shutdown_tracer();

    result
}
