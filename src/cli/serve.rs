use crate::cli::CliContext;
use crate::core::runtime::RuntimeClient;
use anyhow::Result;
use clap::Args;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Handle a single invocation and exit
    #[arg(long)]
    pub once: bool,
}

pub async fn run(ctx: &CliContext, args: ServeArgs) -> Result<()> {
    let client = RuntimeClient::from_env()?;
    let handler = match ctx.build_handler().await {
        Ok(handler) => handler,
        Err(e) => {
            let message = format!("{:#}", e);
            if let Err(report_err) = client.report_init_error("InitError", &message).await {
                tracing::error!(error = %format!("{:#}", report_err), "failed to report init error");
            }
            return Err(e);
        }
    };

    if args.once {
        client.serve_once(&handler).await
    } else {
        client.serve(&handler).await
    }
}
