/// cli - one-shot chatsync commands (login, directory, history, send)
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    chatsync_core::cli_app::run(std::env::args().collect())
}
